//! keepalived process supervision.

use async_trait::async_trait;
use common::{Error, Result};
#[cfg(test)]
use mockall::automock;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Timing and limits for keeping the daemon alive.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between liveness checks
    pub poll_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout: Duration,
    /// Consecutive failed starts before supervision gives up
    pub max_restarts: u32,
    pub restart_backoff_base: Duration,
    pub restart_backoff_cap: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(10),
            max_restarts: 5,
            restart_backoff_base: Duration::from_secs(1),
            restart_backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Delay before restart number `attempt` (1-based).
pub fn restart_delay(config: &SupervisorConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    config
        .restart_backoff_base
        .saturating_mul(1u32 << exp)
        .min(config.restart_backoff_cap)
}

/// A supervised VRRP daemon process.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Daemon: Send + Sync {
    /// Start the process. Fails if it is already running.
    async fn spawn(&self) -> Result<()>;

    /// Whether the process is alive. Reaps it if it has exited.
    async fn is_running(&self) -> bool;

    /// Ask the daemon to re-read its configuration.
    async fn reload(&self) -> Result<()>;

    /// Request a graceful exit.
    async fn terminate(&self) -> Result<()>;

    /// Kill the process and wait for it.
    async fn kill(&self) -> Result<()>;
}

/// keepalived run as a foreground child process.
pub struct ProcessDaemon {
    binary: PathBuf,
    config_path: PathBuf,
    child: Mutex<Option<Child>>,
}

impl ProcessDaemon {
    pub fn new(binary: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            config_path: config_path.into(),
            child: Mutex::new(None),
        }
    }

    async fn signal(&self, sig: Signal) -> Result<()> {
        let guard = self.child.lock().await;
        let pid = guard
            .as_ref()
            .and_then(Child::id)
            .ok_or_else(|| Error::keepalived("keepalived is not running"))?;
        let pid = i32::try_from(pid).map_err(|_| Error::keepalived(format!("invalid pid {}", pid)))?;
        signal::kill(Pid::from_raw(pid), sig)
            .map_err(|e| Error::keepalived(format!("cannot send {:?} to keepalived: {}", sig, e)))
    }
}

#[async_trait]
impl Daemon for ProcessDaemon {
    async fn spawn(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Err(Error::keepalived("keepalived is already running"));
            }
        }

        let child = Command::new(&self.binary)
            .arg("--dont-fork")
            .arg("--log-console")
            .arg("--log-detail")
            .arg("--use-file")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::keepalived(format!("cannot start {}: {}", self.binary.display(), e))
            })?;

        info!(pid = child.id(), binary = %self.binary.display(), "Started keepalived");
        *guard = Some(child);
        Ok(())
    }

    async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(%status, "keepalived exited");
                *guard = None;
                false
            }
            Err(e) => {
                warn!(error = %e, "Cannot query keepalived status");
                false
            }
        }
    }

    async fn reload(&self) -> Result<()> {
        self.signal(Signal::SIGHUP).await
    }

    async fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM).await
    }

    async fn kill(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            child.kill().await?;
            debug!("keepalived killed");
        }
        Ok(())
    }
}

/// Graceful stop: SIGTERM, wait up to `stop_timeout`, then SIGKILL.
pub async fn stop_daemon<D: Daemon + ?Sized>(daemon: &D, stop_timeout: Duration) -> Result<()> {
    if !daemon.is_running().await {
        return Ok(());
    }
    if let Err(e) = daemon.terminate().await {
        warn!(error = %e, "Cannot signal keepalived, killing it");
        return daemon.kill().await;
    }

    let deadline = Instant::now() + stop_timeout;
    let step = Duration::from_millis(100).min(stop_timeout);
    while daemon.is_running().await {
        if Instant::now() >= deadline {
            warn!(timeout = ?stop_timeout, "keepalived ignored SIGTERM, killing it");
            return daemon.kill().await;
        }
        sleep(step).await;
    }
    info!("keepalived stopped");
    Ok(())
}
