//! keepalived configuration and lifecycle manager.
//!
//! The manager is the only writer of keepalived's config file and the only
//! owner of its process. Roles are observed from notify-hook transitions,
//! never driven.

use super::render::{KeepalivedConfig, RenderOptions};
use super::supervisor::{Daemon, SupervisorConfig, restart_delay, stop_daemon};
use crate::types::{NodeRoster, RoleTransition, VrrpState};
use common::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Daemon lifecycle as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Starting,
    Running,
}

/// What [`KeepalivedManager::apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Unchanged,
    Started,
    Reloaded,
    Restarted,
    /// Shutdown is in progress; nothing was written.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub config_path: PathBuf,
    pub render: RenderOptions,
    pub supervisor: SupervisorConfig,
}

struct Inner {
    lifecycle: Lifecycle,
    shutting_down: bool,
    roles: BTreeMap<String, VrrpState>,
    config: Option<KeepalivedConfig>,
    rendered: Option<String>,
    restarts: u32,
}

pub struct KeepalivedManager<D> {
    daemon: Arc<D>,
    settings: ManagerSettings,
    inner: Mutex<Inner>,
}

impl<D: Daemon> KeepalivedManager<D> {
    pub fn new(daemon: Arc<D>, settings: ManagerSettings) -> Self {
        Self {
            daemon,
            settings,
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Stopped,
                shutting_down: false,
                roles: BTreeMap::new(),
                config: None,
                rendered: None,
                restarts: 0,
            }),
        }
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.inner.lock().await.lifecycle
    }

    /// Last reported role of every instance.
    pub async fn roles(&self) -> BTreeMap<String, VrrpState> {
        self.inner.lock().await.roles.clone()
    }

    /// VIPs whose instance last reported MASTER.
    pub async fn master_vips(&self) -> BTreeSet<IpAddr> {
        let inner = self.inner.lock().await;
        let Some(config) = &inner.config else {
            return BTreeSet::new();
        };
        config
            .instances()
            .iter()
            .filter(|i| inner.roles.get(&i.name) == Some(&VrrpState::Master))
            .flat_map(|i| i.vips.iter().copied())
            .collect()
    }

    /// Record a role transition. Returns whether the instance's role changed.
    pub async fn observe(&self, transition: &RoleTransition) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.lifecycle == Lifecycle::Starting {
            inner.lifecycle = Lifecycle::Running;
        }
        let previous = inner
            .roles
            .insert(transition.instance.clone(), transition.state);
        let changed = previous != Some(transition.state);
        if changed {
            info!(
                instance = %transition.instance,
                from = ?previous,
                to = %transition.state,
                "VRRP role changed"
            );
        }
        changed
    }

    /// Render the configuration for `vips`, write it if it changed, and
    /// make the daemon use it: start when stopped, otherwise reload, falling
    /// back to a restart when reload fails.
    pub async fn apply(&self, vips: &BTreeSet<IpAddr>, roster: &NodeRoster) -> Result<ApplyOutcome> {
        let config = KeepalivedConfig::build(vips, roster, &self.settings.render)?;
        let text = config.to_string();

        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return Ok(ApplyOutcome::Skipped);
        }

        let changed = inner.rendered.as_deref() != Some(text.as_str());
        if changed {
            write_atomic(&self.settings.config_path, &text)?;
            info!(
                path = %self.settings.config_path.display(),
                instances = config.instances().len(),
                vips = vips.len(),
                priority = roster.priority,
                "Wrote keepalived configuration"
            );
            inner.rendered = Some(text);
        }
        inner.config = Some(config);

        match inner.lifecycle {
            Lifecycle::Stopped => {
                self.start(&mut inner).await?;
                Ok(ApplyOutcome::Started)
            }
            _ if !changed => Ok(ApplyOutcome::Unchanged),
            _ => match self.daemon.reload().await {
                Ok(()) => {
                    debug!("keepalived reloaded");
                    Ok(ApplyOutcome::Reloaded)
                }
                Err(e) => {
                    warn!(error = %e, "Reload failed, restarting keepalived");
                    stop_daemon(self.daemon.as_ref(), self.settings.supervisor.stop_timeout).await?;
                    inner.roles.clear();
                    self.start(&mut inner).await?;
                    Ok(ApplyOutcome::Restarted)
                }
            },
        }
    }

    /// Spawn the daemon. A failed spawn still leaves the lifecycle at
    /// `Starting` and counts as a failed start, so supervision retries it
    /// and gives up after `max_restarts`.
    async fn start(&self, inner: &mut Inner) -> Result<()> {
        inner.lifecycle = Lifecycle::Starting;
        if let Err(e) = self.daemon.spawn().await {
            inner.restarts += 1;
            warn!(attempt = inner.restarts, error = %e, "keepalived failed to start");
            return Err(e);
        }
        Ok(())
    }

    /// Keep the daemon alive until cancelled, then stop it.
    ///
    /// Returns a fatal supervision error after `max_restarts` consecutive
    /// failed starts.
    pub async fn supervise(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = interval(self.settings.supervisor.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.check(&cancel).await {
                error!(error = %e, "keepalived supervision failed");
                return Err(e);
            }
        }
        self.shutdown().await
    }

    /// One liveness check, restarting the daemon after a backoff if it died.
    async fn check(&self, cancel: &CancellationToken) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.lifecycle == Lifecycle::Stopped || inner.shutting_down {
            return Ok(());
        }

        if self.daemon.is_running().await {
            match inner.lifecycle {
                Lifecycle::Starting => {
                    info!("keepalived running");
                    inner.lifecycle = Lifecycle::Running;
                }
                // Survived a full poll interval after starting.
                Lifecycle::Running => inner.restarts = 0,
                Lifecycle::Stopped => {}
            }
            return Ok(());
        }

        inner.restarts += 1;
        inner.roles.clear();
        let attempt = inner.restarts;
        let config = &self.settings.supervisor;
        if attempt > config.max_restarts {
            inner.lifecycle = Lifecycle::Stopped;
            return Err(Error::supervision(format!(
                "keepalived failed {} consecutive starts",
                config.max_restarts
            )));
        }
        let delay = restart_delay(config, attempt);
        warn!(attempt, delay = ?delay, "keepalived is not running, restarting");
        drop(inner);

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }

        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return Ok(());
        }
        if let Err(e) = self.daemon.spawn().await {
            warn!(attempt, error = %e, "keepalived restart failed");
        }
        inner.lifecycle = Lifecycle::Starting;
        Ok(())
    }

    /// Stop the daemon and refuse further applies.
    pub async fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.shutting_down = true;
        if inner.lifecycle == Lifecycle::Stopped {
            return Ok(());
        }
        info!("Stopping keepalived");
        let result = stop_daemon(self.daemon.as_ref(), self.settings.supervisor.stop_timeout).await;
        inner.lifecycle = Lifecycle::Stopped;
        inner.roles.clear();
        result
    }
}

/// Write through a temporary file and rename, so keepalived never reads a
/// partial config.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::keepalived(format!("cannot create {}: {}", dir.display(), e)))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)
        .map_err(|e| Error::keepalived(format!("cannot write {}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| Error::keepalived(format!("cannot replace {}: {}", path.display(), e)))
}
