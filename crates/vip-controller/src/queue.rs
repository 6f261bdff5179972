//! Reconciliation queue.
//!
//! [`SyncQueue`] coalesces any number of enqueue calls into one outstanding
//! token. A single [`Worker`] consumes tokens and runs synchronization passes
//! through the state machine Idle -> Pending -> Running -> (Idle | Backoff ->
//! Pending), so no two passes ever overlap.
//!
//! A pass runs at the trailing edge of the debounce window, which opens with
//! the first request after Idle and lasts `min_interval`. Every request made
//! inside the window is served by that one pass.

use crate::types::RoleTransition;
use async_trait::async_trait;
use common::Result;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timing of the worker loop.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Debounce window, and minimum time between the starts of two passes
    pub min_interval: Duration,
    /// First retry delay after a failed pass
    pub backoff_base: Duration,
    /// Upper bound on the retry delay
    pub backoff_cap: Duration,
    /// Consecutive failures after which failures are reported as persistent
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

/// Worker state, observable through [`SyncQueue::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Pending = 1,
    Running = 2,
    Backoff = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => WorkerState::Pending,
            2 => WorkerState::Running,
            3 => WorkerState::Backoff,
            _ => WorkerState::Idle,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Pending => "pending",
            WorkerState::Running => "running",
            WorkerState::Backoff => "backoff",
        }
    }
}

/// Counters maintained by the queue and worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub passes: u64,
    pub failures: u64,
    pub coalesced: u64,
    pub state: WorkerState,
}

#[derive(Debug, Default)]
struct Shared {
    pending: AtomicBool,
    forced: AtomicBool,
    closed: AtomicBool,
    wake: Notify,
    passes: AtomicU64,
    failures: AtomicU64,
    coalesced: AtomicU64,
    state: AtomicU8,
}

/// Cloneable, non-blocking handle for requesting synchronization.
#[derive(Debug, Clone, Default)]
pub struct SyncQueue {
    shared: Arc<Shared>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pass. Calls made before the worker picks the token up
    /// collapse into a single pass.
    pub fn enqueue(&self, reason: &str) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        if self.shared.pending.swap(true, Ordering::AcqRel) {
            self.shared.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(reason, "Sync already pending, coalesced");
        } else {
            debug!(reason, "Sync enqueued");
        }
        self.shared.wake.notify_one();
    }

    /// Request a pass that also cuts a running backoff short.
    pub fn force(&self, reason: &str) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        self.shared.forced.store(true, Ordering::Release);
        self.enqueue(reason);
    }

    /// Stop accepting requests.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    pub fn is_pending(&self) -> bool {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            passes: self.shared.passes.load(Ordering::Relaxed),
            failures: self.shared.failures.load(Ordering::Relaxed),
            coalesced: self.shared.coalesced.load(Ordering::Relaxed),
            state: WorkerState::from_u8(self.shared.state.load(Ordering::Relaxed)),
        }
    }

    fn take_pending(&self) -> bool {
        self.shared.forced.store(false, Ordering::Release);
        self.shared.pending.swap(false, Ordering::AcqRel)
    }

    fn take_forced(&self) -> bool {
        self.shared.forced.swap(false, Ordering::AcqRel)
    }

    /// Put back a token without counting it as a coalesced request.
    fn requeue(&self) {
        self.shared.pending.store(true, Ordering::Release);
    }

    fn set_state(&self, state: WorkerState) {
        self.shared.state.store(state as u8, Ordering::Relaxed);
    }
}

/// The work performed by the queue worker.
#[async_trait]
pub trait SyncHandler: Send {
    /// Run one synchronization pass.
    async fn sync(&mut self) -> Result<()>;

    /// Observe a VRRP role transition before the forced pass it triggers.
    async fn role_changed(&mut self, _transition: &RoleTransition) {}
}

/// Retry delay after `failures` consecutive failures, before jitter.
pub fn backoff_delay(config: &QueueConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let delay = config.backoff_base.as_secs_f64() * f64::from(1u32 << exp);
    Duration::from_secs_f64(delay.min(config.backoff_cap.as_secs_f64()))
}

/// Scale by a random factor in 0.5..1.5, never exceeding `cap`.
fn jittered(delay: Duration, cap: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter).min(cap)
}

/// Single consumer of the [`SyncQueue`].
pub struct Worker<H> {
    queue: SyncQueue,
    handler: H,
    roles: mpsc::Receiver<RoleTransition>,
    config: QueueConfig,
    cancel: CancellationToken,
}

impl<H: SyncHandler> Worker<H> {
    pub fn new(
        queue: SyncQueue,
        handler: H,
        roles: mpsc::Receiver<RoleTransition>,
        config: QueueConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            handler,
            roles,
            config,
            cancel,
        }
    }

    /// Run until cancelled or a pass fails fatally.
    ///
    /// Cancellation is observed between passes only; an in-flight pass
    /// always completes.
    pub async fn run(mut self) -> Result<()> {
        info!("Sync worker started");
        let mut state = WorkerState::Idle;
        let mut last_start: Option<Instant> = None;
        let mut window: Option<Instant> = None;
        let mut failures: u32 = 0;
        let mut roles_open = true;

        let result = loop {
            self.queue.set_state(state);
            state = match state {
                WorkerState::Idle => {
                    if self.queue.is_pending() {
                        window = Some(Instant::now());
                        WorkerState::Pending
                    } else {
                        tokio::select! {
                            _ = self.cancel.cancelled() => break Ok(()),
                            _ = self.queue.shared.wake.notified() => WorkerState::Idle,
                            t = self.roles.recv(), if roles_open => {
                                roles_open = self.on_role(t).await;
                                WorkerState::Idle
                            }
                        }
                    }
                }

                WorkerState::Pending => {
                    let throttle = last_start.map(|t| t + self.config.min_interval);
                    let debounce = window.map(|t| t + self.config.min_interval);
                    let ready_at = throttle.max(debounce).unwrap_or_else(Instant::now);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break Ok(()),
                        _ = sleep_until(ready_at) => {
                            if self.queue.take_pending() {
                                WorkerState::Running
                            } else {
                                WorkerState::Idle
                            }
                        }
                        t = self.roles.recv(), if roles_open => {
                            roles_open = self.on_role(t).await;
                            WorkerState::Pending
                        }
                    }
                }

                WorkerState::Running => {
                    window = None;
                    last_start = Some(Instant::now());
                    self.queue.shared.passes.fetch_add(1, Ordering::Relaxed);
                    match self.handler.sync().await {
                        Ok(()) => {
                            if failures > 0 {
                                info!(failures, "Sync recovered");
                            }
                            failures = 0;
                            WorkerState::Idle
                        }
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "Fatal error during sync, stopping worker");
                            break Err(e);
                        }
                        Err(e) => {
                            failures += 1;
                            self.queue.shared.failures.fetch_add(1, Ordering::Relaxed);
                            if failures > self.config.max_retries {
                                error!(error = %e, failures, "Persistent sync failure");
                            } else {
                                warn!(error = %e, failures, "Sync failed, backing off");
                            }
                            WorkerState::Backoff
                        }
                    }
                }

                WorkerState::Backoff => {
                    let delay = jittered(
                        backoff_delay(&self.config, failures),
                        self.config.backoff_cap,
                    );
                    debug!(delay_ms = delay.as_millis() as u64, "Retrying sync after backoff");
                    self.backoff(delay, &mut roles_open).await
                }
            };
        };

        self.queue.close();
        self.queue.set_state(WorkerState::Idle);
        info!("Sync worker stopped");
        result
    }

    /// Wait out a backoff. Only a forced request or a role transition ends
    /// it early.
    async fn backoff(&mut self, delay: Duration, roles_open: &mut bool) -> WorkerState {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.queue.requeue();
                    return WorkerState::Idle;
                }
                _ = sleep_until(deadline) => {
                    self.queue.requeue();
                    return WorkerState::Pending;
                }
                _ = self.queue.shared.wake.notified() => {
                    if self.queue.take_forced() {
                        debug!("Forced sync cuts backoff short");
                        self.queue.requeue();
                        return WorkerState::Pending;
                    }
                }
                t = self.roles.recv(), if *roles_open => {
                    *roles_open = self.on_role(t).await;
                    self.queue.requeue();
                    return WorkerState::Pending;
                }
            }
        }
    }

    /// Hand a role transition to the handler and force a pass. Returns
    /// whether the role channel is still open.
    async fn on_role(&mut self, transition: Option<RoleTransition>) -> bool {
        match transition {
            Some(t) => {
                info!(
                    instance = %t.instance,
                    state = %t.state,
                    "VRRP role transition, forcing sync"
                );
                self.handler.role_changed(&t).await;
                self.queue.force("role transition");
                true
            }
            None => {
                debug!("Role channel closed");
                false
            }
        }
    }
}
