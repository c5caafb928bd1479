//! Exclusive device session.
//!
//! `IDLE -> BUSY` on start: the update lock is taken and the heartbeat armed.
//! `BUSY -> IDLE` on explicit teardown or when the heartbeat lapses: the
//! worker is torn down, the timer disarmed and the lock released.

pub mod heartbeat;
pub mod lease;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::types::SessionState;
use crate::worker::SharedWorker;

pub use heartbeat::Heartbeat;
pub use lease::{HeldLease, LeaseLock};

/// Port-forward tunnels opened for the orchestrator
const TUNNEL_PATTERN: &str = "socat";

/// Answer to a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Another session holds the device; nothing was changed
    Busy,
}

#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

struct Shared {
    worker: SharedWorker,
    lock: Option<LeaseLock>,
    window: Duration,
    tunnel_pattern: Option<String>,
    inner: Mutex<Inner>,
}

struct Inner {
    state: SessionState,
    heartbeat: Option<Heartbeat>,
    lease: Option<HeldLease>,
    /// Bumped per session so a stale timer cannot end a newer one
    generation: u64,
}

impl SessionController {
    pub fn new(worker: SharedWorker, lock: Option<LeaseLock>, window: Duration) -> Self {
        Self::build(worker, lock, window, Some(TUNNEL_PATTERN.into()))
    }

    /// Teardown leaves other processes alone
    pub fn without_tunnel_sweep(
        worker: SharedWorker,
        lock: Option<LeaseLock>,
        window: Duration,
    ) -> Self {
        Self::build(worker, lock, window, None)
    }

    fn build(
        worker: SharedWorker,
        lock: Option<LeaseLock>,
        window: Duration,
        tunnel_pattern: Option<String>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                worker,
                lock,
                window,
                tunnel_pattern,
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    heartbeat: None,
                    lease: None,
                    generation: 0,
                }),
            }),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    /// When the running session lapses, if one is running
    pub async fn deadline(&self) -> Option<Instant> {
        self.shared
            .inner
            .lock()
            .await
            .heartbeat
            .as_ref()
            .map(Heartbeat::deadline)
    }

    pub async fn start(&self) -> Result<StartOutcome> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state == SessionState::Busy {
            info!("start requested while busy");
            return Ok(StartOutcome::Busy);
        }

        let lease = match &self.shared.lock {
            Some(lock) => Some(lock.acquire()?),
            None => None,
        };

        inner.generation += 1;
        let generation = inner.generation;
        let controller = self.clone();
        inner.heartbeat = Some(Heartbeat::arm(self.shared.window, move || async move {
            controller.expire(generation).await;
        }));
        inner.lease = lease;
        inner.state = SessionState::Busy;

        info!(window_secs = self.shared.window.as_secs(), "session started");
        Ok(StartOutcome::Started)
    }

    /// Extend the running session. Returns false when there is none.
    pub async fn heartbeat(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        match &inner.heartbeat {
            Some(hb) => {
                hb.refresh();
                true
            }
            None => false,
        }
    }

    /// End the session and reclaim everything, whatever the current state
    pub async fn teardown(&self) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(hb) = inner.heartbeat.take() {
            hb.cancel();
        }

        if let Err(e) = self.shared.worker.lock().await.teardown(None).await {
            warn!(error = %format!("{:#}", e), "worker teardown failed");
        }
        self.sweep_tunnels().await;

        Self::finish(&mut inner);
        info!("session torn down");
    }

    /// Disarm and unlock without touching the worker
    pub async fn release(&self) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(hb) = inner.heartbeat.take() {
            hb.cancel();
        }
        Self::finish(&mut inner);
    }

    async fn expire(&self, generation: u64) {
        let mut inner = self.shared.inner.lock().await;
        if inner.generation != generation || inner.state != SessionState::Busy {
            return;
        }
        warn!("Did not receive heartbeat from client - tearing down");

        // Running inside the timer task; let it finish on its own
        inner.heartbeat = None;
        if let Err(e) = self.shared.worker.lock().await.teardown(None).await {
            warn!(error = %format!("{:#}", e), "worker teardown failed");
        }
        Self::finish(&mut inner);
    }

    fn finish(inner: &mut Inner) {
        inner.state = SessionState::Idle;
        if let Some(lease) = inner.lease.take() {
            if let Err(e) = lease.release() {
                warn!(error = %format!("{:#}", e), "failed to release update lock");
            }
        }
    }

    async fn sweep_tunnels(&self) {
        let Some(pattern) = &self.shared.tunnel_pattern else {
            return;
        };
        match Command::new("pkill").args(["-f", pattern]).output().await {
            // 1 means nothing matched
            Ok(out) if out.status.success() || out.status.code() == Some(1) => {}
            Ok(out) => warn!(
                status = %out.status,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "error tearing down tunnels"
            ),
            Err(e) => warn!(error = %e, "error tearing down tunnels"),
        }
    }
}
