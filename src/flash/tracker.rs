use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::info;

use crate::types::FlashState;

/// State of the background flash flow plus the gate serialising uploads.
///
/// Whoever holds the gate owns the staging paths until the guard drops.
#[derive(Debug)]
pub struct FlashTracker {
    state: RwLock<FlashState>,
    gate: Arc<Mutex<()>>,
}

impl Default for FlashTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(FlashState::Idle),
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub async fn state(&self) -> FlashState {
        *self.state.read().await
    }

    pub async fn set(&self, state: FlashState) {
        let mut current = self.state.write().await;
        if *current != state {
            info!(from = %*current, to = %state, "flash state changed");
            *current = state;
        }
    }

    /// Wait for exclusive use of the staging area
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.gate.clone().lock_owned().await
    }

    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.gate.clone().try_lock_owned().ok()
    }
}
