//! Initial synchronisation barrier.
//!
//! After every (re)connect the server replays its catalog in phases. Callers
//! that need a phase to be complete (listing timers needs the DVR phase)
//! wait on [`AsyncState::wait_for_state`] instead of reading a half-filled
//! cache.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum AsyncPhase {
    Init,
    Channels,
    Dvr,
    Epg,
    Done,
}

pub struct AsyncState {
    tx: watch::Sender<AsyncPhase>,
}

impl Default for AsyncState {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncState {
    pub fn new() -> Self {
        Self { tx: watch::Sender::new(AsyncPhase::Init) }
    }

    pub fn state(&self) -> AsyncPhase {
        *self.tx.borrow()
    }

    /// Advance to `phase` and wake waiters. Going backwards is ignored.
    pub fn set_state(&self, phase: AsyncPhase) {
        self.tx.send_if_modified(|current| {
            if phase > *current {
                debug!(from = ?*current, to = ?phase, "Initial sync advanced");
                *current = phase;
                true
            } else {
                false
            }
        });
    }

    /// Back to `Init`; used when a new connection epoch starts.
    pub fn reset(&self) {
        self.tx.send_replace(AsyncPhase::Init);
    }

    /// Wait until the phase is at least `phase`; false on timeout.
    pub async fn wait_for_state(&self, phase: AsyncPhase, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        matches!(tokio::time::timeout(timeout, rx.wait_for(|current| *current >= phase)).await, Ok(Ok(_)))
    }
}
