//! Cooperative pause gate checked between steps.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;

/// Single-slot pause signal.
///
/// `pause` arms the gate, `resume` releases it. The run loop only waits on it
/// at step boundaries, so a step already in flight always finishes first.
#[derive(Debug)]
pub struct PauseGate {
    tx: watch::Sender<bool>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Arm the gate. Returns `true` if it was open.
    pub fn pause(&self) -> bool {
        !self.tx.send_replace(true)
    }

    /// Release the gate. Returns `true` if it was armed.
    pub fn resume(&self) -> bool {
        self.tx.send_replace(false)
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Block while the gate is armed.
    ///
    /// # Errors
    /// `ExecutionError::Cancelled` if `cancel` fires before or while waiting.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), ExecutionError> {
        let mut rx = self.tx.subscribe();
        loop {
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
