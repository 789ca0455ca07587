//! Shared cancellable lifetime.
//!
//! One `Lifetime` is created per process run and handed explicitly to every
//! server task and client session. Cancelling it is level-triggered: tasks
//! that start waiting after cancellation observe it immediately.

use std::sync::Arc;

use tokio::sync::watch;

/// Cancellation handle shared by all tasks of one server run
#[derive(Debug, Clone)]
pub struct Lifetime {
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
}

impl Lifetime {
    /// Create a new, live lifetime
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            cancel_tx: Arc::new(tx),
            cancel_rx: rx,
        }
    }

    /// Cancel this lifetime. Returns true for the call that flipped it.
    pub fn cancel(&self) -> bool {
        !self.cancel_tx.send_replace(true)
    }

    /// Check whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolve once the lifetime is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}
