//! Cancellation signal shared by every stage of a shard pass.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable, one-way cancellation flag.
///
/// Built on a `watch` channel: every clone observes [`cancel`](Self::cancel)
/// and can await it. Once cancelled, the signal stays cancelled.
///
/// # Examples
///
/// ```
/// use foldline_core::cancellation::CancellationSignal;
///
/// let signal = CancellationSignal::new();
/// let observer = signal.clone();
///
/// assert!(!observer.is_cancelled());
/// signal.cancel();
/// assert!(observer.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// Create a signal that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as `self`, so `changed` only errors if
        // the signal is dropped mid-await.
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}
