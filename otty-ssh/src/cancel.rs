use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Token used to abandon a pending operation.
///
/// Cancellation is observed the next time the owning connection is pumped
/// (or when a new operation is started on the same slot); the operation
/// then resolves with [`Error::Cancelled`](crate::Error::Cancelled).
#[derive(Clone, Debug, Default)]
pub struct Cancellable {
    flag: Arc<AtomicBool>,
}

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from any thread.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
