use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Cooperative cancellation for a run.
///
/// Clones share one flag. The engine checks it between changeset entries,
/// never in the middle of one.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cancellation token plus optional deadline, as seen by the apply loop.
#[derive(Debug, Clone, Default)]
pub(crate) struct Interrupt {
    pub token: CancelToken,
    pub deadline: Option<Instant>,
}

impl Interrupt {
    /// Reason to stop, if any.
    pub fn check(&self) -> Option<&'static str> {
        if self.token.is_cancelled() {
            Some("cancelled")
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some("deadline exceeded")
        } else {
            None
        }
    }
}
