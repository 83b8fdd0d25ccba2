//! Cooperative cancellation flag shared between a batch and its caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Handle for cooperative cancellation of a batch.
///
/// Cloning is cheap and every clone observes the same flag. The row loop
/// checks it once per row, handle acquisition re-checks it while waiting,
/// and callees may poll it while they run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, non-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());

        clone.cancel();
        assert!(token.is_cancelled());
    }
}
