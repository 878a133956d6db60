use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag, checked by the worker between pipeline steps.
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_clear() {
        assert!(!CancellationFlag::new().is_cancelled());
    }

    #[test]
    fn test_clones_share_state() {
        let flag = CancellationFlag::new();
        let other = flag.clone();

        other.cancel();
        assert!(flag.is_cancelled());

        flag.reset();
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let flag = CancellationFlag::new();
        let remote = flag.clone();
        std::thread::spawn(move || remote.cancel()).join().unwrap();
        assert!(flag.is_cancelled());
    }
}
