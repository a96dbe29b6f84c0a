//! Process-wide fork epoch counter.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter bumped on every rollback or switch of a current chain.
///
/// Blocks and chains record the value they were stamped with; a mismatch
/// means a reorganisation happened since and their context must be
/// re-checked before it is trusted.
#[derive(Debug, Default)]
pub struct ForkVersion(AtomicU64);

impl ForkVersion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn val(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Bump the epoch, returning the new value
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn inc_is_strictly_monotonic() {
        let version = ForkVersion::new();
        assert_eq!(version.val(), 0);
        assert_eq!(version.inc(), 1);
        assert_eq!(version.inc(), 2);
        assert_eq!(version.val(), 2);
    }

    #[test]
    fn concurrent_bumps_are_all_counted() {
        let version = Arc::new(ForkVersion::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let version = version.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        version.inc();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(version.val(), 400);
    }
}
