//! Shared progress counter watched by fault conditions.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Shared count of completed work units.
///
/// Writers publish with release semantics and observers read with acquire
/// semantics, so a fault condition that sees `n` also sees the effects the
/// drivers performed before their `n`th increment.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter {
    value: Arc<AtomicU64>,
}

impl ProgressCounter {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed unit and return the new total.
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current total.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Whether at least `target` units completed.
    pub fn reached(&self, target: u64) -> bool {
        self.get() >= target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let counter = ProgressCounter::new();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..250 {
                    counter.increment();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(counter.get(), 2000);
        assert!(counter.reached(2000));
        assert!(!counter.reached(2001));
    }
}
