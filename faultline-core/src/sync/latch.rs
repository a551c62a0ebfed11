//! Countdown latch the orchestrator waits on for drivers.

use crate::{Error, Result};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Notify;

#[derive(Debug)]
struct LatchInner {
    remaining: AtomicUsize,
    notify: Notify,
}

/// Countdown barrier released once every participant has counted down.
#[derive(Debug, Clone)]
pub struct CountdownLatch {
    inner: Arc<LatchInner>,
}

impl CountdownLatch {
    /// Create a latch expecting `count` participants.
    pub fn new(count: usize) -> Self {
        Self { inner: Arc::new(LatchInner { remaining: AtomicUsize::new(count), notify: Notify::new() }) }
    }

    /// Count one participant down. Extra calls after zero are ignored.
    pub fn count_down(&self) {
        let previous = self.inner.remaining.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            n.checked_sub(1)
        });
        if previous == Ok(1) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Participants still outstanding.
    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::Acquire)
    }

    /// Guard that counts down when dropped, on every exit path of its owner.
    pub fn guard(&self) -> LatchGuard {
        LatchGuard { latch: self.clone() }
    }

    /// Wait until the count reaches zero.
    pub async fn wait_forever(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the count reaches zero or `timeout` elapses.
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.wait_forever()).await.map_err(|_| Error::LatchTimeout {
            remaining: self.remaining(),
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}

/// Counts its latch down on drop.
#[derive(Debug)]
pub struct LatchGuard {
    latch: CountdownLatch,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.latch.count_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latch_releases_after_all_participants() {
        let latch = CountdownLatch::new(3);
        for _ in 0..3 {
            let guard = latch.guard();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(guard);
            });
        }

        latch.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(latch.remaining(), 0);
    }

    #[tokio::test]
    async fn test_latch_timeout_reports_outstanding() {
        let latch = CountdownLatch::new(2);
        latch.count_down();

        let err = latch.wait(Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, Error::LatchTimeout { remaining: 1, timeout_ms: 30 }));
    }

    #[tokio::test]
    async fn test_count_down_saturates_at_zero() {
        let latch = CountdownLatch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.remaining(), 0);
        latch.wait(Duration::from_millis(10)).await.unwrap();
    }
}
