//! Deadline-bounded polling of observable conditions.

use crate::{config::TimeoutSettings, sync::CancellationToken, Error, Result};
use std::{fmt::Debug, future::Future, time::Duration};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Polling gate over externally observable state.
///
/// A gate holds no state between calls, so one gate can serve any number of
/// concurrent waiters. Each call polls its own probe until the accept
/// predicate holds or the deadline passes.
#[derive(Debug, Clone)]
pub struct ConditionGate {
    poll_interval: Duration,
    timeout: Duration,
    cancel: Option<CancellationToken>,
}

impl ConditionGate {
    /// Create a gate with the given poll interval and timeout.
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self { poll_interval, timeout, cancel: None }
    }

    /// Create a gate from the configured poll interval and condition timeout.
    pub fn from_settings(settings: &TimeoutSettings) -> Self {
        Self::new(settings.poll_interval(), settings.condition_timeout())
    }

    /// Abort waits with [`Error::Cancelled`] once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Same gate with a different timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Poll `probe` until `accept` holds for its value.
    ///
    /// Probe errors count as "not yet" and become the last observation. A
    /// probe that hangs is abandoned at the deadline. On timeout the error
    /// carries the condition name, the last observation and the elapsed time.
    pub async fn wait_for<T, F, Fut, A>(&self, condition: &str, mut probe: F, accept: A) -> Result<T>
    where
        T: Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        A: Fn(&T) -> bool,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut last_observed: String;
        let mut polls: u64 = 0;

        loop {
            if self.is_cancelled() {
                return Err(Error::Cancelled);
            }

            polls += 1;
            match tokio::time::timeout_at(deadline, probe()).await {
                Ok(Ok(value)) if accept(&value) => {
                    debug!(
                        condition,
                        polls,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Condition satisfied"
                    );
                    return Ok(value);
                },
                Ok(Ok(value)) => last_observed = format!("{value:?}"),
                Ok(Err(err)) => last_observed = format!("error: {err}"),
                Err(_) => last_observed = String::from("probe did not complete"),
            }

            let now = Instant::now();
            if now >= deadline {
                let elapsed_ms = now.duration_since(started).as_millis() as u64;
                warn!(condition, %last_observed, elapsed_ms, polls, "Condition timed out");
                return Err(Error::ConditionTimeout {
                    condition: condition.to_string(),
                    last_observed,
                    elapsed_ms,
                });
            }

            let nap = self.poll_interval.min(deadline - now);
            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(nap) => {},
                    }
                },
                None => tokio::time::sleep(nap).await,
            }
        }
    }

    /// Poll a boolean probe until it reports `true`.
    pub async fn wait_until<F, Fut>(&self, condition: &str, probe: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.wait_for(condition, probe, |holds| *holds).await.map(|_| ())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::ProgressCounter;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    fn gate(timeout_ms: u64) -> ConditionGate {
        ConditionGate::new(Duration::from_millis(5), Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn test_wait_for_returns_accepted_value() {
        let counter = ProgressCounter::new();
        let writer = {
            let counter = counter.clone();
            tokio::spawn(async move {
                for _ in 0..10 {
                    counter.increment();
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let observed = gate(2_000)
            .wait_for("ten units done", || std::future::ready(Ok(counter.get())), |n| *n >= 10)
            .await
            .unwrap();
        assert!(observed >= 10);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_reports_last_observation() {
        let err = gate(40)
            .wait_for("value reaches 5", || async { Ok(3u32) }, |n| *n == 5)
            .await
            .unwrap_err();

        match err {
            Error::ConditionTimeout { condition, last_observed, elapsed_ms } => {
                assert_eq!(condition, "value reaches 5");
                assert_eq!(last_observed, "3");
                assert!(elapsed_ms >= 40);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_probe_errors_count_as_not_yet() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = gate(2_000)
            .wait_until("third probe succeeds", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(Error::unreachable("node-1", "connection refused"))
                    } else {
                        Ok(true)
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_probe_error_is_reported_on_timeout() {
        let err = gate(30)
            .wait_until("never", || async { Err::<bool, _>(Error::Database("offline".into())) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("offline"));
    }

    #[tokio::test]
    async fn test_hanging_probe_is_abandoned_at_deadline() {
        let err = gate(30)
            .wait_until("hangs", || std::future::pending::<Result<bool>>())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConditionTimeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let token = CancellationToken::new();
        let gate = gate(5_000).with_cancel(token.clone());
        let waiter = tokio::spawn(async move { gate.wait_until("never", || async { Ok(false) }).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_concurrent_waiters_poll_independently() {
        let counter = ProgressCounter::new();
        let gate = gate(2_000);
        let low = gate.wait_for("low", || std::future::ready(Ok(counter.get())), |n| *n >= 1);
        let high = gate.wait_for("high", || std::future::ready(Ok(counter.get())), |n| *n >= 3);
        let bump = async {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.increment();
            }
        };

        let (low, high, ()) = tokio::join!(low, high, bump);
        assert!(low.unwrap() >= 1);
        assert_eq!(high.unwrap(), 3);
    }
}
