//! # Fault scheduler
//!
//! A [`FaultScript`] is an ordered list of named steps, each a condition and
//! an action. One task per script walks the list: it polls the current
//! step's condition through a [`ConditionGate`], runs the action once the
//! condition was observed true, and moves on. Steps go
//! `Pending -> Waiting -> Fired`, or end `Failed`/`Cancelled`.
//!
//! The first failing step ends the script and cancels the steps after it.
//! Failures are recorded in the [`ScriptReport`], never propagated.

use chrono::{DateTime, Utc};
use faultline_core::{CancellationToken, ConditionGate, ProgressCounter, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

type Condition = Box<dyn FnMut() -> BoxFuture<'static, Result<bool>> + Send>;
type Action = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct FaultStep {
    name: String,
    timeout: Option<Duration>,
    condition: Condition,
    action: Action,
}

/// Ordered (condition, action) steps run as one unit.
pub struct FaultScript {
    name: String,
    steps: Vec<FaultStep>,
}

impl fmt::Debug for FaultScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultScript")
            .field("name", &self.name)
            .field("steps", &self.steps.iter().map(|step| step.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

impl FaultScript {
    /// Create an empty script.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into(), steps: Vec::new() }
    }

    /// Script name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the script has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append a step waiting up to the scheduler's timeout.
    pub fn step<C, CF, A, AF>(self, name: impl Into<String>, condition: C, action: A) -> Self
    where
        C: FnMut() -> CF + Send + 'static,
        CF: Future<Output = Result<bool>> + Send + 'static,
        A: FnOnce() -> AF + Send + 'static,
        AF: Future<Output = Result<()>> + Send + 'static,
    {
        self.push(name.into(), None, condition, action)
    }

    /// Append a step whose condition must hold within `timeout`.
    pub fn step_within<C, CF, A, AF>(
        self,
        name: impl Into<String>,
        timeout: Duration,
        condition: C,
        action: A,
    ) -> Self
    where
        C: FnMut() -> CF + Send + 'static,
        CF: Future<Output = Result<bool>> + Send + 'static,
        A: FnOnce() -> AF + Send + 'static,
        AF: Future<Output = Result<()>> + Send + 'static,
    {
        self.push(name.into(), Some(timeout), condition, action)
    }

    /// Append a step firing once `progress` reaches `target`.
    pub fn at_progress<A, AF>(
        self,
        name: impl Into<String>,
        progress: &ProgressCounter,
        target: u64,
        action: A,
    ) -> Self
    where
        A: FnOnce() -> AF + Send + 'static,
        AF: Future<Output = Result<()>> + Send + 'static,
    {
        let progress = progress.clone();
        self.step(name, move || std::future::ready(Ok(progress.reached(target))), action)
    }

    /// Append a step that only waits for `condition`.
    pub fn await_condition<C, CF>(self, name: impl Into<String>, timeout: Duration, condition: C) -> Self
    where
        C: FnMut() -> CF + Send + 'static,
        CF: Future<Output = Result<bool>> + Send + 'static,
    {
        self.step_within(name, timeout, condition, || async { Ok(()) })
    }

    fn push<C, CF, A, AF>(mut self, name: String, timeout: Option<Duration>, mut condition: C, action: A) -> Self
    where
        C: FnMut() -> CF + Send + 'static,
        CF: Future<Output = Result<bool>> + Send + 'static,
        A: FnOnce() -> AF + Send + 'static,
        AF: Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push(FaultStep {
            name,
            timeout,
            condition: Box::new(move || Box::pin(condition())),
            action: Box::new(move || Box::pin(action())),
        });
        self
    }
}

/// State of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepState {
    /// Earlier steps have not fired yet
    Pending,
    /// Condition being polled
    Waiting,
    /// Action ran successfully
    Fired,
    /// Condition timed out or the action failed
    Failed,
    /// The script was cancelled or ended before this step
    Cancelled,
}

/// Observable progress of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// Step name
    pub name: String,
    /// Current state
    pub state: StepState,
    /// When the action completed
    pub fired_at: Option<DateTime<Utc>>,
    /// Failure description
    pub error: Option<String>,
}

/// Snapshot of a whole script.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptReport {
    /// Script name
    pub script: String,
    /// Steps in order
    pub steps: Vec<StepReport>,
}

impl ScriptReport {
    /// Whether every step fired.
    pub fn all_fired(&self) -> bool {
        self.steps.iter().all(|step| step.state == StepState::Fired)
    }

    /// Description of every step that did not fire.
    pub fn problems(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|step| step.state != StepState::Fired)
            .map(|step| match &step.error {
                Some(error) => format!("{}/{}: {:?}: {error}", self.script, step.name, step.state),
                None => format!("{}/{}: {:?}", self.script, step.name, step.state),
            })
            .collect()
    }
}

/// Handle of a running script.
pub struct ScriptHandle {
    name: String,
    steps: Arc<Mutex<Vec<StepReport>>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl fmt::Debug for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptHandle").field("name", &self.name).finish()
    }
}

impl ScriptHandle {
    /// Script name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state of every step.
    pub fn snapshot(&self) -> ScriptReport {
        ScriptReport { script: self.name.clone(), steps: self.steps.lock().clone() }
    }

    /// Stop the script, interrupting a running condition or action.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the script task ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the script to end.
    pub async fn join(mut self) -> ScriptReport {
        let outcome = (&mut self.task).await;
        self.conclude(outcome)
    }

    /// Wait up to `grace` for the script to end, then cancel it. A script
    /// still running `grace` after cancellation is aborted.
    pub async fn finish(mut self, grace: Duration) -> ScriptReport {
        let outcome = match tokio::time::timeout(grace, &mut self.task).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(script = %self.name, "Cancelling unfinished script");
                self.cancel.cancel();
                match tokio::time::timeout(grace, &mut self.task).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(script = %self.name, "Script ignored cancellation, aborting");
                        self.task.abort();
                        (&mut self.task).await
                    },
                }
            },
        };
        self.conclude(outcome)
    }

    fn conclude(self, outcome: std::result::Result<(), JoinError>) -> ScriptReport {
        if let Err(err) = outcome {
            warn!(script = %self.name, error = %err, "Script task ended abnormally");
        }
        let mut steps = self.steps.lock().clone();
        for step in &mut steps {
            if matches!(step.state, StepState::Pending | StepState::Waiting) {
                step.state = StepState::Cancelled;
            }
        }
        ScriptReport { script: self.name, steps }
    }
}

/// Spawns fault scripts sharing one polling policy and one run-wide cancellation token.
#[derive(Debug, Clone)]
pub struct FaultScheduler {
    gate: ConditionGate,
    run_cancel: CancellationToken,
}

impl FaultScheduler {
    /// Create a scheduler polling with `gate`; `run_cancel` stops every script.
    pub fn new(gate: ConditionGate, run_cancel: CancellationToken) -> Self {
        Self { gate, run_cancel }
    }

    /// Start a script on its own task.
    pub fn spawn(&self, script: FaultScript) -> ScriptHandle {
        let steps = Arc::new(Mutex::new(
            script
                .steps
                .iter()
                .map(|step| StepReport {
                    name: step.name.clone(),
                    state: StepState::Pending,
                    fired_at: None,
                    error: None,
                })
                .collect(),
        ));
        let cancel = self.run_cancel.child_token();
        let name = script.name.clone();
        info!(script = %name, steps = script.steps.len(), "Fault script scheduled");

        let task = tokio::spawn(run_script(script, self.gate.clone(), Arc::clone(&steps), cancel.clone()));
        ScriptHandle { name, steps, cancel, task }
    }

    /// Run `action` once `condition` is observed true; a single-step script.
    pub fn execute_when<C, CF, A, AF>(&self, name: impl Into<String>, condition: C, action: A) -> ScriptHandle
    where
        C: FnMut() -> CF + Send + 'static,
        CF: Future<Output = Result<bool>> + Send + 'static,
        A: FnOnce() -> AF + Send + 'static,
        AF: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        self.spawn(FaultScript::new(name.clone()).step(name, condition, action))
    }
}

async fn run_script(
    script: FaultScript,
    gate: ConditionGate,
    reports: Arc<Mutex<Vec<StepReport>>>,
    cancel: CancellationToken,
) {
    let script_name = script.name;
    let set = |index: usize, state: StepState, error: Option<String>| {
        let mut reports = reports.lock();
        if let Some(report) = reports.get_mut(index) {
            report.state = state;
            if state == StepState::Fired {
                report.fired_at = Some(Utc::now());
            }
            report.error = error;
        }
    };

    let mut ended = None;
    for (index, mut step) in script.steps.into_iter().enumerate() {
        if let Some(state) = ended {
            set(index, state, None);
            continue;
        }

        set(index, StepState::Waiting, None);
        let gate = match step.timeout {
            Some(timeout) => gate.clone().with_timeout(timeout),
            None => gate.clone(),
        };
        let condition = &mut step.condition;
        let observed = tokio::select! {
            _ = cancel.cancelled() => None,
            result = gate.wait_until(&step.name, || condition()) => Some(result),
        };

        match observed {
            None => {
                debug!(script = %script_name, step = %step.name, "Step cancelled");
                set(index, StepState::Cancelled, None);
                ended = Some(StepState::Cancelled);
            },
            Some(Err(err)) => {
                warn!(script = %script_name, step = %step.name, error = %err, "Step condition failed");
                set(index, StepState::Failed, Some(err.to_string()));
                ended = Some(StepState::Cancelled);
            },
            Some(Ok(())) => {
                info!(script = %script_name, step = %step.name, "Condition met, firing");
                let fired = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = (step.action)() => Some(result),
                };
                match fired {
                    None => {
                        warn!(script = %script_name, step = %step.name, "Step action interrupted");
                        set(index, StepState::Cancelled, Some("interrupted while running".to_string()));
                        ended = Some(StepState::Cancelled);
                    },
                    Some(Ok(())) => set(index, StepState::Fired, None),
                    Some(Err(err)) => {
                        warn!(script = %script_name, step = %step.name, error = %err, "Step action failed");
                        set(index, StepState::Failed, Some(err.to_string()));
                        ended = Some(StepState::Cancelled);
                    },
                }
            },
        }
    }
    debug!(script = %script_name, "Script finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_core::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scheduler() -> FaultScheduler {
        FaultScheduler::new(
            ConditionGate::new(Duration::from_millis(5), Duration::from_secs(2)),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_steps_fire_in_order_after_their_conditions() {
        let progress = ProgressCounter::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&fired);
        let second = Arc::clone(&fired);
        let observed = progress.clone();
        let script = FaultScript::new("timeline")
            .at_progress("crash", &progress, 3, move || async move {
                first.lock().push(("crash", observed.get()));
                Ok(())
            })
            .at_progress("restart", &progress, 6, move || async move {
                second.lock().push(("restart", 0));
                Ok(())
            });

        let handle = scheduler().spawn(script);
        assert_eq!(handle.snapshot().steps[1].state, StepState::Pending);

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            progress.increment();
        }
        let report = handle.join().await;

        assert!(report.all_fired(), "{:?}", report.problems());
        let fired = fired.lock().clone();
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].0, "crash");
        assert!(fired[0].1 >= 3);
        assert_eq!(fired[1].0, "restart");
        assert!(report.steps.iter().all(|step| step.fired_at.is_some()));
    }

    #[tokio::test]
    async fn test_failed_action_cancels_remaining_steps() {
        let runs = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&runs);
        let script = FaultScript::new("broken")
            .step("explode", || std::future::ready(Ok(true)), || async { Err(Error::internal("boom")) })
            .step("never", || std::future::ready(Ok(true)), move || async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        let report = scheduler().spawn(script).join().await;
        assert_eq!(report.steps[0].state, StepState::Failed);
        assert!(report.steps[0].error.as_deref().unwrap_or_default().contains("boom"));
        assert_eq!(report.steps[1].state, StepState::Cancelled);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(report.problems().len(), 2);
    }

    #[tokio::test]
    async fn test_condition_timeout_marks_step_failed() {
        let script = FaultScript::new("stuck").await_condition(
            "impossible",
            Duration::from_millis(30),
            || std::future::ready(Ok(false)),
        );
        let report = scheduler().spawn(script).join().await;
        assert_eq!(report.steps[0].state, StepState::Failed);
        assert!(report.steps[0].error.as_deref().unwrap_or_default().contains("impossible"));
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting_script() {
        let handle = scheduler().execute_when("never", || std::future::ready(Ok(false)), || async { Ok(()) });
        assert!(!handle.is_finished());
        handle.cancel();
        let report = handle.join().await;
        assert_eq!(report.steps[0].state, StepState::Cancelled);
    }

    #[tokio::test]
    async fn test_run_cancel_stops_every_script() {
        let run_cancel = CancellationToken::new();
        let scheduler = FaultScheduler::new(
            ConditionGate::new(Duration::from_millis(5), Duration::from_secs(5)),
            run_cancel.clone(),
        );
        let a = scheduler.execute_when("a", || std::future::ready(Ok(false)), || async { Ok(()) });
        let b = scheduler.execute_when("b", || std::future::ready(Ok(false)), || async { Ok(()) });

        run_cancel.cancel();
        assert_eq!(a.join().await.steps[0].state, StepState::Cancelled);
        assert_eq!(b.finish(Duration::from_secs(1)).await.steps[0].state, StepState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_action() {
        let handle = scheduler().execute_when(
            "hang",
            || std::future::ready(Ok(true)),
            || std::future::pending::<Result<()>>(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handle.snapshot().steps[0].state, StepState::Waiting);

        handle.cancel();
        let report = tokio::time::timeout(Duration::from_secs(1), handle.join()).await.unwrap();
        assert_eq!(report.steps[0].state, StepState::Cancelled);
        assert_eq!(report.steps[0].error.as_deref(), Some("interrupted while running"));
    }

    #[tokio::test]
    async fn test_finish_bounds_a_hanging_action() {
        let script = FaultScript::new("stalled")
            .step("hang", || std::future::ready(Ok(true)), || std::future::pending::<Result<()>>())
            .step("after", || std::future::ready(Ok(true)), || async { Ok(()) });
        let handle = scheduler().spawn(script);

        let report =
            tokio::time::timeout(Duration::from_secs(2), handle.finish(Duration::from_millis(50))).await.unwrap();
        assert_eq!(report.steps[0].state, StepState::Cancelled);
        assert_eq!(report.steps[1].state, StepState::Cancelled);
    }

    #[tokio::test]
    async fn test_finish_after_completion_returns_report() {
        let handle = scheduler().execute_when("now", || std::future::ready(Ok(true)), || async { Ok(()) });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(handle.is_finished());

        let report = handle.finish(Duration::from_secs(1)).await;
        assert!(report.all_fired());
    }
}
