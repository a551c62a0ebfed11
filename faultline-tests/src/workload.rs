//! # Workload drivers
//!
//! A [`WorkloadDriver`] repeats one [`Operation`] against one node. Each
//! iteration opens a session, runs the operation and advances the shared
//! [`ProgressCounter`] on success. Retryable errors (conflicts, contention,
//! transient unreachability) are retried with back-off up to the retry
//! budget; conflicts reload the session first, availability errors reopen
//! it. Anything else ends the driver and is recorded in its
//! [`DriverOutcome`] instead of being propagated.

use async_trait::async_trait;
use faultline_core::{
    config::WorkloadSettings, CancellationToken, DatabaseClient, Error, Fields, LatchGuard, NodeId,
    ProgressCounter, QueryResult, Result, Session, Statement,
};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Whether a driver mutates data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriverRole {
    /// Issues writes
    Writer,
    /// Issues reads only
    Reader,
}

impl fmt::Display for DriverRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Writer => write!(f, "writer"),
            Self::Reader => write!(f, "reader"),
        }
    }
}

/// Retry and verification policy of a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverPolicy {
    /// Retries of one iteration before giving up
    pub retry_budget: u32,
    /// Base back-off, doubled per retry with jitter
    pub retry_backoff: Duration,
    /// Pause between iterations
    pub pace: Duration,
    /// `Some(true)`: conflicts must occur; `Some(false)`: they must not
    pub expect_conflicts: Option<bool>,
}

impl DriverPolicy {
    /// Policy from the workload settings.
    pub fn from_settings(settings: &WorkloadSettings) -> Self {
        Self {
            retry_budget: settings.retry_budget,
            retry_backoff: settings.retry_backoff(),
            pace: settings.pace(),
            expect_conflicts: settings.expect_conflicts,
        }
    }

    /// Same policy with a conflict expectation.
    pub fn expecting_conflicts(mut self, expect: Option<bool>) -> Self {
        self.expect_conflicts = expect;
        self
    }

    fn backoff(&self, retry: u32) -> Duration {
        let base = self.retry_backoff.as_millis() as u64;
        let jitter = if base == 0 { 0 } else { rand::thread_rng().gen_range(0..=base) };
        Duration::from_millis((base << retry.min(6)).min(1_000) + jitter)
    }
}

impl Default for DriverPolicy {
    fn default() -> Self {
        Self::from_settings(&WorkloadSettings::default())
    }
}

/// One unit of work run by a driver.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Short name for logs and driver names.
    fn name(&self) -> &str;

    /// Role of drivers running this operation.
    fn role(&self) -> DriverRole {
        DriverRole::Writer
    }

    /// Run iteration `iteration` through `session`.
    async fn run(&self, session: &mut dyn Session, iteration: u64) -> Result<()>;
}

/// Inserts one record per iteration.
#[derive(Debug, Clone)]
pub struct InsertRecords {
    type_name: String,
    tag: String,
}

impl InsertRecords {
    /// Insert records of `type_name` tagged with `tag`.
    pub fn new<T: Into<String>, G: Into<String>>(type_name: T, tag: G) -> Self {
        Self { type_name: type_name.into(), tag: tag.into() }
    }
}

#[async_trait]
impl Operation for InsertRecords {
    fn name(&self) -> &str {
        "insert"
    }

    async fn run(&self, session: &mut dyn Session, iteration: u64) -> Result<()> {
        let mut fields = Fields::new();
        fields.insert("driver".into(), json!(self.tag));
        fields.insert("seq".into(), json!(iteration));
        session.execute(Statement::insert(self.type_name.clone(), fields)).await?;
        Ok(())
    }
}

/// Increments a counter on one shared record with an optimistic version check.
#[derive(Debug, Clone)]
pub struct UpdateHotRecord {
    type_name: String,
    key: String,
}

impl UpdateHotRecord {
    /// Field holding the record key.
    pub const KEY_FIELD: &'static str = "key";
    /// Field holding the counter.
    pub const COUNTER_FIELD: &'static str = "counter";

    /// Contend on the record of `type_name` whose key is `key`.
    pub fn new<T: Into<String>, K: Into<String>>(type_name: T, key: K) -> Self {
        Self { type_name: type_name.into(), key: key.into() }
    }

    /// Fields of the contended record before any update.
    pub fn initial_fields(key: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert(Self::KEY_FIELD.into(), json!(key));
        fields.insert(Self::COUNTER_FIELD.into(), json!(0));
        fields
    }
}

#[async_trait]
impl Operation for UpdateHotRecord {
    fn name(&self) -> &str {
        "update-hot"
    }

    async fn run(&self, session: &mut dyn Session, _iteration: u64) -> Result<()> {
        let result = session
            .execute(Statement::select_where(
                self.type_name.clone(),
                Self::KEY_FIELD,
                Value::from(self.key.clone()),
            ))
            .await?;
        let record = result
            .rows()
            .first()
            .cloned()
            .ok_or_else(|| Error::RecordNotFound { record: format!("{}[{}]", self.type_name, self.key) })?;

        let counter = record.int_field(Self::COUNTER_FIELD).unwrap_or(0);
        let mut fields = Fields::new();
        fields.insert(Self::COUNTER_FIELD.into(), json!(counter + 1));

        // Yield between the read and the guarded write.
        tokio::task::yield_now().await;
        session.execute(Statement::update(record.id, fields, record.version)).await?;
        Ok(())
    }
}

/// Counts records of a type.
#[derive(Debug, Clone)]
pub struct ReadRecords {
    type_name: String,
}

impl ReadRecords {
    /// Read records of `type_name`.
    pub fn new<T: Into<String>>(type_name: T) -> Self {
        Self { type_name: type_name.into() }
    }
}

#[async_trait]
impl Operation for ReadRecords {
    fn name(&self) -> &str {
        "read"
    }

    fn role(&self) -> DriverRole {
        DriverRole::Reader
    }

    async fn run(&self, session: &mut dyn Session, _iteration: u64) -> Result<()> {
        session.count_of_type(&self.type_name).await?;
        Ok(())
    }
}

/// Insert in a transaction, then select, update and delete the same record.
///
/// Leaves the record count unchanged when it completes.
#[derive(Debug, Clone)]
pub struct CrudCycle {
    type_name: String,
    tag: String,
}

impl CrudCycle {
    /// Cycle records of `type_name` tagged with `tag`.
    pub fn new<T: Into<String>, G: Into<String>>(type_name: T, tag: G) -> Self {
        Self { type_name: type_name.into(), tag: tag.into() }
    }
}

#[async_trait]
impl Operation for CrudCycle {
    fn name(&self) -> &str {
        "crud"
    }

    async fn run(&self, session: &mut dyn Session, iteration: u64) -> Result<()> {
        let marker = format!("{}-{iteration}", self.tag);
        let mut fields = Fields::new();
        fields.insert("cycle".into(), json!(marker));
        fields.insert("state".into(), json!("created"));

        session.begin().await?;
        if let Err(err) = session.execute(Statement::insert(self.type_name.clone(), fields)).await {
            session.rollback().await?;
            return Err(err);
        }
        session.commit().await?;

        let found = session
            .execute(Statement::select_where(self.type_name.clone(), "cycle", Value::from(marker.clone())))
            .await?;
        let Some(record) = found.rows().first().cloned() else {
            return Err(Error::RecordNotFound { record: marker });
        };

        let mut update = Fields::new();
        update.insert("state".into(), json!("updated"));
        let updated = session.execute(Statement::update(record.id, update, record.version)).await?;
        if updated != QueryResult::Affected(1) {
            return Err(Error::Database(format!("update of {} returned {updated:?}", record.id)));
        }

        session
            .execute(Statement::Delete { id: record.id, expected_version: Some(record.version + 1) })
            .await?;
        Ok(())
    }
}

/// Recorded result of one driver run.
#[derive(Debug, Clone, Serialize)]
pub struct DriverOutcome {
    /// Driver name
    pub driver: String,
    /// Target node
    pub node: NodeId,
    /// Role
    pub role: DriverRole,
    /// Iterations that succeeded
    pub completed: u64,
    /// Iterations requested
    pub iterations: u64,
    /// Conflicts observed, retried or not
    pub conflicts: u64,
    /// Retries performed
    pub retries: u64,
    /// Error that stopped the driver
    pub fatal: Option<String>,
    /// Whether the driver stopped on cancellation
    pub interrupted: bool,
    /// Wall-clock duration
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl DriverOutcome {
    /// Outcome of a driver aborted after it ignored cancellation.
    ///
    /// Its own counters are lost with the task, so only the request is known.
    pub fn aborted(driver: String, node: NodeId, role: DriverRole, iterations: u64, elapsed: Duration) -> Self {
        Self {
            driver,
            node,
            role,
            completed: 0,
            iterations,
            conflicts: 0,
            retries: 0,
            fatal: None,
            interrupted: true,
            elapsed,
        }
    }

    /// Whether the driver ran every iteration.
    pub fn is_complete(&self) -> bool {
        self.fatal.is_none() && !self.interrupted && self.completed == self.iterations
    }

    /// Problems with this outcome under `policy`; empty when it passes.
    pub fn check(&self, policy: &DriverPolicy) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(fatal) = &self.fatal {
            problems.push(format!("{} stopped: {fatal}", self.driver));
        }
        if self.interrupted {
            problems.push(format!(
                "{} interrupted after {}/{} iterations",
                self.driver, self.completed, self.iterations
            ));
        }
        match policy.expect_conflicts {
            Some(true) if self.conflicts == 0 => {
                problems.push(format!("{} expected conflicts but observed none", self.driver));
            },
            Some(false) if self.conflicts > 0 => {
                problems.push(format!("{} observed {} unexpected conflicts", self.driver, self.conflicts));
            },
            _ => {},
        }
        problems
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

enum Stop {
    Fatal(String),
    Interrupted,
}

/// Runs one operation against one node for a fixed number of iterations.
pub struct WorkloadDriver {
    name: String,
    client: Arc<dyn DatabaseClient>,
    node: NodeId,
    database: String,
    operation: Arc<dyn Operation>,
    iterations: u64,
    progress: ProgressCounter,
    policy: DriverPolicy,
}

impl fmt::Debug for WorkloadDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadDriver")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("iterations", &self.iterations)
            .field("policy", &self.policy)
            .finish()
    }
}

impl WorkloadDriver {
    /// Create a driver.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn DatabaseClient>,
        node: NodeId,
        database: impl Into<String>,
        operation: Arc<dyn Operation>,
        iterations: u64,
        progress: ProgressCounter,
        policy: DriverPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            node,
            database: database.into(),
            operation,
            iterations,
            progress,
            policy,
        }
    }

    /// Driver name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Policy the outcome is checked against.
    pub fn policy(&self) -> &DriverPolicy {
        &self.policy
    }

    /// Run to completion, a fatal error or cancellation.
    ///
    /// `guard` is released when the driver stops, on every exit path.
    pub async fn run(self, guard: Option<LatchGuard>, cancel: CancellationToken) -> DriverOutcome {
        let _guard = guard;
        let started = Instant::now();
        let mut outcome = DriverOutcome {
            driver: self.name.clone(),
            node: self.node.clone(),
            role: self.operation.role(),
            completed: 0,
            iterations: self.iterations,
            conflicts: 0,
            retries: 0,
            fatal: None,
            interrupted: false,
            elapsed: Duration::ZERO,
        };
        info!(driver = %self.name, node = %self.node, iterations = self.iterations, "Driver started");

        for iteration in 0..self.iterations {
            if cancel.is_cancelled() {
                outcome.interrupted = true;
                break;
            }
            match self.unit(iteration, &cancel, &mut outcome).await {
                Ok(()) => {
                    outcome.completed += 1;
                    self.progress.increment();
                },
                Err(Stop::Fatal(reason)) => {
                    warn!(driver = %self.name, iteration, %reason, "Driver stopped");
                    outcome.fatal = Some(reason);
                    break;
                },
                Err(Stop::Interrupted) => {
                    outcome.interrupted = true;
                    break;
                },
            }
            let more = iteration + 1 < self.iterations;
            if more && !self.policy.pace.is_zero() && !pause(self.policy.pace, &cancel).await {
                outcome.interrupted = true;
                break;
            }
        }

        outcome.elapsed = started.elapsed();
        info!(
            driver = %self.name,
            completed = outcome.completed,
            conflicts = outcome.conflicts,
            retries = outcome.retries,
            interrupted = outcome.interrupted,
            failed = outcome.fatal.is_some(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Driver finished"
        );
        outcome
    }

    async fn unit(
        &self,
        iteration: u64,
        cancel: &CancellationToken,
        outcome: &mut DriverOutcome,
    ) -> std::result::Result<(), Stop> {
        let mut session: Option<Box<dyn Session>> = None;
        let mut retry = 0;

        let result = loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.attempt(&mut session, iteration) => Some(result),
            };
            let err = match attempt {
                None => break Err(Stop::Interrupted),
                Some(Ok(())) => break Ok(()),
                Some(Err(err)) => err,
            };
            if err.is_conflict() {
                outcome.conflicts += 1;
            }
            if !err.is_retryable() {
                break Err(Stop::Fatal(err.to_string()));
            }
            if retry >= self.policy.retry_budget {
                break Err(Stop::Fatal(format!("retry budget of {} exhausted: {err}", self.policy.retry_budget)));
            }

            retry += 1;
            outcome.retries += 1;
            debug!(driver = %self.name, iteration, retry, error = %err, "Retrying");

            if err.is_conflict() {
                if let Some(open) = session.as_mut() {
                    if let Err(reload) = open.reload().await {
                        debug!(driver = %self.name, error = %reload, "Session reload failed, reopening");
                        close(session.take(), &self.name).await;
                    }
                }
            } else {
                close(session.take(), &self.name).await;
            }

            if !pause(self.policy.backoff(retry), cancel).await {
                break Err(Stop::Interrupted);
            }
        };

        close(session, &self.name).await;
        result
    }

    async fn attempt(&self, session: &mut Option<Box<dyn Session>>, iteration: u64) -> Result<()> {
        if session.is_none() {
            *session = Some(self.client.open_session(&self.node, &self.database).await?);
        }
        match session.as_mut() {
            Some(open) => self.operation.run(open.as_mut(), iteration).await,
            None => Err(Error::SessionClosed),
        }
    }
}

async fn close(session: Option<Box<dyn Session>>, driver: &str) {
    if let Some(session) = session {
        if let Err(err) = session.close().await {
            debug!(driver, error = %err, "Session close failed");
        }
    }
}

/// Sleep unless cancelled first; `false` on cancellation.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(conflicts: u64) -> DriverOutcome {
        DriverOutcome {
            driver: "insert-0@node-0".into(),
            node: NodeId::from_ordinal(0),
            role: DriverRole::Writer,
            completed: 10,
            iterations: 10,
            conflicts,
            retries: conflicts,
            fatal: None,
            interrupted: false,
            elapsed: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_conflict_expectations() {
        let expect = DriverPolicy::default().expecting_conflicts(Some(true));
        let forbid = DriverPolicy::default().expecting_conflicts(Some(false));
        let indifferent = DriverPolicy::default().expecting_conflicts(None);

        assert_eq!(outcome(0).check(&expect).len(), 1);
        assert!(outcome(3).check(&expect).is_empty());
        assert!(outcome(0).check(&forbid).is_empty());
        assert_eq!(outcome(3).check(&forbid).len(), 1);
        assert!(outcome(3).check(&indifferent).is_empty());
    }

    #[test]
    fn test_fatal_and_interrupted_fail_the_check() {
        let mut failed = outcome(0);
        failed.fatal = Some("corrupted".into());
        failed.interrupted = true;
        let problems = failed.check(&DriverPolicy::default());
        assert_eq!(problems.len(), 2);
        assert!(!failed.is_complete());
        assert!(outcome(0).is_complete());
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = DriverPolicy { retry_backoff: Duration::from_millis(10), ..DriverPolicy::default() };
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(20) && first <= Duration::from_millis(30));
        assert!(policy.backoff(30) <= Duration::from_millis(1_010));

        let flat = DriverPolicy { retry_backoff: Duration::ZERO, ..DriverPolicy::default() };
        assert_eq!(flat.backoff(3), Duration::ZERO);
    }
}
