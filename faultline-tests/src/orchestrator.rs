//! # Cluster test orchestrator
//!
//! Drives one scenario through `init -> prepare -> execute`:
//!
//! ```text
//! Created -> Built -> Starting -> Seeding -> Running -> Verifying -> TornDown
//! ```
//!
//! Setup failures abort the run and go straight to teardown. Driver and
//! script failures never abort: they are collected and judged during
//! verification, so every outcome stays inspectable in the [`RunReport`].
//! Teardown always runs and its errors are reported next to, never instead
//! of, the run's own failures.

use crate::{
    checks,
    error::{HarnessError, Result},
    recorder::MembershipRecorder,
    scenario::{RunContext, Scenario, TargetSystem},
    scheduler::{FaultScheduler, ScriptReport},
    workload::{DriverOutcome, DriverPolicy, DriverRole, WorkloadDriver},
};
use faultline_cluster::ClusterTopology;
use faultline_core::{
    config::{self, SeedMode},
    CountdownLatch, DatabaseStatus, HarnessConfig, NodeId,
};
use serde::Serialize;
use std::{fmt, sync::Arc, time::Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

struct RunningDriver {
    name: String,
    node: NodeId,
    role: DriverRole,
    iterations: u64,
    policy: DriverPolicy,
    task: JoinHandle<DriverOutcome>,
}

/// Phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    /// Configured, nothing allocated
    Created,
    /// Topology allocated, nodes stopped
    Built,
    /// Nodes being launched
    Starting,
    /// Database created and seeded
    Seeding,
    /// Drivers and scripts running
    Running,
    /// Checks in progress
    Verifying,
    /// Nodes stopped and proxy closed
    TornDown,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of an executed run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Scenario name
    pub scenario: String,
    /// Run id of the topology
    pub run_id: Option<Uuid>,
    /// Whether no failure was recorded
    pub passed: bool,
    /// Outcome of every driver
    pub outcomes: Vec<DriverOutcome>,
    /// Final state of every fault script
    pub scripts: Vec<ScriptReport>,
    /// Everything that made the run fail
    pub failures: Vec<String>,
    /// Errors raised while tearing down
    pub teardown_errors: Vec<String>,
    /// Wall-clock duration of `execute`, in milliseconds
    pub elapsed_ms: u64,
}

impl RunReport {
    fn empty(scenario: &str) -> Self {
        Self {
            scenario: scenario.to_string(),
            run_id: None,
            passed: true,
            outcomes: Vec::new(),
            scripts: Vec::new(),
            failures: Vec::new(),
            teardown_errors: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// Iterations completed by all drivers.
    pub fn completed(&self) -> u64 {
        self.outcomes.iter().map(|outcome| outcome.completed).sum()
    }

    /// Conflicts observed by all drivers.
    pub fn conflicts(&self) -> u64 {
        self.outcomes.iter().map(|outcome| outcome.conflicts).sum()
    }
}

/// Runs one scenario against one target system.
pub struct ClusterTestOrchestrator {
    scenario: Arc<dyn Scenario>,
    config: HarnessConfig,
    target: TargetSystem,
    recorder: Arc<MembershipRecorder>,
    state: RunState,
    ctx: Option<RunContext>,
}

impl fmt::Debug for ClusterTestOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterTestOrchestrator")
            .field("scenario", &self.scenario.name())
            .field("state", &self.state)
            .field("target", &self.target)
            .finish()
    }
}

impl ClusterTestOrchestrator {
    /// Create an orchestrator; the scenario adjusts `config` first.
    pub fn new(scenario: Arc<dyn Scenario>, mut config: HarnessConfig, target: TargetSystem) -> Self {
        scenario.configure(&mut config);
        let recorder = Arc::new(MembershipRecorder::new());
        target.client.subscribe(recorder.clone());
        Self { scenario, config, target, recorder, state: RunState::Created, ctx: None }
    }

    /// Current phase.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Effective configuration.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run context, once the topology is built.
    pub fn context(&self) -> Option<&RunContext> {
        self.ctx.as_ref()
    }

    /// Membership events seen since creation.
    pub fn recorder(&self) -> &Arc<MembershipRecorder> {
        &self.recorder
    }

    /// Fix the server count and validate the configuration.
    pub fn init(&mut self, server_count: Option<usize>) -> Result<()> {
        self.require(&[RunState::Created])?;
        if let Some(count) = server_count {
            self.config.cluster.server_count = count;
        }
        config::validate(&self.config)?;
        info!(
            scenario = self.scenario.name(),
            servers = self.config.cluster.server_count,
            seed_mode = %self.config.cluster.seed_mode,
            start_mode = %self.config.cluster.start_mode,
            proxied = self.config.proxy.enabled,
            "Run initialised"
        );
        Ok(())
    }

    /// Build the topology and, with `start_nodes`, start and seed the cluster.
    pub async fn prepare(&mut self, start_nodes: bool) -> Result<()> {
        self.require(&[RunState::Created])?;
        let topology = Arc::new(
            ClusterTopology::build(
                &self.config,
                Arc::clone(&self.target.backend),
                Arc::clone(&self.target.probe),
            )
            .await?,
        );

        for id in topology.node_ids() {
            let scenario = Arc::clone(&self.scenario);
            let node = id.clone();
            topology
                .rewrite_settings(&id, move |settings| {
                    scenario.distributed_server_configuration(&node, settings)
                })
                .await?;
        }

        self.ctx = Some(RunContext::new(
            Arc::new(self.config.clone()),
            topology,
            Arc::clone(&self.target.client),
            Arc::clone(&self.recorder),
        ));
        self.state = RunState::Built;

        if start_nodes {
            if let Err(err) = self.start_and_seed().await {
                error!(error = %err, category = err.category(), "Preparation failed");
                self.teardown().await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Run drivers and fault scripts, verify, and tear down.
    ///
    /// Starts and seeds the cluster first when `prepare(false)` left it
    /// stopped. Setup failures are returned as errors; everything that goes
    /// wrong afterwards is reported in the [`RunReport`].
    pub async fn execute(&mut self) -> Result<RunReport> {
        self.require(&[RunState::Built, RunState::Seeding])?;
        if self.state == RunState::Built {
            if let Err(err) = self.start_and_seed().await {
                error!(error = %err, category = err.category(), "Preparation failed");
                self.teardown().await;
                return Err(err);
            }
        }

        let started = Instant::now();
        let mut report = RunReport::empty(self.scenario.name());
        self.state = RunState::Running;
        if let Err(err) = self.run_and_verify(&mut report).await {
            error!(error = %err, "Run aborted");
            report.failures.push(err.to_string());
        }
        report.teardown_errors = self.teardown().await;
        report.passed = report.failures.is_empty();
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        if report.passed {
            info!(
                scenario = %report.scenario,
                completed = report.completed(),
                conflicts = report.conflicts(),
                elapsed_ms = report.elapsed_ms,
                "Scenario passed"
            );
        } else {
            warn!(scenario = %report.scenario, failures = ?report.failures, "Scenario failed");
        }
        Ok(report)
    }

    /// Stop every node and close the proxy. Idempotent; never fails.
    pub async fn teardown(&mut self) -> Vec<String> {
        if self.state == RunState::TornDown {
            return Vec::new();
        }
        let errors = match &self.ctx {
            Some(ctx) => {
                ctx.cancel.cancel();
                ctx.topology.teardown().await
            },
            None => Vec::new(),
        };
        for err in &errors {
            warn!(error = %err, "Teardown error");
        }
        self.state = RunState::TornDown;
        errors
    }

    fn context_or_err(&self) -> Result<&RunContext> {
        self.ctx.as_ref().ok_or_else(|| HarnessError::InvalidState {
            expected: "Built".to_string(),
            actual: self.state.to_string(),
        })
    }

    fn require(&self, allowed: &[RunState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(HarnessError::InvalidState {
                expected: allowed.iter().map(ToString::to_string).collect::<Vec<_>>().join(" or "),
                actual: self.state.to_string(),
            })
        }
    }

    async fn start_and_seed(&mut self) -> Result<()> {
        self.state = RunState::Starting;
        let seed_mode = self.config.cluster.seed_mode;
        let start_mode = self.config.cluster.start_mode;
        let ctx = self.context_or_err()?;
        let topology = Arc::clone(&ctx.topology);
        let seed = ctx.node(self.config.cluster.seed_node)?;
        let nodes = topology.node_ids();

        match seed_mode {
            SeedMode::ColdCopy => {
                topology.start_node(&seed).await?;
                self.seed_database(&seed, &[seed.clone()]).await?;
                topology.shutdown_node(&seed).await?;
                for other in topology.others(&seed) {
                    let bytes = topology.copy_data(&seed, &other).await?;
                    info!(from = %seed, to = %other, bytes, "Seed data copied");
                }
                self.state = RunState::Starting;
                topology.start_all(start_mode).await?;
            },
            SeedMode::Replicate => {
                topology.start_all(start_mode).await?;
                self.seed_database(&seed, &nodes).await?;
            },
        }

        let ctx = self.context_or_err()?;
        let gate = ctx.convergence_gate();
        for node in &nodes {
            checks::wait_for_status(&gate, &ctx.client, node, node, ctx.database(), DatabaseStatus::Online)
                .await
                .map_err(|err| HarnessError::setup("convergence", err))?;
        }
        let baseline = checks::wait_for_matching_counts(&gate, &ctx.client, &nodes, ctx.database(), ctx.record_type())
            .await
            .map_err(|err| HarnessError::setup("convergence", err))?;
        ctx.set_baseline(baseline);

        for node in &nodes {
            let url = self.scenario.database_url(&topology, node)?;
            info!(%node, %url, "Server started");
            self.scenario.on_server_started(ctx, node).await?;
        }
        self.state = RunState::Seeding;
        info!(servers = nodes.len(), baseline, %seed_mode, "Cluster prepared");
        Ok(())
    }

    async fn seed_database(&mut self, seed: &NodeId, online: &[NodeId]) -> Result<()> {
        self.state = RunState::Seeding;
        let ctx = self.context_or_err()?;
        let database = ctx.database();
        ctx.client
            .ensure_database(seed, database)
            .await
            .map_err(|err| HarnessError::setup("database creation", err))?;

        let gate = ctx.convergence_gate();
        for node in online {
            checks::wait_for_status(&gate, &ctx.client, node, node, database, DatabaseStatus::Online)
                .await
                .map_err(|err| HarnessError::setup("database creation", err))?;
        }

        let mut session = ctx.client.open_session(seed, database).await?;
        let seeded = self.scenario.on_after_database_creation(session.as_mut(), &ctx.config).await;
        let closed = session.close().await;
        seeded?;
        closed?;
        info!(node = %seed, database, "Database seeded");
        Ok(())
    }

    async fn run_and_verify(&mut self, report: &mut RunReport) -> Result<()> {
        let ctx = self.context_or_err()?;
        report.run_id = Some(ctx.topology.run_id());

        let specs = self.scenario.drivers(ctx)?;
        let mut scripts = self.scenario.fault_scripts(ctx)?;
        scripts.extend(ctx.take_scheduled());

        let latch = CountdownLatch::new(specs.len());
        let mut drivers = Vec::with_capacity(specs.len());
        for (index, spec) in specs.into_iter().enumerate() {
            let role = spec.operation.role();
            let iterations = spec.iterations;
            let driver = WorkloadDriver::new(
                format!("{}-{index}", spec.operation.name()),
                Arc::clone(&ctx.client),
                spec.node.clone(),
                ctx.database(),
                spec.operation,
                spec.iterations,
                ctx.progress.clone(),
                spec.policy.clone(),
            );
            let name = driver.name().to_string();
            let task = tokio::spawn(driver.run(Some(latch.guard()), ctx.cancel.clone()));
            drivers.push(RunningDriver { name, node: spec.node, role, iterations, policy: spec.policy, task });
        }

        let scheduler = FaultScheduler::new(ctx.gate(), ctx.cancel.clone());
        let handles: Vec<_> = scripts.into_iter().map(|script| scheduler.spawn(script)).collect();
        info!(drivers = drivers.len(), scripts = handles.len(), "Run started");

        let started = Instant::now();
        let ceiling = ctx.config.timeouts.run_ceiling();
        if let Err(err) = latch.wait(ceiling).await {
            error!(error = %err, "Run ceiling exceeded, cancelling drivers and scripts");
            report.failures.push(format!("run ceiling of {}ms exceeded: {err}", ceiling.as_millis()));
            ctx.cancel.cancel();
        }

        let stop_grace = ctx.config.timeouts.stop_grace();
        let deadline = tokio::time::Instant::now() + stop_grace;
        let mut policies = Vec::with_capacity(drivers.len());
        for mut driver in drivers {
            let joined = match tokio::time::timeout_at(deadline, &mut driver.task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        driver = %driver.name,
                        grace_ms = stop_grace.as_millis() as u64,
                        "Driver did not stop in time, aborting"
                    );
                    driver.task.abort();
                    (&mut driver.task).await
                },
            };
            match joined {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(err) if err.is_cancelled() => report.outcomes.push(DriverOutcome::aborted(
                    driver.name,
                    driver.node,
                    driver.role,
                    driver.iterations,
                    started.elapsed(),
                )),
                Err(err) => {
                    report.failures.push(format!("driver {} panicked: {err}", driver.name));
                    continue;
                },
            }
            policies.push(driver.policy);
        }

        let grace = if ctx.cancel.is_cancelled() { stop_grace } else { ctx.config.timeouts.convergence_timeout() };
        for handle in handles {
            let script = handle.finish(grace).await;
            report.failures.extend(script.problems());
            report.scripts.push(script);
        }

        self.state = RunState::Verifying;
        let ctx = self.context_or_err()?;
        for (outcome, policy) in report.outcomes.iter().zip(&policies) {
            report.failures.extend(outcome.check(policy));
        }
        if let Err(err) = self.scenario.on_before_checks(ctx).await {
            report.failures.push(format!("before checks: {err}"));
        }
        if let Err(err) = self.scenario.on_after_execution(ctx, &report.outcomes).await {
            report.failures.push(err.to_string());
        }
        Ok(())
    }
}
