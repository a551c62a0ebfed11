//! # Scenario extension surface
//!
//! A [`Scenario`] customises one orchestrated run: it adjusts the
//! configuration, seeds the database, decides which drivers run where,
//! installs fault scripts and asserts the end state. Every hook except
//! [`Scenario::name`] and [`Scenario::drivers`] has a default.
//!
//! [`RunContext`] is what hooks see of a run in progress.

use crate::{
    error::{HarnessError, Result},
    recorder::MembershipRecorder,
    scheduler::FaultScript,
    sim::SimCluster,
    workload::{DriverOutcome, DriverPolicy, Operation},
};
use async_trait::async_trait;
use faultline_cluster::{
    ClusterTopology, MembershipProbe, NodeBackend, NodeSettings, ReadinessProbe, RestartWait,
    TcpProbe,
};
use faultline_core::{
    config::ReadinessKind, CancellationToken, ConditionGate, DatabaseClient, HarnessConfig, NodeId,
    ProgressCounter, Session,
};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{Arc, OnceLock},
    time::Duration,
};

/// The system under test: how nodes are launched and how they are queried.
#[derive(Clone)]
pub struct TargetSystem {
    /// Launches node instances
    pub backend: Arc<dyn NodeBackend>,
    /// Talks to the database
    pub client: Arc<dyn DatabaseClient>,
    /// Decides when a launched node is ready
    pub probe: Arc<dyn ReadinessProbe>,
}

impl fmt::Debug for TargetSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetSystem").field("backend", &self.backend.name()).finish()
    }
}

impl TargetSystem {
    /// Pair a backend and a client, probing readiness as configured.
    pub fn new(
        backend: Arc<dyn NodeBackend>,
        client: Arc<dyn DatabaseClient>,
        readiness: ReadinessKind,
    ) -> Self {
        let probe: Arc<dyn ReadinessProbe> = match readiness {
            ReadinessKind::Tcp => Arc::new(TcpProbe::default()),
            ReadinessKind::Membership => Arc::new(MembershipProbe::new(Arc::clone(&client))),
        };
        Self { backend, client, probe }
    }

    /// In-process simulated cluster tuned by `config.sim`.
    pub fn simulated(config: &HarnessConfig) -> Self {
        let cluster = SimCluster::new(config.sim.clone());
        Self::new(Arc::new(cluster.clone()), Arc::new(cluster), config.process.readiness)
    }
}

/// One driver a scenario wants to run.
#[derive(Clone)]
pub struct DriverSpec {
    /// Node the driver's sessions connect to
    pub node: NodeId,
    /// Work done per iteration
    pub operation: Arc<dyn Operation>,
    /// Iterations to run
    pub iterations: u64,
    /// Retry and conflict policy
    pub policy: DriverPolicy,
}

impl fmt::Debug for DriverSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverSpec")
            .field("node", &self.node)
            .field("operation", &self.operation.name())
            .field("iterations", &self.iterations)
            .field("policy", &self.policy)
            .finish()
    }
}

impl DriverSpec {
    /// Create a driver spec.
    pub fn new(node: NodeId, operation: Arc<dyn Operation>, iterations: u64, policy: DriverPolicy) -> Self {
        Self { node, operation, iterations, policy }
    }
}

/// State of a run shared with scenario hooks.
pub struct RunContext {
    /// Effective configuration
    pub config: Arc<HarnessConfig>,
    /// Nodes, routes and proxy
    pub topology: Arc<ClusterTopology>,
    /// Database client
    pub client: Arc<dyn DatabaseClient>,
    /// Iterations completed by all drivers together
    pub progress: ProgressCounter,
    /// Membership events observed during the run
    pub recorder: Arc<MembershipRecorder>,
    /// Cancels drivers and scripts
    pub cancel: CancellationToken,
    baseline: OnceLock<u64>,
    pending: Mutex<Vec<FaultScript>>,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.topology.run_id())
            .field("progress", &self.progress.get())
            .field("baseline", &self.baseline.get())
            .finish()
    }
}

impl RunContext {
    pub(crate) fn new(
        config: Arc<HarnessConfig>,
        topology: Arc<ClusterTopology>,
        client: Arc<dyn DatabaseClient>,
        recorder: Arc<MembershipRecorder>,
    ) -> Self {
        Self {
            config,
            topology,
            client,
            progress: ProgressCounter::new(),
            recorder,
            cancel: CancellationToken::new(),
            baseline: OnceLock::new(),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Database under test.
    pub fn database(&self) -> &str {
        self.topology.database()
    }

    /// Record type of the built-in operations.
    pub fn record_type(&self) -> &str {
        &self.config.workload.record_type
    }

    /// Every node, in ordinal order.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.topology.node_ids()
    }

    /// Node at `ordinal`.
    pub fn node(&self, ordinal: usize) -> Result<NodeId> {
        Ok(self.topology.by_ordinal(ordinal)?.id().clone())
    }

    /// Gate with the configured poll interval and condition timeout,
    /// cancelled with the run.
    pub fn gate(&self) -> ConditionGate {
        ConditionGate::from_settings(&self.config.timeouts).with_cancel(self.cancel.clone())
    }

    /// Gate bounded by the convergence timeout instead.
    pub fn convergence_gate(&self) -> ConditionGate {
        self.gate().with_timeout(self.config.timeouts.convergence_timeout())
    }

    /// Restart wait that returns once the node reports its database online.
    pub fn restart_online(&self, timeout: Duration) -> RestartWait {
        RestartWait::Online { client: Arc::clone(&self.client), timeout }
    }

    /// Records of the seeded type present before the drivers started.
    pub fn baseline(&self) -> u64 {
        self.baseline.get().copied().unwrap_or(0)
    }

    pub(crate) fn set_baseline(&self, count: u64) {
        if self.baseline.set(count).is_err() {
            tracing::debug!(count, "Baseline already recorded");
        }
    }

    /// Queue a script to start with the drivers.
    pub fn schedule(&self, script: FaultScript) {
        self.pending.lock().push(script);
    }

    pub(crate) fn take_scheduled(&self) -> Vec<FaultScript> {
        std::mem::take(&mut *self.pending.lock())
    }
}

/// Hooks of one orchestrated scenario.
#[async_trait]
pub trait Scenario: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Adjust the configuration before the topology is built.
    fn configure(&self, _config: &mut HarnessConfig) {}

    /// Address clients use to reach the database on `node`.
    fn database_url(&self, topology: &ClusterTopology, node: &NodeId) -> Result<String> {
        let address = topology.client_route(node)?;
        Ok(format!("remote:{address}/{}", topology.database()))
    }

    /// Tune a node's settings before its first launch.
    fn distributed_server_configuration(&self, _node: &NodeId, _settings: &mut NodeSettings) {}

    /// Seed schema and data on the freshly created database.
    async fn on_after_database_creation(
        &self,
        _session: &mut dyn Session,
        _config: &HarnessConfig,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once per node after the cluster started; may schedule scripts.
    async fn on_server_started(&self, _ctx: &RunContext, _node: &NodeId) -> Result<()> {
        Ok(())
    }

    /// Drivers to run.
    fn drivers(&self, ctx: &RunContext) -> Result<Vec<DriverSpec>>;

    /// Fault scripts started together with the drivers.
    fn fault_scripts(&self, _ctx: &RunContext) -> Result<Vec<FaultScript>> {
        Ok(Vec::new())
    }

    /// Called once drivers and scripts finished, before any check.
    async fn on_before_checks(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    /// Scenario assertions over the end state.
    async fn on_after_execution(&self, _ctx: &RunContext, _outcomes: &[DriverOutcome]) -> Result<()> {
        Ok(())
    }
}

/// Fail a scenario check with a diagnostic.
pub fn ensure(condition: bool, check: &str, reason: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(HarnessError::check(check, reason()))
    }
}
