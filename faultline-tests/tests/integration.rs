//! Orchestrator, workload and simulated-cluster tests across crate boundaries

use std::{future::ready, path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use faultline_cluster::{ClusterTopology, TcpProbe};
use faultline_core::{
    config::{HarnessConfig, SeedMode, SimSettings, StartMode},
    telemetry, CancellationToken, ConditionGate, DatabaseClient, DatabaseStatus, Error, Fields,
    LeaveKind, NodeId, ProgressCounter, Session, Statement,
};
use faultline_tests::{
    checks, ensure, ClusterTestOrchestrator, CrudCycle, DriverOutcome, DriverPolicy, DriverSpec, FaultScript,
    HarnessError, InsertRecords, MembershipRecorder, Operation, RunContext, RunState, Scenario,
    SimCluster, TargetSystem, UpdateHotRecord, WorkloadDriver,
};
use tempfile::TempDir;

fn config(root: &Path, servers: usize) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.cluster.root_dir = root.to_path_buf();
    config.cluster.server_count = servers;
    config.timeouts.node_start_ms = 5_000;
    config.timeouts.stop_grace_ms = 1_000;
    config.timeouts.poll_interval_ms = 10;
    config.timeouts.condition_timeout_ms = 5_000;
    config.timeouts.convergence_timeout_ms = 10_000;
    config.timeouts.run_ceiling_ms = 60_000;
    config.sim = SimSettings { heartbeat_interval_ms: 10, failure_timeout_ms: 150, join_delay_ms: 0 };
    config
}

fn gate() -> ConditionGate {
    ConditionGate::new(Duration::from_millis(10), Duration::from_secs(10))
}

struct Running {
    _dir: TempDir,
    sim: SimCluster,
    client: Arc<dyn DatabaseClient>,
    topology: ClusterTopology,
    nodes: Vec<NodeId>,
}

/// Start a simulated cluster and wait until every node serves the database.
async fn running_cluster(servers: usize, proxied: bool) -> Result<Running> {
    telemetry::init_for_tests();
    let dir = tempfile::tempdir()?;
    let mut config = config(dir.path(), servers);
    config.proxy.enabled = proxied;

    let sim = SimCluster::new(config.sim.clone());
    let client: Arc<dyn DatabaseClient> = Arc::new(sim.clone());
    let topology =
        ClusterTopology::build(&config, Arc::new(sim.clone()), Arc::new(TcpProbe::default())).await?;
    topology.start_all(StartMode::Concurrent).await?;

    let nodes = topology.node_ids();
    client.ensure_database(&nodes[0], topology.database()).await?;
    for node in &nodes {
        checks::wait_for_status(&gate(), &client, node, node, topology.database(), DatabaseStatus::Online)
            .await?;
    }
    Ok(Running { _dir: dir, sim, client, topology, nodes })
}

#[tokio::test]
async fn test_shutdown_and_crash_produce_different_leaves() -> Result<()> {
    let cluster = running_cluster(3, false).await?;
    let recorder = Arc::new(MembershipRecorder::new());
    cluster.client.subscribe(recorder.clone());
    let (observer, crashed, stopped) = (&cluster.nodes[0], &cluster.nodes[1], &cluster.nodes[2]);
    let database = cluster.topology.database();

    cluster.topology.shutdown_node(stopped).await?;
    gate()
        .wait_until("graceful leave observed", || ready(Ok(recorder.saw_leave(observer, stopped, LeaveKind::Graceful))))
        .await?;

    cluster.topology.crash_node(crashed).await?;
    gate()
        .wait_until("failure observed", || ready(Ok(recorder.saw_leave(observer, crashed, LeaveKind::Failed))))
        .await?;
    checks::wait_for_status(&gate(), &cluster.client, observer, crashed, database, DatabaseStatus::NotAvailable)
        .await?;

    assert!(!recorder.leaves_of(stopped).contains(&LeaveKind::Failed));
    assert!(!recorder.leaves_of(crashed).contains(&LeaveKind::Graceful));

    // One node out of three registered cannot commit.
    let mut session = cluster.client.open_session(observer, database).await?;
    let err = session.execute(Statement::insert("Item", Fields::new())).await.unwrap_err();
    assert!(matches!(err, Error::QuorumUnavailable { .. }), "{err}");
    assert!(err.is_retryable());
    session.close().await?;

    cluster.topology.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_peers_announce_proxy_routes() -> Result<()> {
    let cluster = running_cluster(3, true).await?;
    for a in &cluster.nodes {
        for b in cluster.nodes.iter().filter(|b| *b != a) {
            let route = cluster.topology.route(b, a);
            let direct = cluster.topology.node(a)?.cluster_addr();
            assert!(route.is_some());
            assert_ne!(route, Some(direct));
            gate()
                .wait_until(&format!("{b} learns {a} through the proxy"), || {
                    ready(Ok(cluster.sim.announced_address(b, a) == route))
                })
                .await?;
        }
    }
    cluster.topology.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_unproxied_peers_announce_direct_addresses() -> Result<()> {
    let cluster = running_cluster(2, false).await?;
    let (a, b) = (&cluster.nodes[0], &cluster.nodes[1]);
    let direct = cluster.topology.node(a)?.cluster_addr();
    gate()
        .wait_until("direct address learned", || ready(Ok(cluster.sim.announced_address(b, a) == Some(direct))))
        .await?;
    cluster.topology.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_contended_updates_conflict_without_losing_increments() -> Result<()> {
    let cluster = running_cluster(3, false).await?;
    let database = cluster.topology.database().to_string();

    let mut session = cluster.client.open_session(&cluster.nodes[0], &database).await?;
    session.execute(Statement::insert("Counter", UpdateHotRecord::initial_fields("hot"))).await?;
    session.close().await?;
    checks::wait_for_counts_everywhere(&gate(), &cluster.client, &cluster.nodes, &database, "Counter", 1)
        .await?;

    let progress = ProgressCounter::new();
    let cancel = CancellationToken::new();
    let policy = DriverPolicy {
        retry_budget: 200,
        retry_backoff: Duration::from_millis(1),
        pace: Duration::ZERO,
        expect_conflicts: None,
    };
    let hot: Arc<dyn Operation> = Arc::new(UpdateHotRecord::new("Counter", "hot"));
    let mut tasks = Vec::new();
    for (index, node) in cluster.nodes.iter().enumerate() {
        let driver = WorkloadDriver::new(
            format!("hot-{index}"),
            Arc::clone(&cluster.client),
            node.clone(),
            database.clone(),
            Arc::clone(&hot),
            40,
            progress.clone(),
            policy.clone(),
        );
        tasks.push(tokio::spawn(driver.run(None, cancel.clone())));
    }
    let cycle = WorkloadDriver::new(
        "cycle",
        Arc::clone(&cluster.client),
        cluster.nodes[1].clone(),
        database.clone(),
        Arc::new(CrudCycle::new("Cycle", "cycle")),
        20,
        progress.clone(),
        policy.clone(),
    );
    tasks.push(tokio::spawn(cycle.run(None, cancel.clone())));

    let mut outcomes: Vec<DriverOutcome> = Vec::new();
    for task in tasks {
        outcomes.push(task.await?);
    }
    for outcome in &outcomes {
        assert!(outcome.is_complete(), "{outcome:?}");
    }
    assert_eq!(progress.get(), 3 * 40 + 20);
    let conflicts: u64 = outcomes.iter().map(|outcome| outcome.conflicts).sum();
    assert!(conflicts > 0, "three writers on stale replicas never conflicted");

    let expected = 3 * 40;
    for node in &cluster.nodes {
        let client = Arc::clone(&cluster.client);
        let database = database.clone();
        gate()
            .wait_for(
                &format!("{node} counter at {expected}"),
                || {
                    let client = Arc::clone(&client);
                    let database = database.clone();
                    let node = node.clone();
                    async move {
                        let mut session = client.open_session(&node, &database).await?;
                        let rows = session.execute(Statement::select_all("Counter")).await;
                        session.close().await?;
                        let counter = rows?.rows().first().and_then(|row| row.int_field(UpdateHotRecord::COUNTER_FIELD));
                        Ok::<_, Error>(counter)
                    }
                },
                |counter| *counter == Some(expected),
            )
            .await?;
    }
    checks::wait_for_counts_everywhere(&gate(), &cluster.client, &cluster.nodes, &database, "Cycle", 0).await?;

    cluster.topology.teardown().await;
    Ok(())
}

/// Seeds records, then inserts from one writer per node.
struct SeededInserts {
    seed: u64,
    per_writer: u64,
}

#[async_trait]
impl Scenario for SeededInserts {
    fn name(&self) -> &str {
        "seeded-inserts"
    }

    async fn on_after_database_creation(
        &self,
        session: &mut dyn Session,
        config: &HarnessConfig,
    ) -> faultline_tests::Result<()> {
        for seq in 0..self.seed {
            let mut fields = Fields::new();
            fields.insert("seq".into(), seq.into());
            session.execute(Statement::insert(config.workload.record_type.clone(), fields)).await?;
        }
        Ok(())
    }

    fn drivers(&self, ctx: &RunContext) -> faultline_tests::Result<Vec<DriverSpec>> {
        Ok(ctx
            .nodes()
            .into_iter()
            .enumerate()
            .map(|(index, node)| {
                DriverSpec::new(
                    node,
                    Arc::new(InsertRecords::new(ctx.record_type(), format!("w{index}"))),
                    self.per_writer,
                    DriverPolicy::default().expecting_conflicts(Some(false)),
                )
            })
            .collect())
    }

    async fn on_after_execution(&self, ctx: &RunContext, outcomes: &[DriverOutcome]) -> faultline_tests::Result<()> {
        ensure(ctx.baseline() == self.seed, "baseline", || format!("baseline {}", ctx.baseline()))?;
        let inserted: u64 = outcomes.iter().map(|outcome| outcome.completed).sum();
        checks::wait_for_counts_everywhere(
            &ctx.convergence_gate(),
            &ctx.client,
            &ctx.nodes(),
            ctx.database(),
            ctx.record_type(),
            self.seed + inserted,
        )
        .await?;
        Ok(())
    }
}

fn orchestrator(dir: &TempDir, scenario: Arc<dyn Scenario>, seed_mode: SeedMode) -> ClusterTestOrchestrator {
    telemetry::init_for_tests();
    let mut config = config(dir.path(), 3);
    config.cluster.seed_mode = seed_mode;
    let target = TargetSystem::simulated(&config);
    ClusterTestOrchestrator::new(scenario, config, target)
}

#[tokio::test]
async fn test_execute_alone_starts_and_seeds_by_replication() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut run = orchestrator(&dir, Arc::new(SeededInserts { seed: 3, per_writer: 25 }), SeedMode::Replicate);

    let err = run.execute().await.unwrap_err();
    assert!(matches!(err, HarnessError::InvalidState { .. }));

    run.init(Some(2))?;
    run.prepare(false).await?;
    assert_eq!(run.state(), RunState::Built);

    let report = run.execute().await?;
    assert!(report.passed, "{:?}", report.failures);
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.completed(), 50);
    assert!(report.run_id.is_some());
    assert_eq!(run.state(), RunState::TornDown);
    assert!(run.teardown().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_cold_copy_seeds_every_node() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut run = orchestrator(&dir, Arc::new(SeededInserts { seed: 5, per_writer: 10 }), SeedMode::ColdCopy);
    run.init(None)?;
    run.prepare(true).await?;
    assert_eq!(run.state(), RunState::Seeding);
    assert_eq!(run.context().map(RunContext::baseline), Some(5));

    let report = run.execute().await?;
    assert!(report.passed, "{:?}", report.failures);
    assert_eq!(report.completed(), 30);
    Ok(())
}

struct Refused;

#[async_trait]
impl Operation for Refused {
    fn name(&self) -> &str {
        "refused"
    }

    async fn run(&self, _session: &mut dyn Session, _iteration: u64) -> faultline_core::Result<()> {
        Err(Error::Unsupported("refused by test".to_string()))
    }
}

struct Slow;

#[async_trait]
impl Operation for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn run(&self, _session: &mut dyn Session, _iteration: u64) -> faultline_core::Result<()> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(())
    }
}

/// Runs a fatal driver next to a slow one and a script that never fires.
struct Faulty;

#[async_trait]
impl Scenario for Faulty {
    fn name(&self) -> &str {
        "faulty"
    }

    fn configure(&self, config: &mut HarnessConfig) {
        config.timeouts.run_ceiling_ms = 300;
    }

    fn drivers(&self, ctx: &RunContext) -> faultline_tests::Result<Vec<DriverSpec>> {
        Ok(vec![
            DriverSpec::new(ctx.node(0)?, Arc::new(Refused), 10, DriverPolicy::default()),
            DriverSpec::new(ctx.node(1)?, Arc::new(Slow), 1_000, DriverPolicy::default()),
        ])
    }

    fn fault_scripts(&self, _ctx: &RunContext) -> faultline_tests::Result<Vec<FaultScript>> {
        Ok(vec![FaultScript::new("never")
            .step_within(
                "impossible",
                Duration::from_millis(100),
                || ready(Ok(false)),
                || ready(Ok(())),
            )
            .step("after", || ready(Ok(true)), || ready(Ok(())))])
    }
}

#[tokio::test]
async fn test_failures_are_reported_not_raised() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut run = orchestrator(&dir, Arc::new(Faulty), SeedMode::Replicate);
    run.init(Some(2))?;
    run.prepare(true).await?;

    let report = run.execute().await?;
    assert!(!report.passed);
    let failures = report.failures.join("\n");
    assert!(failures.contains("run ceiling"), "{failures}");
    assert!(failures.contains("refused by test"), "{failures}");
    assert!(failures.contains("impossible"), "{failures}");

    let refused = report.outcomes.iter().find(|outcome| outcome.driver.starts_with("refused")).unwrap();
    assert_eq!(refused.completed, 0);
    assert!(refused.fatal.is_some());
    let slow = report.outcomes.iter().find(|outcome| outcome.driver.starts_with("slow")).unwrap();
    assert!(slow.interrupted);
    assert!(slow.completed < 1_000);

    assert_eq!(report.scripts.len(), 1);
    assert_eq!(report.scripts[0].steps[1].state, faultline_tests::StepState::Cancelled);
    assert!(report.teardown_errors.is_empty(), "{:?}", report.teardown_errors);
    Ok(())
}

struct Stuck;

#[async_trait]
impl Operation for Stuck {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn run(&self, _session: &mut dyn Session, _iteration: u64) -> faultline_core::Result<()> {
        std::future::pending().await
    }
}

/// A driver and a fault action that never return on their own.
struct Hung;

#[async_trait]
impl Scenario for Hung {
    fn name(&self) -> &str {
        "hung"
    }

    fn configure(&self, config: &mut HarnessConfig) {
        config.timeouts.run_ceiling_ms = 500;
        config.timeouts.stop_grace_ms = 500;
    }

    fn drivers(&self, ctx: &RunContext) -> faultline_tests::Result<Vec<DriverSpec>> {
        Ok(vec![
            DriverSpec::new(ctx.node(0)?, Arc::new(Stuck), 10, DriverPolicy::default()),
            DriverSpec::new(
                ctx.node(1)?,
                Arc::new(InsertRecords::new(ctx.record_type(), "inserts")),
                5,
                DriverPolicy::default(),
            ),
        ])
    }

    fn fault_scripts(&self, _ctx: &RunContext) -> faultline_tests::Result<Vec<FaultScript>> {
        Ok(vec![FaultScript::new("blocked").step(
            "never returns",
            || ready(Ok(true)),
            || std::future::pending::<faultline_core::Result<()>>(),
        )])
    }
}

#[tokio::test]
async fn test_run_ceiling_interrupts_blocked_driver_and_action() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut run = orchestrator(&dir, Arc::new(Hung), SeedMode::Replicate);
    run.init(Some(2))?;
    run.prepare(true).await?;

    let report = tokio::time::timeout(Duration::from_secs(15), run.execute()).await??;
    assert!(!report.passed);
    assert_eq!(run.state(), RunState::TornDown);
    let failures = report.failures.join("\n");
    assert!(failures.contains("run ceiling of 500ms"), "{failures}");

    let stuck = report.outcomes.iter().find(|outcome| outcome.driver.starts_with("stuck")).unwrap();
    assert!(stuck.interrupted);
    assert_eq!(stuck.completed, 0);
    let inserts = report.outcomes.iter().find(|outcome| outcome.driver.starts_with("insert")).unwrap();
    assert!(inserts.is_complete(), "{inserts:?}");

    let step = &report.scripts[0].steps[0];
    assert_eq!(step.state, faultline_tests::StepState::Cancelled);
    assert!(report.teardown_errors.is_empty(), "{:?}", report.teardown_errors);
    Ok(())
}
