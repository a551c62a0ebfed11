use super::status_is;
use crate::{
    error::{HarnessError, Result},
    scenario::{ensure, DriverSpec, RunContext, Scenario},
    scheduler::FaultScript,
    sim::SNAPSHOT_FILE,
    workload::{DriverOutcome, DriverPolicy, ReadRecords},
};
use async_trait::async_trait;
use faultline_cluster::ClusterTopology;
use faultline_core::{DatabaseStatus, Error, HarnessConfig, LeaveKind, NodeId};
use std::{future::Ready, sync::Arc, time::Duration};
use tracing::info;

/// One node is shut down and another crashed while a reader keeps querying.
///
/// Peers must observe the shutdown as a graceful leave and the crash as a
/// failure, never the other way round. The shut-down node must leave its
/// snapshot behind; both nodes are restarted before the end of the run.
#[derive(Debug, Clone)]
pub struct GracefulShutdown {
    /// Ordinal of the node shut down gracefully
    pub stopped: usize,
    /// Ordinal of the node crashed
    pub crashed: usize,
    /// Ordinal of the node observing both
    pub observer: usize,
    /// Reads issued by the reader driver
    pub reads: u64,
    /// Window for each membership change to be observed
    pub detection: Duration,
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self { stopped: 2, crashed: 1, observer: 0, reads: 200, detection: Duration::from_secs(10) }
    }
}

/// Script condition: `observer` recorded `node` leaving as `kind`.
fn left(
    ctx: &RunContext,
    observer: &NodeId,
    node: &NodeId,
    kind: LeaveKind,
) -> impl FnMut() -> Ready<faultline_core::Result<bool>> + Send + 'static {
    let recorder = Arc::clone(&ctx.recorder);
    let (observer, node) = (observer.clone(), node.clone());
    move || std::future::ready(Ok(recorder.saw_leave(&observer, &node, kind)))
}

async fn snapshot_written(topology: &ClusterTopology, node: &NodeId) -> faultline_core::Result<()> {
    let data_dir = topology.node(node).map_err(Error::from)?.lock().await.data_dir().to_path_buf();
    let snapshot = data_dir.join(SNAPSHOT_FILE);
    if tokio::fs::try_exists(&snapshot).await? {
        Ok(())
    } else {
        Err(Error::internal(format!("{node} left no snapshot at {}", snapshot.display())))
    }
}

#[async_trait]
impl Scenario for GracefulShutdown {
    fn name(&self) -> &str {
        "graceful-shutdown"
    }

    fn configure(&self, config: &mut HarnessConfig) {
        config.cluster.server_count = config.cluster.server_count.max(3);
        if config.workload.pace_ms == 0 {
            config.workload.pace_ms = 5;
        }
    }

    fn drivers(&self, ctx: &RunContext) -> Result<Vec<DriverSpec>> {
        let policy = DriverPolicy::from_settings(&ctx.config.workload);
        Ok(vec![DriverSpec::new(
            ctx.node(self.observer)?,
            Arc::new(ReadRecords::new(ctx.record_type())),
            self.reads,
            policy,
        )])
    }

    fn fault_scripts(&self, ctx: &RunContext) -> Result<Vec<FaultScript>> {
        let stopped = ctx.node(self.stopped)?;
        let crashed = ctx.node(self.crashed)?;
        let observer = ctx.node(self.observer)?;
        if stopped == crashed || observer == stopped || observer == crashed {
            return Err(HarnessError::Scenario(
                "observer, stopped and crashed nodes must be distinct".to_string(),
            ));
        }
        let database = ctx.database();
        let ready = || std::future::ready(Ok::<_, Error>(true));

        let shutdown = {
            let topology = Arc::clone(&ctx.topology);
            let node = stopped.clone();
            move || async move {
                info!(%node, "Shutting down node");
                topology.shutdown_node(&node).await.map_err(Error::from)?;
                snapshot_written(&topology, &node).await
            }
        };
        let restart_stopped = {
            let topology = Arc::clone(&ctx.topology);
            let wait = ctx.restart_online(self.detection);
            let node = stopped.clone();
            move || async move { topology.restart_node(&node, wait).await.map_err(Error::from) }
        };
        let crash = {
            let topology = Arc::clone(&ctx.topology);
            let node = crashed.clone();
            move || async move {
                info!(%node, "Crashing node");
                topology.crash_node(&node).await.map_err(Error::from)
            }
        };
        let restart_crashed = {
            let topology = Arc::clone(&ctx.topology);
            let wait = ctx.restart_online(self.detection);
            let node = crashed.clone();
            move || async move { topology.restart_node(&node, wait).await.map_err(Error::from) }
        };

        Ok(vec![FaultScript::new("graceful-shutdown")
            .step("shut down", ready, shutdown)
            .await_condition(
                "graceful leave observed",
                self.detection,
                left(ctx, &observer, &stopped, LeaveKind::Graceful),
            )
            .step("restart stopped node", ready, restart_stopped)
            .step_within(
                "crash",
                self.detection,
                status_is(&ctx.client, &observer, &stopped, database, DatabaseStatus::Online),
                crash,
            )
            .await_condition("failure observed", self.detection, left(ctx, &observer, &crashed, LeaveKind::Failed))
            .step("restart crashed node", ready, restart_crashed)
            .await_condition(
                "crashed node back online",
                self.detection,
                status_is(&ctx.client, &observer, &crashed, database, DatabaseStatus::Online),
            )])
    }

    async fn on_after_execution(&self, ctx: &RunContext, _outcomes: &[DriverOutcome]) -> Result<()> {
        let stopped = ctx.node(self.stopped)?;
        let crashed = ctx.node(self.crashed)?;

        let leaves = ctx.recorder.leaves_of(&stopped);
        ensure(
            leaves.contains(&LeaveKind::Graceful) && !leaves.contains(&LeaveKind::Failed),
            "shutdown seen as graceful",
            || format!("leaves of {stopped}: {leaves:?}"),
        )?;

        let leaves = ctx.recorder.leaves_of(&crashed);
        ensure(
            leaves.contains(&LeaveKind::Failed) && !leaves.contains(&LeaveKind::Graceful),
            "crash seen as failure",
            || format!("leaves of {crashed}: {leaves:?}"),
        )
    }
}
