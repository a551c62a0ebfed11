use super::{fraction, seed_records, status_is, writer};
use crate::{
    checks,
    error::{HarnessError, Result},
    scenario::{ensure, DriverSpec, RunContext, Scenario},
    scheduler::FaultScript,
    workload::{DriverOutcome, DriverPolicy},
};
use async_trait::async_trait;
use faultline_core::{DatabaseStatus, Error, HarnessConfig, Session};
use std::{sync::Arc, time::Duration};
use tracing::info;

/// A node is killed a third of the way through the workload and restarted
/// at two thirds.
///
/// Peers must report the victim `NotAvailable` within the detection window,
/// and after the restart it must come back `Online` with the same record
/// count as the survivors.
#[derive(Debug, Clone)]
pub struct CrashRestart {
    /// Ordinal of the node to crash
    pub victim: usize,
    /// Ordinal of the node observing the victim
    pub observer: usize,
    /// Records written by all drivers together
    pub total_records: u64,
    /// Window in which the observer must see the crash
    pub detection: Duration,
    /// Window in which the restarted node must be online with matching counts
    pub recovery: Duration,
}

impl Default for CrashRestart {
    fn default() -> Self {
        Self {
            victim: 2,
            observer: 0,
            total_records: 1000,
            detection: Duration::from_secs(10),
            recovery: Duration::from_secs(20),
        }
    }
}

#[async_trait]
impl Scenario for CrashRestart {
    fn name(&self) -> &str {
        "crash-restart"
    }

    fn configure(&self, config: &mut HarnessConfig) {
        config.cluster.server_count = config.cluster.server_count.max(3);
        config.workload.writers = 2;
        config.workload.iterations = self.total_records / 2;
        if config.workload.pace_ms == 0 {
            config.workload.pace_ms = 2;
        }
    }

    async fn on_after_database_creation(&self, session: &mut dyn Session, config: &HarnessConfig) -> Result<()> {
        seed_records(session, &config.workload.record_type, 1).await
    }

    fn drivers(&self, ctx: &RunContext) -> Result<Vec<DriverSpec>> {
        let workload = &ctx.config.workload;
        let victim = ctx.node(self.victim)?;
        let survivors: Vec<_> = ctx.nodes().into_iter().filter(|node| *node != victim).collect();
        let policy = DriverPolicy::from_settings(workload);
        Ok((0..workload.writers)
            .map(|index| {
                DriverSpec::new(
                    survivors[index % survivors.len()].clone(),
                    writer(ctx.record_type(), index),
                    workload.iterations,
                    policy.clone(),
                )
            })
            .collect())
    }

    fn fault_scripts(&self, ctx: &RunContext) -> Result<Vec<FaultScript>> {
        let victim = ctx.node(self.victim)?;
        let observer = ctx.node(self.observer)?;
        if victim == observer {
            return Err(HarnessError::Scenario("the observer cannot be the crashed node".to_string()));
        }
        let total = ctx.config.workload.writers as u64 * ctx.config.workload.iterations;

        let crash = {
            let topology = Arc::clone(&ctx.topology);
            let victim = victim.clone();
            move || async move {
                info!(node = %victim, "Crashing node");
                topology.crash_node(&victim).await.map_err(Error::from)
            }
        };
        let restart = {
            let topology = Arc::clone(&ctx.topology);
            let wait = ctx.restart_online(self.recovery);
            let victim = victim.clone();
            move || async move {
                info!(node = %victim, "Restarting node");
                topology.restart_node(&victim, wait).await.map_err(Error::from)
            }
        };

        Ok(vec![FaultScript::new("crash-restart")
            .at_progress("crash", &ctx.progress, fraction(total, 1, 3), crash)
            .await_condition(
                "crash detected",
                self.detection,
                status_is(&ctx.client, &observer, &victim, ctx.database(), DatabaseStatus::NotAvailable),
            )
            .at_progress("restart", &ctx.progress, fraction(total, 2, 3), restart)])
    }

    async fn on_after_execution(&self, ctx: &RunContext, outcomes: &[DriverOutcome]) -> Result<()> {
        let victim = ctx.node(self.victim)?;
        let observer = ctx.node(self.observer)?;
        let gate = ctx.gate().with_timeout(self.recovery);

        checks::wait_for_status(&gate, &ctx.client, &observer, &victim, ctx.database(), DatabaseStatus::Online)
            .await?;
        let survivors: Vec<_> = ctx.nodes().into_iter().filter(|node| *node != victim).collect();
        let agreed =
            checks::wait_for_matching_counts(&gate, &ctx.client, &survivors, ctx.database(), ctx.record_type())
                .await?;
        checks::wait_for_count(&gate, &ctx.client, &victim, ctx.database(), ctx.record_type(), agreed).await?;

        let inserted: u64 = outcomes.iter().map(|outcome| outcome.completed).sum();
        ensure(agreed == ctx.baseline() + inserted, "no lost writes", || {
            format!("nodes agree on {agreed} records, expected {} + {inserted}", ctx.baseline())
        })
    }
}
