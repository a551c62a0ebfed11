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

/// Two nodes lose their link through the proxy while the workload runs,
/// then the link is restored.
///
/// Each side must see the other `NotAvailable` during the partition and
/// `Online` again after the heal; all nodes must converge on one count.
#[derive(Debug, Clone)]
pub struct PartitionHeal {
    /// Ordinals on either side of the cut
    pub sides: (usize, usize),
    /// Inserts per writer
    pub iterations: u64,
    /// Window in which each side must see the cut, then the heal
    pub detection: Duration,
}

impl Default for PartitionHeal {
    fn default() -> Self {
        Self { sides: (0, 1), iterations: 300, detection: Duration::from_secs(10) }
    }
}

#[async_trait]
impl Scenario for PartitionHeal {
    fn name(&self) -> &str {
        "partition-heal"
    }

    fn configure(&self, config: &mut HarnessConfig) {
        config.proxy.enabled = true;
        config.cluster.server_count = config.cluster.server_count.max(3);
        config.workload.iterations = self.iterations;
        if config.workload.pace_ms == 0 {
            config.workload.pace_ms = 2;
        }
    }

    async fn on_after_database_creation(&self, session: &mut dyn Session, config: &HarnessConfig) -> Result<()> {
        seed_records(session, &config.workload.record_type, 1).await
    }

    fn drivers(&self, ctx: &RunContext) -> Result<Vec<DriverSpec>> {
        let workload = &ctx.config.workload;
        let nodes = ctx.nodes();
        let policy = DriverPolicy::from_settings(workload);
        Ok((0..workload.writers)
            .map(|index| {
                DriverSpec::new(
                    nodes[index % nodes.len()].clone(),
                    writer(ctx.record_type(), index),
                    workload.iterations,
                    policy.clone(),
                )
            })
            .collect())
    }

    fn fault_scripts(&self, ctx: &RunContext) -> Result<Vec<FaultScript>> {
        let a = ctx.node(self.sides.0)?;
        let b = ctx.node(self.sides.1)?;
        let proxy = ctx
            .topology
            .proxy()
            .cloned()
            .ok_or_else(|| HarnessError::Scenario("partitions need the proxy enabled".to_string()))?;
        let total = ctx.config.workload.writers as u64 * ctx.config.workload.iterations;

        let close = {
            let proxy = Arc::clone(&proxy);
            let (a, b) = (a.clone(), b.clone());
            move || async move {
                let relays = proxy.close_partition(a.as_str(), b.as_str()).map_err(Error::from)?;
                info!(%a, %b, relays, "Partition closed");
                Ok::<_, Error>(())
            }
        };
        let heal = {
            let (a, b) = (a.clone(), b.clone());
            move || async move {
                let relays = proxy.heal_partition(a.as_str(), b.as_str()).map_err(Error::from)?;
                info!(%a, %b, relays, "Partition healed");
                Ok::<_, Error>(())
            }
        };

        let database = ctx.database();
        Ok(vec![FaultScript::new("partition-heal")
            .at_progress("close partition", &ctx.progress, fraction(total, 1, 3), close)
            .await_condition(
                "partition seen from first side",
                self.detection,
                status_is(&ctx.client, &a, &b, database, DatabaseStatus::NotAvailable),
            )
            .await_condition(
                "partition seen from second side",
                self.detection,
                status_is(&ctx.client, &b, &a, database, DatabaseStatus::NotAvailable),
            )
            .step("heal partition", || std::future::ready(Ok(true)), heal)
            .await_condition(
                "heal seen from first side",
                self.detection,
                status_is(&ctx.client, &a, &b, database, DatabaseStatus::Online),
            )
            .await_condition(
                "heal seen from second side",
                self.detection,
                status_is(&ctx.client, &b, &a, database, DatabaseStatus::Online),
            )])
    }

    async fn on_after_execution(&self, ctx: &RunContext, outcomes: &[DriverOutcome]) -> Result<()> {
        let agreed = checks::wait_for_matching_counts(
            &ctx.convergence_gate(),
            &ctx.client,
            &ctx.nodes(),
            ctx.database(),
            ctx.record_type(),
        )
        .await?;
        let inserted: u64 = outcomes.iter().map(|outcome| outcome.completed).sum();
        ensure(agreed == ctx.baseline() + inserted, "no lost writes", || {
            format!("nodes agree on {agreed} records, expected {} + {inserted}", ctx.baseline())
        })
    }
}
