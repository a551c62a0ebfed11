use super::{seed_records, writer};
use crate::{
    checks,
    error::Result,
    scenario::{ensure, DriverSpec, RunContext, Scenario},
    workload::{DriverOutcome, DriverPolicy},
};
use async_trait::async_trait;
use faultline_core::{config::StartMode, HarnessConfig, Session};

/// Writers insert in parallel on distinct nodes; no fault is injected.
///
/// Every node must end up with the seed records plus every insert, and no
/// driver may observe a conflict.
#[derive(Debug, Clone)]
pub struct ConcurrentWrites {
    /// Records inserted before the drivers start
    pub seed_records: u64,
    /// Writer drivers, spread over the nodes round-robin
    pub writers: usize,
    /// Inserts per writer
    pub iterations: u64,
}

impl Default for ConcurrentWrites {
    fn default() -> Self {
        Self { seed_records: 1, writers: 2, iterations: 400 }
    }
}

#[async_trait]
impl Scenario for ConcurrentWrites {
    fn name(&self) -> &str {
        "concurrent-writes"
    }

    fn configure(&self, config: &mut HarnessConfig) {
        config.cluster.start_mode = StartMode::Sequential;
        config.workload.writers = self.writers;
        config.workload.iterations = self.iterations;
        config.workload.expect_conflicts = Some(false);
    }

    async fn on_after_database_creation(&self, session: &mut dyn Session, config: &HarnessConfig) -> Result<()> {
        seed_records(session, &config.workload.record_type, self.seed_records).await
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

    async fn on_after_execution(&self, ctx: &RunContext, outcomes: &[DriverOutcome]) -> Result<()> {
        let inserted: u64 = outcomes.iter().map(|outcome| outcome.completed).sum();
        let planned = ctx.config.workload.writers as u64 * ctx.config.workload.iterations;
        ensure(inserted == planned, "all inserts completed", || {
            format!("{inserted} of {planned} inserts completed")
        })?;

        let expected = ctx.baseline() + inserted;
        checks::wait_for_counts_everywhere(
            &ctx.convergence_gate(),
            &ctx.client,
            &ctx.nodes(),
            ctx.database(),
            ctx.record_type(),
            expected,
        )
        .await?;
        Ok(())
    }
}
