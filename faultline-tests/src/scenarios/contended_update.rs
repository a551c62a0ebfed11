use crate::{
    error::Result,
    scenario::{ensure, DriverSpec, RunContext, Scenario},
    workload::{DriverOutcome, DriverPolicy, UpdateHotRecord},
};
use async_trait::async_trait;
use faultline_core::{HarnessConfig, NodeId, Session, Statement};
use serde_json::Value;
use std::sync::Arc;

/// Writers on every node increment one shared counter record.
///
/// Optimistic version checks must make the drivers conflict, and once they
/// are done the counter must equal the number of completed increments on
/// every node: a lost update shows up as a smaller counter.
#[derive(Debug, Clone)]
pub struct ContendedUpdate {
    /// Key of the contended record
    pub key: String,
    /// Record type of the counter
    pub type_name: String,
    /// Writer drivers, spread over the nodes round-robin
    pub writers: usize,
    /// Increments per writer
    pub iterations: u64,
}

impl Default for ContendedUpdate {
    fn default() -> Self {
        Self { key: "hot".to_string(), type_name: "Counter".to_string(), writers: 3, iterations: 100 }
    }
}

impl ContendedUpdate {
    async fn counter_on(&self, ctx: &RunContext, node: &NodeId) -> faultline_core::Result<i64> {
        let mut session = ctx.client.open_session(node, ctx.database()).await?;
        let selected = session
            .execute(Statement::select_where(
                self.type_name.clone(),
                UpdateHotRecord::KEY_FIELD,
                Value::from(self.key.clone()),
            ))
            .await;
        let closed = session.close().await;
        let rows = selected?;
        closed?;
        Ok(rows
            .rows()
            .first()
            .and_then(|record| record.int_field(UpdateHotRecord::COUNTER_FIELD))
            .unwrap_or(-1))
    }
}

#[async_trait]
impl Scenario for ContendedUpdate {
    fn name(&self) -> &str {
        "contended-update"
    }

    fn configure(&self, config: &mut HarnessConfig) {
        config.workload.writers = self.writers;
        config.workload.iterations = self.iterations;
        config.workload.expect_conflicts = Some(true);
        config.workload.retry_budget = config.workload.retry_budget.max(50);
    }

    async fn on_after_database_creation(&self, session: &mut dyn Session, _config: &HarnessConfig) -> Result<()> {
        session
            .execute(Statement::insert(self.type_name.clone(), UpdateHotRecord::initial_fields(&self.key)))
            .await?;
        Ok(())
    }

    fn drivers(&self, ctx: &RunContext) -> Result<Vec<DriverSpec>> {
        let workload = &ctx.config.workload;
        let nodes = ctx.nodes();
        let policy = DriverPolicy::from_settings(workload);
        let operation = Arc::new(UpdateHotRecord::new(self.type_name.clone(), self.key.clone()));
        Ok((0..workload.writers)
            .map(|index| {
                DriverSpec::new(
                    nodes[index % nodes.len()].clone(),
                    operation.clone(),
                    workload.iterations,
                    policy.clone(),
                )
            })
            .collect())
    }

    async fn on_after_execution(&self, ctx: &RunContext, outcomes: &[DriverOutcome]) -> Result<()> {
        let increments: u64 = outcomes.iter().map(|outcome| outcome.completed).sum();
        let conflicts: u64 = outcomes.iter().map(|outcome| outcome.conflicts).sum();
        ensure(conflicts > 0, "contention observed", || {
            format!("{increments} increments completed without a single conflict")
        })?;

        let expected = increments as i64;
        let gate = ctx.convergence_gate();
        for node in ctx.nodes() {
            let node = &node;
            gate.wait_for(
                &format!("{node} counter reaches {expected}"),
                move || self.counter_on(ctx, node),
                |counter| *counter == expected,
            )
            .await?;
        }
        Ok(())
    }
}
