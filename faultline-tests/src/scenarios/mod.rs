//! Bundled scenarios, runnable from the `faultline` binary.
//!
//! | name | fault | end state |
//! |------|-------|-----------|
//! | `concurrent-writes` | none | every node holds `seed + writers * iterations` |
//! | `crash-restart` | crash a node at 1/3, restart it at 2/3 | node back online, counts agree |
//! | `partition-heal` | partition two nodes at 1/3, heal | peers see each other online, counts agree |
//! | `contended-update` | none | hot counter equals completed updates, conflicts seen |
//! | `graceful-shutdown` | shut down one node, crash another | peers saw a graceful leave and a failure |

mod concurrent_writes;
mod contended_update;
mod crash_restart;
mod graceful_shutdown;
mod partition_heal;

pub use concurrent_writes::ConcurrentWrites;
pub use contended_update::ContendedUpdate;
pub use crash_restart::CrashRestart;
pub use graceful_shutdown::GracefulShutdown;
pub use partition_heal::PartitionHeal;

use crate::{
    error::{HarnessError, Result},
    scenario::Scenario,
    workload::InsertRecords,
};
use faultline_core::{DatabaseClient, DatabaseStatus, Fields, NodeId, Session, Statement};
use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;

/// Names accepted by [`builtin`].
pub fn names() -> &'static [&'static str] {
    &["concurrent-writes", "crash-restart", "partition-heal", "contended-update", "graceful-shutdown"]
}

/// Bundled scenario registered under `name`, with its default parameters.
pub fn builtin(name: &str) -> Result<Arc<dyn Scenario>> {
    let scenario: Arc<dyn Scenario> = match name {
        "concurrent-writes" => Arc::new(ConcurrentWrites::default()),
        "crash-restart" => Arc::new(CrashRestart::default()),
        "partition-heal" => Arc::new(PartitionHeal::default()),
        "contended-update" => Arc::new(ContendedUpdate::default()),
        "graceful-shutdown" => Arc::new(GracefulShutdown::default()),
        other => return Err(HarnessError::UnknownScenario(other.to_string())),
    };
    Ok(scenario)
}

/// Insert `count` seed records of `type_name` in one transaction.
async fn seed_records(session: &mut dyn Session, type_name: &str, count: u64) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    session.begin().await?;
    for seq in 0..count {
        let mut fields = Fields::new();
        fields.insert("driver".into(), json!("seed"));
        fields.insert("seq".into(), json!(seq));
        session.execute(Statement::insert(type_name, fields)).await?;
    }
    session.commit().await?;
    Ok(())
}

/// Insert operation tagged after the driver's position.
fn writer(type_name: &str, index: usize) -> Arc<InsertRecords> {
    Arc::new(InsertRecords::new(type_name, format!("writer-{index}")))
}

/// Script condition: `observer` reports `status` for `target`.
fn status_is(
    client: &Arc<dyn DatabaseClient>,
    observer: &NodeId,
    target: &NodeId,
    database: &str,
    status: DatabaseStatus,
) -> impl FnMut() -> BoxFuture<'static, faultline_core::Result<bool>> + Send + 'static {
    let client = Arc::clone(client);
    let observer = observer.clone();
    let target = target.clone();
    let database = database.to_string();
    move || {
        let client = Arc::clone(&client);
        let observer = observer.clone();
        let target = target.clone();
        let database = database.clone();
        Box::pin(async move {
            Ok(client.distributed_status(&observer, &target, &database).await? == status)
        })
    }
}

/// Integer division rounding up, for progress marks.
fn fraction(total: u64, numerator: u64, denominator: u64) -> u64 {
    (total * numerator).div_ceil(denominator).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_every_name() {
        for name in names() {
            let scenario = builtin(name).unwrap();
            assert_eq!(scenario.name(), *name);
        }
        let err = builtin("split-brain").err().unwrap();
        assert!(err.is_usage());
    }

    #[test]
    fn test_progress_marks() {
        assert_eq!(fraction(1000, 1, 3), 334);
        assert_eq!(fraction(1000, 2, 3), 667);
        assert_eq!(fraction(0, 1, 3), 1);
    }
}
