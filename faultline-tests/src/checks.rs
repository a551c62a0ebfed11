//! Post-condition probes shared by scenarios.
//!
//! Every wait goes through a [`ConditionGate`], so a check that does not hold
//! fails with the last observed value instead of hanging.

use faultline_core::{ConditionGate, DatabaseClient, DatabaseStatus, NodeId, Result};
use std::{collections::BTreeMap, sync::Arc};
use tracing::info;

/// Count records of `type_name` on `node` through a short-lived session.
pub async fn count_on(
    client: &Arc<dyn DatabaseClient>,
    node: &NodeId,
    database: &str,
    type_name: &str,
) -> Result<u64> {
    let mut session = client.open_session(node, database).await?;
    let counted = session.count_of_type(type_name).await;
    let closed = session.close().await;
    let count = counted?;
    closed?;
    Ok(count)
}

/// Counts of `type_name` on every node, keyed by node.
pub async fn counts_on(
    client: &Arc<dyn DatabaseClient>,
    nodes: &[NodeId],
    database: &str,
    type_name: &str,
) -> Result<BTreeMap<NodeId, u64>> {
    let mut counts = BTreeMap::new();
    for node in nodes {
        counts.insert(node.clone(), count_on(client, node, database, type_name).await?);
    }
    Ok(counts)
}

/// Wait until `node` reports exactly `expected` records.
pub async fn wait_for_count(
    gate: &ConditionGate,
    client: &Arc<dyn DatabaseClient>,
    node: &NodeId,
    database: &str,
    type_name: &str,
    expected: u64,
) -> Result<u64> {
    gate.wait_for(
        &format!("{node} holds {expected} {type_name} records"),
        move || count_on(client, node, database, type_name),
        |count| *count == expected,
    )
    .await
}

/// Wait until every node reports exactly `expected` records.
pub async fn wait_for_counts_everywhere(
    gate: &ConditionGate,
    client: &Arc<dyn DatabaseClient>,
    nodes: &[NodeId],
    database: &str,
    type_name: &str,
    expected: u64,
) -> Result<()> {
    gate.wait_for(
        &format!("every node holds {expected} {type_name} records"),
        move || counts_on(client, nodes, database, type_name),
        |counts| counts.values().all(|count| *count == expected),
    )
    .await?;
    info!(nodes = nodes.len(), expected, type_name, "Counts converged");
    Ok(())
}

/// Wait until every node reports the same count, and return it.
pub async fn wait_for_matching_counts(
    gate: &ConditionGate,
    client: &Arc<dyn DatabaseClient>,
    nodes: &[NodeId],
    database: &str,
    type_name: &str,
) -> Result<u64> {
    let counts = gate
        .wait_for(
            &format!("{type_name} counts agree on {} nodes", nodes.len()),
            move || counts_on(client, nodes, database, type_name),
            |counts| {
                let mut values = counts.values();
                match values.next() {
                    Some(first) => values.all(|count| count == first),
                    None => true,
                }
            },
        )
        .await?;
    Ok(counts.values().next().copied().unwrap_or(0))
}

/// Wait until `observer` reports `status` for `target`.
pub async fn wait_for_status(
    gate: &ConditionGate,
    client: &Arc<dyn DatabaseClient>,
    observer: &NodeId,
    target: &NodeId,
    database: &str,
    status: DatabaseStatus,
) -> Result<()> {
    gate.wait_for(
        &format!("{target} {status} as seen from {observer}"),
        move || client.distributed_status(observer, target, database),
        |observed| *observed == status,
    )
    .await?;
    info!(%observer, %target, %status, "Status observed");
    Ok(())
}
