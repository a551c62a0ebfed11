//! Sessions against the simulated cluster.

use super::{node::SimNode, store::DatabaseState, Shared};
use async_trait::async_trait;
use faultline_core::{Error, NodeId, QueryResult, Result, Session, Statement};
use std::sync::Arc;
use tracing::{debug, trace};

/// Session bound to one launch of one simulated node.
///
/// Reads are served from the node's replica. Writes go to the committed state
/// and need a quorum. Once the node restarts, the session reports
/// [`Error::SessionClosed`] and must be reopened.
#[derive(Debug)]
pub struct SimSession {
    shared: Arc<Shared>,
    node: NodeId,
    database: String,
    generation: u64,
    transaction: Option<Vec<Statement>>,
}

impl SimSession {
    pub(crate) fn new(shared: Arc<Shared>, node: &SimNode, database: &str) -> Self {
        Self {
            shared,
            node: node.id.clone(),
            database: database.to_string(),
            generation: node.generation,
            transaction: None,
        }
    }

    fn live(&self) -> Result<Arc<SimNode>> {
        let node = self.shared.running(&self.node)?;
        if node.generation != self.generation {
            return Err(Error::SessionClosed);
        }
        Ok(node)
    }
}

#[async_trait]
impl Session for SimSession {
    fn node(&self) -> &NodeId {
        &self.node
    }

    async fn execute(&mut self, statement: Statement) -> Result<QueryResult> {
        let node = self.live()?;
        if !DatabaseState::is_write(&statement) {
            return node.read(&self.shared, &self.database, &statement);
        }
        if let Some(buffered) = self.transaction.as_mut() {
            buffered.push(statement);
            return Ok(QueryResult::Deferred);
        }
        node.commit_with(&self.shared, &self.database, |state| state.apply(&statement))
    }

    async fn begin(&mut self) -> Result<()> {
        self.live()?;
        if self.transaction.is_some() {
            return Err(Error::Database("transaction already open".to_string()));
        }
        self.transaction = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let statements = self
            .transaction
            .take()
            .ok_or_else(|| Error::Database("no open transaction".to_string()))?;
        if statements.is_empty() {
            return Ok(());
        }
        let node = self.live()?;
        node.commit_with(&self.shared, &self.database, |state| {
            state.apply_all(&statements)?;
            Ok(QueryResult::Affected(statements.len() as u64))
        })?;
        trace!(node = %self.node, statements = statements.len(), "Transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(discarded) = self.transaction.take() {
            debug!(node = %self.node, statements = discarded.len(), "Transaction rolled back");
        }
        Ok(())
    }

    async fn reload(&mut self) -> Result<()> {
        let node = self.live()?;
        if node.has_quorum(&self.shared) {
            node.resync(&self.shared);
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        if let Some(discarded) = &self.transaction {
            debug!(node = %self.node, statements = discarded.len(), "Closing session with open transaction");
        }
        Ok(())
    }
}
