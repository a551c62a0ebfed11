//! Contract of the database under test.
//!
//! The harness never talks to a concrete driver directly. Everything it needs
//! from the cluster (sessions, statements, counts, distributed status and
//! membership callbacks) goes through the traits in this module, so the same
//! orchestration runs against a real client binding or the in-process
//! simulation shipped with the test crate.

use crate::{
    types::{DatabaseStatus, NodeId, RecordId},
    Result,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

/// Field map of a record.
pub type Fields = serde_json::Map<String, Value>;

/// A record as returned by the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record identity
    pub id: RecordId,
    /// Type (class/table) the record belongs to
    pub type_name: String,
    /// Optimistic-concurrency version, bumped on every update
    pub version: u64,
    /// Record payload
    pub fields: Fields,
}

impl Record {
    /// Read an integer field.
    pub fn int_field(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(Value::as_i64)
    }
}

/// A statement sent through a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// Create a new record
    Insert {
        /// Record type
        type_name: String,
        /// Initial fields
        fields: Fields,
    },
    /// Update fields of a record, optionally guarded by its version
    Update {
        /// Record to update
        id: RecordId,
        /// Fields to overwrite
        fields: Fields,
        /// Version the update is based on
        expected_version: Option<u64>,
    },
    /// Delete a record, optionally guarded by its version
    Delete {
        /// Record to delete
        id: RecordId,
        /// Version the delete is based on
        expected_version: Option<u64>,
    },
    /// Select records of a type, optionally filtered by one field equality
    Select {
        /// Record type
        type_name: String,
        /// Field name and value to match
        filter: Option<(String, Value)>,
    },
    /// Count records of a type
    Count {
        /// Record type
        type_name: String,
    },
    /// Free-form command understood by the collaborator
    Command(String),
}

impl Statement {
    /// Build an insert statement.
    pub fn insert<S: Into<String>>(type_name: S, fields: Fields) -> Self {
        Self::Insert { type_name: type_name.into(), fields }
    }

    /// Build a version-guarded update statement.
    pub fn update(id: RecordId, fields: Fields, expected_version: u64) -> Self {
        Self::Update { id, fields, expected_version: Some(expected_version) }
    }

    /// Build a select over all records of a type.
    pub fn select_all<S: Into<String>>(type_name: S) -> Self {
        Self::Select { type_name: type_name.into(), filter: None }
    }

    /// Build a select filtered on one field.
    pub fn select_where<S: Into<String>, F: Into<String>>(type_name: S, field: F, value: Value) -> Self {
        Self::Select { type_name: type_name.into(), filter: Some((field.into(), value)) }
    }

    /// Build a count statement.
    pub fn count<S: Into<String>>(type_name: S) -> Self {
        Self::Count { type_name: type_name.into() }
    }
}

/// Result of executing a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Rows returned by a select
    Rows(Vec<Record>),
    /// Single numeric value, for counts
    Scalar(i64),
    /// The record created by an insert
    Created(Record),
    /// Number of records touched by an update/delete
    Affected(u64),
    /// Buffered inside an open transaction, applied on commit
    Deferred,
}

impl QueryResult {
    /// Rows of a select, or an empty slice.
    pub fn rows(&self) -> &[Record] {
        match self {
            Self::Rows(rows) => rows,
            _ => &[],
        }
    }

    /// Scalar value, if any.
    pub fn scalar(&self) -> Option<i64> {
        match self {
            Self::Scalar(value) => Some(*value),
            _ => None,
        }
    }
}

/// Distributed configuration of a database as seen by one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedConfiguration {
    /// Database name
    pub database: String,
    /// Every server registered for the database
    pub servers: BTreeSet<NodeId>,
    /// Servers the observer currently sees as online for the database
    pub online: BTreeSet<NodeId>,
    /// Owner per data subset (cluster)
    pub owners: BTreeMap<String, NodeId>,
}

impl DistributedConfiguration {
    /// Owner of a data subset, if known.
    pub fn owner_of(&self, cluster: &str) -> Option<&NodeId> {
        self.owners.get(cluster)
    }

    /// All servers configured for the database.
    pub fn all_configured_servers(&self) -> impl Iterator<Item = &NodeId> {
        self.servers.iter()
    }

    /// Whether a server is seen online.
    pub fn is_online(&self, node: &NodeId) -> bool {
        self.online.contains(node)
    }
}

/// A database session bound to one node.
///
/// Sessions are never shared between drivers; `close` consumes the session.
#[async_trait]
pub trait Session: Send {
    /// Node this session is connected to.
    fn node(&self) -> &NodeId;

    /// Execute one statement.
    async fn execute(&mut self, statement: Statement) -> Result<QueryResult>;

    /// Start a transaction; later statements are buffered until commit.
    async fn begin(&mut self) -> Result<()>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Discard the open transaction.
    async fn rollback(&mut self) -> Result<()>;

    /// Count records of a type.
    async fn count_of_type(&mut self, type_name: &str) -> Result<u64> {
        let result = self.execute(Statement::count(type_name)).await?;
        let value = result.scalar().ok_or_else(|| {
            crate::Error::Database(format!("count of {type_name} returned no scalar"))
        })?;
        Ok(u64::try_from(value).unwrap_or(0))
    }

    /// Drop any cached state so the next statement sees fresh data.
    async fn reload(&mut self) -> Result<()>;

    /// Release the session.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// How a node left the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaveKind {
    /// The node announced its departure
    Graceful,
    /// The node stopped answering
    Failed,
}

impl fmt::Display for LeaveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => write!(f, "graceful"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Membership lifecycle callbacks.
///
/// Every method has a no-op default so listeners implement only what they
/// observe. Callbacks run on collaborator tasks and must not block.
pub trait MembershipListener: Send + Sync {
    /// `observer` sees `node` starting to join.
    fn on_node_joining(&self, _observer: &NodeId, _node: &NodeId) {}

    /// `observer` sees `node` as a full member.
    fn on_node_joined(&self, _observer: &NodeId, _node: &NodeId) {}

    /// `observer` sees `node` leaving.
    fn on_node_left(&self, _observer: &NodeId, _node: &NodeId, _kind: LeaveKind) {}

    /// `observer` sees the status of `database` on `node` change.
    fn on_database_status_changed(
        &self,
        _observer: &NodeId,
        _node: &NodeId,
        _database: &str,
        _status: DatabaseStatus,
    ) {
    }
}

/// Entry point to the database under test.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Create the database on a node if it does not exist yet.
    async fn ensure_database(&self, node: &NodeId, database: &str) -> Result<()>;

    /// Open a session against a node and database.
    async fn open_session(&self, node: &NodeId, database: &str) -> Result<Box<dyn Session>>;

    /// Status of `database` on `target`, as observed from `observer`.
    async fn distributed_status(
        &self,
        observer: &NodeId,
        target: &NodeId,
        database: &str,
    ) -> Result<DatabaseStatus>;

    /// Distributed configuration of `database` as observed from `observer`.
    async fn distributed_configuration(
        &self,
        observer: &NodeId,
        database: &str,
    ) -> Result<DistributedConfiguration>;

    /// Register a membership listener.
    fn subscribe(&self, listener: Arc<dyn MembershipListener>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_statement_builders() {
        let mut fields = Fields::new();
        fields.insert("value".into(), json!(1));
        let update = Statement::update(RecordId(3), fields.clone(), 7);
        assert_eq!(
            update,
            Statement::Update { id: RecordId(3), fields, expected_version: Some(7) }
        );
        assert_eq!(
            Statement::count("Account"),
            Statement::Count { type_name: "Account".into() }
        );
    }

    #[test]
    fn test_distributed_configuration_queries() {
        let node0 = NodeId::from_ordinal(0);
        let node1 = NodeId::from_ordinal(1);
        let config = DistributedConfiguration {
            database: "bank".into(),
            servers: [node0.clone(), node1.clone()].into_iter().collect(),
            online: [node0.clone()].into_iter().collect(),
            owners: [("account_0".to_string(), node0.clone())].into_iter().collect(),
        };

        assert_eq!(config.owner_of("account_0"), Some(&node0));
        assert_eq!(config.all_configured_servers().count(), 2);
        assert!(config.is_online(&node0));
        assert!(!config.is_online(&node1));
    }
}
