//! Error types for the faultline core library.
//!
//! The taxonomy separates errors the workload layer may retry (conflicts,
//! contention, transient unreachability) from errors that end a driver or a
//! whole run.

use thiserror::Error;

/// Main error type for faultline core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading or validation failed
    #[error("Configuration error: {message}")]
    Configuration {
        /// What was wrong
        message: String,
    },

    /// Optimistic-lock conflict on a record
    #[error("Concurrent modification of {record}: expected version {expected}, found {actual}")]
    Conflict {
        /// Record the writer raced on
        record: String,
        /// Version the writer based its update on
        expected: u64,
        /// Version found at commit
        actual: u64,
    },

    /// A distributed lock could not be acquired in time
    #[error("Lock contention on {resource}")]
    LockContention {
        /// Contended lock
        resource: String,
    },

    /// The node cannot be reached right now
    #[error("Node {node} unreachable: {reason}")]
    Unreachable {
        /// Node addressed
        node: String,
        /// Transport-level cause
        reason: String,
    },

    /// A write could not gather a quorum of replicas
    #[error("Quorum unavailable on {node}: {reachable} of {required} required servers reachable")]
    QuorumUnavailable {
        /// Node that took the write
        node: String,
        /// Servers it could reach, itself included
        reachable: usize,
        /// Servers a write needs
        required: usize,
    },

    /// The database does not exist on the node
    #[error("Database {database} not found on {node}")]
    DatabaseNotFound {
        /// Missing database
        database: String,
        /// Node asked
        node: String,
    },

    /// A record addressed by id does not exist
    #[error("Record {record} not found")]
    RecordNotFound {
        /// Missing record
        record: String,
    },

    /// The session was already closed
    #[error("Session closed")]
    SessionClosed,

    /// Statement or operation not supported by the collaborator
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Any other failure reported by the database under test
    #[error("Database error: {0}")]
    Database(String),

    /// A polled condition did not hold before its deadline
    #[error("Timed out after {elapsed_ms}ms waiting for {condition} (last observed: {last_observed})")]
    ConditionTimeout {
        /// Description of the condition
        condition: String,
        /// Last probe value or probe error
        last_observed: String,
        /// Time spent polling
        elapsed_ms: u64,
    },

    /// A countdown latch did not reach zero before its deadline
    #[error("Latch timed out after {timeout_ms}ms with {remaining} participants outstanding")]
    LatchTimeout {
        /// Participants that had not counted down
        remaining: usize,
        /// Deadline that passed
        timeout_ms: u64,
    },

    /// The operation observed a cancellation request
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        /// Decoder or encoder message
        message: String,
    },

    /// Standard I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal harness errors
    #[error("Internal error: {message}")]
    Internal {
        /// Description
        message: String,
    },
}

/// Result type alias for faultline core operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn configuration<T: std::fmt::Display>(message: T) -> Self {
        Self::Configuration { message: message.to_string() }
    }

    /// Create an unreachable-node error
    pub fn unreachable<N: std::fmt::Display, R: std::fmt::Display>(node: N, reason: R) -> Self {
        Self::Unreachable { node: node.to_string(), reason: reason.to_string() }
    }

    /// Create an internal error
    pub fn internal<T: std::fmt::Display>(message: T) -> Self {
        Self::Internal { message: message.to_string() }
    }

    /// Check if this error is a transient condition a workload may retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::LockContention { .. }
                | Self::Unreachable { .. }
                | Self::QuorumUnavailable { .. }
                | Self::SessionClosed
        )
    }

    /// Check if this error is a concurrency conflict between racing writers
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::LockContention { .. })
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Conflict { .. } | Self::LockContention { .. } => "concurrency",
            Self::Unreachable { .. } | Self::QuorumUnavailable { .. } => "availability",
            Self::DatabaseNotFound { .. }
            | Self::RecordNotFound { .. }
            | Self::SessionClosed
            | Self::Unsupported(_)
            | Self::Database(_) => "database",
            Self::ConditionTimeout { .. } | Self::LatchTimeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Serialization { .. } => "serialization",
            Self::Io(_) => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization { message: err.to_string() }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Configuration { message: err.to_string() }
    }
}
