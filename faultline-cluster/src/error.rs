//! # Cluster Error Handling
//!
//! Resource-level failures of node processes, relays and the topology.

use thiserror::Error;

/// Errors raised by node, proxy and topology operations
#[derive(Error, Debug)]
pub enum Error {
    /// A node failed to launch or to become ready
    #[error("Node {node} failed to start: {reason}")]
    NodeStart {
        /// Node that failed
        node: String,
        /// Launch or readiness failure
        reason: String,
    },

    /// Operation not valid in the node's lifecycle state
    #[error("Invalid node state for {node}: expected {expected}, got {actual}")]
    InvalidNodeState {
        /// Node the operation targeted
        node: String,
        /// States the operation accepts
        expected: String,
        /// Current state
        actual: String,
    },

    /// No node with this id or ordinal
    #[error("Unknown node: {node}")]
    UnknownNode {
        /// Requested id or ordinal
        node: String,
    },

    /// A relay listener could not be bound
    #[error("Proxy failed to bind {listen}: {source}")]
    ProxyBind {
        /// Requested listen address
        listen: String,
        /// Bind failure
        source: std::io::Error,
    },

    /// No relay connects the two endpoints
    #[error("No relay between {from} and {to}")]
    UnknownRelay {
        /// Source endpoint
        from: String,
        /// Target endpoint
        to: String,
    },

    /// Timeout waiting for cluster operations
    #[error("Cluster operation timeout: {operation} after {timeout_ms}ms")]
    ClusterTimeout {
        /// Name of the operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Node configuration could not be rendered
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Conversion from core faultline errors
    #[error("Core error: {0}")]
    Core(#[from] faultline_core::Error),

    /// Standard I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a node start error
    pub fn node_start<N: std::fmt::Display, R: std::fmt::Display>(node: N, reason: R) -> Self {
        Self::NodeStart { node: node.to_string(), reason: reason.to_string() }
    }

    /// Create an unknown node error
    pub fn unknown_node<N: std::fmt::Display>(node: N) -> Self {
        Self::UnknownNode { node: node.to_string() }
    }

    /// Check if the error is transient
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ClusterTimeout { .. } => true,
            Self::Core(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::NodeStart { .. } | Self::InvalidNodeState { .. } | Self::UnknownNode { .. } => {
                "node"
            },
            Self::ProxyBind { .. } | Self::UnknownRelay { .. } => "proxy",
            Self::ClusterTimeout { .. } => "timeout",
            Self::Configuration(_) => "configuration",
            Self::Core(err) => err.category(),
            Self::Io(_) => "io",
        }
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<Error> for faultline_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Core(inner) => inner,
            Error::Io(io) => Self::Io(io),
            Error::Configuration(message) => Self::Configuration { message },
            other => Self::internal(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_keep_their_classification() {
        let err: Error = faultline_core::Error::unreachable("node-1", "refused").into();
        assert!(err.is_retryable());
        assert_eq!(err.category(), "availability");

        let err = Error::node_start("node-0", "port in use");
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Node node-0 failed to start: port in use");

        let core: faultline_core::Error = err.into();
        assert_eq!(core.category(), "internal");
        let core: faultline_core::Error = Error::Core(faultline_core::Error::SessionClosed).into();
        assert!(core.is_retryable());
    }
}
