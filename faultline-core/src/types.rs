//! Common types used throughout the faultline harness.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the pseudo-endpoint standing for external clients in proxy routing.
pub const CLIENT_ENDPOINT: &str = "client";

/// Logical identity of one cluster member.
///
/// Node ids are derived from the ordinal at topology build time and stay
/// stable for the lifetime of a run, even across restarts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from an explicit name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    /// Create the conventional node id for an ordinal.
    #[must_use]
    pub fn from_ordinal(ordinal: usize) -> Self {
        Self(format!("node-{ordinal}"))
    }

    /// Get the node name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of a record in the database under test.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RecordId(pub u64);

impl RecordId {
    /// Get the raw id value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Status of a database on a node, as reported by the distributed layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatabaseStatus {
    /// Serving reads and writes
    Online,
    /// Joined but still catching up with its peers
    Synchronizing,
    /// Not reachable from the observer
    NotAvailable,
    /// Deliberately taken offline
    Offline,
}

impl DatabaseStatus {
    /// Check if the status allows serving requests
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl fmt::Display for DatabaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "ONLINE"),
            Self::Synchronizing => write!(f, "SYNCHRONIZING"),
            Self::NotAvailable => write!(f, "NOT_AVAILABLE"),
            Self::Offline => write!(f, "OFFLINE"),
        }
    }
}
