//! # Faultline Cluster
//!
//! Resources of a cluster under test: node processes with a managed
//! lifecycle, a partition proxy between nodes, and the topology tying them
//! to ordinals, directories and ports.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

/// Cluster error types and handling
pub mod error;

/// Node lifecycle, backends and readiness probes
pub mod node;

/// TCP relays simulating network partitions
pub mod proxy;

/// Node set, ports and routes of one run
pub mod topology;

pub use crate::{
    error::{Error, Result},
    node::{
        LaunchSpec, MembershipProbe, NodeBackend, NodeHandle, NodeLifecycle, NodePlacement,
        NodeProcess, NodeSettings, ProcessBackend, ReadinessProbe, RestartWait, StopMode, TcpProbe,
    },
    proxy::{AddressField, AddressRewrite, PartitionProxy, RelaySpec, RelayStats, RewriteRule},
    topology::{ClusterTopology, NodeSlot},
};
