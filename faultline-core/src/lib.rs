//! # Faultline Core
//!
//! Shared foundations of the faultline cluster fault-injection harness.
//!
//! - [`client`]: the contract of the database under test (sessions, statements,
//!   distributed status, membership callbacks)
//! - [`config`]: layered configuration with validation
//! - [`sync`]: condition gates, latches, cancel tokens and progress counters
//! - [`telemetry`]: tracing subscriber setup
//! - [`error`]: error taxonomy distinguishing retryable conditions
//! - [`types`]: node, record and status identifiers

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod prelude;
pub mod sync;
pub mod telemetry;
pub mod types;

pub use client::{
    DatabaseClient, DistributedConfiguration, Fields, LeaveKind, MembershipListener, QueryResult,
    Record, Session, Statement,
};
pub use config::HarnessConfig;
pub use error::{Error, Result};
pub use sync::{CancellationToken, ConditionGate, CountdownLatch, LatchGuard, ProgressCounter};
pub use types::{DatabaseStatus, NodeId, RecordId, CLIENT_ENDPOINT};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
