//! # Prelude
//!
//! Commonly used types and traits of the faultline core library.

pub use crate::{
    client::{
        DatabaseClient, DistributedConfiguration, Fields, LeaveKind, MembershipListener,
        QueryResult, Record, Session, Statement,
    },
    config::{ConfigLoader, HarnessConfig},
    error::{Error, Result},
    sync::{CancellationToken, ConditionGate, CountdownLatch, ProgressCounter},
    types::{DatabaseStatus, NodeId, RecordId},
};

pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
