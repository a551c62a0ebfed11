//! # Faultline Tests
//!
//! Workload generation, fault scheduling and orchestration on top of
//! [`faultline_cluster`], plus an in-process simulated cluster and the
//! bundled scenarios.
//!
//! A run goes through three phases a scenario composes:
//!
//! 1. `init(server_count)`: fix the cluster size and validate the configuration
//! 2. `prepare(start_nodes)`: build the topology, optionally start and seed it
//! 3. `execute()`: run drivers and fault scripts, verify, tear down
//!
//! ## Writing a scenario
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use faultline_tests::prelude::*;
//! use std::sync::Arc;
//!
//! struct Inserts;
//!
//! #[async_trait]
//! impl Scenario for Inserts {
//!     fn name(&self) -> &str {
//!         "inserts"
//!     }
//!
//!     fn drivers(&self, ctx: &RunContext) -> HarnessResult<Vec<DriverSpec>> {
//!         let node = ctx.node(0)?;
//!         let operation = Arc::new(InsertRecords::new(ctx.record_type(), "inserts"));
//!         Ok(vec![DriverSpec::new(node, operation, 100, DriverPolicy::default())])
//!     }
//! }
//!
//! # async fn run() -> HarnessResult<()> {
//! let config = HarnessConfig::default();
//! let target = TargetSystem::simulated(&config);
//! let mut orchestrator = ClusterTestOrchestrator::new(Arc::new(Inserts), config, target);
//! orchestrator.init(Some(3))?;
//! orchestrator.prepare(true).await?;
//! let report = orchestrator.execute().await?;
//! assert!(report.passed, "{:?}", report.failures);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checks;
pub mod cli;
pub mod error;
pub mod orchestrator;
pub mod recorder;
pub mod scenario;
pub mod scenarios;
pub mod scheduler;
pub mod sim;
pub mod workload;

pub use error::{HarnessError, Result};
pub use orchestrator::{ClusterTestOrchestrator, RunReport, RunState};
pub use recorder::{MembershipEvent, MembershipEventKind, MembershipRecorder};
pub use scenario::{ensure, DriverSpec, RunContext, Scenario, TargetSystem};
pub use scheduler::{FaultScheduler, FaultScript, ScriptHandle, ScriptReport, StepReport, StepState};
pub use sim::SimCluster;
pub use workload::{
    CrudCycle, DriverOutcome, DriverPolicy, DriverRole, InsertRecords, Operation, ReadRecords,
    UpdateHotRecord, WorkloadDriver,
};

/// Commonly used types for writing scenarios
pub mod prelude {
    pub use crate::{
        checks,
        error::{HarnessError, Result as HarnessResult},
        orchestrator::{ClusterTestOrchestrator, RunReport, RunState},
        recorder::MembershipRecorder,
        scenario::{ensure, DriverSpec, RunContext, Scenario, TargetSystem},
        scheduler::{FaultScheduler, FaultScript, ScriptReport, StepState},
        sim::SimCluster,
        workload::{
            CrudCycle, DriverOutcome, DriverPolicy, InsertRecords, Operation, ReadRecords,
            UpdateHotRecord, WorkloadDriver,
        },
    };
    pub use faultline_cluster::{ClusterTopology, RestartWait, StopMode};
    pub use faultline_core::prelude::*;
}
