//! Synchronization primitives owned by the harness.
//!
//! Drivers, fault scripts and the orchestrator never share mutable state
//! directly; they coordinate through these types:
//!
//! - [`ConditionGate`] polls an observable predicate with a deadline
//! - [`CountdownLatch`] is the barrier the orchestrator waits on for drivers
//! - [`CancellationToken`] propagates interruption to drivers and scripts;
//!   scripts hold a child of the run token
//! - [`ProgressCounter`] is the shared work counter fault conditions watch

mod gate;
mod latch;
mod progress;

pub use gate::ConditionGate;
pub use latch::{CountdownLatch, LatchGuard};
pub use progress::ProgressCounter;
pub use tokio_util::sync::CancellationToken;
