//! # Harness Error Handling
//!
//! Errors that end an orchestration phase. Driver failures are not errors at
//! this level: they are recorded in outcomes and judged during verification.

use thiserror::Error;

/// Errors raised by the orchestrator, scenarios and the CLI
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Core library error
    #[error(transparent)]
    Core(#[from] faultline_core::Error),

    /// Node, proxy or topology error
    #[error(transparent)]
    Cluster(#[from] faultline_cluster::Error),

    /// A setup phase failed
    #[error("Setup failed during {phase}: {reason}")]
    Setup {
        /// Phase that failed
        phase: String,
        /// Failure description
        reason: String,
    },

    /// A post-condition did not hold
    #[error("Check {check} failed: {reason}")]
    Check {
        /// Name of the check
        check: String,
        /// Diagnostic
        reason: String,
    },

    /// Operation called in the wrong run state
    #[error("Invalid run state: expected {expected}, got {actual}")]
    InvalidState {
        /// States the operation accepts
        expected: String,
        /// Current state
        actual: String,
    },

    /// No scenario registered under this name
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    /// Scenario-specific failure
    #[error("Scenario error: {0}")]
    Scenario(String),
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, HarnessError>;

impl HarnessError {
    /// Create a setup error
    pub fn setup<P: std::fmt::Display, R: std::fmt::Display>(phase: P, reason: R) -> Self {
        Self::Setup { phase: phase.to_string(), reason: reason.to_string() }
    }

    /// Create a check failure
    pub fn check<C: std::fmt::Display, R: std::fmt::Display>(check: C, reason: R) -> Self {
        Self::Check { check: check.to_string(), reason: reason.to_string() }
    }

    /// Check if the error is transient
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Core(err) => err.is_retryable(),
            Self::Cluster(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Core(err) => err.category(),
            Self::Cluster(err) => err.category(),
            Self::Setup { .. } => "setup",
            Self::Check { .. } => "check",
            Self::InvalidState { .. } => "state",
            Self::UnknownScenario(_) => "usage",
            Self::Scenario(_) => "scenario",
        }
    }

    /// Whether the error comes from invalid user input rather than the run
    pub fn is_usage(&self) -> bool {
        matches!(self, Self::UnknownScenario(_))
            || matches!(self, Self::Core(faultline_core::Error::Configuration { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_follow_source() {
        let err: HarnessError = faultline_core::Error::Cancelled.into();
        assert_eq!(err.category(), "cancelled");

        let err: HarnessError = faultline_cluster::Error::unknown_node("node-9").into();
        assert_eq!(err.category(), "node");
        assert!(!err.is_usage());

        assert!(HarnessError::UnknownScenario("nope".into()).is_usage());
        assert!(HarnessError::from(faultline_core::Error::configuration("bad")).is_usage());
    }
}
