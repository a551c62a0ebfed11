//! Command line of the `faultline` binary.

use crate::{
    error::Result,
    orchestrator::{ClusterTestOrchestrator, RunReport},
    scenario::TargetSystem,
    scenarios,
};
use clap::{Parser, ValueEnum};
use faultline_core::{config::ConfigLoader, telemetry};
use std::{fmt, path::PathBuf};
use tracing::info;

/// Orchestration phases to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    /// Build, start and seed the cluster, then tear it down
    Prepare,
    /// Build the cluster stopped, then start, seed and run it
    Execute,
    /// Build, start and seed, then run
    #[value(name = "prepare+execute")]
    PrepareExecute,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prepare => write!(f, "prepare"),
            Self::Execute => write!(f, "execute"),
            Self::PrepareExecute => write!(f, "prepare+execute"),
        }
    }
}

/// Run a bundled fault-injection scenario against a simulated cluster.
#[derive(Debug, Parser)]
#[command(name = "faultline", version, about)]
pub struct Cli {
    /// Scenario name
    #[arg(value_parser = clap::builder::PossibleValuesParser::new(scenarios::names().iter().copied()))]
    pub scenario: String,

    /// Phases to run
    pub mode: RunMode,

    /// Number of nodes; the configured count when absent
    pub server_count: Option<usize>,

    /// Configuration file; searched in the default locations when absent
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

/// What a CLI invocation produced.
#[derive(Debug)]
pub enum Completion {
    /// The cluster was prepared and torn down
    Prepared {
        /// Teardown errors, logged but not fatal
        teardown_errors: Vec<String>,
    },
    /// The scenario ran
    Executed(RunReport),
}

impl Completion {
    /// Whether the invocation counts as a success.
    pub fn passed(&self) -> bool {
        match self {
            Self::Prepared { .. } => true,
            Self::Executed(report) => report.passed,
        }
    }
}

/// Load configuration, set up logging and run the requested phases.
pub async fn run(cli: &Cli) -> Result<Completion> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let config = loader.load()?;
    telemetry::init(&config.logging)?;

    let scenario = scenarios::builtin(&cli.scenario)?;
    let target = TargetSystem::simulated(&config);
    let mut orchestrator = ClusterTestOrchestrator::new(scenario, config, target);
    orchestrator.init(cli.server_count)?;
    info!(scenario = %cli.scenario, mode = %cli.mode, "Starting");

    let completion = match cli.mode {
        RunMode::Prepare => {
            orchestrator.prepare(true).await?;
            Completion::Prepared { teardown_errors: orchestrator.teardown().await }
        },
        RunMode::Execute => {
            orchestrator.prepare(false).await?;
            Completion::Executed(orchestrator.execute().await?)
        },
        RunMode::PrepareExecute => {
            orchestrator.prepare(true).await?;
            Completion::Executed(orchestrator.execute().await?)
        },
    };
    Ok(completion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_positional_arguments() {
        let cli = Cli::try_parse_from(["faultline", "crash-restart", "prepare+execute", "5"]).unwrap();
        assert_eq!(cli.scenario, "crash-restart");
        assert_eq!(cli.mode, RunMode::PrepareExecute);
        assert_eq!(cli.server_count, Some(5));
        assert!(cli.config.is_none());

        let cli = Cli::try_parse_from(["faultline", "concurrent-writes", "prepare", "--config", "run.toml"])
            .unwrap();
        assert_eq!(cli.mode, RunMode::Prepare);
        assert_eq!(cli.server_count, None);
        assert_eq!(cli.config, Some(PathBuf::from("run.toml")));
    }

    #[test]
    fn test_invalid_arguments_are_rejected() {
        let err = Cli::try_parse_from(["faultline", "no-such-scenario", "execute"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);

        let err = Cli::try_parse_from(["faultline", "partition-heal", "verify"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);

        let err = Cli::try_parse_from(["faultline", "partition-heal", "execute", "three"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);

        let err = Cli::try_parse_from(["faultline"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }
}
