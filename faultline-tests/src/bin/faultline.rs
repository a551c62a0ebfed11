//! `faultline <scenario> <prepare|execute|prepare+execute> [server_count]`
//!
//! Exit codes: `0` passed, `1` invalid arguments or configuration, `2` setup
//! or assertion failure.

use anyhow::Context;
use clap::Parser;
use faultline_tests::{
    cli::{self, Cli, Completion},
    HarnessError,
};
use std::process::ExitCode;

const INVALID_ARGUMENTS: u8 = 1;
const RUN_FAILED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version exit zero.
            let code = if err.use_stderr() { INVALID_ARGUMENTS } else { 0 };
            let _ = err.print();
            return ExitCode::from(code);
        },
    };

    match run(&cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(RUN_FAILED),
        Err(err) => {
            eprintln!("faultline: {err:#}");
            let usage = err.downcast_ref::<HarnessError>().is_some_and(HarnessError::is_usage);
            ExitCode::from(if usage { INVALID_ARGUMENTS } else { RUN_FAILED })
        },
    }
}

async fn run(cli: &Cli) -> anyhow::Result<bool> {
    let completion = cli::run(cli).await.with_context(|| format!("scenario {} failed", cli.scenario))?;
    match &completion {
        Completion::Prepared { teardown_errors } => {
            for err in teardown_errors {
                eprintln!("teardown: {err}");
            }
        },
        Completion::Executed(report) => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(report)?);
            } else {
                println!(
                    "{}: {} ({} iterations, {} conflicts, {} ms)",
                    report.scenario,
                    if report.passed { "passed" } else { "FAILED" },
                    report.completed(),
                    report.conflicts(),
                    report.elapsed_ms
                );
                for failure in &report.failures {
                    println!("  - {failure}");
                }
            }
        },
    }
    Ok(completion.passed())
}
