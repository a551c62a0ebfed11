//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level. Initialisation is
//! idempotent: a second call, or a call after another subscriber was
//! installed, leaves the existing subscriber in place.

use crate::{
    config::{LogFormat, LoggingSettings},
    Error, Result,
};
use tracing::debug;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Install the global subscriber described by `settings`.
pub fn init(settings: &LoggingSettings) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.level).map_err(|e| {
            Error::configuration(format!("Invalid log level {:?}: {e}", settings.level))
        })?,
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match settings.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_ids(settings.thread_ids)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_thread_ids(settings.thread_ids)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(settings.thread_ids)
            .boxed(),
    };

    if tracing_subscriber::registry().with(layer.with_filter(filter)).try_init().is_err() {
        debug!("Global tracing subscriber already installed");
    }
    Ok(())
}

/// Install a test-friendly subscriber that writes through the test harness capture.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}
