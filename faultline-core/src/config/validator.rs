//! # Configuration Validation
//!
//! Field ranges are declared on the schema through `validator`; this module
//! adds the checks that span several fields or sections.

use crate::{config::schema::HarnessConfig, Error, Result};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use validator::Validate;

/// Cross-field validation of a [`HarnessConfig`].
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate a configuration
    pub fn validate(config: &HarnessConfig) -> Result<()> {
        config.validate().map_err(Error::from)?;

        Self::validate_cluster(config)?;
        Self::validate_timeouts(config)?;
        Self::validate_workload(config);
        Self::validate_logging(config)?;
        Self::validate_sim(config)?;

        debug!("Configuration validation completed successfully");
        Ok(())
    }

    fn validate_cluster(config: &HarnessConfig) -> Result<()> {
        let cluster = &config.cluster;
        if cluster.seed_node >= cluster.server_count {
            return Err(Error::configuration(format!(
                "seed_node {} is out of range for {} servers",
                cluster.seed_node, cluster.server_count
            )));
        }

        if cluster.base_port != 0 {
            let last = u32::from(cluster.base_port)
                + u32::from(cluster.port_stride) * (cluster.server_count as u32 - 1)
                + 1;
            if last > u32::from(u16::MAX) {
                return Err(Error::configuration(format!(
                    "Ports for {} servers from base {} with stride {} exceed 65535",
                    cluster.server_count, cluster.base_port, cluster.port_stride
                )));
            }
            if cluster.base_port < 1024 {
                warn!("Using privileged base port {} may require special permissions", cluster.base_port);
            }
        }

        if config.proxy.route_clients && !config.proxy.enabled {
            return Err(Error::configuration("proxy.route_clients requires proxy.enabled"));
        }

        Ok(())
    }

    fn validate_timeouts(config: &HarnessConfig) -> Result<()> {
        let timeouts = &config.timeouts;
        if timeouts.poll_interval_ms >= timeouts.condition_timeout_ms {
            return Err(Error::configuration(format!(
                "poll_interval_ms ({}) must be below condition_timeout_ms ({})",
                timeouts.poll_interval_ms, timeouts.condition_timeout_ms
            )));
        }
        if timeouts.run_ceiling_ms < timeouts.condition_timeout_ms {
            warn!(
                "run_ceiling_ms ({}) is shorter than condition_timeout_ms ({})",
                timeouts.run_ceiling_ms, timeouts.condition_timeout_ms
            );
        }
        Ok(())
    }

    fn validate_workload(config: &HarnessConfig) {
        let workload = &config.workload;
        if workload.expect_conflicts == Some(true) && workload.writers < 2 {
            warn!("expect_conflicts is set but fewer than two writers can contend");
        }
        if workload.retry_budget == 0 {
            debug!("Retry budget is zero; the first conflict stops a driver");
        }
    }

    fn validate_logging(config: &HarnessConfig) -> Result<()> {
        EnvFilter::try_new(&config.logging.level).map_err(|e| {
            Error::configuration(format!("Invalid log level {:?}: {e}", config.logging.level))
        })?;
        Ok(())
    }

    fn validate_sim(config: &HarnessConfig) -> Result<()> {
        let sim = &config.sim;
        if sim.failure_timeout_ms < sim.heartbeat_interval_ms * 2 {
            return Err(Error::configuration(format!(
                "sim.failure_timeout_ms ({}) must be at least twice heartbeat_interval_ms ({})",
                sim.failure_timeout_ms, sim.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        ConfigValidator::validate(&HarnessConfig::default()).unwrap();
    }

    #[test]
    fn test_port_range_overflow() {
        let mut config = HarnessConfig::default();
        config.cluster.base_port = 65_500;
        config.cluster.server_count = 10;
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("exceed 65535"));
    }

    #[test]
    fn test_poll_interval_must_be_below_timeout() {
        let mut config = HarnessConfig::default();
        config.timeouts.poll_interval_ms = 500;
        config.timeouts.condition_timeout_ms = 500;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_client_routing_requires_proxy() {
        let mut config = HarnessConfig::default();
        config.proxy.route_clients = true;
        assert!(ConfigValidator::validate(&config).is_err());
        config.proxy.enabled = true;
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_sim_failure_window() {
        let mut config = HarnessConfig::default();
        config.sim.heartbeat_interval_ms = 100;
        config.sim.failure_timeout_ms = 150;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_invalid_log_directive() {
        let mut config = HarnessConfig::default();
        config.logging.level = "faultline=[".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
