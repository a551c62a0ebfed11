//! Configuration schema for the faultline harness.
//!
//! Every section has defaults that run the bundled scenarios against the
//! simulated cluster on loopback, so an empty `faultline.toml` is valid.
//! Durations are stored as milliseconds and exposed through accessors.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    time::Duration,
};
use validator::Validate;

/// Root configuration of a harness run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HarnessConfig {
    /// Cluster layout and lifecycle modes
    #[validate(nested)]
    pub cluster: ClusterSettings,

    /// Deadlines and poll cadence
    #[validate(nested)]
    pub timeouts: TimeoutSettings,

    /// Workload driver defaults
    #[validate(nested)]
    pub workload: WorkloadSettings,

    /// Partition proxy routing
    #[validate(nested)]
    pub proxy: ProxySettings,

    /// OS process backend
    pub process: ProcessSettings,

    /// Log output
    #[validate(nested)]
    pub logging: LoggingSettings,

    /// Simulated cluster tuning
    #[validate(nested)]
    pub sim: SimSettings,
}

/// How nodes are brought up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// Launch every node at once
    #[default]
    Concurrent,
    /// Launch one node at a time, waiting for readiness and a delay in between
    Sequential,
}

/// How the seeded state reaches the other nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedMode {
    /// Seed one stopped-cluster node and copy its data directory before the others start
    ColdCopy,
    /// Seed a running cluster and wait for replication to converge
    #[default]
    Replicate,
}

/// How nodes are stopped at teardown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownMode {
    /// Graceful shutdown of every node
    #[default]
    Shutdown,
    /// Hard kill of every node
    Crash,
}

/// How a node's readiness is decided after launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessKind {
    /// The client port accepts TCP connections
    #[default]
    Tcp,
    /// The node's distributed configuration is readable through the client
    Membership,
}

impl fmt::Display for StartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concurrent => write!(f, "concurrent"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

impl fmt::Display for SeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ColdCopy => write!(f, "cold_copy"),
            Self::Replicate => write!(f, "replicate"),
        }
    }
}

/// Cluster layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClusterSettings {
    /// Number of nodes in the run
    #[validate(range(min = 1, max = 64))]
    pub server_count: usize,

    /// Database every node serves
    #[validate(length(min = 1, max = 128))]
    pub database: String,

    /// Parent of the per-run directories; wiped at build time
    pub root_dir: PathBuf,

    /// Address every node and relay binds to
    #[validate(ip)]
    pub host: String,

    /// First client port; `0` allocates ephemeral ports
    pub base_port: u16,

    /// Port distance between consecutive nodes (client port, cluster port follows)
    #[validate(range(min = 2, max = 1000))]
    pub port_stride: u16,

    /// Concurrent or sequential start
    pub start_mode: StartMode,

    /// Delay between nodes in sequential start, in milliseconds
    pub start_delay_ms: u64,

    /// How seeded state reaches the other nodes
    pub seed_mode: SeedMode,

    /// Ordinal of the node that is seeded
    pub seed_node: usize,

    /// How nodes are stopped at teardown
    pub teardown_mode: TeardownMode,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            server_count: 3,
            database: "faultline".to_string(),
            root_dir: std::env::temp_dir().join("faultline"),
            host: "127.0.0.1".to_string(),
            base_port: 0,
            port_stride: 10,
            start_mode: StartMode::Concurrent,
            start_delay_ms: 0,
            seed_mode: SeedMode::Replicate,
            seed_node: 0,
            teardown_mode: TeardownMode::Shutdown,
        }
    }
}

impl ClusterSettings {
    /// Delay between nodes in sequential start.
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }
}

/// Deadlines and poll cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Readiness deadline of a launched node
    #[validate(range(min = 100))]
    pub node_start_ms: u64,

    /// Grace period of a graceful stop before escalating to a kill
    #[validate(range(min = 10))]
    pub stop_grace_ms: u64,

    /// Poll interval of condition gates
    #[validate(range(min = 1, max = 60_000))]
    pub poll_interval_ms: u64,

    /// Default condition gate timeout
    #[validate(range(min = 10))]
    pub condition_timeout_ms: u64,

    /// Hard ceiling of the running phase
    #[validate(range(min = 100))]
    pub run_ceiling_ms: u64,

    /// Deadline for post-run convergence checks
    #[validate(range(min = 10))]
    pub convergence_timeout_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            node_start_ms: 30_000,
            stop_grace_ms: 5_000,
            poll_interval_ms: 100,
            condition_timeout_ms: 10_000,
            run_ceiling_ms: 300_000,
            convergence_timeout_ms: 20_000,
        }
    }
}

impl TimeoutSettings {
    /// Readiness deadline of a launched node.
    pub fn node_start(&self) -> Duration {
        Duration::from_millis(self.node_start_ms)
    }

    /// Grace period of a graceful stop.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Poll interval of condition gates.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Default condition gate timeout.
    pub fn condition_timeout(&self) -> Duration {
        Duration::from_millis(self.condition_timeout_ms)
    }

    /// Hard ceiling of the running phase.
    pub fn run_ceiling(&self) -> Duration {
        Duration::from_millis(self.run_ceiling_ms)
    }

    /// Deadline for convergence checks.
    pub fn convergence_timeout(&self) -> Duration {
        Duration::from_millis(self.convergence_timeout_ms)
    }
}

/// Workload driver defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct WorkloadSettings {
    /// Writer drivers per run
    #[validate(range(max = 256))]
    pub writers: usize,

    /// Reader drivers per run
    #[validate(range(max = 256))]
    pub readers: usize,

    /// Iterations per driver
    #[validate(range(min = 1))]
    pub iterations: u64,

    /// Retries of one iteration before the driver gives up
    pub retry_budget: u32,

    /// Base back-off between retries
    pub retry_backoff_ms: u64,

    /// Pause between iterations of one driver; `0` runs flat out
    pub pace_ms: u64,

    /// Whether conflicts must (`true`) or must not (`false`) be observed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expect_conflicts: Option<bool>,

    /// Record type the built-in operations write
    #[validate(length(min = 1, max = 128))]
    pub record_type: String,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self {
            writers: 2,
            readers: 0,
            iterations: 100,
            retry_budget: 10,
            retry_backoff_ms: 10,
            pace_ms: 0,
            expect_conflicts: None,
            record_type: "Record".to_string(),
        }
    }
}

impl WorkloadSettings {
    /// Base back-off between retries.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Pause between iterations.
    pub fn pace(&self) -> Duration {
        Duration::from_millis(self.pace_ms)
    }
}

/// Partition proxy routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProxySettings {
    /// Route inter-node traffic through relays
    pub enabled: bool,

    /// Also route client traffic through relays
    pub route_clients: bool,

    /// Idle time after which a held partial match is flushed unchanged
    #[validate(range(min = 1, max = 10_000))]
    pub hold_flush_ms: u64,

    /// Read buffer per relay direction
    #[validate(range(min = 64, max = 4_194_304))]
    pub buffer_size: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self { enabled: false, route_clients: false, hold_flush_ms: 20, buffer_size: 16 * 1024 }
    }
}

impl ProxySettings {
    /// Idle flush period of held bytes.
    pub fn hold_flush(&self) -> Duration {
        Duration::from_millis(self.hold_flush_ms)
    }
}

/// OS process backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Node executable; the simulated backend is used when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,

    /// Argument templates expanded per node
    pub args: Vec<String>,

    /// Extra environment of node processes
    pub env: BTreeMap<String, String>,

    /// Redirect stdout/stderr into per-node log files
    pub capture_output: bool,

    /// Readiness probe used after launch
    pub readiness: ReadinessKind,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["--config".to_string(), "{config}".to_string()],
            env: BTreeMap::new(),
            capture_output: true,
            readiness: ReadinessKind::Tcp,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line human output
    Pretty,
    /// Single-line human output
    #[default]
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingSettings {
    /// Filter directive, overridden by `RUST_LOG`
    #[validate(length(min = 1))]
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Include thread ids
    pub thread_ids: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Compact, thread_ids: false }
    }
}

/// Simulated cluster tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SimSettings {
    /// Heartbeat period between simulated peers
    #[validate(range(min = 5, max = 10_000))]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a peer is considered failed
    #[validate(range(min = 10, max = 60_000))]
    pub failure_timeout_ms: u64,

    /// Delay between a node starting and it joining the cluster
    pub join_delay_ms: u64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self { heartbeat_interval_ms: 50, failure_timeout_ms: 400, join_delay_ms: 0 }
    }
}

impl SimSettings {
    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Failure detection window.
    pub fn failure_timeout(&self) -> Duration {
        Duration::from_millis(self.failure_timeout_ms)
    }

    /// Join delay.
    pub fn join_delay(&self) -> Duration {
        Duration::from_millis(self.join_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HarnessConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cluster.server_count, 3);
        assert_eq!(config.timeouts.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: HarnessConfig = toml::from_str(
            r#"
            [cluster]
            server_count = 5
            start_mode = "sequential"
            seed_mode = "cold_copy"

            [workload]
            expect_conflicts = false
            "#,
        )
        .unwrap();

        assert_eq!(config.cluster.server_count, 5);
        assert_eq!(config.cluster.start_mode, StartMode::Sequential);
        assert_eq!(config.cluster.seed_mode, SeedMode::ColdCopy);
        assert_eq!(config.cluster.database, "faultline");
        assert_eq!(config.workload.expect_conflicts, Some(false));
        assert_eq!(config.workload.iterations, 100);
    }

    #[test]
    fn test_range_violations_are_reported() {
        let mut config = HarnessConfig::default();
        config.cluster.server_count = 0;
        config.cluster.host = "not-an-ip".to_string();
        let errors = config.validate().unwrap_err().to_string();
        assert!(errors.contains("server_count"));
        assert!(errors.contains("host"));
    }
}
