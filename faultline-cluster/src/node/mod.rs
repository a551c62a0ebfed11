//! # Node lifecycle
//!
//! A [`NodeProcess`] owns one cluster member: its directories, its ports and
//! at most one running instance. How the instance is launched and stopped is
//! delegated to a [`NodeBackend`]; when it counts as ready is decided by a
//! [`ReadinessProbe`].
//!
//! `shutdown` stops the instance with [`StopMode::Graceful`], letting it
//! flush and leave the membership cleanly. `crash` uses
//! [`StopMode::ForceKill`], so peers observe a failure instead.

mod probe;
mod process;

pub use probe::{MembershipProbe, TcpProbe};
pub use process::{expand_template, ProcessBackend, ProcessHandle};

use crate::error::{Error, Result};
use async_trait::async_trait;
use faultline_core::{config::TimeoutSettings, ConditionGate, DatabaseClient, DatabaseStatus, NodeId};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, warn};

/// Name of the per-node configuration file written before every launch.
pub const NODE_CONFIG_FILE: &str = "node.toml";

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeLifecycle {
    /// Not running; initial state and state after a graceful shutdown
    Stopped,
    /// Launched, waiting for readiness
    Starting,
    /// Ready and serving
    Active,
    /// Killed without graceful hooks
    Crashed,
    /// Graceful stop in progress
    ShuttingDown,
}

impl NodeLifecycle {
    /// Whether no instance is running.
    pub const fn is_down(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

impl fmt::Display for NodeLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Active => write!(f, "Active"),
            Self::Crashed => write!(f, "Crashed"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// How a running instance is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Ask the instance to exit and wait up to the grace period
    Graceful,
    /// Kill immediately, skipping shutdown hooks
    ForceKill,
}

/// Per-node settings rendered into the launch and the node config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeSettings {
    /// Address this node uses to reach each peer (direct or through the proxy)
    pub peers: BTreeMap<NodeId, SocketAddr>,
    /// Free-form settings passed through to the node
    pub extra: BTreeMap<String, String>,
}

/// Everything a backend needs to launch one node.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Node identity
    pub node: NodeId,
    /// Stable ordinal
    pub ordinal: usize,
    /// Database the node serves
    pub database: String,
    /// Bind host
    pub host: String,
    /// Client-facing port
    pub client_port: u16,
    /// Inter-node port
    pub cluster_port: u16,
    /// Node root directory (logs, config file)
    pub root_dir: PathBuf,
    /// On-disk state
    pub data_dir: PathBuf,
    /// Path of the rendered node config file
    pub config_file: PathBuf,
    /// Peers and extra settings
    pub settings: NodeSettings,
}

impl LaunchSpec {
    /// Client-facing socket address.
    pub fn client_addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.host, self.client_port)
    }

    /// Inter-node socket address.
    pub fn cluster_addr(&self) -> Result<SocketAddr> {
        socket_addr(&self.host, self.cluster_port)
    }
}

/// A running node instance.
#[async_trait]
pub trait NodeHandle: Send + Sync {
    /// OS process id, when the instance is a process.
    fn pid(&self) -> Option<u32>;

    /// Stop the instance. Errors from an instance that is already gone are
    /// reported but must leave the handle unusable.
    async fn stop(&self, mode: StopMode, grace: Duration) -> Result<()>;

    /// Whether the instance terminated on its own.
    async fn has_exited(&self) -> bool;
}

/// Launches node instances.
#[async_trait]
pub trait NodeBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Launch an instance described by `spec`.
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn NodeHandle>>;
}

/// Decides when a launched instance is ready.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Whether the node is ready. Errors count as "not yet".
    async fn is_ready(&self, spec: &LaunchSpec) -> faultline_core::Result<bool>;
}

/// What `restart` waits for before returning.
#[derive(Clone)]
pub enum RestartWait {
    /// Return once the readiness probe passes
    Ready,
    /// Additionally wait until the node reports its database online
    Online {
        /// Client used to observe the status
        client: Arc<dyn DatabaseClient>,
        /// Deadline for the online status
        timeout: Duration,
    },
}

impl fmt::Debug for RestartWait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::Online { timeout, .. } => write!(f, "Online({timeout:?})"),
        }
    }
}

/// Placement of one node, decided at topology build time.
#[derive(Debug, Clone)]
pub struct NodePlacement {
    /// Node identity
    pub id: NodeId,
    /// Stable ordinal
    pub ordinal: usize,
    /// Database served
    pub database: String,
    /// Bind host
    pub host: String,
    /// Client-facing port
    pub client_port: u16,
    /// Inter-node port
    pub cluster_port: u16,
    /// Node root directory
    pub root_dir: PathBuf,
}

#[derive(Debug, Serialize)]
struct NodeConfigFile<'a> {
    node: &'a NodeId,
    ordinal: usize,
    database: &'a str,
    host: &'a str,
    client_port: u16,
    cluster_port: u16,
    data_dir: &'a Path,
    peers: BTreeMap<String, String>,
    settings: &'a BTreeMap<String, String>,
}

enum Startup {
    Waiting,
    Ready,
    Exited,
}

impl fmt::Debug for Startup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "not ready"),
            Self::Ready => write!(f, "ready"),
            Self::Exited => write!(f, "process exited"),
        }
    }
}

/// One cluster member and its running instance.
pub struct NodeProcess {
    placement: NodePlacement,
    data_dir: PathBuf,
    settings: NodeSettings,
    lifecycle: NodeLifecycle,
    backend: Arc<dyn NodeBackend>,
    probe: Arc<dyn ReadinessProbe>,
    handle: Option<Arc<dyn NodeHandle>>,
    timeouts: TimeoutSettings,
    launches: u32,
}

impl fmt::Debug for NodeProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeProcess")
            .field("id", &self.placement.id)
            .field("ordinal", &self.placement.ordinal)
            .field("lifecycle", &self.lifecycle)
            .field("backend", &self.backend.name())
            .field("launches", &self.launches)
            .finish()
    }
}

impl NodeProcess {
    /// Create a stopped node.
    pub fn new(
        placement: NodePlacement,
        backend: Arc<dyn NodeBackend>,
        probe: Arc<dyn ReadinessProbe>,
        timeouts: TimeoutSettings,
    ) -> Self {
        let data_dir = placement.root_dir.join("data");
        Self {
            placement,
            data_dir,
            settings: NodeSettings::default(),
            lifecycle: NodeLifecycle::Stopped,
            backend,
            probe,
            handle: None,
            timeouts,
            launches: 0,
        }
    }

    /// Node identity.
    pub fn id(&self) -> &NodeId {
        &self.placement.id
    }

    /// Stable ordinal.
    pub fn ordinal(&self) -> usize {
        self.placement.ordinal
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> NodeLifecycle {
        self.lifecycle
    }

    /// Node root directory.
    pub fn root_dir(&self) -> &Path {
        &self.placement.root_dir
    }

    /// On-disk state directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Client-facing port.
    pub fn client_port(&self) -> u16 {
        self.placement.client_port
    }

    /// Inter-node port.
    pub fn cluster_port(&self) -> u16 {
        self.placement.cluster_port
    }

    /// Current settings.
    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Process id of the running instance.
    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|handle| handle.pid())
    }

    /// Number of launches so far.
    pub fn launches(&self) -> u32 {
        self.launches
    }

    /// Change settings; only while no instance runs.
    pub fn rewrite_settings<F>(&mut self, rewrite: F) -> Result<()>
    where
        F: FnOnce(&mut NodeSettings),
    {
        self.require_down("rewrite settings")?;
        rewrite(&mut self.settings);
        Ok(())
    }

    /// Launch spec reflecting the current settings.
    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            node: self.placement.id.clone(),
            ordinal: self.placement.ordinal,
            database: self.placement.database.clone(),
            host: self.placement.host.clone(),
            client_port: self.placement.client_port,
            cluster_port: self.placement.cluster_port,
            root_dir: self.placement.root_dir.clone(),
            data_dir: self.data_dir.clone(),
            config_file: self.placement.root_dir.join(NODE_CONFIG_FILE),
            settings: self.settings.clone(),
        }
    }

    /// Launch the instance and wait for readiness.
    ///
    /// Fails when an instance is already running. On readiness timeout, or if
    /// the instance exits before becoming ready, it is killed and a
    /// [`Error::NodeStart`] is returned.
    pub async fn start(&mut self) -> Result<()> {
        if !self.lifecycle.is_down() {
            return Err(self.invalid_state("Stopped or Crashed"));
        }

        tokio::fs::create_dir_all(&self.data_dir).await?;
        let spec = Arc::new(self.launch_spec());
        self.write_node_config(&spec).await?;

        self.lifecycle = NodeLifecycle::Starting;
        self.launches += 1;
        info!(
            node = %self.placement.id,
            ordinal = self.placement.ordinal,
            client_port = spec.client_port,
            cluster_port = spec.cluster_port,
            backend = self.backend.name(),
            "Starting node"
        );

        let handle = match self.backend.launch(&spec).await {
            Ok(handle) => handle,
            Err(err) => {
                self.lifecycle = NodeLifecycle::Stopped;
                return Err(Error::node_start(&self.placement.id, err));
            },
        };
        self.handle = Some(Arc::clone(&handle));

        let gate = ConditionGate::new(self.timeouts.poll_interval(), self.timeouts.node_start());
        let condition = format!("{} ready", self.placement.id);
        let probe = Arc::clone(&self.probe);
        let observed = gate
            .wait_for(
                &condition,
                || {
                    let handle = Arc::clone(&handle);
                    let probe = Arc::clone(&probe);
                    let spec = Arc::clone(&spec);
                    async move {
                        if handle.has_exited().await {
                            return Ok(Startup::Exited);
                        }
                        Ok(if probe.is_ready(&spec).await? { Startup::Ready } else { Startup::Waiting })
                    }
                },
                |startup| !matches!(startup, Startup::Waiting),
            )
            .await;

        let failure = match observed {
            Ok(Startup::Ready) => {
                self.lifecycle = NodeLifecycle::Active;
                info!(node = %self.placement.id, pid = ?handle.pid(), "Node active");
                return Ok(());
            },
            Ok(_) => "process exited before becoming ready".to_string(),
            Err(err) => err.to_string(),
        };

        if let Err(err) = handle.stop(StopMode::ForceKill, self.timeouts.stop_grace()).await {
            debug!(node = %self.placement.id, error = %err, "Kill after failed start");
        }
        self.handle = None;
        self.lifecycle = NodeLifecycle::Crashed;
        Err(Error::node_start(&self.placement.id, failure))
    }

    /// Stop the instance gracefully. A no-op when nothing runs.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.lifecycle.is_down() {
            debug!(node = %self.placement.id, state = %self.lifecycle, "Shutdown skipped");
            return Ok(());
        }

        self.lifecycle = NodeLifecycle::ShuttingDown;
        info!(node = %self.placement.id, "Shutting down node");
        self.stop_handle(StopMode::Graceful).await;
        self.lifecycle = NodeLifecycle::Stopped;
        Ok(())
    }

    /// Kill the instance without graceful hooks. A no-op when nothing runs.
    pub async fn crash(&mut self) -> Result<()> {
        if self.lifecycle.is_down() {
            debug!(node = %self.placement.id, state = %self.lifecycle, "Crash skipped");
            return Ok(());
        }

        warn!(node = %self.placement.id, pid = ?self.pid(), "Crashing node");
        self.stop_handle(StopMode::ForceKill).await;
        self.lifecycle = NodeLifecycle::Crashed;
        Ok(())
    }

    /// Start again after a shutdown or crash.
    pub async fn restart(&mut self, wait: RestartWait) -> Result<()> {
        if !self.lifecycle.is_down() {
            return Err(self.invalid_state("Stopped or Crashed"));
        }

        info!(node = %self.placement.id, ?wait, "Restarting node");
        self.start().await?;

        if let RestartWait::Online { client, timeout } = wait {
            let node = self.placement.id.clone();
            let database = self.placement.database.clone();
            let gate = ConditionGate::new(self.timeouts.poll_interval(), timeout);
            gate.wait_for(
                &format!("{node} online after restart"),
                || {
                    let client = Arc::clone(&client);
                    let node = node.clone();
                    let database = database.clone();
                    async move { client.distributed_status(&node, &node, &database).await }
                },
                |status| *status == DatabaseStatus::Online,
            )
            .await?;
            info!(node = %self.placement.id, "Node online after restart");
        }
        Ok(())
    }

    /// Remove the on-disk state; only while no instance runs.
    pub async fn delete_data(&mut self) -> Result<()> {
        self.require_down("delete data")?;
        match tokio::fs::remove_dir_all(&self.data_dir).await {
            Ok(()) => {
                info!(node = %self.placement.id, dir = %self.data_dir.display(), "Deleted node data");
                Ok(())
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn stop_handle(&mut self, mode: StopMode) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(err) = handle.stop(mode, self.timeouts.stop_grace()).await {
            warn!(node = %self.placement.id, ?mode, error = %err, "Stop reported an error");
        }
    }

    async fn write_node_config(&self, spec: &LaunchSpec) -> Result<()> {
        let rendered = toml::to_string_pretty(&NodeConfigFile {
            node: &spec.node,
            ordinal: spec.ordinal,
            database: &spec.database,
            host: &spec.host,
            client_port: spec.client_port,
            cluster_port: spec.cluster_port,
            data_dir: &spec.data_dir,
            peers: spec
                .settings
                .peers
                .iter()
                .map(|(peer, addr)| (peer.to_string(), addr.to_string()))
                .collect(),
            settings: &spec.settings.extra,
        })?;
        tokio::fs::write(&spec.config_file, rendered).await?;
        Ok(())
    }

    fn require_down(&self, operation: &str) -> Result<()> {
        if self.lifecycle.is_down() {
            Ok(())
        } else {
            debug!(node = %self.placement.id, operation, "Rejected while running");
            Err(self.invalid_state("Stopped or Crashed"))
        }
    }

    fn invalid_state(&self, expected: &str) -> Error {
        Error::InvalidNodeState {
            node: self.placement.id.to_string(),
            expected: expected.to_string(),
            actual: self.lifecycle.to_string(),
        }
    }
}

/// Resolve `host:port` into a socket address.
pub fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid address {host}:{port}: {e}")))
}
