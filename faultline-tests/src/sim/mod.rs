//! # Simulated cluster
//!
//! In-process stand-in for the database under test. [`SimCluster`] is both
//! the [`NodeBackend`] the topology launches nodes with and the
//! [`DatabaseClient`] scenarios talk to.
//!
//! Every simulated node binds its real client and cluster ports and sends
//! heartbeat frames to its peers through the routed addresses it was launched
//! with, so partitions opened on the proxy are felt exactly like on a real
//! cluster. Peer liveness, quorum and status all derive from heartbeat
//! freshness.
//!
//! Writes go to one committed state per database and need a majority of the
//! servers ever launched. Each node serves reads from its own replica, which
//! resynchronises from the committed state while the node is online. Graceful
//! shutdown announces the departure and writes a JSON snapshot into the data
//! directory; a kill does neither.

mod node;
mod session;
mod store;
mod wire;

pub use session::SimSession;
pub use store::{DatabaseState, Snapshot};
pub use wire::{Frame, FrameDecoder, FrameKind};

use async_trait::async_trait;
use faultline_cluster::{LaunchSpec, NodeBackend, NodeHandle, StopMode};
use faultline_core::{
    config::SimSettings, DatabaseClient, DatabaseStatus, DistributedConfiguration, Error,
    MembershipListener, NodeId, Result, Session,
};
use node::{Notice, SimNode};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info};

/// File a gracefully stopped node leaves in its data directory.
pub const SNAPSHOT_FILE: &str = "snapshot.json";

pub(crate) struct Shared {
    pub(crate) settings: SimSettings,
    pub(crate) committed: Mutex<BTreeMap<String, DatabaseState>>,
    registered: Mutex<BTreeSet<NodeId>>,
    nodes: Mutex<BTreeMap<NodeId, Arc<SimNode>>>,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("registered", &*self.registered.lock())
            .field("running", &self.nodes.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Shared {
    pub(crate) fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }

    pub(crate) fn running(&self, id: &NodeId) -> Result<Arc<SimNode>> {
        self.nodes
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::unreachable(id, "node is not running"))
    }

    fn require_database(&self, node: &NodeId, database: &str) -> Result<()> {
        if self.committed.lock().contains_key(database) {
            Ok(())
        } else {
            Err(Error::DatabaseNotFound { database: database.to_string(), node: node.to_string() })
        }
    }

    /// Take over snapshot databases newer than the committed state.
    pub(crate) fn adopt(&self, snapshot: &Snapshot) {
        let mut committed = self.committed.lock();
        for (name, database) in &snapshot.databases {
            let newer = committed.get(name).map_or(true, |current| current.seq() < database.seq());
            if newer {
                debug!(database = %name, seq = database.seq(), "Committed state adopted from snapshot");
                committed.insert(name.clone(), database.clone());
            }
        }
    }

    pub(crate) fn notify(&self, observer: &NodeId, database: &str, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for notice in notices {
            for listener in &listeners {
                match &notice {
                    Notice::Joining(node) => listener.on_node_joining(observer, node),
                    Notice::Joined(node) => listener.on_node_joined(observer, node),
                    Notice::Left(node, kind) => listener.on_node_left(observer, node, *kind),
                    Notice::Status(node, status) => {
                        listener.on_database_status_changed(observer, node, database, *status)
                    },
                }
            }
        }
    }

    fn remove(&self, node: &SimNode) {
        let mut nodes = self.nodes.lock();
        if nodes.get(&node.id).is_some_and(|current| current.generation == node.generation) {
            nodes.remove(&node.id);
        }
    }
}

/// Simulated cluster: node backend and database client in one.
#[derive(Debug, Clone)]
pub struct SimCluster {
    shared: Arc<Shared>,
}

impl SimCluster {
    /// Create an empty simulated cluster.
    pub fn new(settings: SimSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                committed: Mutex::new(BTreeMap::new()),
                registered: Mutex::new(BTreeSet::new()),
                nodes: Mutex::new(BTreeMap::new()),
                listeners: RwLock::new(Vec::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Whether `node` has a running instance.
    pub fn is_running(&self, node: &NodeId) -> bool {
        self.shared.nodes.lock().contains_key(node)
    }

    /// Every server launched at least once; the quorum base.
    pub fn registered(&self) -> Vec<NodeId> {
        self.shared.registered.lock().iter().cloned().collect()
    }

    /// Address `peer` announced to `observer` in its last frame.
    pub fn announced_address(&self, observer: &NodeId, peer: &NodeId) -> Option<SocketAddr> {
        self.shared.running(observer).ok().and_then(|node| node.announced(peer))
    }

    /// Committed number of records of a type.
    pub fn committed_count(&self, database: &str, type_name: &str) -> Option<usize> {
        self.shared.committed.lock().get(database).map(|state| state.count_of(type_name))
    }
}

#[async_trait]
impl DatabaseClient for SimCluster {
    async fn ensure_database(&self, node: &NodeId, database: &str) -> Result<()> {
        let running = self.shared.running(node)?;
        running.ensure_database(&self.shared, database);
        info!(%node, database, "Database ensured");
        Ok(())
    }

    async fn open_session(&self, node: &NodeId, database: &str) -> Result<Box<dyn Session>> {
        let running = self.shared.running(node)?;
        self.shared.require_database(node, database)?;
        Ok(Box::new(SimSession::new(Arc::clone(&self.shared), &running, database)))
    }

    async fn distributed_status(
        &self,
        observer: &NodeId,
        target: &NodeId,
        database: &str,
    ) -> Result<DatabaseStatus> {
        let running = self.shared.running(observer)?;
        self.shared.require_database(observer, database)?;
        if observer == target {
            Ok(running.self_status(database))
        } else {
            Ok(running.peer_status(&self.shared, target))
        }
    }

    async fn distributed_configuration(
        &self,
        observer: &NodeId,
        database: &str,
    ) -> Result<DistributedConfiguration> {
        let running = self.shared.running(observer)?;
        let servers: BTreeSet<NodeId> = self.shared.registered.lock().clone();
        let mut online: BTreeSet<NodeId> = running.online_peers(&self.shared).into_iter().collect();
        if running.self_status(database) == DatabaseStatus::Online {
            online.insert(observer.clone());
        }

        let fallback = online.iter().next().cloned();
        let owners = servers
            .iter()
            .enumerate()
            .map(|(index, server)| {
                let owner = if online.contains(server) {
                    server.clone()
                } else {
                    fallback.clone().unwrap_or_else(|| server.clone())
                };
                (format!("{database}_{index}"), owner)
            })
            .collect();

        Ok(DistributedConfiguration { database: database.to_string(), servers, online, owners })
    }

    fn subscribe(&self, listener: Arc<dyn MembershipListener>) {
        self.shared.listeners.write().push(listener);
    }
}

struct SimHandle {
    node: Arc<SimNode>,
    shared: Arc<Shared>,
}

#[async_trait]
impl NodeHandle for SimHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn stop(&self, mode: StopMode, grace: Duration) -> faultline_cluster::Result<()> {
        if self.node.has_stopped() {
            return Ok(());
        }
        let result = match mode {
            StopMode::Graceful => self.node.shutdown(grace).await,
            StopMode::ForceKill => {
                self.node.kill();
                Ok(())
            },
        };
        self.shared.remove(&self.node);
        info!(node = %self.node.id, ?mode, "Simulated node stopped");
        result
    }

    async fn has_exited(&self) -> bool {
        self.node.has_stopped()
    }
}

#[async_trait]
impl NodeBackend for SimCluster {
    fn name(&self) -> &'static str {
        "sim"
    }

    async fn launch(&self, spec: &LaunchSpec) -> faultline_cluster::Result<Arc<dyn NodeHandle>> {
        if self.is_running(&spec.node) {
            return Err(faultline_cluster::Error::node_start(&spec.node, "already running"));
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let node = SimNode::launch(&self.shared, spec, generation).await?;
        self.shared.registered.lock().insert(spec.node.clone());
        self.shared.nodes.lock().insert(spec.node.clone(), Arc::clone(&node));
        Ok(Arc::new(SimHandle { node, shared: Arc::clone(&self.shared) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_cluster::NodeSettings;
    use faultline_core::{ConditionGate, Fields, Statement};
    use std::path::Path;

    fn settings() -> SimSettings {
        SimSettings { heartbeat_interval_ms: 10, failure_timeout_ms: 100, join_delay_ms: 0 }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .unwrap()
    }

    fn spec(ordinal: usize, root: &Path) -> LaunchSpec {
        let node = NodeId::from_ordinal(ordinal);
        let root_dir = root.join(node.as_str());
        LaunchSpec {
            node,
            ordinal,
            database: "sim".to_string(),
            host: "127.0.0.1".to_string(),
            client_port: free_port(),
            cluster_port: free_port(),
            data_dir: root_dir.join("data"),
            config_file: root_dir.join("node.toml"),
            root_dir,
            settings: NodeSettings::default(),
        }
    }

    fn gate() -> ConditionGate {
        ConditionGate::new(Duration::from_millis(10), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_single_node_writes_and_snapshots() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cluster = SimCluster::new(settings());
        let spec = spec(0, dir.path());
        let handle = cluster.launch(&spec).await?;
        cluster.ensure_database(&spec.node, "sim").await?;

        let node = spec.node.clone();
        let probe = cluster.clone();
        gate()
            .wait_for(
                "node-0 online",
                || {
                    let probe = probe.clone();
                    let node = node.clone();
                    async move { probe.distributed_status(&node, &node, "sim").await }
                },
                |status| *status == DatabaseStatus::Online,
            )
            .await?;

        let mut session = cluster.open_session(&spec.node, "sim").await?;
        session.execute(Statement::insert("Item", Fields::new())).await?;
        assert_eq!(session.count_of_type("Item").await?, 1);
        session.close().await?;

        handle.stop(StopMode::Graceful, Duration::from_secs(1)).await?;
        assert!(handle.has_exited().await);
        assert!(!cluster.is_running(&spec.node));
        assert!(spec.data_dir.join(SNAPSHOT_FILE).exists());

        let restarted = SimCluster::new(settings());
        let handle = restarted.launch(&spec).await?;
        assert_eq!(restarted.committed_count("sim", "Item"), Some(1));
        handle.stop(StopMode::ForceKill, Duration::from_secs(1)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_stopped_node_is_unreachable() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cluster = SimCluster::new(settings());
        let spec = spec(0, dir.path());
        let handle = cluster.launch(&spec).await?;
        cluster.ensure_database(&spec.node, "sim").await?;
        let mut session = cluster.open_session(&spec.node, "sim").await?;

        handle.stop(StopMode::ForceKill, Duration::from_secs(1)).await?;
        assert!(!spec.data_dir.join(SNAPSHOT_FILE).exists());

        let err = session.execute(Statement::count("Item")).await.unwrap_err();
        assert!(matches!(err, Error::Unreachable { .. }));
        assert!(cluster.open_session(&spec.node, "sim").await.is_err());

        let handle = cluster.launch(&spec).await?;
        let err = session.execute(Statement::count("Item")).await.unwrap_err();
        assert!(matches!(err, Error::SessionClosed));
        handle.stop(StopMode::ForceKill, Duration::from_secs(1)).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_double_launch_rejected_and_unknown_database() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cluster = SimCluster::new(settings());
        let spec = spec(0, dir.path());
        let handle = cluster.launch(&spec).await?;
        assert!(cluster.launch(&spec).await.is_err());

        let err = cluster.distributed_status(&spec.node, &spec.node, "missing").await.unwrap_err();
        assert!(matches!(err, Error::DatabaseNotFound { .. }));
        let config = cluster.distributed_configuration(&spec.node, "missing").await?;
        assert!(config.servers.contains(&spec.node));

        handle.stop(StopMode::Graceful, Duration::from_secs(1)).await?;
        Ok(())
    }
}
