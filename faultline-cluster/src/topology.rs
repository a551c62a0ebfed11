//! # Cluster topology
//!
//! The ordered set of nodes of one run, their directories and ports, and the
//! routed address every node (and the client) uses to reach every other
//! node. Ordinals and ids are fixed at build time and survive restarts.

use crate::{
    error::{Error, Result},
    node::{
        socket_addr, NodeBackend, NodeLifecycle, NodePlacement, NodeProcess, ReadinessProbe,
        RestartWait,
    },
    proxy::{AddressRewrite, PartitionProxy, RelaySpec},
};
use faultline_core::{
    config::{HarnessConfig, StartMode, TeardownMode},
    NodeId, CLIENT_ENDPOINT,
};
use futures::future::{join_all, BoxFuture, FutureExt};
use std::{
    collections::BTreeMap,
    net::{SocketAddr, TcpListener},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One node of the topology with its fixed addresses.
#[derive(Debug)]
pub struct NodeSlot {
    id: NodeId,
    ordinal: usize,
    client_addr: SocketAddr,
    cluster_addr: SocketAddr,
    process: Mutex<NodeProcess>,
}

impl NodeSlot {
    /// Node identity.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Stable ordinal.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Direct client address.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Direct inter-node address.
    pub fn cluster_addr(&self) -> SocketAddr {
        self.cluster_addr
    }

    /// Exclusive access to the node process.
    pub async fn lock(&self) -> MutexGuard<'_, NodeProcess> {
        self.process.lock().await
    }

    /// Current lifecycle state.
    pub async fn lifecycle(&self) -> NodeLifecycle {
        self.process.lock().await.lifecycle()
    }
}

/// Nodes, routes and proxy of one run.
pub struct ClusterTopology {
    run_id: Uuid,
    database: String,
    run_root: PathBuf,
    nodes: Vec<Arc<NodeSlot>>,
    routes: BTreeMap<(NodeId, NodeId), SocketAddr>,
    client_routes: BTreeMap<NodeId, SocketAddr>,
    proxy: Option<Arc<PartitionProxy>>,
    start_delay: Duration,
    teardown_mode: TeardownMode,
}

impl std::fmt::Debug for ClusterTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterTopology")
            .field("run_id", &self.run_id)
            .field("database", &self.database)
            .field("nodes", &self.nodes.len())
            .field("proxied", &self.proxy.is_some())
            .finish()
    }
}

impl ClusterTopology {
    /// Wipe the run directory, allocate nodes and ports, and open proxy relays.
    ///
    /// With the proxy enabled every ordered node pair gets a relay whose rules
    /// rewrite each side's announced cluster port into the relay port the
    /// other side must use to reach it.
    pub async fn build(
        config: &HarnessConfig,
        backend: Arc<dyn NodeBackend>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Result<Self> {
        let cluster = &config.cluster;
        let run_id = Uuid::new_v4();
        let run_root = cluster.root_dir.join(&cluster.database);
        match tokio::fs::remove_dir_all(&run_root).await {
            Ok(()) => debug!(dir = %run_root.display(), "Wiped previous run directory"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
            Err(err) => return Err(err.into()),
        }
        tokio::fs::create_dir_all(&run_root).await?;

        let placements = allocate(config, &run_root).await?;
        let host = cluster.host.as_str();

        let mut routes = BTreeMap::new();
        let mut client_routes = BTreeMap::new();
        let proxy = if config.proxy.enabled {
            let proxy = Arc::new(PartitionProxy::from_settings(&config.proxy));
            let ephemeral = socket_addr(host, 0)?;

            for a in &placements {
                for b in placements.iter().filter(|b| b.ordinal != a.ordinal) {
                    let listen = proxy.reserve(a.id.as_str(), b.id.as_str(), ephemeral).await?;
                    routes.insert((a.id.clone(), b.id.clone()), listen);
                }
            }

            for a in &placements {
                for b in placements.iter().filter(|b| b.ordinal != a.ordinal) {
                    let back = routes[&(b.id.clone(), a.id.clone())].port();
                    let forth = routes[&(a.id.clone(), b.id.clone())].port();
                    let spec = RelaySpec::new(
                        a.id.as_str(),
                        b.id.as_str(),
                        ephemeral,
                        socket_addr(host, b.cluster_port)?,
                    )
                    .with_upstream_rule(Arc::new(AddressRewrite::new(
                        host,
                        u32::from(a.cluster_port),
                        u32::from(back),
                    )))
                    .with_downstream_rule(Arc::new(AddressRewrite::new(
                        host,
                        u32::from(b.cluster_port),
                        u32::from(forth),
                    )));
                    proxy.open_relay(spec).await?;
                }
            }

            if config.proxy.route_clients {
                for b in &placements {
                    let spec = RelaySpec::new(
                        CLIENT_ENDPOINT,
                        b.id.as_str(),
                        ephemeral,
                        socket_addr(host, b.client_port)?,
                    );
                    client_routes.insert(b.id.clone(), proxy.open_relay(spec).await?);
                }
            }
            Some(proxy)
        } else {
            None
        };

        for a in &placements {
            for b in placements.iter().filter(|b| b.ordinal != a.ordinal) {
                routes
                    .entry((a.id.clone(), b.id.clone()))
                    .or_insert(socket_addr(host, b.cluster_port)?);
            }
            if !client_routes.contains_key(&a.id) {
                client_routes.insert(a.id.clone(), socket_addr(host, a.client_port)?);
            }
        }

        let mut nodes = Vec::with_capacity(placements.len());
        for placement in placements {
            let id = placement.id.clone();
            let ordinal = placement.ordinal;
            let client_addr = socket_addr(host, placement.client_port)?;
            let cluster_addr = socket_addr(host, placement.cluster_port)?;
            let mut process = NodeProcess::new(
                placement,
                Arc::clone(&backend),
                Arc::clone(&probe),
                config.timeouts.clone(),
            );
            process.rewrite_settings(|settings| {
                settings.peers = routes
                    .iter()
                    .filter(|((from, _), _)| *from == id)
                    .map(|((_, to), addr)| (to.clone(), *addr))
                    .collect();
            })?;
            nodes.push(Arc::new(NodeSlot {
                id,
                ordinal,
                client_addr,
                cluster_addr,
                process: Mutex::new(process),
            }));
        }

        info!(
            %run_id,
            nodes = nodes.len(),
            proxied = proxy.is_some(),
            root = %run_root.display(),
            "Topology built"
        );

        Ok(Self {
            run_id,
            database: cluster.database.clone(),
            run_root,
            nodes,
            routes,
            client_routes,
            proxy,
            start_delay: cluster.start_delay(),
            teardown_mode: cluster.teardown_mode,
        })
    }

    /// Unique id of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Database every node serves.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Root directory of this run.
    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the topology has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids in ordinal order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|slot| slot.id.clone()).collect()
    }

    /// Slots in ordinal order.
    pub fn slots(&self) -> &[Arc<NodeSlot>] {
        &self.nodes
    }

    /// Slot of a node.
    pub fn node(&self, id: &NodeId) -> Result<&Arc<NodeSlot>> {
        self.nodes.iter().find(|slot| &slot.id == id).ok_or_else(|| Error::unknown_node(id))
    }

    /// Slot at an ordinal.
    pub fn by_ordinal(&self, ordinal: usize) -> Result<&Arc<NodeSlot>> {
        self.nodes.get(ordinal).ok_or_else(|| Error::unknown_node(format!("#{ordinal}")))
    }

    /// Partition proxy, when traffic is routed through one.
    pub fn proxy(&self) -> Option<&Arc<PartitionProxy>> {
        self.proxy.as_ref()
    }

    /// Address `from` uses to reach `to`'s cluster port.
    pub fn route(&self, from: &NodeId, to: &NodeId) -> Option<SocketAddr> {
        self.routes.get(&(from.clone(), to.clone())).copied()
    }

    /// Address clients use to reach a node.
    pub fn client_route(&self, id: &NodeId) -> Result<SocketAddr> {
        self.client_routes.get(id).copied().ok_or_else(|| Error::unknown_node(id))
    }

    /// Nodes currently active.
    pub async fn active_nodes(&self) -> Vec<NodeId> {
        let mut active = Vec::new();
        for slot in &self.nodes {
            if slot.lifecycle().await == NodeLifecycle::Active {
                active.push(slot.id.clone());
            }
        }
        active
    }

    /// Every node except `id`.
    pub fn others(&self, id: &NodeId) -> Vec<NodeId> {
        self.nodes.iter().filter(|slot| &slot.id != id).map(|slot| slot.id.clone()).collect()
    }

    /// Nodes at the given ordinals.
    pub fn select(&self, ordinals: &[usize]) -> Result<Vec<NodeId>> {
        ordinals.iter().map(|&ordinal| self.by_ordinal(ordinal).map(|slot| slot.id.clone())).collect()
    }

    /// Change a stopped node's settings before its next launch.
    pub async fn rewrite_settings<F>(&self, id: &NodeId, rewrite: F) -> Result<()>
    where
        F: FnOnce(&mut crate::node::NodeSettings),
    {
        self.node(id)?.lock().await.rewrite_settings(rewrite)
    }

    /// Replace `to`'s data directory with a copy of `from`'s; both must be stopped.
    pub async fn copy_data(&self, from: &NodeId, to: &NodeId) -> Result<u64> {
        let source = self.node(from)?;
        let target = self.node(to)?;
        if source.ordinal == target.ordinal {
            return Ok(0);
        }

        let (first, second) =
            if source.ordinal < target.ordinal { (source, target) } else { (target, source) };
        let first = first.lock().await;
        let second = second.lock().await;
        let (source_process, target_process) =
            if source.ordinal < target.ordinal { (&first, &second) } else { (&second, &first) };

        for process in [source_process, target_process] {
            if !process.lifecycle().is_down() {
                return Err(Error::InvalidNodeState {
                    node: process.id().to_string(),
                    expected: "Stopped or Crashed".to_string(),
                    actual: process.lifecycle().to_string(),
                });
            }
        }

        let target_dir = target_process.data_dir().to_path_buf();
        match tokio::fs::remove_dir_all(&target_dir).await {
            Ok(()) => {},
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
            Err(err) => return Err(err.into()),
        }
        let copied = copy_dir(source_process.data_dir(), &target_dir).await?;
        info!(from = %from, to = %to, bytes = copied, "Copied node data");
        Ok(copied)
    }

    /// Start every node.
    pub async fn start_all(&self, mode: StartMode) -> Result<()> {
        self.start_nodes(&self.node_ids(), mode).await
    }

    /// Start the given nodes concurrently or one after another.
    ///
    /// Sequential start waits for each node's readiness, then the configured
    /// inter-node delay, before launching the next one. Concurrent start
    /// waits for every launch to settle and reports the first failure.
    pub async fn start_nodes(&self, ids: &[NodeId], mode: StartMode) -> Result<()> {
        info!(nodes = ids.len(), %mode, "Starting nodes");
        match mode {
            StartMode::Sequential => {
                for (position, id) in ids.iter().enumerate() {
                    self.start_node(id).await?;
                    if position + 1 < ids.len() && !self.start_delay.is_zero() {
                        tokio::time::sleep(self.start_delay).await;
                    }
                }
                Ok(())
            },
            StartMode::Concurrent => {
                let results = join_all(ids.iter().map(|id| self.start_node(id))).await;
                results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
            },
        }
    }

    /// Start one node.
    pub async fn start_node(&self, id: &NodeId) -> Result<()> {
        self.node(id)?.lock().await.start().await
    }

    /// Gracefully stop one node.
    pub async fn shutdown_node(&self, id: &NodeId) -> Result<()> {
        self.node(id)?.lock().await.shutdown().await
    }

    /// Kill one node and drop its proxied connections.
    pub async fn crash_node(&self, id: &NodeId) -> Result<()> {
        self.node(id)?.lock().await.crash().await?;
        if let Some(proxy) = &self.proxy {
            proxy.sever(id.as_str());
        }
        Ok(())
    }

    /// Restart one stopped or crashed node.
    pub async fn restart_node(&self, id: &NodeId, wait: RestartWait) -> Result<()> {
        self.node(id)?.lock().await.restart(wait).await
    }

    /// Delete one stopped node's data.
    pub async fn delete_data(&self, id: &NodeId) -> Result<()> {
        self.node(id)?.lock().await.delete_data().await
    }

    /// Stop every node and close the proxy; never fails.
    ///
    /// Returns the errors encountered, which callers log next to, not instead
    /// of, the run's own outcome.
    pub async fn teardown(&self) -> Vec<String> {
        info!(mode = ?self.teardown_mode, "Tearing down topology");
        let mut errors = Vec::new();
        for slot in self.nodes.iter().rev() {
            let mut process = slot.lock().await;
            let result = match self.teardown_mode {
                TeardownMode::Shutdown => process.shutdown().await,
                TeardownMode::Crash => process.crash().await,
            };
            if let Err(err) = result {
                warn!(node = %slot.id, error = %err, "Teardown of node failed");
                errors.push(format!("{}: {err}", slot.id));
            }
        }
        if let Some(proxy) = &self.proxy {
            proxy.shutdown().await;
        }
        errors
    }
}

async fn allocate(config: &HarnessConfig, run_root: &Path) -> Result<Vec<NodePlacement>> {
    let cluster = &config.cluster;
    let mut held = Vec::new();
    let mut placements = Vec::with_capacity(cluster.server_count);

    for ordinal in 0..cluster.server_count {
        let (client_port, cluster_port) = if cluster.base_port == 0 {
            (free_port(&cluster.host, &mut held)?, free_port(&cluster.host, &mut held)?)
        } else {
            let client = cluster.base_port + cluster.port_stride * ordinal as u16;
            (client, client + 1)
        };

        let id = NodeId::from_ordinal(ordinal);
        let root_dir = run_root.join(id.as_str());
        tokio::fs::create_dir_all(&root_dir).await?;
        placements.push(NodePlacement {
            id,
            ordinal,
            database: cluster.database.clone(),
            host: cluster.host.clone(),
            client_port,
            cluster_port,
            root_dir,
        });
    }

    debug!(ports = ?placements.iter().map(|p| (p.client_port, p.cluster_port)).collect::<Vec<_>>(), "Allocated ports");
    Ok(placements)
}

/// Pick an ephemeral port, keeping its listener alive so later picks differ.
fn free_port(host: &str, held: &mut Vec<TcpListener>) -> Result<u16> {
    let listener = TcpListener::bind(socket_addr(host, 0)?)?;
    let port = listener.local_addr()?.port();
    held.push(listener);
    Ok(port)
}

fn copy_dir<'a>(from: &'a Path, to: &'a Path) -> BoxFuture<'a, std::io::Result<u64>> {
    async move {
        tokio::fs::create_dir_all(to).await?;
        let mut copied = 0;
        let mut entries = match tokio::fs::read_dir(from).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let dest = to.join(entry.file_name());
            if file_type.is_dir() {
                copied += copy_dir(&entry.path(), &dest).await?;
            } else if file_type.is_file() {
                copied += tokio::fs::copy(entry.path(), &dest).await?;
            }
        }
        Ok(copied)
    }
    .boxed()
}

