//! One running simulated node: listeners, heartbeat senders and the
//! membership monitor.

use super::{
    store::{DatabaseState, Snapshot},
    wire::{Frame, FrameDecoder, FrameKind},
    Shared, SNAPSHOT_FILE,
};
use bytes::BytesMut;
use faultline_cluster::LaunchSpec;
use faultline_core::{
    CancellationToken, DatabaseStatus, Error, LeaveKind, NodeId, QueryResult, Result, Statement,
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, trace, warn};

/// Membership change to report to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Notice {
    Joining(NodeId),
    Joined(NodeId),
    Left(NodeId, LeaveKind),
    Status(NodeId, DatabaseStatus),
}

#[derive(Debug, Default)]
struct PeerView {
    last_seen: Option<Instant>,
    status: Option<DatabaseStatus>,
    left: bool,
    announced: Option<SocketAddr>,
    member: bool,
    joined: bool,
    reported: Option<DatabaseStatus>,
}

impl PeerView {
    fn is_fresh(&self, now: Instant, failure_timeout: Duration) -> bool {
        !self.left && self.last_seen.is_some_and(|seen| now.duration_since(seen) <= failure_timeout)
    }
}

#[derive(Debug, Default)]
struct NodeState {
    status: Option<DatabaseStatus>,
    ever_online: bool,
    peers: BTreeMap<NodeId, PeerView>,
    replicas: BTreeMap<String, DatabaseState>,
}

pub(crate) struct SimNode {
    pub(crate) id: NodeId,
    pub(crate) generation: u64,
    database: String,
    host: String,
    cluster_port: u16,
    data_dir: PathBuf,
    started: Instant,
    stop: CancellationToken,
    leave: CancellationToken,
    state: Mutex<NodeState>,
    senders: Mutex<Vec<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SimNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNode")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("cluster_port", &self.cluster_port)
            .finish()
    }
}

impl SimNode {
    /// Bind the node's ports, load its snapshot and spawn its tasks.
    pub(crate) async fn launch(
        shared: &Arc<Shared>,
        spec: &LaunchSpec,
        generation: u64,
    ) -> faultline_cluster::Result<Arc<Self>> {
        let client_listener = TcpListener::bind(spec.client_addr()?).await?;
        let cluster_listener = TcpListener::bind(spec.cluster_addr()?).await?;
        let snapshot = load_snapshot(&spec.data_dir.join(SNAPSHOT_FILE)).await?;

        let mut state = NodeState::default();
        for peer in spec.settings.peers.keys() {
            state.peers.insert(peer.clone(), PeerView::default());
        }
        if let Some(snapshot) = snapshot {
            shared.adopt(&snapshot);
            state.replicas = snapshot.databases;
        }

        let node = Arc::new(Self {
            id: spec.node.clone(),
            generation,
            database: spec.database.clone(),
            host: spec.host.clone(),
            cluster_port: spec.cluster_port,
            data_dir: spec.data_dir.clone(),
            started: Instant::now(),
            stop: CancellationToken::new(),
            leave: CancellationToken::new(),
            state: Mutex::new(state),
            senders: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = vec![
            tokio::spawn(accept_clients(Arc::clone(&node), client_listener)),
            tokio::spawn(accept_peers(Arc::clone(&node), cluster_listener)),
            tokio::spawn(monitor(Arc::clone(&node), Arc::clone(shared))),
        ];
        let senders = spec
            .settings
            .peers
            .iter()
            .map(|(peer, addr)| {
                tokio::spawn(send_heartbeats(
                    Arc::clone(&node),
                    Arc::clone(shared),
                    peer.clone(),
                    *addr,
                ))
            })
            .collect::<Vec<_>>();
        node.tasks.lock().append(&mut tasks);
        *node.senders.lock() = senders;

        info!(node = %node.id, generation, peers = spec.settings.peers.len(), "Simulated node launched");
        Ok(node)
    }

    /// Leave gracefully: announce the departure, flush a snapshot, stop.
    pub(crate) async fn shutdown(&self, grace: Duration) -> faultline_cluster::Result<()> {
        self.leave.cancel();
        let senders = std::mem::take(&mut *self.senders.lock());
        if tokio::time::timeout(grace, futures::future::join_all(senders)).await.is_err() {
            debug!(node = %self.id, "Leave announcements did not finish within grace period");
        }
        let written = self.write_snapshot().await;
        self.kill();
        written
    }

    /// Stop every task at once.
    pub(crate) fn kill(&self) {
        self.stop.cancel();
        for task in self.senders.lock().drain(..).chain(self.tasks.lock().drain(..)) {
            task.abort();
        }
    }

    pub(crate) fn has_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn self_status_online(&self) -> bool {
        self.state.lock().status == Some(DatabaseStatus::Online)
    }

    async fn write_snapshot(&self) -> faultline_cluster::Result<()> {
        let rendered = {
            let state = self.state.lock();
            serde_json::to_vec_pretty(&Snapshot { databases: state.replicas.clone() })
                .map_err(Error::from)?
        };
        tokio::fs::create_dir_all(&self.data_dir).await?;
        tokio::fs::write(self.data_dir.join(SNAPSHOT_FILE), rendered).await?;
        debug!(node = %self.id, dir = %self.data_dir.display(), "Snapshot written");
        Ok(())
    }

    fn frame(&self, kind: FrameKind) -> Frame {
        let state = self.state.lock();
        Frame {
            kind,
            node: self.id.clone(),
            host: self.host.clone(),
            port: u32::from(self.cluster_port),
            status: state.status.unwrap_or(DatabaseStatus::Synchronizing),
            seq: state.replicas.get(&self.database).map_or(0, DatabaseState::seq),
        }
    }

    fn on_frame(&self, frame: Frame) {
        if frame.node == self.id {
            return;
        }
        let announced = format!("{}:{}", frame.host, frame.port).parse().ok();
        let mut state = self.state.lock();
        let view = state.peers.entry(frame.node).or_default();
        view.announced = announced;
        view.status = Some(frame.status);
        match frame.kind {
            FrameKind::Heartbeat => {
                view.left = false;
                view.last_seen = Some(Instant::now());
            },
            FrameKind::Leave => view.left = true,
        }
    }

    fn reachable(&self, shared: &Shared) -> (usize, usize) {
        let registered = shared.registered_count().max(1);
        let failure_timeout = shared.settings.failure_timeout();
        let now = Instant::now();
        let alive = self
            .state
            .lock()
            .peers
            .values()
            .filter(|view| view.is_fresh(now, failure_timeout))
            .count();
        (alive + 1, registered / 2 + 1)
    }

    pub(crate) fn has_quorum(&self, shared: &Shared) -> bool {
        let (reachable, required) = self.reachable(shared);
        reachable >= required
    }

    fn require_quorum(&self, shared: &Shared) -> Result<()> {
        let (reachable, required) = self.reachable(shared);
        if reachable >= required {
            Ok(())
        } else {
            Err(Error::QuorumUnavailable { node: self.id.to_string(), reachable, required })
        }
    }

    /// One monitor pass: refresh peer liveness and this node's own status.
    fn tick(&self, shared: &Shared) -> Vec<Notice> {
        let registered = shared.registered_count().max(1);
        let failure_timeout = shared.settings.failure_timeout();
        let now = Instant::now();
        let mut notices = Vec::new();

        let mut state = self.state.lock();
        let mut alive = 0;
        for (peer, view) in &mut state.peers {
            let fresh = view.is_fresh(now, failure_timeout);
            if fresh {
                alive += 1;
                if !view.member {
                    view.member = true;
                    notices.push(Notice::Joining(peer.clone()));
                }
                if !view.joined && view.status == Some(DatabaseStatus::Online) {
                    view.joined = true;
                    notices.push(Notice::Joined(peer.clone()));
                }
            } else if view.member {
                view.member = false;
                view.joined = false;
                let kind = if view.left { LeaveKind::Graceful } else { LeaveKind::Failed };
                notices.push(Notice::Left(peer.clone(), kind));
            }

            let effective = if fresh {
                view.status.unwrap_or(DatabaseStatus::Synchronizing)
            } else {
                DatabaseStatus::NotAvailable
            };
            if view.reported != Some(effective) && (fresh || view.reported.is_some()) {
                view.reported = Some(effective);
                notices.push(Notice::Status(peer.clone(), effective));
            }
        }

        let quorum = (alive + 1) * 2 > registered;
        let status = if self.started.elapsed() < shared.settings.join_delay() {
            DatabaseStatus::Synchronizing
        } else if quorum {
            DatabaseStatus::Online
        } else if state.ever_online {
            DatabaseStatus::NotAvailable
        } else {
            DatabaseStatus::Synchronizing
        };
        if status == DatabaseStatus::Online {
            state.ever_online = true;
        }
        if state.status != Some(status) {
            info!(node = %self.id, %status, alive, registered, "Node status changed");
            state.status = Some(status);
            notices.push(Notice::Status(self.id.clone(), status));
        }
        notices
    }

    /// Copy every committed database whose sequence differs from the replica.
    pub(crate) fn resync(&self, shared: &Shared) -> usize {
        let committed = shared.committed.lock();
        let mut state = self.state.lock();
        let mut copied = 0;
        for (name, database) in committed.iter() {
            if state.replicas.get(name).map(DatabaseState::seq) != Some(database.seq()) {
                state.replicas.insert(name.clone(), database.clone());
                copied += 1;
            }
        }
        if copied > 0 {
            trace!(node = %self.id, databases = copied, "Replica resynchronised");
        }
        copied
    }

    /// Create `database` in the committed state and this node's replica.
    pub(crate) fn ensure_database(&self, shared: &Shared, database: &str) {
        let mut committed = shared.committed.lock();
        let entry = committed.entry(database.to_string()).or_default();
        self.state
            .lock()
            .replicas
            .entry(database.to_string())
            .or_insert_with(|| entry.clone());
    }

    /// Apply a write to the committed state, then to this node's replica.
    pub(crate) fn commit_with<F>(&self, shared: &Shared, database: &str, write: F) -> Result<QueryResult>
    where
        F: Fn(&mut DatabaseState) -> Result<QueryResult>,
    {
        self.require_quorum(shared)?;
        let mut committed = shared.committed.lock();
        let current = committed.get_mut(database).ok_or_else(|| Error::DatabaseNotFound {
            database: database.to_string(),
            node: self.id.to_string(),
        })?;
        let before = current.seq();
        let result = write(current)?;

        let mut state = self.state.lock();
        match state.replicas.get_mut(database) {
            Some(replica) if replica.seq() == before => {
                if write(replica).is_err() {
                    *replica = current.clone();
                }
            },
            _ => {
                state.replicas.insert(database.to_string(), current.clone());
            },
        }
        Ok(result)
    }

    /// Answer a read from this node's replica, which may lag the committed state.
    pub(crate) fn read(&self, shared: &Shared, database: &str, statement: &Statement) -> Result<QueryResult> {
        if let Some(replica) = self.state.lock().replicas.get(database) {
            return replica.read(statement);
        }
        if shared.committed.lock().contains_key(database) {
            Err(Error::unreachable(&self.id, format!("database {database} is synchronizing")))
        } else {
            Err(Error::DatabaseNotFound { database: database.to_string(), node: self.id.to_string() })
        }
    }

    /// This node's own status of `database`.
    pub(crate) fn self_status(&self, database: &str) -> DatabaseStatus {
        let state = self.state.lock();
        match state.status {
            Some(DatabaseStatus::Online) if !state.replicas.contains_key(database) => {
                DatabaseStatus::Synchronizing
            },
            Some(status) => status,
            None => DatabaseStatus::Synchronizing,
        }
    }

    /// Status of `peer` as observed by this node.
    pub(crate) fn peer_status(&self, shared: &Shared, peer: &NodeId) -> DatabaseStatus {
        let state = self.state.lock();
        match state.peers.get(peer) {
            Some(view) if view.is_fresh(Instant::now(), shared.settings.failure_timeout()) => {
                view.status.unwrap_or(DatabaseStatus::Synchronizing)
            },
            _ => DatabaseStatus::NotAvailable,
        }
    }

    /// Peers this node currently sees online.
    pub(crate) fn online_peers(&self, shared: &Shared) -> Vec<NodeId> {
        let now = Instant::now();
        let failure_timeout = shared.settings.failure_timeout();
        self.state
            .lock()
            .peers
            .iter()
            .filter(|(_, view)| view.is_fresh(now, failure_timeout))
            .filter(|(_, view)| view.status == Some(DatabaseStatus::Online))
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Address `peer` last announced to this node.
    pub(crate) fn announced(&self, peer: &NodeId) -> Option<SocketAddr> {
        self.state.lock().peers.get(peer).and_then(|view| view.announced)
    }
}

async fn load_snapshot(path: &std::path::Path) -> faultline_cluster::Result<Option<Snapshot>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let snapshot = serde_json::from_slice(&bytes).map_err(Error::from)?;
            Ok(Some(snapshot))
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn accept_clients(node: Arc<SimNode>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = node.stop.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    trace!(node = %node.id, %peer, "Client connection accepted");
                    drop(stream);
                },
                Err(err) => warn!(node = %node.id, error = %err, "Client accept failed"),
            },
        }
    }
}

async fn accept_peers(node: Arc<SimNode>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = node.stop.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let task = tokio::spawn(read_frames(Arc::clone(&node), stream));
                    let mut tasks = node.tasks.lock();
                    tasks.retain(|task| !task.is_finished());
                    tasks.push(task);
                },
                Err(err) => warn!(node = %node.id, error = %err, "Cluster accept failed"),
            },
        }
    }
}

async fn read_frames(node: Arc<SimNode>, mut stream: TcpStream) {
    let mut decoder = FrameDecoder::default();
    loop {
        let read = tokio::select! {
            _ = node.stop.cancelled() => return,
            read = stream.read_buf(decoder.buffer_mut()) => read,
        };
        match read {
            Ok(0) => return,
            Ok(_) => loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => node.on_frame(frame),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(node = %node.id, error = %err, "Dropping malformed peer stream");
                        return;
                    },
                }
            },
            Err(err) => {
                trace!(node = %node.id, error = %err, "Peer stream closed");
                return;
            },
        }
    }
}

async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    frame.encode(&mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await
}

async fn send_heartbeats(node: Arc<SimNode>, shared: Arc<Shared>, peer: NodeId, addr: SocketAddr) {
    let interval = shared.settings.heartbeat_interval();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut connection: Option<TcpStream> = None;

    loop {
        tokio::select! {
            _ = node.stop.cancelled() => return,
            _ = node.leave.cancelled() => {
                if let Some(stream) = connection.as_mut() {
                    if let Err(err) = write_frame(stream, &node.frame(FrameKind::Leave)).await {
                        debug!(node = %node.id, %peer, error = %err, "Leave announcement failed");
                    }
                    if let Err(err) = stream.shutdown().await {
                        trace!(node = %node.id, %peer, error = %err, "Peer connection shutdown failed");
                    }
                }
                return;
            },
            _ = ticker.tick() => {},
        }

        if connection.is_none() {
            match tokio::time::timeout(interval * 4, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        trace!(node = %node.id, %peer, error = %err, "Could not disable Nagle");
                    }
                    debug!(node = %node.id, %peer, %addr, "Connected to peer");
                    connection = Some(stream);
                },
                Ok(Err(err)) => {
                    trace!(node = %node.id, %peer, %addr, error = %err, "Peer unreachable");
                    continue;
                },
                Err(_) => continue,
            }
        }

        if let Some(stream) = connection.as_mut() {
            if let Err(err) = write_frame(stream, &node.frame(FrameKind::Heartbeat)).await {
                trace!(node = %node.id, %peer, error = %err, "Heartbeat failed, reconnecting");
                connection = None;
            }
        }
    }
}

async fn monitor(node: Arc<SimNode>, shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.settings.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = node.stop.cancelled() => return,
            _ = ticker.tick() => {},
        }
        let notices = node.tick(&shared);
        if node.self_status_online() {
            node.resync(&shared);
        }
        shared.notify(&node.id, &node.database, notices);
    }
}
