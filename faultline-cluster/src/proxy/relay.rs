//! One listen-port-to-target relay and its connection pumps.

use super::rewrite::RewriteRule;
use bytes::BytesMut;
use faultline_core::CancellationToken;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::watch,
};
use tracing::{debug, trace, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Description of a relay to open.
#[derive(Debug, Clone)]
pub struct RelaySpec {
    /// Endpoint whose outbound traffic enters the relay (node name or `client`)
    pub from: String,
    /// Endpoint the relay forwards to
    pub to: String,
    /// Local listen address; port `0` picks an ephemeral port
    pub listen: SocketAddr,
    /// Forward target
    pub target: SocketAddr,
    /// Rule applied to bytes flowing from `from` to `to`
    pub upstream_rule: Option<Arc<dyn RewriteRule>>,
    /// Rule applied to bytes flowing back
    pub downstream_rule: Option<Arc<dyn RewriteRule>>,
}

impl RelaySpec {
    /// Plain relay without rewrite rules.
    pub fn new<F: Into<String>, T: Into<String>>(from: F, to: T, listen: SocketAddr, target: SocketAddr) -> Self {
        Self { from: from.into(), to: to.into(), listen, target, upstream_rule: None, downstream_rule: None }
    }

    /// Rewrite traffic flowing from `from` to `to`.
    pub fn with_upstream_rule(mut self, rule: Arc<dyn RewriteRule>) -> Self {
        self.upstream_rule = Some(rule);
        self
    }

    /// Rewrite traffic flowing back from `to` to `from`.
    pub fn with_downstream_rule(mut self, rule: Arc<dyn RewriteRule>) -> Self {
        self.downstream_rule = Some(rule);
        self
    }
}

/// Counters of one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Source endpoint
    pub from: String,
    /// Target endpoint
    pub to: String,
    /// Bound listen address
    pub listen: SocketAddr,
    /// Whether the relay currently forwards
    pub enabled: bool,
    /// Connections forwarded
    pub connections: u64,
    /// Connections refused while disabled
    pub refused: u64,
    /// Live connections dropped by partitions or severing
    pub severed: u64,
    /// Bytes forwarded from source to target
    pub bytes_upstream: u64,
    /// Bytes forwarded back
    pub bytes_downstream: u64,
    /// Rewrite rule matches
    pub rewrites: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicU64,
    refused: AtomicU64,
    severed: AtomicU64,
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,
    rewrites: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Upstream,
    Downstream,
}

/// Shared state of a running relay.
#[derive(Debug)]
pub(crate) struct Relay {
    spec: RelaySpec,
    listen: SocketAddr,
    enabled: Mutex<bool>,
    generation: watch::Sender<u64>,
    counters: Counters,
    hold_flush: Duration,
    buffer_size: usize,
}

impl Relay {
    pub(crate) fn new(spec: RelaySpec, listen: SocketAddr, hold_flush: Duration, buffer_size: usize) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            spec,
            listen,
            enabled: Mutex::new(true),
            generation,
            counters: Counters::default(),
            hold_flush,
            buffer_size,
        }
    }

    pub(crate) fn from_endpoint(&self) -> &str {
        &self.spec.from
    }

    pub(crate) fn to_endpoint(&self) -> &str {
        &self.spec.to
    }

    pub(crate) fn listen(&self) -> SocketAddr {
        self.listen
    }

    pub(crate) fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }

    /// Flip the switch. Disabling also drops live connections.
    pub(crate) fn set_enabled(&self, enabled: bool) {
        let mut switch = self.enabled.lock();
        if *switch == enabled {
            return;
        }
        *switch = enabled;
        if !enabled {
            self.generation.send_modify(|generation| *generation += 1);
        }
        debug!(from = %self.spec.from, to = %self.spec.to, enabled, "Relay switched");
    }

    /// Drop live connections without touching the switch.
    pub(crate) fn sever(&self) {
        let _switch = self.enabled.lock();
        self.generation.send_modify(|generation| *generation += 1);
    }

    /// Admit a new connection: a generation receiver when enabled, `None` when refused.
    fn admit(&self) -> Option<watch::Receiver<u64>> {
        let switch = self.enabled.lock();
        if *switch {
            Some(self.generation.subscribe())
        } else {
            None
        }
    }

    pub(crate) fn stats(&self) -> RelayStats {
        RelayStats {
            from: self.spec.from.clone(),
            to: self.spec.to.clone(),
            listen: self.listen,
            enabled: self.is_enabled(),
            connections: self.counters.connections.load(Ordering::Relaxed),
            refused: self.counters.refused.load(Ordering::Relaxed),
            severed: self.counters.severed.load(Ordering::Relaxed),
            bytes_upstream: self.counters.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.counters.bytes_downstream.load(Ordering::Relaxed),
            rewrites: self.counters.rewrites.load(Ordering::Relaxed),
        }
    }

    fn rule(&self, direction: Direction) -> Option<Arc<dyn RewriteRule>> {
        match direction {
            Direction::Upstream => self.spec.upstream_rule.clone(),
            Direction::Downstream => self.spec.downstream_rule.clone(),
        }
    }

    fn count_bytes(&self, direction: Direction, n: usize) {
        let counter = match direction {
            Direction::Upstream => &self.counters.bytes_upstream,
            Direction::Downstream => &self.counters.bytes_downstream,
        };
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Accept loop of one relay; runs until `shutdown` is cancelled.
pub(crate) async fn accept_loop(relay: Arc<Relay>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (inbound, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(from = %relay.from_endpoint(), to = %relay.to_endpoint(), error = %err, "Relay accept failed");
                continue;
            },
        };

        let Some(generation) = relay.admit() else {
            relay.counters.refused.fetch_add(1, Ordering::Relaxed);
            trace!(from = %relay.from_endpoint(), to = %relay.to_endpoint(), %peer, "Refused connection on disabled relay");
            drop(inbound);
            continue;
        };

        relay.counters.connections.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(connection(Arc::clone(&relay), inbound, generation, shutdown.clone()));
    }
    debug!(from = %relay.from_endpoint(), to = %relay.to_endpoint(), "Relay closed");
}

async fn connection(
    relay: Arc<Relay>,
    inbound: TcpStream,
    mut generation: watch::Receiver<u64>,
    shutdown: CancellationToken,
) {
    let outbound = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(relay.spec.target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            debug!(target = %relay.spec.target, error = %err, "Relay target unreachable");
            return;
        },
        Err(_) => {
            debug!(target = %relay.spec.target, "Relay target connect timed out");
            return;
        },
    };
    let _ = inbound.set_nodelay(true);
    let _ = outbound.set_nodelay(true);

    let (in_read, in_write) = inbound.into_split();
    let (out_read, out_write) = outbound.into_split();
    let upstream = pump(&relay, Direction::Upstream, in_read, out_write);
    let downstream = pump(&relay, Direction::Downstream, out_read, in_write);

    tokio::select! {
        _ = async { tokio::join!(upstream, downstream) } => {},
        _ = generation.changed() => {
            relay.counters.severed.fetch_add(1, Ordering::Relaxed);
            debug!(from = %relay.from_endpoint(), to = %relay.to_endpoint(), "Dropped live connection");
        },
        _ = shutdown.cancelled() => {},
    }
}

/// Copy one direction, applying the rewrite rule and holding back possible partial matches.
async fn pump(relay: &Relay, direction: Direction, mut reader: OwnedReadHalf, mut writer: OwnedWriteHalf) {
    let rule = relay.rule(direction);
    let mut buf = BytesMut::with_capacity(relay.buffer_size);

    loop {
        buf.reserve(relay.buffer_size);
        let read = if buf.is_empty() {
            reader.read_buf(&mut buf).await
        } else {
            match tokio::time::timeout(relay.hold_flush, reader.read_buf(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    // Idle with held bytes: they were not a match after all.
                    if writer.write_all(&buf).await.is_err() {
                        return;
                    }
                    buf.clear();
                    continue;
                },
            }
        };

        let read = match read {
            Ok(0) | Err(_) => {
                if !buf.is_empty() {
                    let _ = writer.write_all(&buf).await;
                }
                let _ = writer.shutdown().await;
                return;
            },
            Ok(read) => read,
        };
        relay.count_bytes(direction, read);

        let ready = match &rule {
            Some(rule) => {
                let rewrites = rule.apply(&mut buf);
                if rewrites > 0 {
                    relay.counters.rewrites.fetch_add(rewrites as u64, Ordering::Relaxed);
                }
                buf.len() - rule.pending_prefix(&buf)
            },
            None => buf.len(),
        };

        if ready > 0 {
            let chunk = buf.split_to(ready);
            if writer.write_all(&chunk).await.is_err() {
                return;
            }
        }
    }
}
