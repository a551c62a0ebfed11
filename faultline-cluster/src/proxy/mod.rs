//! # Partition proxy
//!
//! A set of TCP relays placed in front of inter-node (and optionally client)
//! ports. Each relay is keyed by its source and target endpoint, so a network
//! partition between two nodes is simulated by switching off the two relays
//! that connect them. Processes keep running and sockets stay bound.
//!
//! Disabling a relay drops its live connections and refuses new ones
//! (accepted, then closed immediately). Re-enabling does not reconnect
//! anyone; peers recover on their own retry cadence.

mod relay;
mod rewrite;

pub use relay::{RelaySpec, RelayStats};
pub use rewrite::{AddressField, AddressRewrite, RewriteRule};

use crate::error::{Error, Result};
use faultline_core::{config::ProxySettings, CancellationToken};
use parking_lot::{Mutex, RwLock};
use relay::Relay;
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{debug, info, warn};

type RelayKey = (String, String);

/// Switchboard of relays between cluster endpoints.
pub struct PartitionProxy {
    relays: RwLock<BTreeMap<RelayKey, Arc<Relay>>>,
    reserved: Mutex<BTreeMap<RelayKey, TcpListener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    hold_flush: Duration,
    buffer_size: usize,
}

impl PartitionProxy {
    /// Create an empty proxy.
    pub fn new(hold_flush: Duration, buffer_size: usize) -> Self {
        Self {
            relays: RwLock::new(BTreeMap::new()),
            reserved: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            hold_flush,
            buffer_size,
        }
    }

    /// Create a proxy from settings.
    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self::new(settings.hold_flush(), settings.buffer_size)
    }

    /// Bind the listener of a future relay and return its address.
    ///
    /// Lets callers learn every relay port before building rewrite rules that
    /// refer to them. The next [`open_relay`](Self::open_relay) for the same
    /// endpoints uses this listener.
    pub async fn reserve(&self, from: &str, to: &str, listen: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|source| Error::ProxyBind { listen: listen.to_string(), source })?;
        let addr = listener.local_addr()?;
        self.reserved.lock().insert((from.to_string(), to.to_string()), listener);
        debug!(from, to, %addr, "Reserved relay listener");
        Ok(addr)
    }

    /// Start forwarding `spec.from -> spec.to` and return the bound listen address.
    pub async fn open_relay(&self, spec: RelaySpec) -> Result<SocketAddr> {
        let key = (spec.from.clone(), spec.to.clone());
        let reserved = self.reserved.lock().remove(&key);
        let listener = match reserved {
            Some(listener) => listener,
            None => TcpListener::bind(spec.listen)
                .await
                .map_err(|source| Error::ProxyBind { listen: spec.listen.to_string(), source })?,
        };
        let listen = listener.local_addr()?;

        info!(
            from = %spec.from,
            to = %spec.to,
            %listen,
            target = %spec.target,
            rewrites = spec.upstream_rule.is_some() || spec.downstream_rule.is_some(),
            "Opening relay"
        );

        let relay = Arc::new(Relay::new(spec, listen, self.hold_flush, self.buffer_size));
        let task = tokio::spawn(relay::accept_loop(Arc::clone(&relay), listener, self.shutdown.clone()));
        self.tasks.lock().push(task);
        if let Some(previous) = self.relays.write().insert(key, relay) {
            warn!(from = %previous.from_endpoint(), to = %previous.to_endpoint(), "Replaced existing relay");
            previous.set_enabled(false);
        }
        Ok(listen)
    }

    /// Listen address of the relay `from -> to`.
    pub fn route(&self, from: &str, to: &str) -> Option<SocketAddr> {
        self.relays.read().get(&(from.to_string(), to.to_string())).map(|relay| relay.listen())
    }

    /// Whether the relay `from -> to` forwards.
    pub fn is_enabled(&self, from: &str, to: &str) -> Option<bool> {
        self.relays.read().get(&(from.to_string(), to.to_string())).map(|relay| relay.is_enabled())
    }

    /// Cut both directions between `a` and `b`; returns the number of relays switched.
    pub fn close_partition(&self, a: &str, b: &str) -> Result<usize> {
        let switched = self.switch_pair(a, b, false)?;
        info!(a, b, relays = switched, "Partition closed");
        Ok(switched)
    }

    /// Restore both directions between `a` and `b`.
    pub fn heal_partition(&self, a: &str, b: &str) -> Result<usize> {
        let switched = self.switch_pair(a, b, true)?;
        info!(a, b, relays = switched, "Partition healed");
        Ok(switched)
    }

    /// Cut `node` off from every other endpoint.
    pub fn isolate(&self, node: &str) -> usize {
        let switched = self.for_each_touching(node, |relay| relay.set_enabled(false));
        info!(node, relays = switched, "Node isolated");
        switched
    }

    /// Undo [`isolate`](Self::isolate).
    pub fn rejoin(&self, node: &str) -> usize {
        let switched = self.for_each_touching(node, |relay| relay.set_enabled(true));
        info!(node, relays = switched, "Node rejoined");
        switched
    }

    /// Drop live connections touching `node` while leaving relays enabled.
    pub fn sever(&self, node: &str) -> usize {
        let severed = self.for_each_touching(node, Relay::sever);
        debug!(node, relays = severed, "Severed live connections");
        severed
    }

    /// Counters of every relay.
    pub fn stats(&self) -> Vec<RelayStats> {
        self.relays.read().values().map(|relay| relay.stats()).collect()
    }

    /// Close every relay and listener and wait for the accept loops to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.reserved.lock().clear();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Relay task ended abnormally");
            }
        }
        self.relays.write().clear();
        info!("Partition proxy shut down");
    }

    fn switch_pair(&self, a: &str, b: &str, enabled: bool) -> Result<usize> {
        let relays = self.relays.read();
        let forward = relays.get(&(a.to_string(), b.to_string()));
        let backward = relays.get(&(b.to_string(), a.to_string()));
        if forward.is_none() && backward.is_none() {
            return Err(Error::UnknownRelay { from: a.to_string(), to: b.to_string() });
        }

        let mut switched = 0;
        for relay in forward.into_iter().chain(backward) {
            relay.set_enabled(enabled);
            switched += 1;
        }
        Ok(switched)
    }

    fn for_each_touching<F: Fn(&Relay)>(&self, node: &str, action: F) -> usize {
        let mut touched = 0;
        for relay in self.relays.read().values() {
            if relay.from_endpoint() == node || relay.to_endpoint() == node {
                action(relay.as_ref());
                touched += 1;
            }
        }
        touched
    }
}

impl Drop for PartitionProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for PartitionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionProxy").field("relays", &self.relays.read().len()).finish()
    }
}
