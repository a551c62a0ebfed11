//! Readiness probes.

use super::{LaunchSpec, ReadinessProbe};
use async_trait::async_trait;
use faultline_core::{DatabaseClient, Error};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpStream;

/// Ready once the client port accepts a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    /// Create a probe with a per-attempt connect timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn is_ready(&self, spec: &LaunchSpec) -> faultline_core::Result<bool> {
        let addr = (spec.host.as_str(), spec.client_port);
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(err)) => Err(Error::unreachable(&spec.node, err)),
            Err(_) => Ok(false),
        }
    }
}

/// Ready once the node's distributed configuration is readable and lists it.
#[derive(Clone)]
pub struct MembershipProbe {
    client: Arc<dyn DatabaseClient>,
}

impl MembershipProbe {
    /// Create a probe observing through `client`.
    pub fn new(client: Arc<dyn DatabaseClient>) -> Self {
        Self { client }
    }
}

impl std::fmt::Debug for MembershipProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MembershipProbe")
    }
}

#[async_trait]
impl ReadinessProbe for MembershipProbe {
    async fn is_ready(&self, spec: &LaunchSpec) -> faultline_core::Result<bool> {
        let config = self.client.distributed_configuration(&spec.node, &spec.database).await?;
        Ok(config.servers.contains(&spec.node))
    }
}
