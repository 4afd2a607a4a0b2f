//! Connection factory backed by discovery.
//!
//! [`ClusterConnectionFactory`] turns a [`ReconnectionTrigger`] into a
//! connection:
//!
//! | Trigger | Single node | Gossip cluster |
//! |---------|-------------|----------------|
//! | `Rediscover` | configured endpoint | resolve, then pick by preference |
//! | `NewLeader(e)` | `e` | `e` (no discovery) |
//!
//! The chosen endpoint's handle comes from the shared [`ConnectionCache`],
//! then capabilities are negotiated if enabled.

use std::{sync::Arc, time::Duration};

use snafu::OptionExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    capabilities::{ServerCapabilities, negotiate},
    connection::ConnectionCache,
    endpoint::EndPoint,
    error::{Result, UnavailableSnafu},
    provider::{ConnectionFactory, ReconnectionTrigger, ResolvedConnection},
    server::{GossipResolver, NodeSelector},
};

/// Where `Rediscover` looks for a node.
#[derive(Debug, Clone)]
pub enum DiscoveryMode {
    /// Always the same node; no gossip.
    SingleNode(EndPoint),
    /// Gossip discovery over the resolver's seeds and known members.
    Gossip(Arc<GossipResolver>),
}

/// [`ConnectionFactory`] that discovers, selects and negotiates.
#[derive(Debug)]
pub struct ClusterConnectionFactory {
    mode: DiscoveryMode,
    cache: Arc<ConnectionCache>,
    selector: NodeSelector,
    negotiation_timeout: Option<Duration>,
}

impl ClusterConnectionFactory {
    /// Creates a factory that skips capability negotiation.
    #[must_use]
    pub fn new(mode: DiscoveryMode, cache: Arc<ConnectionCache>, selector: NodeSelector) -> Self {
        Self { mode, cache, selector, negotiation_timeout: None }
    }

    /// Negotiates capabilities with `timeout` after each connect; `None` skips it.
    #[must_use]
    pub fn with_capability_negotiation(mut self, timeout: Option<Duration>) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Returns the discovery mode.
    #[must_use]
    pub fn mode(&self) -> &DiscoveryMode {
        &self.mode
    }

    async fn target(
        &self,
        trigger: &ReconnectionTrigger,
        token: &CancellationToken,
    ) -> Result<EndPoint> {
        match (trigger, &self.mode) {
            (ReconnectionTrigger::NewLeader(leader), _) => {
                info!(leader = %leader, "Connecting to hinted leader");
                Ok(leader.clone())
            },
            (ReconnectionTrigger::Rediscover, DiscoveryMode::SingleNode(endpoint)) => Ok(endpoint.clone()),
            (ReconnectionTrigger::Rediscover, DiscoveryMode::Gossip(resolver)) => {
                let resolution = resolver.refresh(token).await?;
                let chosen = self.selector.select(&resolution.members).context(UnavailableSnafu {
                    message: format!(
                        "no connectable node among {} members reported by {}",
                        resolution.members.len(),
                        resolution.source
                    ),
                })?;

                debug!(
                    node_id = %chosen.node_id,
                    endpoint = %chosen.endpoint,
                    state = ?chosen.state,
                    preference = %self.selector.preference(),
                    "Selected cluster node"
                );
                Ok(chosen.endpoint)
            },
        }
    }
}

#[tonic::async_trait]
impl ConnectionFactory for ClusterConnectionFactory {
    async fn connect(
        &self,
        trigger: &ReconnectionTrigger,
        token: &CancellationToken,
    ) -> Result<ResolvedConnection> {
        let endpoint = self.target(trigger, token).await?;
        let handle = self.cache.get_or_create(&endpoint)?;

        let capabilities = match self.negotiation_timeout {
            Some(timeout) => negotiate(handle.channel(), timeout, token).await?,
            None => ServerCapabilities::default(),
        };

        Ok(ResolvedConnection { handle, capabilities })
    }
}
