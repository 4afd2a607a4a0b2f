//! Main `ClusterClient` implementation.
//!
//! Wires the connection cache, gossip resolver, connection factory and
//! single-flight provider together from one [`ClientConfig`].

use std::sync::Arc;

use snafu::ensure;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::{ClientConfig, Topology},
    connection::{ChannelFactory, ConnectionCache, LazyChannelFactory},
    discovery::{ClusterConnectionFactory, DiscoveryMode},
    endpoint::EndPoint,
    error::{CancelledSnafu, DisposedSnafu, Result},
    provider::{ConnectionInfo, ConnectionProvider, ReconnectionTrigger},
    server::{GossipResolver, GrpcTopologyClient, NodeSelector, TopologyClient},
};

const COMPONENT: &str = "cluster client";

/// Always-available connection to an evdb cluster.
///
/// `ClusterClient` orchestrates:
/// - Gossip discovery from seeds (or a fixed single node)
/// - Preference-based node selection
/// - A shared cache of lazily-connecting channels
/// - Single-flight reconnection when calls report a leader change or an
///   unavailable node
///
/// The client is cheap to clone; clones share all state.
///
/// # Shutdown Behavior
///
/// When [`shutdown()`](Self::shutdown) is called:
/// 1. New requests fail with `SdkError::Disposed`
/// 2. The periodic discovery task stops
/// 3. In-flight discovery and connection runs are cancelled
/// 4. Cached connections are closed
///
/// Dropping the last clone shuts the client down.
///
/// # Example
///
/// ```no_run
/// # use evdb_client::{ClientConfig, ClusterClient, NodePreference};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::builder()
///     .with_gossip_seeds(["node-1:2113", "node-2:2113", "node-3:2113"])
///     .with_node_preference(NodePreference::Leader)
///     .build()?;
///
/// let client = ClusterClient::new(config).await?;
/// let info = client.connection_info().await?;
/// println!("connected to {}", info.endpoint());
///
/// client.shutdown();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    cache: Arc<ConnectionCache>,
    resolver: Option<Arc<GossipResolver>>,
    provider: Arc<ConnectionProvider>,
    cancellation: CancellationToken,
}

impl ClusterClient {
    /// Creates a client with the default channel factory and gossip client.
    ///
    /// Connections are established lazily on first use. When a discovery
    /// interval is configured a background refresh task is started.
    ///
    /// # Errors
    ///
    /// Returns an error if the seeds cannot be cached.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let channels = Arc::new(LazyChannelFactory::new(config.channel_settings()));
        Self::with_components(config, channels, Arc::new(GrpcTopologyClient)).await
    }

    /// Creates a client with custom channel and topology implementations.
    ///
    /// # Errors
    ///
    /// Returns an error if the seeds cannot be cached.
    pub async fn with_components(
        config: ClientConfig,
        channels: Arc<dyn ChannelFactory>,
        topology: Arc<dyn TopologyClient>,
    ) -> Result<Self> {
        let metrics = Arc::clone(config.metrics());
        let cache = Arc::new(ConnectionCache::with_metrics(channels, Arc::clone(&metrics)));

        let (mode, resolver) = match config.topology() {
            Topology::Cluster(seeds) => {
                let resolver = GossipResolver::with_metrics(
                    seeds.clone(),
                    Arc::clone(&cache),
                    topology,
                    config.resolver_settings(),
                    Arc::clone(&metrics),
                )?;
                resolver.start_periodic_refresh();
                (DiscoveryMode::Gossip(Arc::clone(&resolver)), Some(resolver))
            },
            Topology::SingleNode(endpoint) => (DiscoveryMode::SingleNode(endpoint.clone()), None),
        };

        let selector =
            NodeSelector::new(config.node_preference()).with_randomized_ties(config.randomize_ties());
        let factory = ClusterConnectionFactory::new(mode, Arc::clone(&cache), selector)
            .with_capability_negotiation(config.negotiation_timeout());
        let provider =
            ConnectionProvider::with_metrics(Arc::new(factory), *config.reconnect_backoff(), metrics);

        info!(
            topology = ?config.topology(),
            preference = %config.node_preference(),
            "Cluster client created"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                cache,
                resolver,
                provider,
                cancellation: CancellationToken::new(),
            }),
        })
    }

    /// Returns the current connection, discovering the cluster if needed.
    ///
    /// # Errors
    ///
    /// - `SdkError::Unavailable` when no connectable node can be found
    /// - `SdkError::Disposed` after [`shutdown`](Self::shutdown)
    /// - a recent connection failure, until its retry delay has passed
    pub async fn connection_info(&self) -> Result<ConnectionInfo> {
        self.check_shutdown()?;
        self.inner.provider.current().await
    }

    /// Like [`connection_info`](Self::connection_info), giving up when `token` fires.
    ///
    /// Cancelling only stops this caller's wait; the connection run continues
    /// for other callers.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Cancelled` if `token` fires first.
    pub async fn connection_info_with_token(&self, token: &CancellationToken) -> Result<ConnectionInfo> {
        self.check_shutdown()?;
        ensure!(!token.is_cancelled(), CancelledSnafu);

        tokio::select! {
            biased;
            () = token.cancelled() => CancelledSnafu.fail(),
            result = self.inner.provider.current() => result,
        }
    }

    /// Requests a new connection without waiting for it.
    ///
    /// With `Some(leader)` the client connects straight to `leader`;
    /// otherwise it rediscovers the cluster.
    pub fn trigger_reconnect(&self, leader: Option<EndPoint>) {
        if self.is_shutdown() {
            return;
        }
        self.inner.provider.reset(Self::trigger_for(leader));
    }

    /// Requests a new connection and waits for it.
    ///
    /// # Errors
    ///
    /// See [`connection_info`](Self::connection_info).
    pub async fn force_reconnect(&self, leader: Option<EndPoint>) -> Result<ConnectionInfo> {
        self.check_shutdown()?;
        self.inner.provider.force(Self::trigger_for(leader)).await
    }

    fn trigger_for(leader: Option<EndPoint>) -> ReconnectionTrigger {
        match leader {
            Some(leader) => ReconnectionTrigger::NewLeader(leader),
            None => ReconnectionTrigger::Rediscover,
        }
    }

    /// Returns the gossip resolver, `None` in single-node mode.
    #[must_use]
    pub fn resolver(&self) -> Option<&Arc<GossipResolver>> {
        self.inner.resolver.as_ref()
    }

    /// Returns the shared connection cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ConnectionCache> {
        &self.inner.cache
    }

    /// Returns the connection provider.
    #[must_use]
    pub fn provider(&self) -> &Arc<ConnectionProvider> {
        &self.inner.provider
    }

    /// Returns the client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the client's cancellation token, cancelled on shutdown.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Stops background discovery, cancels pending runs and closes every
    /// cached connection. Calling it again does nothing.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Returns `true` if the client has been shut down.
    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    #[inline]
    fn check_shutdown(&self) -> Result<()> {
        ensure!(!self.is_shutdown(), DisposedSnafu { component: COMPONENT });
        Ok(())
    }
}

impl ClientInner {
    fn shutdown(&self) {
        if self.cancellation.is_cancelled() {
            return;
        }
        self.cancellation.cancel();

        if let Some(resolver) = &self.resolver {
            resolver.shutdown();
        }
        self.provider.dispose();
        self.cache.dispose();
        debug!("Cluster client shut down");
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("config", &self.inner.config)
            .field("provider", &self.inner.provider)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}
