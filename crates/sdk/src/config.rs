//! Client configuration with builder pattern.
//!
//! Provides validated configuration for a [`ClusterClient`](crate::ClusterClient):
//! - Gossip seeds or a single node
//! - Discovery timeouts, attempts and refresh interval
//! - Node preference
//! - Channel and TLS settings
//! - Metrics sink

use std::{fmt, sync::Arc, time::Duration};

use snafu::ensure;
use tonic::transport::ClientTlsConfig;

use crate::{
    backoff::BackoffConfig,
    capabilities::DEFAULT_NEGOTIATION_TIMEOUT,
    connection::{
        ChannelSettings, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEP_ALIVE_INTERVAL,
        DEFAULT_KEEP_ALIVE_TIMEOUT,
    },
    endpoint::EndPoint,
    error::{ConfigSnafu, Result},
    metrics::{SdkMetrics, default_metrics},
    server::{DEFAULT_GOSSIP_TIMEOUT, DEFAULT_MAX_DISCOVER_ATTEMPTS, NodePreference, ResolverSettings},
};

/// How the client finds cluster nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// Gossip discovery starting from these seeds.
    Cluster(Vec<EndPoint>),
    /// A single node; discovery is skipped.
    SingleNode(EndPoint),
}

/// Configuration for a [`ClusterClient`](crate::ClusterClient).
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) topology: Topology,
    pub(crate) gossip_timeout: Duration,
    pub(crate) discovery_interval: Option<Duration>,
    pub(crate) max_discover_attempts: u32,
    pub(crate) node_preference: NodePreference,
    pub(crate) randomize_ties: bool,
    pub(crate) discovery_backoff: BackoffConfig,
    pub(crate) reconnect_backoff: BackoffConfig,
    pub(crate) connect_timeout: Duration,
    pub(crate) keep_alive_interval: Duration,
    pub(crate) keep_alive_timeout: Duration,
    pub(crate) negotiation_timeout: Option<Duration>,
    pub(crate) tls: Option<ClientTlsConfig>,
    pub(crate) metrics: Arc<dyn SdkMetrics>,
}

impl ClientConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Returns how nodes are found.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Returns the deadline of a single gossip call.
    #[must_use]
    pub fn gossip_timeout(&self) -> Duration {
        self.gossip_timeout
    }

    /// Returns the background discovery period; `None` disables it.
    #[must_use]
    pub fn discovery_interval(&self) -> Option<Duration> {
        self.discovery_interval
    }

    /// Returns the attempts per discovery.
    #[must_use]
    pub fn max_discover_attempts(&self) -> u32 {
        self.max_discover_attempts
    }

    /// Returns the node preference.
    #[must_use]
    pub fn node_preference(&self) -> NodePreference {
        self.node_preference
    }

    /// Returns whether equal-priority nodes are shuffled.
    #[must_use]
    pub fn randomize_ties(&self) -> bool {
        self.randomize_ties
    }

    /// Returns the backoff between failed discovery attempts.
    #[must_use]
    pub fn discovery_backoff(&self) -> &BackoffConfig {
        &self.discovery_backoff
    }

    /// Returns the backoff between failed reconnections.
    #[must_use]
    pub fn reconnect_backoff(&self) -> &BackoffConfig {
        &self.reconnect_backoff
    }

    /// Returns the connection timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Returns the capability negotiation deadline; `None` when disabled.
    #[must_use]
    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout
    }

    /// Returns the TLS configuration.
    #[must_use]
    pub fn tls(&self) -> Option<&ClientTlsConfig> {
        self.tls.as_ref()
    }

    /// Returns the metrics sink.
    #[must_use]
    pub fn metrics(&self) -> &Arc<dyn SdkMetrics> {
        &self.metrics
    }

    pub(crate) fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            connect_timeout: self.connect_timeout,
            keep_alive_interval: self.keep_alive_interval,
            keep_alive_timeout: self.keep_alive_timeout,
            tls: self.tls.clone(),
        }
    }

    pub(crate) fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            gossip_timeout: self.gossip_timeout,
            max_discover_attempts: self.max_discover_attempts,
            backoff: self.discovery_backoff,
            discovery_interval: self.discovery_interval,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("topology", &self.topology)
            .field("gossip_timeout", &self.gossip_timeout)
            .field("discovery_interval", &self.discovery_interval)
            .field("max_discover_attempts", &self.max_discover_attempts)
            .field("node_preference", &self.node_preference)
            .field("randomize_ties", &self.randomize_ties)
            .field("connect_timeout", &self.connect_timeout)
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Default)]
pub struct ClientConfigBuilder {
    gossip_seeds: Vec<String>,
    single_node: Option<String>,
    gossip_timeout: Option<Duration>,
    discovery_interval: Option<Duration>,
    max_discover_attempts: Option<u32>,
    node_preference: NodePreference,
    randomize_ties: bool,
    discovery_backoff: Option<BackoffConfig>,
    reconnect_backoff: Option<BackoffConfig>,
    connect_timeout: Option<Duration>,
    keep_alive: Option<(Duration, Duration)>,
    negotiate_capabilities: Option<bool>,
    negotiation_timeout: Option<Duration>,
    tls: Option<ClientTlsConfig>,
    metrics: Option<Arc<dyn SdkMetrics>>,
}

impl ClientConfigBuilder {
    /// Sets the gossip seeds (`host:port`, `[v6]:port` or `http(s)://host:port`).
    ///
    /// Mutually exclusive with [`with_single_node`](Self::with_single_node).
    #[must_use]
    pub fn with_gossip_seeds<I, S>(mut self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gossip_seeds = seeds.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a single gossip seed.
    #[must_use]
    pub fn with_gossip_seed<S: Into<String>>(mut self, seed: S) -> Self {
        self.gossip_seeds.push(seed.into());
        self
    }

    /// Connects to one node without gossip.
    #[must_use]
    pub fn with_single_node<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.single_node = Some(endpoint.into());
        self
    }

    /// Sets the deadline of a single gossip call.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub fn with_gossip_timeout(mut self, timeout: Duration) -> Self {
        self.gossip_timeout = Some(timeout);
        self
    }

    /// Enables background rediscovery every `interval`.
    ///
    /// Default: disabled.
    #[must_use]
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = Some(interval);
        self
    }

    /// Sets how many attempts one discovery makes before giving up.
    ///
    /// Default: 10.
    #[must_use]
    pub fn with_max_discover_attempts(mut self, attempts: u32) -> Self {
        self.max_discover_attempts = Some(attempts);
        self
    }

    /// Sets which node role to connect to.
    ///
    /// Default: [`NodePreference::Leader`].
    #[must_use]
    pub fn with_node_preference(mut self, preference: NodePreference) -> Self {
        self.node_preference = preference;
        self
    }

    /// Shuffles nodes of equal priority before selection.
    ///
    /// Default: disabled.
    #[must_use]
    pub fn with_randomized_ties(mut self, enabled: bool) -> Self {
        self.randomize_ties = enabled;
        self
    }

    /// Sets the backoff between failed discovery attempts.
    #[must_use]
    pub fn with_discovery_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.discovery_backoff = Some(backoff);
        self
    }

    /// Sets the backoff between failed reconnections.
    #[must_use]
    pub fn with_reconnect_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.reconnect_backoff = Some(backoff);
        self
    }

    /// Sets the connection establishment timeout.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the HTTP/2 keep-alive ping interval and timeout.
    ///
    /// Default: 10 seconds each.
    #[must_use]
    pub fn with_keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keep_alive = Some((interval, timeout));
        self
    }

    /// Enables or disables capability negotiation after connecting.
    ///
    /// Default: enabled.
    #[must_use]
    pub fn with_capability_negotiation(mut self, enabled: bool) -> Self {
        self.negotiate_capabilities = Some(enabled);
        self
    }

    /// Sets the capability negotiation deadline.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = Some(timeout);
        self
    }

    /// Enables TLS. Endpoints are then reached over `https://`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use evdb_client::ClientConfig;
    /// # use tonic::transport::{Certificate, ClientTlsConfig};
    /// # fn example(ca_pem: Vec<u8>) -> evdb_client::Result<()> {
    /// let config = ClientConfig::builder()
    ///     .with_gossip_seeds(["node-1:2113", "node-2:2113"])
    ///     .with_tls(ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca_pem)))
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn with_tls(mut self, tls: ClientTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Sets the metrics sink.
    ///
    /// Default: [`NoopSdkMetrics`](crate::NoopSdkMetrics).
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn SdkMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Neither or both of gossip seeds and a single node are set
    /// - Any endpoint fails to parse
    /// - Any timeout or interval is zero
    /// - `max_discover_attempts` is zero
    /// - A backoff configuration is invalid
    pub fn build(self) -> Result<ClientConfig> {
        let topology = match (self.gossip_seeds.is_empty(), self.single_node) {
            (false, None) => {
                let seeds = self
                    .gossip_seeds
                    .iter()
                    .map(|s| s.parse::<EndPoint>())
                    .collect::<Result<Vec<_>>>()?;
                Topology::Cluster(seeds)
            },
            (true, Some(node)) => Topology::SingleNode(node.parse()?),
            (true, None) => {
                return ConfigSnafu { message: "either gossip seeds or a single node is required" }.fail();
            },
            (false, Some(_)) => {
                return ConfigSnafu { message: "gossip seeds and a single node are mutually exclusive" }
                    .fail();
            },
        };

        let gossip_timeout = self.gossip_timeout.unwrap_or(DEFAULT_GOSSIP_TIMEOUT);
        ensure!(!gossip_timeout.is_zero(), ConfigSnafu { message: "gossip_timeout cannot be zero" });

        if let Some(interval) = self.discovery_interval {
            ensure!(!interval.is_zero(), ConfigSnafu { message: "discovery_interval cannot be zero" });
        }

        let max_discover_attempts = self.max_discover_attempts.unwrap_or(DEFAULT_MAX_DISCOVER_ATTEMPTS);
        ensure!(
            max_discover_attempts > 0,
            ConfigSnafu { message: "max_discover_attempts must be at least 1" }
        );

        let discovery_backoff = self.discovery_backoff.unwrap_or_default();
        discovery_backoff.validate()?;
        let reconnect_backoff = self.reconnect_backoff.unwrap_or_default();
        reconnect_backoff.validate()?;

        let connect_timeout = self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        ensure!(
            !connect_timeout.is_zero(),
            ConfigSnafu { message: "connect_timeout cannot be zero" }
        );

        let (keep_alive_interval, keep_alive_timeout) =
            self.keep_alive.unwrap_or((DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_KEEP_ALIVE_TIMEOUT));
        ensure!(
            !keep_alive_interval.is_zero() && !keep_alive_timeout.is_zero(),
            ConfigSnafu { message: "keep-alive interval and timeout cannot be zero" }
        );

        let negotiation_timeout = self.negotiation_timeout.unwrap_or(DEFAULT_NEGOTIATION_TIMEOUT);
        ensure!(
            !negotiation_timeout.is_zero(),
            ConfigSnafu { message: "negotiation_timeout cannot be zero" }
        );

        Ok(ClientConfig {
            topology,
            gossip_timeout,
            discovery_interval: self.discovery_interval,
            max_discover_attempts,
            node_preference: self.node_preference,
            randomize_ties: self.randomize_ties,
            discovery_backoff,
            reconnect_backoff,
            connect_timeout,
            keep_alive_interval,
            keep_alive_timeout,
            negotiation_timeout: self.negotiate_capabilities.unwrap_or(true).then_some(negotiation_timeout),
            tls: self.tls,
            metrics: self.metrics.unwrap_or_else(default_metrics),
        })
    }
}

impl fmt::Debug for ClientConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfigBuilder")
            .field("gossip_seeds", &self.gossip_seeds)
            .field("single_node", &self.single_node)
            .field("node_preference", &self.node_preference)
            .finish_non_exhaustive()
    }
}
