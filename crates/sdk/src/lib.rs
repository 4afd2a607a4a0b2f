//! Cluster discovery and leader-aware connection management for evdb clients.
//!
//! This SDK finds a usable node in an evdb cluster, keeps a connection to it,
//! and moves that connection when the cluster says the leader is elsewhere.
//! Application RPC clients are built on top of the channel it hands out.
//!
//! # Features
//!
//! - **Gossip discovery**: Seeds and known members are queried in random order with retry
//! - **Node selection**: Leader, follower, read-only replica or random preference
//! - **Single-flight reconnection**: Concurrent callers share one connection attempt
//! - **Leader redirects**: "Not leader" rejections reconnect straight to the hinted node
//! - **Capability negotiation**: Optional features are detected per node, best-effort
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use evdb_client::{ClientConfig, ClusterClient, NodePreference};
//!
//! #[tokio::main]
//! async fn main() -> evdb_client::Result<()> {
//!     let config = ClientConfig::builder()
//!         .with_gossip_seeds(["10.0.0.1:2113", "10.0.0.2:2113", "10.0.0.3:2113"])
//!         .with_node_preference(NodePreference::Leader)
//!         .build()?;
//!
//!     let client = ClusterClient::new(config).await?;
//!
//!     // Current connection; waits for discovery on first use
//!     let info = client.connection_info().await?;
//!     let invoker = info.invoker();
//!
//!     // Calls made through the invoker reconnect on "not leader" and UNAVAILABLE
//!     let mut gossip = evdb_client::proto::gossip_client::GossipClient::new(invoker.channel());
//!     let members = invoker.unary(gossip.read(evdb_client::proto::Empty {})).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ClusterClient (Public API)                │
//! │  .connection_info() │ .trigger_reconnect() │ .shutdown()    │
//! ├─────────────────────────────────────────────────────────────┤
//! │            CallInvoker + LeaderChangeDetector               │
//! │   Failure classification │ Leader hints │ Stream wrapping   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   ConnectionProvider                        │
//! │   Generations │ Single-flight connect │ Failure backoff     │
//! ├─────────────────────────────────────────────────────────────┤
//! │          ClusterConnectionFactory + NodeSelector            │
//! │   Discovery mode │ Preference │ Capability negotiation      │
//! ├─────────────────────────────────────────────────────────────┤
//! │             GossipResolver + ConnectionCache                │
//! │   Gossip rounds │ Reseeding │ Per-endpoint channels         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   Tonic gRPC Channels                       │
//! │        GossipClient │ ServerFeaturesClient                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod capabilities;
mod client;
mod config;
mod connection;
mod detector;
mod discovery;
mod endpoint;
mod error;
mod metrics;
pub mod mock;
mod provider;
mod server;
mod streaming;

// Public API exports
pub use backoff::{
    Backoff, BackoffConfig, DEFAULT_INITIAL_BACKOFF, DEFAULT_JITTER, DEFAULT_MAX_BACKOFF,
    DEFAULT_MULTIPLIER, apply_jitter,
};
pub use capabilities::{DEFAULT_NEGOTIATION_TIMEOUT, ServerCapabilities, negotiate};
pub use client::ClusterClient;
pub use config::{ClientConfig, ClientConfigBuilder, Topology};
pub use connection::{
    ChannelFactory, ChannelSettings, ConnectionCache, ConnectionHandle, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_KEEP_ALIVE_TIMEOUT, LazyChannelFactory,
};
pub use detector::{
    CallInvoker, EXCEPTION_KEY, FailureClass, LeaderChangeDetector, NOT_LEADER, classify,
};
pub use discovery::{ClusterConnectionFactory, DiscoveryMode};
pub use endpoint::EndPoint;
pub use error::{Result, SdkError};
pub use metrics::{ConnectionEvent, MetricsSdkMetrics, NoopSdkMetrics, SdkMetrics};
pub use provider::{
    ConnectionFactory, ConnectionInfo, ConnectionProvider, ReconnectionTrigger, ResolvedConnection,
};
pub use server::{
    ClusterNode, DEFAULT_GOSSIP_TIMEOUT, DEFAULT_MAX_DISCOVER_ATTEMPTS, GossipOutcome,
    GossipResolver, GrpcTopologyClient, NOT_ALLOWED_STATES, NodePreference, NodeSelector,
    NodeState, Resolution, ResolverSettings, TopologyClient, select_node, select_nodes,
};
pub use streaming::DetectingStream;

// Re-export the wire types application clients are built from
pub use evdb_proto::{VNodeState, proto};
