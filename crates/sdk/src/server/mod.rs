//! Cluster membership, node selection and gossip discovery.
//!
//! # Architecture
//!
//! ```text
//! seeds / cached endpoints
//!       │
//!       ▼
//! GossipResolver (per-endpoint gossip, retry, reseed)
//!       │ uses TopologyClient
//!       ▼
//! member table (ClusterNode list)
//!       │
//!       ▼
//! NodeSelector (state filter + preference ordering)
//! ```

mod node;
mod resolver;
mod selector;
mod topology;

pub use node::{ClusterNode, NOT_ALLOWED_STATES, NodePreference, NodeState};
pub use resolver::{
    DEFAULT_GOSSIP_TIMEOUT, DEFAULT_MAX_DISCOVER_ATTEMPTS, GossipOutcome, GossipResolver,
    Resolution, ResolverSettings,
};
pub use selector::{NodeSelector, select_node, select_nodes};
pub use topology::{GrpcTopologyClient, TopologyClient};

#[cfg(test)]
pub(crate) use resolver::tests as resolver_tests;
