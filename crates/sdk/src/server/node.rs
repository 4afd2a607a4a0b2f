//! Cluster member model as reported by gossip.

use std::{fmt, str::FromStr};

use evdb_proto::{VNodeState, proto};

use crate::{
    endpoint::EndPoint,
    error::{ConfigSnafu, Result, SdkError},
};

/// Replication role of a cluster member.
///
/// Mirrors the gossip wire enumeration one to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Node is starting up.
    Initializing,
    /// Node is looking for a leader.
    DiscoverLeader,
    /// State could not be determined.
    Unknown,
    /// Node is about to become a replica.
    PreReplica,
    /// Node is replaying the log to catch up with the leader.
    CatchingUp,
    /// Node is cloning data from another member.
    Clone,
    /// In-sync follower.
    Follower,
    /// Node is about to become leader.
    PreLeader,
    /// Current leader; accepts writes.
    Leader,
    /// Management-only node; never serves client traffic.
    Manager,
    /// Node is shutting down.
    ShuttingDown,
    /// Node has shut down.
    Shutdown,
    /// Read-only replica that has lost contact with a leader.
    ReadOnlyLeaderless,
    /// Node is about to become a read-only replica.
    PreReadOnlyReplica,
    /// Read-only replica.
    ReadOnlyReplica,
    /// Leader that is handing over leadership.
    ResigningLeader,
}

/// States that are never connectable, whatever the preference.
pub const NOT_ALLOWED_STATES: [NodeState; 12] = [
    NodeState::Manager,
    NodeState::ShuttingDown,
    NodeState::Shutdown,
    NodeState::Unknown,
    NodeState::Initializing,
    NodeState::CatchingUp,
    NodeState::ResigningLeader,
    NodeState::PreLeader,
    NodeState::PreReplica,
    NodeState::PreReadOnlyReplica,
    NodeState::Clone,
    NodeState::DiscoverLeader,
];

impl NodeState {
    /// All states, in wire order.
    pub const ALL: [NodeState; 16] = [
        NodeState::Initializing,
        NodeState::DiscoverLeader,
        NodeState::Unknown,
        NodeState::PreReplica,
        NodeState::CatchingUp,
        NodeState::Clone,
        NodeState::Follower,
        NodeState::PreLeader,
        NodeState::Leader,
        NodeState::Manager,
        NodeState::ShuttingDown,
        NodeState::Shutdown,
        NodeState::ReadOnlyLeaderless,
        NodeState::PreReadOnlyReplica,
        NodeState::ReadOnlyReplica,
        NodeState::ResigningLeader,
    ];

    /// Returns whether a client may ever connect to a node in this state.
    #[must_use]
    pub fn is_connectable(self) -> bool {
        !NOT_ALLOWED_STATES.contains(&self)
    }

    /// Decodes the wire value; unrecognised values map to [`NodeState::Unknown`].
    #[must_use]
    pub fn from_wire(value: i32) -> Self {
        VNodeState::try_from(value).map_or(NodeState::Unknown, Self::from)
    }
}

impl From<VNodeState> for NodeState {
    fn from(state: VNodeState) -> Self {
        match state {
            VNodeState::Initializing => Self::Initializing,
            VNodeState::DiscoverLeader => Self::DiscoverLeader,
            VNodeState::Unknown => Self::Unknown,
            VNodeState::PreReplica => Self::PreReplica,
            VNodeState::CatchingUp => Self::CatchingUp,
            VNodeState::Clone => Self::Clone,
            VNodeState::Follower => Self::Follower,
            VNodeState::PreLeader => Self::PreLeader,
            VNodeState::Leader => Self::Leader,
            VNodeState::Manager => Self::Manager,
            VNodeState::ShuttingDown => Self::ShuttingDown,
            VNodeState::Shutdown => Self::Shutdown,
            VNodeState::ReadOnlyLeaderless => Self::ReadOnlyLeaderless,
            VNodeState::PreReadOnlyReplica => Self::PreReadOnlyReplica,
            VNodeState::ReadOnlyReplica => Self::ReadOnlyReplica,
            VNodeState::ResigningLeader => Self::ResigningLeader,
        }
    }
}

impl From<NodeState> for VNodeState {
    fn from(state: NodeState) -> Self {
        match state {
            NodeState::Initializing => Self::Initializing,
            NodeState::DiscoverLeader => Self::DiscoverLeader,
            NodeState::Unknown => Self::Unknown,
            NodeState::PreReplica => Self::PreReplica,
            NodeState::CatchingUp => Self::CatchingUp,
            NodeState::Clone => Self::Clone,
            NodeState::Follower => Self::Follower,
            NodeState::PreLeader => Self::PreLeader,
            NodeState::Leader => Self::Leader,
            NodeState::Manager => Self::Manager,
            NodeState::ShuttingDown => Self::ShuttingDown,
            NodeState::Shutdown => Self::Shutdown,
            NodeState::ReadOnlyLeaderless => Self::ReadOnlyLeaderless,
            NodeState::PreReadOnlyReplica => Self::PreReadOnlyReplica,
            NodeState::ReadOnlyReplica => Self::ReadOnlyReplica,
            NodeState::ResigningLeader => Self::ResigningLeader,
        }
    }
}

/// Which kind of node the client would rather talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodePreference {
    /// Prefer the leader, then followers, then read-only replicas.
    #[default]
    Leader,
    /// Prefer followers, then the leader, then read-only replicas.
    Follower,
    /// Prefer read-only replicas, then the leader, then followers.
    ReadOnlyReplica,
    /// No ordering; only the connectability filter applies.
    Random,
}

impl fmt::Display for NodePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
            Self::ReadOnlyReplica => write!(f, "readonlyreplica"),
            Self::Random => write!(f, "random"),
        }
    }
}

impl FromStr for NodePreference {
    type Err = SdkError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "leader" => Ok(Self::Leader),
            "follower" => Ok(Self::Follower),
            "readonlyreplica" | "read_only_replica" => Ok(Self::ReadOnlyReplica),
            "random" => Ok(Self::Random),
            other => ConfigSnafu { message: format!("unknown node preference '{other}'") }.fail(),
        }
    }
}

/// One member of the gossip membership table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    /// Opaque member identifier.
    pub node_id: String,
    /// Address clients use to reach the member.
    pub endpoint: EndPoint,
    /// Replication role at the time of the gossip snapshot.
    pub state: NodeState,
    /// Whether the reporting node considers the member alive.
    pub is_alive: bool,
}

impl ClusterNode {
    /// Creates a node record.
    #[must_use]
    pub fn new(node_id: impl Into<String>, endpoint: EndPoint, state: NodeState, is_alive: bool) -> Self {
        Self { node_id: node_id.into(), endpoint, state, is_alive }
    }

    /// Converts a gossip member entry.
    ///
    /// Returns `None` for members without a usable address, since a client
    /// could never connect to them.
    pub(crate) fn from_proto(member: &proto::MemberInfo) -> Option<Self> {
        let endpoint = match member.http_end_point.as_ref().map(EndPoint::from_proto) {
            Some(Ok(endpoint)) => endpoint,
            Some(Err(e)) => {
                tracing::debug!(node_id = %member.instance_id, error = %e, "Ignoring member with invalid address");
                return None;
            },
            None => return None,
        };

        Some(Self {
            node_id: member.instance_id.clone(),
            endpoint,
            state: NodeState::from_wire(member.state),
            is_alive: member.is_alive,
        })
    }
}
