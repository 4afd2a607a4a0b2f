//! Preference-based node selection.
//!
//! Filters a gossip snapshot down to connectable members and orders them by
//! a per-preference priority table. Lower priority values win; states not
//! listed for a preference sort last. The sort is stable, so members with
//! equal priority keep the order in which gossip reported them.

use rand::seq::SliceRandom;

use super::{ClusterNode, NodePreference, NodeState};

/// Priority assigned to states a preference does not list.
const LOWEST_PRIORITY: u8 = u8::MAX;

/// Returns the priority of `state` under `preference`.
fn priority(preference: NodePreference, state: NodeState) -> u8 {
    use NodeState::{Follower, Leader, PreReadOnlyReplica, ReadOnlyLeaderless, ReadOnlyReplica};

    let table: &[NodeState] = match preference {
        NodePreference::Leader => {
            &[Leader, Follower, ReadOnlyReplica, PreReadOnlyReplica, ReadOnlyLeaderless]
        },
        NodePreference::Follower => {
            &[Follower, Leader, ReadOnlyReplica, PreReadOnlyReplica, ReadOnlyLeaderless]
        },
        NodePreference::ReadOnlyReplica => {
            &[ReadOnlyReplica, PreReadOnlyReplica, ReadOnlyLeaderless, Leader, Follower]
        },
        NodePreference::Random => &[],
    };

    table
        .iter()
        .position(|s| *s == state)
        .and_then(|p| u8::try_from(p).ok())
        .unwrap_or(LOWEST_PRIORITY)
}

/// Filters `nodes` to alive, connectable members and orders them by `preference`.
///
/// Pure and deterministic: the same input always yields the same output.
#[must_use]
pub fn select_nodes(nodes: &[ClusterNode], preference: NodePreference) -> Vec<ClusterNode> {
    let mut candidates: Vec<ClusterNode> =
        nodes.iter().filter(|n| n.is_alive && n.state.is_connectable()).cloned().collect();
    candidates.sort_by_key(|n| priority(preference, n.state));
    candidates
}

/// Returns the preferred node, if any member is connectable.
#[must_use]
pub fn select_node(nodes: &[ClusterNode], preference: NodePreference) -> Option<ClusterNode> {
    select_nodes(nodes, preference).into_iter().next()
}

/// Node selector bound to a preference.
///
/// With `randomize_ties` enabled the candidates are shuffled before the
/// stable sort, so clients with the same preference spread across members of
/// equal priority (for example several followers) instead of all picking the
/// first one gossip lists.
///
/// # Example
///
/// ```no_run
/// use evdb_client::{ClusterNode, EndPoint, NodePreference, NodeSelector, NodeState};
///
/// let selector = NodeSelector::new(NodePreference::Leader);
/// let nodes = vec![
///     ClusterNode::new("a", EndPoint::new("10.0.0.1", 2113), NodeState::Follower, true),
///     ClusterNode::new("b", EndPoint::new("10.0.0.2", 2113), NodeState::Leader, true),
/// ];
/// let chosen = selector.select(&nodes).unwrap();
/// assert_eq!(chosen.node_id, "b");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSelector {
    preference: NodePreference,
    randomize_ties: bool,
}

impl NodeSelector {
    /// Creates a deterministic selector for `preference`.
    #[must_use]
    pub fn new(preference: NodePreference) -> Self {
        Self { preference, randomize_ties: false }
    }

    /// Shuffles equal-priority candidates when enabled.
    #[must_use]
    pub fn with_randomized_ties(mut self, enabled: bool) -> Self {
        self.randomize_ties = enabled;
        self
    }

    /// Returns the configured preference.
    #[must_use]
    pub fn preference(&self) -> NodePreference {
        self.preference
    }

    /// Returns all connectable nodes, most preferred first.
    #[must_use]
    pub fn candidates(&self, nodes: &[ClusterNode]) -> Vec<ClusterNode> {
        if !self.randomize_ties {
            return select_nodes(nodes, self.preference);
        }

        let mut shuffled = nodes.to_vec();
        shuffled.shuffle(&mut rand::rng());
        select_nodes(&shuffled, self.preference)
    }

    /// Returns the most preferred connectable node.
    #[must_use]
    pub fn select(&self, nodes: &[ClusterNode]) -> Option<ClusterNode> {
        self.candidates(nodes).into_iter().next()
    }
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod proptest_tests {
    use proptest::prelude::*;

    use super::*;
    use crate::endpoint::EndPoint;

    fn arb_state() -> impl Strategy<Value = NodeState> {
        prop::sample::select(NodeState::ALL.to_vec())
    }

    fn arb_preference() -> impl Strategy<Value = NodePreference> {
        prop::sample::select(vec![
            NodePreference::Leader,
            NodePreference::Follower,
            NodePreference::ReadOnlyReplica,
            NodePreference::Random,
        ])
    }

    fn arb_nodes() -> impl Strategy<Value = Vec<ClusterNode>> {
        prop::collection::vec((arb_state(), any::<bool>()), 0..24).prop_map(|specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (state, alive))| {
                    ClusterNode::new(format!("n{i}"), EndPoint::new(format!("n{i}"), 2113), state, alive)
                })
                .collect()
        })
    }

    proptest! {
        /// Property: no disallowed or dead node is ever selected
        #[test]
        fn prop_selection_only_returns_connectable_alive_nodes(
            nodes in arb_nodes(),
            preference in arb_preference(),
        ) {
            for n in select_nodes(&nodes, preference) {
                prop_assert!(n.is_alive);
                prop_assert!(n.state.is_connectable());
            }
        }

        /// Property: priorities are non-decreasing along the output
        #[test]
        fn prop_selection_is_ordered_by_priority(
            nodes in arb_nodes(),
            preference in arb_preference(),
        ) {
            let ordered = select_nodes(&nodes, preference);
            for pair in ordered.windows(2) {
                prop_assert!(priority(preference, pair[0].state) <= priority(preference, pair[1].state));
            }
        }

        /// Property: selection is deterministic and keeps every eligible node
        #[test]
        fn prop_selection_is_deterministic(
            nodes in arb_nodes(),
            preference in arb_preference(),
        ) {
            let first = select_nodes(&nodes, preference);
            let second = select_nodes(&nodes, preference);
            prop_assert_eq!(&first, &second);

            let eligible = nodes.iter().filter(|n| n.is_alive && n.state.is_connectable()).count();
            prop_assert_eq!(first.len(), eligible);
        }
    }
}
