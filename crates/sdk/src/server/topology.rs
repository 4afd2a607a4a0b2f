//! Single-endpoint membership queries.

use std::{fmt, time::Duration};

use evdb_proto::proto::{Empty, gossip_client::GossipClient};

use tonic::{Code, Status};

use super::ClusterNode;
use crate::{
    connection::ConnectionHandle,
    error::{Result, SdkError, TimeoutSnafu},
};

/// Asks one cluster node for the member table.
///
/// Implementations return every member the node reports (itself included),
/// without filtering or ordering.
#[tonic::async_trait]
pub trait TopologyClient: Send + Sync + fmt::Debug {
    /// Issues one membership request on `handle`, bounded by `deadline`.
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Timeout` when `deadline` passes, otherwise a
    /// transport or RPC error when the node cannot answer.
    async fn get_topology(&self, handle: &ConnectionHandle, deadline: Duration) -> Result<Vec<ClusterNode>>;
}

/// [`TopologyClient`] speaking `evdb.v1.Gossip/Read`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcTopologyClient;

#[tonic::async_trait]
impl TopologyClient for GrpcTopologyClient {
    async fn get_topology(&self, handle: &ConnectionHandle, deadline: Duration) -> Result<Vec<ClusterNode>> {
        let mut client = GossipClient::new(handle.channel());
        let mut request = tonic::Request::new(Empty {});
        request.set_timeout(deadline);

        let response = match tokio::time::timeout(deadline, client.read(request)).await {
            Ok(Ok(response)) => response.into_inner(),
            Ok(Err(status)) => return Err(status_error(status, deadline)),
            Err(_elapsed) => return TimeoutSnafu { duration_ms: deadline.as_millis() as u64 }.fail(),
        };
        let reported = response.members.len();
        let members: Vec<ClusterNode> =
            response.members.iter().filter_map(ClusterNode::from_proto).collect();

        tracing::trace!(
            endpoint = %handle.endpoint(),
            reported = reported,
            usable = members.len(),
            "Gossip read completed"
        );
        Ok(members)
    }
}

fn status_error(status: Status, deadline: Duration) -> SdkError {
    if status.code() == Code::DeadlineExceeded {
        return TimeoutSnafu { duration_ms: deadline.as_millis() as u64 }.build();
    }
    status.into()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use tonic::transport::Endpoint;

    use super::*;
    use crate::{
        endpoint::EndPoint,
        mock::{MockClusterNode, member_info},
        server::NodeState,
    };

    fn handle_for(endpoint: &EndPoint) -> ConnectionHandle {
        let channel = Endpoint::from_shared(endpoint.uri(false)).unwrap().connect_lazy();
        ConnectionHandle::new(endpoint.clone(), channel, false)
    }

    #[tokio::test]
    async fn test_reads_every_reported_member() {
        let node = MockClusterNode::start().await.unwrap();
        let peer = EndPoint::new("127.0.0.1", 7);
        node.set_members(vec![
            node.member(NodeState::Leader),
            member_info(&peer, NodeState::Manager, false),
        ]);

        let members = GrpcTopologyClient
            .get_topology(&handle_for(node.endpoint()), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(members.len(), 2);
        assert_eq!(&members[0].endpoint, node.endpoint());
        assert_eq!(members[1].state, NodeState::Manager);
        assert!(!members[1].is_alive);
    }

    #[tokio::test]
    async fn test_rpc_failure_is_surfaced() {
        let node = MockClusterNode::start().await.unwrap();
        node.inject_unavailable(1);

        let err = GrpcTopologyClient
            .get_topology(&handle_for(node.endpoint()), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Rpc { code: Code::Unavailable, .. }));
    }

    #[test]
    fn test_deadline_exceeded_maps_to_timeout() {
        let err = status_error(Status::deadline_exceeded("too slow"), Duration::from_millis(250));
        assert!(matches!(err, SdkError::Timeout { duration_ms: 250 }));

        let err = status_error(Status::unavailable("down"), Duration::from_millis(250));
        assert_eq!(err.code(), Some(Code::Unavailable));
    }

    #[tokio::test]
    async fn test_deadline_bounds_slow_node() {
        let node = MockClusterNode::start().await.unwrap();
        node.inject_delay(2_000);

        let started = std::time::Instant::now();
        let result = GrpcTopologyClient
            .get_topology(&handle_for(node.endpoint()), Duration::from_millis(100))
            .await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
