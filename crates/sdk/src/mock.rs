//! Mock cluster node for SDK integration testing.
//!
//! This module provides a controllable in-process implementation of the
//! gossip and server-features services, so discovery and reconnection can be
//! tested without a real cluster.
//!
//! # Features
//!
//! - **Scripted membership**: Set the member table each node reports
//! - **Capability replies**: Advertise supported methods, or answer `UNIMPLEMENTED`
//! - **Failure injection**: Inject UNAVAILABLE errors, "not leader" rejections or delays
//! - **Request counting**: Track gossip calls for verification
//!
//! # Example
//!
//! ```no_run
//! use evdb_client::mock::MockClusterNode;
//! use evdb_client::{ClientConfig, ClusterClient, NodeState};
//!
//! #[tokio::test]
//! async fn test_discovery() {
//!     // Start a node on an ephemeral port that reports itself as leader
//!     let node = MockClusterNode::start().await.unwrap();
//!     node.set_members(vec![node.member(NodeState::Leader)]);
//!
//!     let config = ClientConfig::builder()
//!         .with_gossip_seed(node.endpoint().to_string())
//!         .build()
//!         .unwrap();
//!     let client = ClusterClient::new(config).await.unwrap();
//!
//!     let info = client.connection_info().await.unwrap();
//!     assert_eq!(info.endpoint(), node.endpoint());
//! }
//! ```

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use evdb_proto::proto::{
    self,
    gossip_server::{Gossip, GossipServer},
    server_features_server::{ServerFeatures, ServerFeaturesServer},
};
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tonic::{
    Request, Response, Status,
    metadata::{MetadataMap, MetadataValue},
    transport::Server,
};

use crate::{
    detector::{EXCEPTION_KEY, NOT_LEADER},
    endpoint::EndPoint,
    error::{ConnectionSnafu, Result},
    server::NodeState,
};

/// Shared state for the mock node.
#[derive(Debug, Default)]
struct MockState {
    /// Member table returned by `Gossip/Read`.
    members: RwLock<Vec<proto::MemberInfo>>,

    /// Reply to `GetSupportedMethods`; `None` answers UNIMPLEMENTED.
    supported_methods: RwLock<Option<proto::SupportedMethods>>,

    /// Number of UNAVAILABLE errors to inject for next requests.
    unavailable_count: AtomicUsize,

    /// Number of "not leader" rejections to inject for next gossip reads.
    not_leader_count: AtomicUsize,

    /// Leader named in injected "not leader" rejections.
    leader_hint: RwLock<Option<EndPoint>>,

    /// Delay to inject for each request (milliseconds).
    delay_ms: AtomicU64,

    /// Total gossip reads received.
    gossip_count: AtomicUsize,

    /// Total capability requests received.
    features_count: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
}

impl MockState {
    /// Applies configured delay and checks for injected errors.
    async fn check_injection(&self) -> std::result::Result<(), Status> {
        let delay_ms = self.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if take_one(&self.unavailable_count) {
            return Err(Status::unavailable("Injected error"));
        }
        Ok(())
    }

    fn not_leader_rejection(&self) -> Option<Status> {
        if !take_one(&self.not_leader_count) {
            return None;
        }
        let leader = self.leader_hint.read().clone()?;

        let mut metadata = MetadataMap::new();
        metadata.insert(EXCEPTION_KEY, MetadataValue::from_static(NOT_LEADER));
        if let Ok(host) = leader.host().parse() {
            metadata.insert("leader-endpoint-host", host);
        }
        metadata.insert("leader-endpoint-port", MetadataValue::from(u32::from(leader.port())));
        Some(Status::with_metadata(tonic::Code::NotFound, "Leader info available", metadata))
    }
}

/// Mock implementation of one cluster node.
///
/// Serves `evdb.v1.Gossip` and `evdb.v1.ServerFeatures` on an ephemeral
/// localhost port. Several nodes can be started to simulate a cluster; each
/// reports whatever member table it was given.
pub struct MockClusterNode {
    state: Arc<MockState>,
    endpoint: EndPoint,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockClusterNode {
    /// Starts a new mock node on an ephemeral port.
    ///
    /// The node reports an empty member table until [`set_members`](Self::set_members).
    ///
    /// # Errors
    ///
    /// Returns `SdkError::Connection` if binding to an ephemeral port fails.
    pub async fn start() -> Result<Self> {
        let state = Arc::new(MockState::default());

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ConnectionSnafu { message: format!("Failed to bind: {e}") }.build())?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ConnectionSnafu { message: format!("Failed to get local addr: {e}") }.build())?;

        let endpoint = EndPoint::new(local_addr.ip().to_string(), local_addr.port());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        let gossip = MockGossipService { state: state.clone() };
        let features = MockFeaturesService { state: state.clone() };
        tokio::spawn(async move {
            let result = Server::builder()
                .add_service(GossipServer::new(gossip))
                .add_service(ServerFeaturesServer::new(features))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_rx.await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!("Mock cluster node error: {}", e);
            }
        });

        Ok(Self { state, endpoint, shutdown_tx: Some(shutdown_tx) })
    }

    /// Returns the endpoint this node listens on.
    #[must_use]
    pub fn endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    /// Returns a member entry describing this node.
    #[must_use]
    pub fn member(&self, state: NodeState) -> proto::MemberInfo {
        member_info(&self.endpoint, state, true)
    }

    /// Sets the member table returned by gossip reads.
    pub fn set_members(&self, members: Vec<proto::MemberInfo>) {
        *self.state.members.write() = members;
    }

    /// Advertises `methods` from `GetSupportedMethods`.
    pub fn set_supported_methods(&self, methods: proto::SupportedMethods) {
        *self.state.supported_methods.write() = Some(methods);
    }

    /// Makes `GetSupportedMethods` answer UNIMPLEMENTED (the default).
    pub fn clear_supported_methods(&self) {
        *self.state.supported_methods.write() = None;
    }

    /// Injects UNAVAILABLE errors for the next N requests.
    ///
    /// Each request will decrement this counter and return UNAVAILABLE until it reaches 0.
    pub fn inject_unavailable(&self, count: usize) {
        self.state.unavailable_count.store(count, Ordering::SeqCst);
    }

    /// Rejects the next N gossip reads as "not leader", naming `leader`.
    pub fn inject_not_leader(&self, count: usize, leader: EndPoint) {
        *self.state.leader_hint.write() = Some(leader);
        self.state.not_leader_count.store(count, Ordering::SeqCst);
    }

    /// Injects a delay for all subsequent requests.
    ///
    /// Sets to 0 to disable delay.
    pub fn inject_delay(&self, millis: u64) {
        self.state.delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Returns the total number of gossip reads received.
    #[must_use]
    pub fn gossip_count(&self) -> usize {
        self.state.gossip_count.load(Ordering::SeqCst)
    }

    /// Returns the total number of capability requests received.
    #[must_use]
    pub fn features_count(&self) -> usize {
        self.state.features_count.load(Ordering::SeqCst)
    }

    /// Shuts down the node gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockClusterNode {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Builds a gossip member entry.
#[must_use]
pub fn member_info(endpoint: &EndPoint, state: NodeState, is_alive: bool) -> proto::MemberInfo {
    proto::MemberInfo {
        instance_id: format!("node-{endpoint}"),
        time_stamp: 0,
        state: proto::member_info::VNodeState::from(state) as i32,
        is_alive,
        http_end_point: Some(proto::EndPoint {
            address: endpoint.host().to_owned(),
            port: u32::from(endpoint.port()),
        }),
    }
}

// =============================================================================
// Mock Gossip Implementation
// =============================================================================

struct MockGossipService {
    state: Arc<MockState>,
}

#[tonic::async_trait]
impl Gossip for MockGossipService {
    async fn read(
        &self,
        _request: Request<proto::Empty>,
    ) -> std::result::Result<Response<proto::ClusterInfo>, Status> {
        self.state.gossip_count.fetch_add(1, Ordering::SeqCst);
        self.state.check_injection().await?;
        if let Some(rejection) = self.state.not_leader_rejection() {
            return Err(rejection);
        }

        let members = self.state.members.read().clone();
        Ok(Response::new(proto::ClusterInfo { members }))
    }
}

// =============================================================================
// Mock ServerFeatures Implementation
// =============================================================================

struct MockFeaturesService {
    state: Arc<MockState>,
}

#[tonic::async_trait]
impl ServerFeatures for MockFeaturesService {
    async fn get_supported_methods(
        &self,
        _request: Request<proto::Empty>,
    ) -> std::result::Result<Response<proto::SupportedMethods>, Status> {
        self.state.features_count.fetch_add(1, Ordering::SeqCst);
        self.state.check_injection().await?;

        match self.state.supported_methods.read().clone() {
            Some(methods) => Ok(Response::new(methods)),
            None => Err(Status::unimplemented("GetSupportedMethods is not supported")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use evdb_proto::proto::{Empty, gossip_client::GossipClient};

    use super::*;
    use crate::{
        detector::{FailureClass, classify},
        server::ClusterNode,
    };

    async fn gossip_client(node: &MockClusterNode) -> GossipClient<tonic::transport::Channel> {
        GossipClient::connect(node.endpoint().uri(false)).await.unwrap()
    }

    #[tokio::test]
    async fn test_gossip_returns_configured_members() {
        let node = MockClusterNode::start().await.unwrap();
        let other = EndPoint::new("127.0.0.1", 9);
        node.set_members(vec![node.member(NodeState::Leader), member_info(&other, NodeState::Follower, true)]);

        let mut client = gossip_client(&node).await;
        let reply = client.read(Empty {}).await.unwrap().into_inner();

        let members: Vec<_> = reply.members.iter().filter_map(ClusterNode::from_proto).collect();
        assert_eq!(members.len(), 2);
        assert_eq!(&members[0].endpoint, node.endpoint());
        assert_eq!(members[0].state, NodeState::Leader);
        assert_eq!(members[1].endpoint, other);
        assert_eq!(node.gossip_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_unavailable() {
        let node = MockClusterNode::start().await.unwrap();
        node.inject_unavailable(1);

        let mut client = gossip_client(&node).await;
        let err = client.read(Empty {}).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
        assert!(client.read(Empty {}).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_not_leader_carries_trailers() {
        let node = MockClusterNode::start().await.unwrap();
        node.inject_not_leader(1, EndPoint::new("127.0.0.1", 4113));

        let mut client = gossip_client(&node).await;
        let status = client.read(Empty {}).await.unwrap_err();
        assert_eq!(classify(&status), FailureClass::NotLeader(EndPoint::new("127.0.0.1", 4113)));
    }

    #[tokio::test]
    async fn test_features_unimplemented_by_default() {
        let node = MockClusterNode::start().await.unwrap();
        let channel = tonic::transport::Endpoint::from_shared(node.endpoint().uri(false))
            .unwrap()
            .connect()
            .await
            .unwrap();

        let mut client = proto::server_features_client::ServerFeaturesClient::new(channel);
        let err = client.get_supported_methods(Empty {}).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unimplemented);
        assert_eq!(node.features_count(), 1);
    }
}
