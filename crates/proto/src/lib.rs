//! Protobuf types and gRPC stubs for the evdb cluster services.
//!
//! This crate provides the wire types the client needs to talk to a cluster
//! before any application RPC is issued:
//! - `evdb.v1.Gossip/Read` for membership discovery
//! - `evdb.v1.ServerFeatures/GetSupportedMethods` for capability negotiation
//!
//! The schema lives in `proto/evdb/v1/cluster.proto`. The Rust code under
//! `src/generated/` is checked in so that building the client never needs
//! `protoc`.

#![deny(unsafe_code)]
// gRPC services return tonic::Status (176 bytes) - standard practice for gRPC error handling
#![allow(clippy::result_large_err)]

/// Generated protobuf types and service traits.
pub mod proto {
    #![allow(clippy::all)]
    #![allow(missing_docs)]

    include!("generated/evdb.v1.rs");
}

pub use proto::member_info::VNodeState;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use prost::Message;

    use super::proto::{ClusterInfo, EndPoint, MemberInfo};
    use super::*;

    #[test]
    fn test_vnode_state_wire_values_follow_declaration_order() {
        assert_eq!(VNodeState::Initializing as i32, 0);
        assert_eq!(VNodeState::Leader as i32, 8);
        assert_eq!(VNodeState::ResigningLeader as i32, 15);
        assert_eq!(VNodeState::try_from(14).unwrap(), VNodeState::ReadOnlyReplica);
        assert!(VNodeState::try_from(16).is_err());
    }

    #[test]
    fn test_vnode_state_str_names() {
        assert_eq!(VNodeState::PreReadOnlyReplica.as_str_name(), "PRE_READ_ONLY_REPLICA");
        assert_eq!(VNodeState::from_str_name("CATCHING_UP"), Some(VNodeState::CatchingUp));
        assert_eq!(VNodeState::from_str_name("catching_up"), None);
    }

    #[test]
    fn test_cluster_info_decodes_member_table() {
        let info = ClusterInfo {
            members: vec![MemberInfo {
                instance_id: "node-a".to_owned(),
                time_stamp: 42,
                state: VNodeState::Follower as i32,
                is_alive: true,
                http_end_point: Some(EndPoint { address: "10.0.0.1".to_owned(), port: 2113 }),
            }],
        };

        let decoded = ClusterInfo::decode(info.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.members.len(), 1);
        assert_eq!(decoded.members[0].state(), VNodeState::Follower);
        assert_eq!(decoded.members[0].http_end_point.as_ref().unwrap().port, 2113);
    }
}
