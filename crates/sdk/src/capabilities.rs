//! Best-effort server feature negotiation.
//!
//! After a node is chosen the client may ask it which optional methods it
//! serves (`evdb.v1.ServerFeatures/GetSupportedMethods`). Older servers do not
//! implement the call; any failure other than cancellation leaves every
//! optional feature disabled.

use std::time::Duration;

use evdb_proto::proto::{Empty, SupportedMethods, server_features_client::ServerFeaturesClient};
use tokio_util::sync::CancellationToken;
use tonic::{Code, transport::Channel};
use tracing::{debug, warn};

use crate::error::{CancelledSnafu, Result};

/// Default deadline for the negotiation call.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Optional features a node advertised.
///
/// The default value means "nothing optional is supported".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    /// Server version string, if reported.
    pub version: Option<String>,
    /// Streams service accepts batch appends.
    pub supports_batch_append: bool,
    /// Persistent subscriptions can target the `$all` stream.
    pub supports_persistent_subscriptions_to_all: bool,
    /// Parked messages can be replayed.
    pub supports_persistent_subscriptions_manage: bool,
    /// Subscription details can be queried.
    pub supports_persistent_subscriptions_get_info: bool,
    /// The subscription subsystem can be restarted.
    pub supports_persistent_subscriptions_restart_subsystem: bool,
    /// Subscriptions can be listed.
    pub supports_persistent_subscriptions_list: bool,
}

impl ServerCapabilities {
    /// Builds capabilities from a supported-methods reply.
    ///
    /// Service and method names compare case-insensitively; only the last
    /// dot-separated segment of the service name is considered.
    #[must_use]
    pub fn from_supported_methods(reply: &SupportedMethods) -> Self {
        let version = Some(reply.server_version.trim()).filter(|v| !v.is_empty()).map(str::to_owned);
        let mut capabilities = Self { version, ..Self::default() };

        for method in &reply.methods {
            let service = method.service_name.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
            let name = method.method_name.to_ascii_lowercase();

            match (service.as_str(), name.as_str()) {
                ("streams", "batchappend") => capabilities.supports_batch_append = true,
                ("persistentsubscriptions", "create") => {
                    if method.features.iter().any(|f| f.eq_ignore_ascii_case("all")) {
                        capabilities.supports_persistent_subscriptions_to_all = true;
                    }
                },
                ("persistentsubscriptions", "getinfo") => {
                    capabilities.supports_persistent_subscriptions_get_info = true;
                },
                ("persistentsubscriptions", "replayparked") => {
                    capabilities.supports_persistent_subscriptions_manage = true;
                },
                ("persistentsubscriptions", "restartsubsystem") => {
                    capabilities.supports_persistent_subscriptions_restart_subsystem = true;
                },
                ("persistentsubscriptions", "list") => {
                    capabilities.supports_persistent_subscriptions_list = true;
                },
                _ => {},
            }
        }
        capabilities
    }
}

/// Asks the node behind `channel` for its capabilities.
///
/// # Errors
///
/// Returns `SdkError::Cancelled` if `token` fires first. Every other failure
/// yields the default capabilities.
pub async fn negotiate(
    channel: Channel,
    timeout: Duration,
    token: &CancellationToken,
) -> Result<ServerCapabilities> {
    let mut client = ServerFeaturesClient::new(channel);
    let mut request = tonic::Request::new(Empty {});
    request.set_timeout(timeout);

    let call = tokio::time::timeout(timeout, client.get_supported_methods(request));
    let result = tokio::select! {
        biased;
        () = token.cancelled() => return CancelledSnafu.fail(),
        result = call => result,
    };

    let capabilities = match result {
        Ok(Ok(response)) => {
            let capabilities = ServerCapabilities::from_supported_methods(response.get_ref());
            debug!(
                version = ?capabilities.version,
                methods = response.get_ref().methods.len(),
                "Negotiated server capabilities"
            );
            capabilities
        },
        Ok(Err(status)) if status.code() == Code::Unimplemented => {
            debug!("Server does not support capability negotiation");
            ServerCapabilities::default()
        },
        Ok(Err(status)) => {
            warn!(code = ?status.code(), message = status.message(), "Capability negotiation failed, using defaults");
            ServerCapabilities::default()
        },
        Err(_elapsed) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Capability negotiation timed out, using defaults");
            ServerCapabilities::default()
        },
    };
    Ok(capabilities)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use evdb_proto::proto::SupportedMethod;
    use tonic::transport::Endpoint;

    use super::*;
    use crate::error::SdkError;

    fn method(service: &str, name: &str, features: &[&str]) -> SupportedMethod {
        SupportedMethod {
            method_name: name.to_owned(),
            service_name: service.to_owned(),
            features: features.iter().map(|f| (*f).to_owned()).collect(),
        }
    }

    #[test]
    fn test_full_feature_set() {
        let reply = SupportedMethods {
            server_version: "24.10.0".to_owned(),
            methods: vec![
                method("evdb.v1.Streams", "BatchAppend", &[]),
                method("evdb.v1.PersistentSubscriptions", "Create", &["stream", "all"]),
                method("evdb.v1.PersistentSubscriptions", "GetInfo", &[]),
                method("evdb.v1.PersistentSubscriptions", "ReplayParked", &[]),
                method("evdb.v1.PersistentSubscriptions", "RestartSubsystem", &[]),
                method("evdb.v1.PersistentSubscriptions", "List", &[]),
            ],
        };

        let caps = ServerCapabilities::from_supported_methods(&reply);
        assert_eq!(caps, ServerCapabilities {
            version: Some("24.10.0".to_owned()),
            supports_batch_append: true,
            supports_persistent_subscriptions_to_all: true,
            supports_persistent_subscriptions_manage: true,
            supports_persistent_subscriptions_get_info: true,
            supports_persistent_subscriptions_restart_subsystem: true,
            supports_persistent_subscriptions_list: true,
        });
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let reply = SupportedMethods {
            server_version: String::new(),
            methods: vec![
                method("event_store.client.streams.streams", "batchappend", &[]),
                method("PERSISTENTSUBSCRIPTIONS", "CREATE", &["ALL"]),
            ],
        };

        let caps = ServerCapabilities::from_supported_methods(&reply);
        assert!(caps.supports_batch_append);
        assert!(caps.supports_persistent_subscriptions_to_all);
        assert!(caps.version.is_none());
    }

    #[test]
    fn test_create_without_all_feature() {
        let reply = SupportedMethods {
            server_version: "23.10".to_owned(),
            methods: vec![
                method("evdb.v1.PersistentSubscriptions", "Create", &["stream"]),
                method("evdb.v1.Gossip", "Read", &[]),
                method("evdb.v1.Streams", "Append", &[]),
            ],
        };

        let caps = ServerCapabilities::from_supported_methods(&reply);
        assert_eq!(caps, ServerCapabilities { version: Some("23.10".to_owned()), ..Default::default() });
    }

    #[tokio::test]
    async fn test_unreachable_node_yields_defaults() {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let caps = negotiate(channel, Duration::from_secs(2), &CancellationToken::new()).await.unwrap();
        assert_eq!(caps, ServerCapabilities::default());
    }

    #[tokio::test]
    async fn test_cancelled_negotiation_is_an_error() {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let token = CancellationToken::new();
        token.cancel();

        let err = negotiate(channel, Duration::from_secs(2), &token).await.unwrap_err();
        assert!(matches!(err, SdkError::Cancelled));
    }
}
