//! RPC failure classification and leader-change detection.
//!
//! Every [`ConnectionInfo`](crate::ConnectionInfo) carries a [`CallInvoker`]
//! whose detector watches call outcomes. A "not leader" rejection resets the
//! provider towards the hinted leader; an `UNAVAILABLE` status resets it
//! towards a fresh discovery. The failed call itself is never retried: the
//! original [`Status`] is returned unchanged and only later calls see the new
//! connection.
//!
//! The server signals a leader change through trailers:
//!
//! | Key | Value |
//! |-----|-------|
//! | `exception` | `not-leader` |
//! | `leader-endpoint-host` (or `leader-host`) | leader host |
//! | `leader-endpoint-port` (or `leader-port`) | leader port |

use std::{fmt, future::Future, sync::Weak};

use futures::Stream;
use tonic::{Code, Response, Status, metadata::MetadataMap, transport::Channel};
use tracing::{debug, info};

use crate::{
    endpoint::EndPoint,
    provider::{ConnectionProvider, ReconnectionTrigger},
    streaming::DetectingStream,
};

/// Trailer key naming the server-side exception.
pub const EXCEPTION_KEY: &str = "exception";

/// `exception` value sent by a node that is not the leader.
pub const NOT_LEADER: &str = "not-leader";

const LEADER_HOST_KEYS: [&str; 2] = ["leader-endpoint-host", "leader-host"];
const LEADER_PORT_KEYS: [&str; 2] = ["leader-endpoint-port", "leader-port"];

/// How a failed call affects connectivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// The node rejected the call and named the current leader.
    NotLeader(EndPoint),
    /// The node is unreachable, or claimed not to be leader without a usable hint.
    Unavailable,
    /// Any other failure; connectivity is left alone.
    Other,
}

/// Classifies a failed call.
#[must_use]
pub fn classify(status: &Status) -> FailureClass {
    let metadata = status.metadata();
    if header(metadata, EXCEPTION_KEY).is_some_and(|v| v.trim().eq_ignore_ascii_case(NOT_LEADER)) {
        return match leader_hint(metadata) {
            Some(leader) => FailureClass::NotLeader(leader),
            None => FailureClass::Unavailable,
        };
    }

    if status.code() == Code::Unavailable { FailureClass::Unavailable } else { FailureClass::Other }
}

fn header<'a>(metadata: &'a MetadataMap, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(|value| value.to_str().ok())
}

fn first_header<'a>(metadata: &'a MetadataMap, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| header(metadata, key))
}

fn leader_hint(metadata: &MetadataMap) -> Option<EndPoint> {
    let host = first_header(metadata, &LEADER_HOST_KEYS)?.trim();
    let port = first_header(metadata, &LEADER_PORT_KEYS)?.trim().parse::<u16>().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some(EndPoint::new(host, port))
}

/// Watches call outcomes of one connection generation.
///
/// Holds the provider weakly: a detector outliving its client does nothing.
/// Signals from a generation that was already replaced are ignored, so a
/// burst of failures on one connection causes a single reset.
#[derive(Clone)]
pub struct LeaderChangeDetector {
    provider: Weak<ConnectionProvider>,
    generation: u64,
}

impl LeaderChangeDetector {
    pub(crate) fn new(provider: Weak<ConnectionProvider>, generation: u64) -> Self {
        Self { provider, generation }
    }

    /// Returns the connection generation this detector reports for.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Classifies `status` without acting on it. Same as [`classify`].
    #[must_use]
    pub fn classify(status: &Status) -> FailureClass {
        classify(status)
    }

    /// Classifies `status` and requests a reset when it signals a topology change.
    ///
    /// Never blocks and never waits for the new connection.
    pub fn observe(&self, status: &Status) -> FailureClass {
        let class = classify(status);
        let trigger = match &class {
            FailureClass::NotLeader(leader) => ReconnectionTrigger::NewLeader(leader.clone()),
            FailureClass::Unavailable => ReconnectionTrigger::Rediscover,
            FailureClass::Other => return class,
        };

        match self.provider.upgrade() {
            Some(provider) => {
                if provider.reset_from(self.generation, trigger.clone()) {
                    info!(
                        generation = self.generation,
                        trigger = %trigger,
                        code = ?status.code(),
                        "Call failure triggered reconnection"
                    );
                }
            },
            None => debug!(generation = self.generation, "Connection provider dropped, ignoring call failure"),
        }
        class
    }

    /// Awaits a unary call (or the response of a client-streaming call),
    /// observing its failure.
    ///
    /// # Errors
    ///
    /// Returns the call's own [`Status`] unchanged.
    pub async fn unary<T, F>(&self, call: F) -> Result<T, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        let result = call.await;
        if let Err(status) = &result {
            self.observe(status);
        }
        result
    }

    /// Awaits the opening of a server-streaming call and wraps the stream so
    /// that its first failed item is observed.
    ///
    /// # Errors
    ///
    /// Returns the call's own [`Status`] unchanged.
    pub async fn server_streaming<S, T, F>(
        &self,
        call: F,
    ) -> Result<Response<DetectingStream<S>>, Status>
    where
        F: Future<Output = Result<Response<S>, Status>>,
        S: Stream<Item = Result<T, Status>> + Unpin,
    {
        match call.await {
            Ok(response) => Ok(response.map(|stream| DetectingStream::new(stream, self.clone()))),
            Err(status) => {
                self.observe(&status);
                Err(status)
            },
        }
    }
}

impl fmt::Debug for LeaderChangeDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderChangeDetector")
            .field("generation", &self.generation)
            .field("attached", &(self.provider.strong_count() > 0))
            .finish()
    }
}

/// Channel plus detector for issuing application RPCs.
///
/// Build generated clients on [`channel`](Self::channel) and route the calls
/// through the invoker:
///
/// ```no_run
/// # use evdb_client::{ClusterClient, Result};
/// # use evdb_client::proto::{Empty, gossip_client::GossipClient};
/// # async fn example(client: &ClusterClient) -> Result<()> {
/// let info = client.connection_info().await?;
/// let invoker = info.invoker();
/// let mut gossip = GossipClient::new(invoker.channel());
/// let members = invoker.unary(gossip.read(Empty {})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CallInvoker {
    channel: Channel,
    detector: LeaderChangeDetector,
}

impl CallInvoker {
    pub(crate) fn new(channel: Channel, detector: LeaderChangeDetector) -> Self {
        Self { channel, detector }
    }

    /// Returns a clone of the connection's channel.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Returns the detector bound to this connection.
    #[must_use]
    pub fn detector(&self) -> &LeaderChangeDetector {
        &self.detector
    }

    /// Runs a unary call.
    ///
    /// # Errors
    ///
    /// Returns the call's own [`Status`] unchanged.
    pub async fn unary<T, F>(&self, call: F) -> Result<Response<T>, Status>
    where
        F: Future<Output = Result<Response<T>, Status>>,
    {
        self.detector.unary(call).await
    }

    /// Runs a client-streaming call; only its final response can fail.
    ///
    /// # Errors
    ///
    /// Returns the call's own [`Status`] unchanged.
    pub async fn client_streaming<T, F>(&self, call: F) -> Result<Response<T>, Status>
    where
        F: Future<Output = Result<Response<T>, Status>>,
    {
        self.detector.unary(call).await
    }

    /// Runs a server-streaming call.
    ///
    /// # Errors
    ///
    /// Returns the call's own [`Status`] unchanged.
    pub async fn server_streaming<S, T, F>(
        &self,
        call: F,
    ) -> Result<Response<DetectingStream<S>>, Status>
    where
        F: Future<Output = Result<Response<S>, Status>>,
        S: Stream<Item = Result<T, Status>> + Unpin,
    {
        self.detector.server_streaming(call).await
    }
}
