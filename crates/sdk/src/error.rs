//! SDK error types with recovery context.
//!
//! Provides a two-tier error model:
//! - **Transport errors**: Connection failures, timeouts, gRPC status codes
//! - **Connectivity errors**: Exhausted discovery, disposal, cancellation
//!
//! Every error is `Clone` so that a single failed discovery or connection
//! attempt can be handed to all callers that were waiting on it.

use std::sync::Arc;

use snafu::{Location, Snafu};
use tonic::Code;

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;

/// SDK error types with context-rich error messages.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum SdkError {
    /// Failed to establish or use a connection.
    #[snafu(display("Connection error at {location}: {message}"))]
    Connection {
        /// Error description.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Transport-level error (HTTP/2, TLS, invalid URI).
    #[snafu(display("Transport error at {location}: {source}"))]
    Transport {
        /// Underlying transport error.
        #[snafu(source(from(tonic::transport::Error, Arc::new)))]
        source: Arc<tonic::transport::Error>,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// gRPC RPC error with status code.
    #[snafu(display("RPC error (code={code:?}): {message}"))]
    Rpc {
        /// gRPC status code.
        code: Code,
        /// Error message from server.
        message: String,
    },

    /// Operation timed out.
    #[snafu(display("Operation timed out after {duration_ms}ms"))]
    Timeout {
        /// Timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// The caller's cancellation token fired before the operation completed.
    #[snafu(display("Operation cancelled"))]
    Cancelled,

    /// The component was used after it was disposed.
    #[snafu(display("{component} has been disposed"))]
    Disposed {
        /// Name of the disposed component.
        component: &'static str,
    },

    /// No reachable cluster node could be found.
    #[snafu(display("Cluster unavailable: {message}"))]
    Unavailable {
        /// Summary of why discovery gave up.
        message: String,
    },

    /// Configuration validation error.
    #[snafu(display("Configuration error: {message}"))]
    Config {
        /// Error description.
        message: String,
    },

    /// An endpoint string could not be parsed.
    #[snafu(display("Invalid endpoint '{value}': {message}"))]
    InvalidEndpoint {
        /// The rejected input.
        value: String,
        /// Parse error description.
        message: String,
    },
}

impl SdkError {
    /// Returns true if the error is transient and the operation should be retried.
    ///
    /// Retryable errors:
    /// - `UNAVAILABLE`: Server temporarily unreachable
    /// - `DEADLINE_EXCEEDED`: Request timed out
    /// - `RESOURCE_EXHAUSTED`: Rate limited
    /// - `ABORTED`: Transaction conflict (retry may succeed)
    /// - Transport, connection and timeout errors
    /// - `Unavailable`: discovery may succeed once the cluster recovers
    ///
    /// Cancellation, disposal and configuration problems are never retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Unavailable { .. } => true,
            Self::Rpc { code, .. } => matches!(
                code,
                Code::Unavailable
                    | Code::DeadlineExceeded
                    | Code::ResourceExhausted
                    | Code::Aborted
            ),
            Self::Cancelled => false,
            Self::Disposed { .. } => false,
            Self::Config { .. } => false,
            Self::InvalidEndpoint { .. } => false,
        }
    }

    /// Returns true if the component that produced this error can no longer be used.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Disposed { .. } | Self::Config { .. } | Self::InvalidEndpoint { .. })
    }

    /// Returns the gRPC status code if this is an RPC error.
    #[must_use]
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<tonic::transport::Error> for SdkError {
    fn from(source: tonic::transport::Error) -> Self {
        Self::Transport { source: Arc::new(source), location: Location::default() }
    }
}

impl From<tonic::Status> for SdkError {
    fn from(status: tonic::Status) -> Self {
        Self::Rpc { code: status.code(), message: status.message().to_owned() }
    }
}
