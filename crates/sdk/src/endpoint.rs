//! Network endpoints of cluster members.

use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

use evdb_proto::proto;
use snafu::ensure;

use crate::error::{InvalidEndpointSnafu, Result, SdkError};

/// A `(host, port)` pair identifying one cluster node.
///
/// Hosts compare case-insensitively, so `NODE-1:2113` and `node-1:2113` are the
/// same endpoint (and share one cached connection).
#[derive(Debug, Clone)]
pub struct EndPoint {
    host: String,
    port: u16,
}

impl EndPoint {
    /// Creates an endpoint from a host name or IP literal and a port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Returns the host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the URI used to open a gRPC channel to this endpoint.
    #[must_use]
    pub fn uri(&self, tls: bool) -> String {
        let scheme = if tls { "https" } else { "http" };
        format!("{scheme}://{self}")
    }

    /// Converts a gossip member address, rejecting hosts that are empty or ports
    /// outside the `u16` range.
    pub(crate) fn from_proto(endpoint: &proto::EndPoint) -> Result<Self> {
        let value = format!("{}:{}", endpoint.address, endpoint.port);
        ensure!(
            !endpoint.address.is_empty(),
            InvalidEndpointSnafu { value: value.clone(), message: "empty host" }
        );
        let port = u16::try_from(endpoint.port).map_err(|_| {
            InvalidEndpointSnafu { value: value.clone(), message: "port out of range" }.build()
        })?;
        Ok(Self::new(endpoint.address.clone(), port))
    }
}

impl PartialEq for EndPoint {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl Eq for EndPoint {}

impl Hash for EndPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.host.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        state.write_u16(self.port);
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for EndPoint {
    type Err = SdkError;

    /// Parses `host:port`, `[v6]:port`, or an `http(s)://host:port` URL.
    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let authority = trimmed
            .strip_prefix("http://")
            .or_else(|| trimmed.strip_prefix("https://"))
            .unwrap_or(trimmed)
            .trim_end_matches('/');

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                InvalidEndpointSnafu { value, message: "unterminated IPv6 literal" }.build()
            })?;
            let port = tail.strip_prefix(':').ok_or_else(|| {
                InvalidEndpointSnafu { value, message: "missing port" }.build()
            })?;
            (host, port)
        } else {
            authority.rsplit_once(':').ok_or_else(|| {
                InvalidEndpointSnafu { value, message: "missing port" }.build()
            })?
        };

        ensure!(!host.is_empty(), InvalidEndpointSnafu { value, message: "empty host" });
        ensure!(
            !host.contains(|c| matches!(c, '/' | '?' | '#')),
            InvalidEndpointSnafu { value, message: "unexpected path component" }
        );

        let port = port.parse::<u16>().map_err(|e| {
            InvalidEndpointSnafu { value, message: format!("invalid port: {e}") }.build()
        })?;

        Ok(Self::new(host, port))
    }
}

impl TryFrom<&str> for EndPoint {
    type Error = SdkError;

    fn try_from(value: &str) -> Result<Self> {
        value.parse()
    }
}
