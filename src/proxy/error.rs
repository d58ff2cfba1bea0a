//! Error types for proxy operations.
//!
//! Everything except [`ProxyError::Bind`] is scoped to one client
//! connection: it is logged, turned into an HTTP error for that client where
//! possible, and the listener keeps serving.

use crate::auth::AuthError;
use crate::ca::CaError;
use std::net::SocketAddr;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The loopback listener could not be bound.
    #[error("Failed to bind proxy listener on {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Invalid CONNECT request.
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// Invalid plain HTTP proxy request.
    #[error("Invalid proxy request: {0}")]
    InvalidRequest(String),

    /// TLS error during handshake or configuration.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Leaf certificate issuance failed.
    #[error("Certificate issuance failed: {0}")]
    Certificate(#[from] CaError),

    /// A connect or handshake did not finish in time.
    #[error("Timed out connecting to '{addr}'")]
    Timeout {
        /// Destination or proxy address.
        addr: String,
    },

    /// Failed to connect to the destination or the upstream proxy.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// The upstream proxy answered CONNECT with a non-success status.
    #[error("Upstream proxy refused CONNECT to '{target}' with status {status}")]
    UpstreamRefused {
        /// Requested destination.
        target: String,
        /// Status returned by the proxy.
        status: u16,
    },

    /// Authentication against the upstream proxy failed.
    #[error("Upstream proxy authentication failed: {0}")]
    UpstreamAuth(#[from] AuthError),

    /// The upstream proxy address cannot be used.
    #[error("Invalid upstream proxy '{value}': {reason}")]
    InvalidUpstream {
        /// Address as configured.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Upgrade to tunnel failed.
    #[error("HTTP upgrade failed: {0}")]
    UpgradeFailed(String),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Whether this is an ordinary peer disconnect rather than a fault.
    pub fn is_disconnect(&self) -> bool {
        let io_kind = match self {
            ProxyError::Io(e) => Some(e.kind()),
            _ => None,
        };
        matches!(
            io_kind,
            Some(
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            )
        ) || matches!(self, ProxyError::Http(e) if e.is_incomplete_message() || e.is_canceled())
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}
