//! Error types for upstream proxy authentication.

use thiserror::Error;

/// Errors raised while answering an upstream proxy's `407` challenge.
///
/// All of these are per-tunnel failures: the session that produced them is
/// discarded and the client connection is failed, the proxy keeps running.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Authentication is disabled but the upstream proxy demanded it.
    #[error("Upstream proxy requires authentication but authentication is disabled")]
    NotPermitted,

    /// The round limit was reached without the proxy accepting the credentials.
    #[error("Upstream proxy authentication did not complete within {rounds} rounds")]
    RoundsExhausted {
        /// Number of responses that were sent.
        rounds: usize,
    },

    /// Every eligible scheme was tried and rejected.
    #[error("Upstream proxy rejected all available credentials (offered: {offered})")]
    Rejected {
        /// Schemes the proxy offered in its last challenge.
        offered: String,
    },

    /// The proxy did not offer a scheme we can use.
    #[error("Upstream proxy offered no supported authentication scheme (offered: {offered})")]
    NoSupportedScheme {
        /// Schemes the proxy offered.
        offered: String,
    },

    /// The Negotiate mechanism is not available in this build or environment.
    #[error("Negotiate authentication unavailable: {0}")]
    MechanismUnavailable(String),

    /// The security context failed to produce or accept a token.
    #[error("Negotiate token exchange failed: {0}")]
    Negotiate(String),

    /// A challenge token could not be decoded.
    #[error("Malformed authentication challenge: {0}")]
    MalformedChallenge(String),

    /// The computed credentials cannot be placed in a header.
    #[error("Invalid Proxy-Authorization value")]
    InvalidHeader(#[from] hyper::header::InvalidHeaderValue),
}
