//! Upstream proxy authentication.
//!
//! The intercepting proxy reaches the network through an optional corporate
//! proxy. When that proxy answers a CONNECT with `407`, an [`AuthSession`]
//! computes the `Proxy-Authorization` value for the retry according to the
//! configured [`AuthMechanism`].

pub mod basic;
pub mod challenge;
pub mod error;
pub mod mechanism;
pub mod negotiate;
pub mod session;

pub use basic::BasicCredentials;
pub use challenge::Challenge;
pub use error::AuthError;
pub use mechanism::AuthMechanism;
pub use negotiate::{NegotiateContext, NegotiateProvider, UnavailableProvider, default_provider};
pub use session::{AuthSession, MAX_AUTH_ROUNDS, UpstreamAuthenticator};
