//! Intercepting proxy for the wrapped tool's outbound traffic.
//!
//! This module provides an embedded MITM proxy with:
//! - HTTP CONNECT handling with TLS termination per destination host
//! - Leaf certificates issued on demand by the [`crate::ca`] authority
//! - Plain HTTP forwarding for absolute-form requests
//! - Optional chaining through an authenticated upstream (corporate) proxy
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  CONNECT host:443   ┌──────────────────┐
//! │ wrapped tool │────────────────────▶│ 127.0.0.1:<port> │
//! └──────────────┘   TLS (leaf cert)   └────────┬─────────┘
//!                                               │ direct, or CONNECT via
//!                                               ▼ upstream proxy (+407 auth)
//!                                       ┌──────────────┐
//!                                       │ destination  │
//!                                       └──────────────┘
//! ```

pub mod connect;
pub mod error;
pub mod server;
pub mod tls;
pub mod tunnel;
pub mod upstream;

// Re-export main types for convenient access
pub use error::{ProxyError, ProxyResult};
pub use server::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT, DEFAULT_SHUTDOWN_GRACE, InterceptingProxy,
    ProxyConfig,
};
pub use tls::{client_acceptor, destination_connector};
pub use tunnel::PipeStats;
pub use upstream::{DEFAULT_UPSTREAM_PORT, Dialer, UpstreamProxy};
