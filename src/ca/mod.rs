//! Root certificate authority for TLS interception.
//!
//! - [`authority`]: root lifecycle and per-host leaf issuance
//! - [`store`]: root files, metadata sidecar and locking in the cache directory
//! - [`bundle`]: per-run trust files for child processes

pub mod authority;
pub mod bundle;
pub mod error;
pub mod store;

pub use authority::{CertificateAuthority, LeafCertificate, RootOrigin};
pub use bundle::{HOST_CA_BUNDLES, find_host_ca_bundle, write_combined_bundle, write_root_anchor};
pub use error::CaError;
