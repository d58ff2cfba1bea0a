//! Error types for certificate authority operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors related to root and leaf certificate handling.
///
/// Persistence errors carry the path that failed so the orchestrator can
/// report which part of the cache directory is unusable.
#[derive(Debug, Error)]
pub enum CaError {
    /// The cache directory could not be created.
    #[error("Failed to create cache directory {path}: {source}")]
    CacheDir {
        /// Directory we tried to create.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a root certificate or key file.
    #[error("Failed to write {path}: {source}")]
    WriteFile {
        /// File that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to read a persisted root file.
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        /// File that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The lock guarding the persisted root could not be taken.
    #[error("Failed to lock {path}: {source}")]
    Lock {
        /// Lock file.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The persisted root bundle is unusable.
    #[error("Persisted root at {path} is invalid: {reason}")]
    InvalidRoot {
        /// Bundle file that failed validation.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// Failed to generate a key pair.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to generate the root certificate.
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    /// Failed to sign a leaf certificate.
    #[error("Failed to sign certificate for {host}: {message}")]
    Signing {
        /// Host the leaf was requested for.
        host: String,
        /// Error reported by the signer.
        message: String,
    },

    /// The hostname cannot be placed in a certificate.
    #[error("Invalid hostname for certificate: {0:?}")]
    InvalidHostname(String),

    /// The generated key could not be loaded into rustls.
    #[error("Failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_names_path() {
        let err = CaError::WriteFile {
            path: PathBuf::from("/cache/proxywrap-root-1.0.pem"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/cache/proxywrap-root-1.0.pem"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_invalid_hostname_display() {
        let err = CaError::InvalidHostname("bad host".to_string());
        assert!(err.to_string().contains("bad host"));
    }
}
