//! Error types for launching and supervising the wrapped tool.

use crate::ca::CaError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the child process lifecycle.
#[derive(Debug, Error)]
pub enum ChildError {
    /// The executable could not be found.
    #[error("Tool '{program}' not found: {reason}")]
    NotFound {
        /// Program as given on the command line.
        program: String,
        /// Why resolution failed.
        reason: String,
    },

    /// Failed to spawn the child process.
    #[error("Failed to launch '{}': {source}", program.display())]
    Spawn {
        /// Resolved executable path.
        program: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to wait for the child process.
    #[error("Failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),

    /// Failed to install signal handlers.
    #[error("Failed to install signal handler: {0}")]
    SignalSetup(#[source] std::io::Error),

    /// Failed to send a signal to the child.
    #[error("Failed to send signal to child: {0}")]
    Signal(#[source] nix::Error),

    /// Failed to prepare the per-run directory.
    #[error("Failed to create run directory: {0}")]
    RunDir(#[source] std::io::Error),

    /// Failed to write the trust bundle handed to the child.
    #[error("Failed to prepare trust bundle: {0}")]
    TrustBundle(#[from] CaError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = ChildError::NotFound {
            program: "no-such-tool".to_string(),
            reason: "cannot find binary path".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("no-such-tool"));
        assert!(msg.contains("cannot find binary path"));
    }

    #[test]
    fn test_spawn_display() {
        let err = ChildError::Spawn {
            program: PathBuf::from("/usr/bin/tool"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("/usr/bin/tool"));
    }
}
