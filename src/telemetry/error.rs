//! Telemetry error types.

use thiserror::Error;

/// Audit sink failures. None of these ever affect the wrapped run.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The local syslog socket is unavailable.
    #[error("syslog unavailable: {0}")]
    SyslogConnection(String),

    /// An event could not be rendered as JSON.
    #[error("cannot encode audit event: {0}")]
    Encode(#[from] serde_json::Error),
}
