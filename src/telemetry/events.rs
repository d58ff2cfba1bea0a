//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `PROXYWRAP` tag when audit
//! logging is enabled in the configuration.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events for security logging.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// The wrapped tool was launched.
    SessionStart {
        /// Tool being wrapped.
        tool: String,
        /// Process ID of the child.
        pid: u32,
    },

    /// The wrapped tool terminated.
    SessionEnd {
        /// Tool that was wrapped.
        tool: String,
        /// Exit code returned by the wrapper.
        exit_code: i32,
        /// Duration of the session in seconds.
        duration_sec: u64,
    },

    /// An intercepted tunnel reached its destination.
    TunnelOpen {
        /// Destination host.
        host: String,
        /// Destination port.
        port: u16,
        /// Whether the tunnel goes through the upstream proxy.
        via_upstream: bool,
    },

    /// An intercepted tunnel could not reach its destination.
    TunnelFailed {
        /// Destination host.
        host: String,
        /// Destination port.
        port: u16,
        /// Error description.
        reason: String,
    },

    /// Authentication exchange with the upstream proxy finished.
    UpstreamAuth {
        /// Scheme used in the last response.
        scheme: String,
        /// Whether the proxy accepted.
        outcome: AuthOutcome,
        /// Number of responses sent.
        rounds: usize,
    },

    /// A new root certificate was generated.
    RootGenerated {
        /// Identity tag of the root.
        identity: String,
        /// Why the previous root was not reused.
        reason: String,
    },
}

/// Result of an upstream authentication exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthOutcome {
    /// The proxy accepted the credentials.
    Accepted,
    /// The exchange was abandoned.
    Failed,
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
