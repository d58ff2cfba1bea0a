//! Telemetry and audit logging.
//!
//! - **Audit logging** (syslog, opt-in via `telemetry.syslog`): tunnel,
//!   upstream authentication, root lifecycle and session events
//! - **Debug logging** (tracing): diagnostics on stderr, see `main.rs`
//!
//! Events are logged as JSON with an ISO8601 timestamp:
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"tunnel_open","host":"api.example.com","port":443,"via_upstream":false}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, AuthOutcome};
pub use syslog::{AuditLogger, SYSLOG_TAG};
