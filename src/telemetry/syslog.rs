//! Syslog sink for audit events.

use std::sync::{Mutex, PoisonError};

use syslog::{Facility, Formatter3164, Logger, LoggerBackend};
use tracing::{debug, warn};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "PROXYWRAP";

type SyslogWriter = Logger<LoggerBackend, Formatter3164>;

/// Audit logger that writes one JSON line per event.
///
/// Shared by the orchestrator and every proxy connection. Events are always
/// mirrored to the `debug` log; with syslog disabled that is all that
/// happens to them.
pub struct AuditLogger {
    syslog: Option<Mutex<SyslogWriter>>,
}

impl AuditLogger {
    /// Connect to the local syslog daemon (`LOG_USER`, RFC 3164).
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter)
            .map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;

        debug!("Audit events go to syslog as '{}'", SYSLOG_TAG);
        Ok(Self {
            syslog: Some(Mutex::new(writer)),
        })
    }

    /// A logger that keeps events out of syslog.
    pub fn new_null() -> Self {
        Self { syslog: None }
    }

    /// Record `event`. Failures are logged and otherwise ignored.
    pub fn log(&self, event: AuditEvent) {
        if let Err(e) = self.try_log(&event) {
            warn!("Dropped audit event: {}", e);
        }
    }

    fn try_log(&self, event: &AuditEvent) -> Result<(), TelemetryError> {
        let line = render(event)?;
        debug!("Audit event: {}", line);

        if let Some(writer) = &self.syslog {
            writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .info(&line)
                .map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;
        }
        Ok(())
    }

    /// Whether events stay out of syslog.
    pub fn is_null(&self) -> bool {
        self.syslog.is_none()
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("syslog", &!self.is_null())
            .finish()
    }
}

/// JSON line for `event`, stamped with the current time.
fn render(event: &AuditEvent) -> Result<String, TelemetryError> {
    Ok(serde_json::to_string(&event.with_timestamp())?)
}
