//! Configuration schema definitions.
//!
//! This module defines the structure of the proxywrap configuration files.
//! Every field is optional so that a file only needs to name what it
//! changes; [`Config::merge`] lets a later source override an earlier one.

use crate::auth::AuthMechanism;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration file structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Proxy settings.
    #[serde(default)]
    pub proxy: ProxySection,

    /// Cache settings.
    #[serde(default)]
    pub cache: CacheSection,

    /// Audit telemetry settings.
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Scalars set in `other` override; unset ones leave `self` alone.
    pub fn merge(&mut self, other: Config) {
        self.proxy.merge(other.proxy);
        self.cache.merge(other.cache);
        self.telemetry.merge(other.telemetry);
    }
}

/// `[proxy]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySection {
    /// Upstream proxy URL.
    pub upstream: Option<String>,

    /// Upstream authentication mechanism.
    pub auth: Option<AuthMechanism>,

    /// Skip destination certificate verification.
    pub insecure: Option<bool>,

    /// Connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,

    /// Tunnel idle timeout in seconds.
    pub idle_timeout_secs: Option<u64>,

    /// Shutdown grace period in milliseconds.
    pub shutdown_grace_ms: Option<u64>,
}

impl ProxySection {
    fn merge(&mut self, other: ProxySection) {
        merge_option(&mut self.upstream, other.upstream);
        merge_option(&mut self.auth, other.auth);
        merge_option(&mut self.insecure, other.insecure);
        merge_option(&mut self.connect_timeout_secs, other.connect_timeout_secs);
        merge_option(&mut self.idle_timeout_secs, other.idle_timeout_secs);
        merge_option(&mut self.shutdown_grace_ms, other.shutdown_grace_ms);
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    /// Directory for the persisted interception root.
    pub dir: Option<PathBuf>,
}

impl CacheSection {
    fn merge(&mut self, other: CacheSection) {
        merge_option(&mut self.dir, other.dir);
    }
}

/// `[telemetry]` section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    /// Send audit events to syslog.
    pub syslog: Option<bool>,
}

impl TelemetrySection {
    fn merge(&mut self, other: TelemetrySection) {
        merge_option(&mut self.syslog, other.syslog);
    }
}

fn merge_option<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}
