//! Configuration system for proxywrap.
//!
//! This module provides TOML configuration loading with hierarchy merging
//! and produces one immutable [`WrapperConfig`] per run.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/proxywrap/config.toml`
//! 2. User config: `~/.config/proxywrap/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. Upstream proxy from `HTTPS_PROXY` & co. when no file names one
//! 5. CLI flags (highest priority)
//!
//! No configuration file is required.
//!
//! ```toml
//! [proxy]
//! upstream = "http://proxy.corp:3128"
//! auth = "negotiate"
//!
//! [telemetry]
//! syslog = true
//! ```

mod cache;
mod error;
mod loader;
mod schema;

pub use cache::{CACHE_DIR_NAME, resolve_cache_dir};
pub use error::ConfigError;
pub use loader::{ConfigLoader, WrapperConfig};
pub use schema::{CacheSection, Config, ProxySection, TelemetrySection};
