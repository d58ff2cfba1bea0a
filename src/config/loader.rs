//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/proxywrap/config.toml`
//! 3. User config: `~/.config/proxywrap/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. `HTTPS_PROXY`/`HTTP_PROXY` (only when no file names an upstream proxy)
//! 6. CLI flags (highest priority)
//!
//! Scalars set by a later source override earlier ones.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::error::ConfigError;
use super::schema::Config;
use crate::cli::Invocation;
use crate::proxy::{ProxyConfig, UpstreamProxy};

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/proxywrap/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "proxywrap";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Environment variables consulted for an upstream proxy, in order.
pub const UPSTREAM_ENV_VARS: &[&str] = &["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"];

/// The resolved, immutable wrapper configuration.
#[derive(Debug, Clone, Default)]
pub struct WrapperConfig {
    /// Settings for the intercepting proxy.
    pub proxy: ProxyConfig,
    /// Explicit cache directory, if any source named one.
    pub cache_dir: Option<PathBuf>,
    /// Send audit events to syslog.
    pub syslog: bool,
}

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
    /// Upstream proxy variables captured at construction.
    env: HashMap<String, String>,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths and the process environment.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        let env = UPSTREAM_ENV_VARS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
            .collect();

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
            env,
        }
    }

    /// Create a ConfigLoader with custom paths and no environment (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
            env: HashMap::new(),
        }
    }

    /// Replace the captured environment.
    #[must_use]
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Load, merge and validate configuration from all sources.
    ///
    /// Missing system/user files are skipped. A missing `--config` file or
    /// invalid TOML anywhere is an error.
    pub fn load(&self, invocation: &Invocation) -> Result<WrapperConfig, ConfigError> {
        let mut config = Config::default();

        for path in [&self.system_path, &self.user_path] {
            if let Some(file_config) = self.load_file(path)? {
                config.merge(file_config);
                debug!("Loaded config from {:?}", path);
            } else {
                debug!("No config found at {:?}", path);
            }
        }

        if let Some(ref cli_config_path) = invocation.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike system/user config, a missing CLI-specified config is an error
                    return Err(ConfigError::Read {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        if config.proxy.upstream.is_none()
            && let Some((key, value)) = self.upstream_from_env()
        {
            debug!("Using upstream proxy from {}", key);
            config.proxy.upstream = Some(value.to_string());
        }

        // Apply CLI flags (highest priority)
        if invocation.insecure {
            config.proxy.insecure = Some(true);
        }
        if invocation.proxy.is_some() {
            config.proxy.upstream = invocation.proxy.clone();
        }
        if invocation.auth.is_some() {
            config.proxy.auth = invocation.auth;
        }
        if invocation.cache_dir.is_some() {
            config.cache.dir = invocation.cache_dir.clone();
        }

        resolve(config)
    }

    fn upstream_from_env(&self) -> Option<(&str, &str)> {
        UPSTREAM_ENV_VARS.iter().find_map(|key| {
            self.env
                .get(*key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(|v| (*key, v))
        })
    }

    /// Load a single config file. Returns `None` if the file doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(Some(config))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate merged settings into a [`WrapperConfig`].
fn resolve(config: Config) -> Result<WrapperConfig, ConfigError> {
    let defaults = ProxyConfig::default();

    let upstream = config
        .proxy
        .upstream
        .as_deref()
        .map(str::parse::<UpstreamProxy>)
        .transpose()
        .map_err(|e| ConfigError::InvalidValue {
            field: "proxy.upstream".to_string(),
            message: e.to_string(),
        })?;

    let proxy = ProxyConfig {
        insecure_upstream_tls: config.proxy.insecure.unwrap_or(defaults.insecure_upstream_tls),
        upstream,
        auth_mechanism: config.proxy.auth.unwrap_or(defaults.auth_mechanism),
        connect_timeout: duration(
            "proxy.connect_timeout_secs",
            config.proxy.connect_timeout_secs.map(Duration::from_secs),
            defaults.connect_timeout,
        )?,
        idle_timeout: duration(
            "proxy.idle_timeout_secs",
            config.proxy.idle_timeout_secs.map(Duration::from_secs),
            defaults.idle_timeout,
        )?,
        shutdown_grace: config
            .proxy
            .shutdown_grace_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_grace),
    };

    Ok(WrapperConfig {
        proxy,
        cache_dir: config.cache.dir,
        syslog: config.telemetry.syslog.unwrap_or(false),
    })
}

fn duration(field: &str, value: Option<Duration>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        Some(d) if d.is_zero() => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: "must be greater than zero".to_string(),
        }),
        Some(d) => Ok(d),
        None => Ok(default),
    }
}
