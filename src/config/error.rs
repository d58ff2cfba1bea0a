//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Why the run's configuration could not be assembled.
///
/// [`ConfigError::NoCacheDirectory`] and [`ConfigError::CacheDirUnusable`]
/// are reported with their own exit code; everything else means the
/// configuration itself is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file exists (or was named with `--config`) but cannot be read.
    #[error("Cannot read {path}: {source}")]
    Read {
        /// The config file.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A config file is not valid TOML for the schema.
    #[error("Invalid TOML in {path}: {source}")]
    Parse {
        /// The config file.
        path: PathBuf,
        /// Parser diagnostics, including line and column.
        source: toml::de::Error,
    },

    /// A field parsed but its value cannot be used.
    #[error("{field}: {message}")]
    InvalidValue {
        /// Dotted field name, e.g. `proxy.upstream`.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// No cache directory was configured and the platform has none.
    #[error("Could not determine a cache directory; set --cache-dir or PROXYWRAP_CACHE_PATH")]
    NoCacheDirectory,

    /// The cache directory cannot be created or written.
    #[error("Cache directory {path} is not usable: {source}")]
    CacheDirUnusable {
        /// The resolved cache directory.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Whether this is a cache directory problem rather than bad configuration.
    pub fn is_cache_dir(&self) -> bool {
        matches!(
            self,
            ConfigError::NoCacheDirectory | ConfigError::CacheDirUnusable { .. }
        )
    }
}
