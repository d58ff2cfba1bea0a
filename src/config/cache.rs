//! Cache directory resolution.

use super::error::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory name under the platform cache directory.
pub const CACHE_DIR_NAME: &str = "proxywrap";

/// Resolve, create and probe the cache directory.
///
/// `explicit` is the directory named by the command line, the environment or
/// a config file; otherwise `<platform cache dir>/proxywrap` is used.
pub fn resolve_cache_dir(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let dir = match explicit {
        Some(dir) => dir.to_path_buf(),
        None => dirs::cache_dir()
            .map(|p| p.join(CACHE_DIR_NAME))
            .ok_or(ConfigError::NoCacheDirectory)?,
    };

    let unusable = |source| ConfigError::CacheDirUnusable {
        path: dir.clone(),
        source,
    };

    fs::create_dir_all(&dir).map_err(unusable)?;

    // Creating and dropping a temp file proves we can write here.
    tempfile::Builder::new()
        .prefix(".probe-")
        .tempfile_in(&dir)
        .map_err(unusable)?;

    debug!("Using cache directory {:?}", dir);
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a").join("b");

        let resolved = resolve_cache_dir(Some(&target)).unwrap();
        assert_eq!(resolved, target);
        assert!(target.is_dir());
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
    }

    #[test]
    fn test_unusable_directory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, "not a directory").unwrap();

        assert!(matches!(
            resolve_cache_dir(Some(&file.join("sub"))),
            Err(ConfigError::CacheDirUnusable { .. })
        ));
    }

    #[test]
    fn test_dev_null_is_unusable() {
        assert!(resolve_cache_dir(Some(Path::new("/dev/null"))).is_err());
    }
}
