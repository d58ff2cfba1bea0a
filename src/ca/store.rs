//! On-disk persistence of the root certificate authority.
//!
//! Each wrapper identity (normally the package version) owns three files in
//! the cache directory:
//!
//! - `proxywrap-root-<identity>.pem`: private key and certificate, 0600
//! - `proxywrap-root-<identity>.toml`: identity tag and expiry
//! - `proxywrap-root-<identity>.lock`: held while a run loads or replaces the root
//!
//! The metadata sidecar lets a stale or foreign root be detected without
//! parsing X.509. Runs sharing an identity serialize on the lock file, so a
//! root is generated once and every concurrent run ends up with the same one.

use super::error::CaError;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// File name prefix shared by all persisted roots.
pub const ROOT_FILE_PREFIX: &str = "proxywrap-root-";

/// Roots belonging to other identities are pruned once they are this old.
const STALE_ROOT_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const KEY_TAG: &str = "PRIVATE KEY";
const CERT_TAG: &str = "CERTIFICATE";

/// Locations of the persisted root for one identity.
#[derive(Debug, Clone)]
pub struct RootPaths {
    /// Key + certificate bundle.
    pub bundle: PathBuf,
    /// Metadata sidecar.
    pub metadata: PathBuf,
    /// Lock file guarding the other two.
    pub lock: PathBuf,
}

impl RootPaths {
    /// Paths for `identity` inside `cache_dir`.
    pub fn new(cache_dir: &Path, identity: &str) -> Self {
        let stem = format!("{}{}", ROOT_FILE_PREFIX, sanitize_identity(identity));
        Self {
            bundle: cache_dir.join(format!("{}.pem", stem)),
            metadata: cache_dir.join(format!("{}.toml", stem)),
            lock: cache_dir.join(format!("{}.lock", stem)),
        }
    }

    fn dir(&self) -> &Path {
        self.bundle.parent().unwrap_or_else(|| Path::new("."))
    }

    fn owns(&self, path: &Path) -> bool {
        path == self.bundle || path == self.metadata || path == self.lock
    }
}

/// Reduce an identity tag to characters that are safe in a file name.
pub fn sanitize_identity(identity: &str) -> String {
    let cleaned: String = identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

/// Contents of the metadata sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMetadata {
    /// Identity tag the root was generated for.
    pub identity: String,
    /// Expiry of the root certificate.
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
}

/// A root as persisted: metadata plus PEM key and certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRoot {
    /// Identity tag the root was generated for.
    pub identity: String,
    /// Expiry of the root certificate.
    pub not_after: OffsetDateTime,
    /// PKCS#8 private key, PEM encoded.
    pub key_pem: String,
    /// Root certificate, PEM encoded.
    pub cert_pem: String,
}

impl PersistedRoot {
    /// Sidecar view of this root.
    pub fn metadata(&self) -> RootMetadata {
        RootMetadata {
            identity: self.identity.clone(),
            not_after: self.not_after,
        }
    }

    /// Key followed by certificate, as written to the bundle file.
    pub fn bundle_pem(&self) -> String {
        format!("{}{}", self.key_pem, self.cert_pem)
    }

    /// Rebuild a root from its sidecar and bundle text.
    pub fn from_parts(metadata: RootMetadata, bundle: &str) -> Result<Self, String> {
        let blocks = pem::parse_many(bundle).map_err(|e| format!("bad bundle: {}", e))?;

        let find = |tag: &str| {
            blocks
                .iter()
                .find(|block| block.tag() == tag)
                .map(|block| {
                    pem::encode_config(
                        block,
                        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
                    )
                })
        };

        Ok(Self {
            identity: metadata.identity,
            not_after: metadata.not_after,
            key_pem: find(KEY_TAG).ok_or("missing private key")?,
            cert_pem: find(CERT_TAG).ok_or("missing certificate")?,
        })
    }
}

/// Exclusive hold on one identity's root files. Released on drop.
#[derive(Debug)]
pub struct RootLock {
    _file: File,
}

/// Block until this process holds the lock for `paths`.
pub fn lock(paths: &RootPaths) -> Result<RootLock, CaError> {
    let lock_err = |source| CaError::Lock {
        path: paths.lock.clone(),
        source,
    };

    let file = File::options()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&paths.lock)
        .map_err(lock_err)?;
    FileExt::lock_exclusive(&file).map_err(lock_err)?;

    debug!("Locked {:?}", paths.lock);
    Ok(RootLock { _file: file })
}

/// Result of looking for a persisted root.
#[derive(Debug)]
pub enum LoadOutcome {
    /// A root for this identity was found and parsed.
    Loaded(PersistedRoot),
    /// Neither file exists yet.
    Missing,
    /// Something exists but cannot be used.
    Invalid(String),
}

/// Load the persisted root for `identity`. Callers should hold [`lock`].
pub fn load(paths: &RootPaths, identity: &str) -> Result<LoadOutcome, CaError> {
    let metadata = read_optional(&paths.metadata)?;
    let bundle = read_optional(&paths.bundle)?;

    let (metadata, bundle) = match (metadata, bundle) {
        (None, None) => return Ok(LoadOutcome::Missing),
        (None, Some(_)) => return Ok(LoadOutcome::Invalid("missing metadata".to_string())),
        (Some(_), None) => return Ok(LoadOutcome::Invalid("missing bundle".to_string())),
        (Some(metadata), Some(bundle)) => (metadata, bundle),
    };

    let metadata: RootMetadata = match toml::from_str(&metadata) {
        Ok(metadata) => metadata,
        Err(e) => return Ok(LoadOutcome::Invalid(format!("bad metadata: {}", e))),
    };

    if metadata.identity != identity {
        return Ok(LoadOutcome::Invalid(format!(
            "identity mismatch (found {:?})",
            metadata.identity
        )));
    }

    Ok(match PersistedRoot::from_parts(metadata, &bundle) {
        Ok(root) => LoadOutcome::Loaded(root),
        Err(reason) => LoadOutcome::Invalid(reason),
    })
}

fn read_optional(path: &Path) -> Result<Option<String>, CaError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CaError::ReadFile {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Atomically write the bundle, then its sidecar. Callers should hold [`lock`].
pub fn save(paths: &RootPaths, root: &PersistedRoot) -> Result<(), CaError> {
    let metadata = toml::to_string(&root.metadata())
        .map_err(|e| CaError::CertGeneration(format!("cannot encode metadata: {}", e)))?;

    write_atomic(paths.dir(), &paths.bundle, root.bundle_pem().as_bytes(), 0o600)?;
    write_atomic(paths.dir(), &paths.metadata, metadata.as_bytes(), 0o644)?;

    info!("Persisted root certificate to {:?}", paths.bundle);
    Ok(())
}

fn write_atomic(dir: &Path, target: &Path, contents: &[u8], mode: u32) -> Result<(), CaError> {
    let write_err = |source| CaError::WriteFile {
        path: target.to_path_buf(),
        source,
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".proxywrap-")
        .tempfile_in(dir)
        .map_err(write_err)?;
    tmp.write_all(contents).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode)).map_err(write_err)?;
    tmp.persist(target).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Remove old roots that belong to other identities.
///
/// Best effort: failures are logged and otherwise ignored.
pub fn prune_other_identities(cache_dir: &Path, keep: &RootPaths) {
    let entries = match fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot scan cache directory for stale roots: {}", e);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if !name.starts_with(ROOT_FILE_PREFIX) || keep.owns(&path) {
            continue;
        }

        if let Ok(metadata) = entry.metadata()
            && let Ok(modified) = metadata.modified()
            && let Ok(age) = SystemTime::now().duration_since(modified)
            && age > STALE_ROOT_AGE
        {
            info!("Removing stale root file {}", name);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove stale root file {}: {}", name, e);
            }
        }
    }
}
