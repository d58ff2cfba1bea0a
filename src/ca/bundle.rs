//! Trust files for child processes.
//!
//! Tools that read `SSL_CERT_FILE` or `REQUESTS_CA_BUNDLE` replace their
//! trust store wholesale. Pointing them at the interception root alone would
//! break traffic that bypasses the proxy, so they get the host's system CAs
//! with the root appended. Tools that add to their built-in roots get the
//! interception root on its own.
//!
//! Both files are written into the run's private directory. A later run that
//! renews the cached root cannot change what an already running child trusts.

use super::error::CaError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the combined bundle inside its directory.
pub const COMBINED_BUNDLE_NAME: &str = "ca-bundle.crt";

/// File name of the root-only anchor inside its directory.
pub const ROOT_ANCHOR_NAME: &str = "proxywrap-root.crt";

/// Standard host CA bundle locations to try.
pub const HOST_CA_BUNDLES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt", // Debian/Ubuntu
    "/etc/pki/tls/certs/ca-bundle.crt",   // RHEL/Fedora
    "/etc/ssl/cert.pem",                  // Alpine/macOS
];

/// Find the first existing host CA bundle.
pub fn find_host_ca_bundle() -> Option<&'static Path> {
    HOST_CA_BUNDLES
        .iter()
        .map(|p| Path::new(*p))
        .find(|p| p.exists())
}

/// Write `host bundle + root_pem` into `dir` and return the path.
///
/// A missing host bundle is tolerated; the result then holds the root only.
pub fn write_combined_bundle(
    dir: &Path,
    host_bundle: Option<&Path>,
    root_pem: &str,
) -> Result<PathBuf, CaError> {
    let mut content = String::new();

    match host_bundle {
        Some(path) => {
            content = fs::read_to_string(path).map_err(|source| CaError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            debug!("Read {} bytes from host CA bundle {:?}", content.len(), path);
        }
        None => warn!("No host CA bundle found, child trust bundle holds the interception root only"),
    }

    content.push_str(root_pem);

    let bundle_path = dir.join(COMBINED_BUNDLE_NAME);
    fs::write(&bundle_path, &content).map_err(|source| CaError::WriteFile {
        path: bundle_path.clone(),
        source,
    })?;

    debug!("Combined CA bundle written to {:?}", bundle_path);
    Ok(bundle_path)
}

/// Write the interception root on its own into `dir` and return the path.
pub fn write_root_anchor(dir: &Path, root_pem: &str) -> Result<PathBuf, CaError> {
    let anchor_path = dir.join(ROOT_ANCHOR_NAME);
    fs::write(&anchor_path, root_pem).map_err(|source| CaError::WriteFile {
        path: anchor_path.clone(),
        source,
    })?;

    debug!("Root anchor written to {:?}", anchor_path);
    Ok(anchor_path)
}
