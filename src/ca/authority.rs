//! Persistent root CA and on-demand leaf issuance.
//!
//! The root is generated once per wrapper identity and reused across runs, so
//! the trust anchor handed to child processes stays stable. Leaf certificates
//! are minted lazily per hostname and cached for the lifetime of the authority.
//!
//! # Example
//!
//! ```ignore
//! use proxywrap::ca::CertificateAuthority;
//!
//! let ca = CertificateAuthority::ensure_root(&cache_dir, env!("CARGO_PKG_VERSION"))?;
//! let leaf = ca.issue_leaf("api.example.com")?;
//! ```

use super::error::CaError;
use super::store::{self, LoadOutcome, PersistedRoot, RootPaths};
use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, trace, warn};

/// Subject common name of the root certificate.
pub const ROOT_COMMON_NAME: &str = "proxywrap Interception CA";

const ROOT_ORGANIZATION: &str = "proxywrap";

/// Root certificates are valid for one year.
const ROOT_VALIDITY: Duration = Duration::days(365);

/// A root this close to expiry is replaced instead of reused.
const ROOT_RENEWAL_MARGIN: Duration = Duration::hours(24);

/// Leaf certificates are valid for one day, clamped to the root's expiry.
const LEAF_VALIDITY: Duration = Duration::hours(24);

/// Backdating applied to `not_before` to tolerate clock skew.
const CLOCK_SKEW: Duration = Duration::minutes(5);

/// Why the authority is using the root it has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootOrigin {
    /// An existing, valid root was loaded from the cache directory.
    Reused,
    /// A new root was generated.
    Generated {
        /// Short description of why the previous root was not usable.
        reason: String,
    },
}

/// A certificate minted for one hostname.
pub struct LeafCertificate {
    /// Normalized hostname the certificate covers.
    pub host: String,
    /// DER encoding of the leaf certificate.
    pub cert_der: CertificateDer<'static>,
    /// Chain `[leaf, root]` with the leaf's signing key, ready for rustls.
    pub certified_key: Arc<CertifiedKey>,
}

impl fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("host", &self.host)
            .field("cert_len", &self.cert_der.len())
            .finish()
    }
}

/// Per-host slot. Issuance runs while the slot is locked so concurrent
/// requests for the same host share one certificate.
type LeafSlot = Arc<Mutex<Option<Arc<LeafCertificate>>>>;

/// Root signing material held in memory.
struct RootMaterial {
    key: KeyPair,
    params: CertificateParams,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    not_after: OffsetDateTime,
}

impl RootMaterial {
    /// Rebuild signing material from a persisted bundle.
    ///
    /// Issuer parameters are derived deterministically, so a loaded key yields
    /// the same issuer name and key identifier as the persisted certificate.
    fn from_persisted(root: &PersistedRoot) -> Result<Self, String> {
        let key = KeyPair::from_pem(&root.key_pem).map_err(|e| format!("bad key: {}", e))?;

        let cert_der = rustls_pemfile::certs(&mut root.cert_pem.as_bytes())
            .next()
            .ok_or("no certificate in bundle")?
            .map_err(|e| format!("bad certificate: {}", e))?;

        let not_before = root.not_after - ROOT_VALIDITY;
        Ok(Self {
            key,
            params: root_params(not_before, root.not_after),
            cert_pem: root.cert_pem.clone(),
            cert_der,
            not_after: root.not_after,
        })
    }

    fn is_expiring(&self, now: OffsetDateTime) -> bool {
        self.not_after - now <= ROOT_RENEWAL_MARGIN
    }
}

/// Root certificate authority with a leaf cache.
pub struct CertificateAuthority {
    identity: String,
    root: RootMaterial,
    origin: RootOrigin,
    leaves: Mutex<HashMap<String, LeafSlot>>,
    issued: AtomicUsize,
}

impl CertificateAuthority {
    /// Load the root for `identity` from `cache_dir`, generating it if needed.
    ///
    /// A root that is missing, unreadable, or within a day of expiry is
    /// replaced. Runs sharing an identity take turns on a lock file, so
    /// concurrent first runs generate one root between them. Roots of other
    /// identities older than a week are removed.
    ///
    /// # Errors
    ///
    /// Returns error if the cache directory cannot be created, locked or
    /// written, or if key or certificate generation fails.
    pub fn ensure_root(cache_dir: &Path, identity: &str) -> Result<Self, CaError> {
        std::fs::create_dir_all(cache_dir).map_err(|source| CaError::CacheDir {
            path: cache_dir.to_path_buf(),
            source,
        })?;

        let paths = RootPaths::new(cache_dir, identity);
        let _lock = store::lock(&paths)?;
        let now = OffsetDateTime::now_utc();

        let stale = match store::load(&paths, identity)? {
            LoadOutcome::Loaded(persisted) => match RootMaterial::from_persisted(&persisted) {
                Ok(root) if !root.is_expiring(now) => {
                    debug!("Reusing root certificate from {:?}", paths.bundle);
                    store::prune_other_identities(cache_dir, &paths);
                    return Ok(Self::new(identity, root, RootOrigin::Reused));
                }
                Ok(_) => Some("expiring".to_string()),
                Err(reason) => Some(reason),
            },
            LoadOutcome::Invalid(reason) => Some(reason),
            LoadOutcome::Missing => None,
        };

        if let Some(reason) = &stale {
            warn!("Replacing root certificate at {:?}: {}", paths.bundle, reason);
        }
        let reason = stale.unwrap_or_else(|| "missing".to_string());

        let fresh = generate_root(identity, now)?;
        store::save(&paths, &fresh)?;
        store::prune_other_identities(cache_dir, &paths);

        let root = RootMaterial::from_persisted(&fresh).map_err(|reason| CaError::InvalidRoot {
            path: paths.bundle.clone(),
            reason,
        })?;

        Ok(Self::new(identity, root, RootOrigin::Generated { reason }))
    }

    fn new(identity: &str, root: RootMaterial, origin: RootOrigin) -> Self {
        Self {
            identity: identity.to_string(),
            root,
            origin,
            leaves: Mutex::new(HashMap::new()),
            issued: AtomicUsize::new(0),
        }
    }

    /// Root certificate as PEM.
    pub fn cert_pem(&self) -> &str {
        &self.root.cert_pem
    }

    /// Root certificate as DER.
    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root.cert_der
    }

    /// Identity tag the root belongs to.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether the root was reused or freshly generated.
    pub fn origin(&self) -> &RootOrigin {
        &self.origin
    }

    /// Expiry of the root certificate.
    pub fn not_after(&self) -> OffsetDateTime {
        self.root.not_after
    }

    /// Get the leaf certificate for `host`, minting it on first use.
    ///
    /// Hostnames are matched case-insensitively. IP literals get an IP SAN.
    pub fn issue_leaf(&self, host: &str) -> Result<Arc<LeafCertificate>, CaError> {
        let host = normalize_host(host)?;

        let slot = {
            let mut leaves = self.leaves.lock().unwrap_or_else(PoisonError::into_inner);
            leaves.entry(host.clone()).or_default().clone()
        };

        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(leaf) = guard.as_ref() {
            trace!("Leaf cache hit for {}", host);
            return Ok(leaf.clone());
        }

        let leaf = Arc::new(self.mint_leaf(&host)?);
        *guard = Some(leaf.clone());
        self.issued.fetch_add(1, Ordering::Relaxed);
        Ok(leaf)
    }

    /// Number of leaf certificates minted so far.
    pub fn issued_count(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }

    /// Number of hostnames with a cached leaf.
    ///
    /// Waits for issuances already in flight, so a leaf being minted right
    /// now is counted once it is ready.
    pub fn cached_hosts(&self) -> usize {
        let slots: Vec<LeafSlot> = {
            let leaves = self.leaves.lock().unwrap_or_else(PoisonError::into_inner);
            leaves.values().cloned().collect()
        };

        slots
            .iter()
            .filter(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).is_some())
            .count()
    }

    fn mint_leaf(&self, host: &str) -> Result<LeafCertificate, CaError> {
        debug!("Issuing leaf certificate for {}", host);

        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(host.to_string()));
        params.distinguished_name = dn;
        params.subject_alt_names = vec![subject_alt_name(host)?];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW;
        params.not_after = (now + LEAF_VALIDITY).min(self.root.not_after);

        let issuer = Issuer::from_params(&self.root.params, &self.root.key);
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| CaError::Signing {
                host: host.to_string(),
                message: e.to_string(),
            })?;

        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key_der)
            .map_err(CaError::SigningKey)?;

        let chain = vec![cert_der.clone(), self.root.cert_der.clone()];

        Ok(LeafCertificate {
            host: host.to_string(),
            cert_der,
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("identity", &self.identity)
            .field("origin", &self.origin)
            .field("issued", &self.issued_count())
            .finish()
    }
}

fn root_params(not_before: OffsetDateTime, not_after: OffsetDateTime) -> CertificateParams {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(ROOT_COMMON_NAME.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ROOT_ORGANIZATION.to_string()),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = not_before;
    params.not_after = not_after;
    params
}

fn generate_root(identity: &str, now: OffsetDateTime) -> Result<PersistedRoot, CaError> {
    info!("Generating root certificate for identity {}", identity);

    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

    let not_after = now + ROOT_VALIDITY - CLOCK_SKEW;
    let params = root_params(not_after - ROOT_VALIDITY, not_after);
    let cert = params
        .self_signed(&key)
        .map_err(|e| CaError::CertGeneration(e.to_string()))?;

    Ok(PersistedRoot {
        identity: identity.to_string(),
        not_after: params.not_after,
        key_pem: key.serialize_pem(),
        cert_pem: cert.pem(),
    })
}

/// Lower-case the host and strip brackets or a trailing dot.
fn normalize_host(host: &str) -> Result<String, CaError> {
    let trimmed = host
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.');

    if trimmed.is_empty() {
        return Err(CaError::InvalidHostname(host.to_string()));
    }

    Ok(trimmed.to_ascii_lowercase())
}

fn subject_alt_name(host: &str) -> Result<SanType, CaError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }

    let name = Ia5String::try_from(host)
        .map_err(|_| CaError::InvalidHostname(host.to_string()))?;
    Ok(SanType::DnsName(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::client::WebPkiServerVerifier;
    use rustls::client::danger::ServerCertVerifier;
    use rustls_pki_types::{ServerName, UnixTime};
    use std::fs;

    fn verify(ca: &CertificateAuthority, leaf: &LeafCertificate, name: &str) -> bool {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(ca.root_der().clone()).unwrap();
        let verifier = WebPkiServerVerifier::builder_with_provider(
            Arc::new(roots),
            Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        )
        .build()
        .unwrap();

        verifier
            .verify_server_cert(
                &leaf.cert_der,
                &[],
                &ServerName::try_from(name.to_string()).unwrap(),
                &[],
                UnixTime::now(),
            )
            .is_ok()
    }

    #[test]
    fn test_root_generated_then_reused() {
        let dir = tempfile::tempdir().unwrap();

        let first = CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap();
        assert!(matches!(first.origin(), RootOrigin::Generated { .. }));
        let bundle = fs::read(dir.path().join("proxywrap-root-1.0.0.pem")).unwrap();

        let second = CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap();
        assert_eq!(second.origin(), &RootOrigin::Reused);
        assert_eq!(first.cert_pem(), second.cert_pem());
        assert_eq!(
            bundle,
            fs::read(dir.path().join("proxywrap-root-1.0.0.pem")).unwrap()
        );
    }

    #[test]
    fn test_concurrent_first_runs_share_one_root() {
        let dir = tempfile::tempdir().unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = dir.path().to_path_buf();
                std::thread::spawn(move || CertificateAuthority::ensure_root(&path, "1.0.0").unwrap())
            })
            .collect();
        let roots: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let generated = roots
            .iter()
            .filter(|ca| matches!(ca.origin(), RootOrigin::Generated { .. }))
            .count();
        assert_eq!(generated, 1);
        assert!(roots.iter().all(|ca| ca.cert_pem() == roots[0].cert_pem()));
    }

    #[test]
    fn test_identities_get_distinct_roots() {
        let dir = tempfile::tempdir().unwrap();
        let a = CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap();
        let b = CertificateAuthority::ensure_root(dir.path(), "2.0.0").unwrap();

        assert_ne!(a.cert_pem(), b.cert_pem());
    }

    #[test]
    fn test_corrupt_bundle_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("proxywrap-root-1.0.0.pem");
        fs::write(&bundle, "garbage").unwrap();

        let ca = CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap();
        assert!(matches!(ca.origin(), RootOrigin::Generated { .. }));
        assert!(fs::read_to_string(&bundle).unwrap().contains(ca.cert_pem().trim()));
    }

    #[test]
    fn test_expiring_root_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let original = CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap();

        let paths = RootPaths::new(dir.path(), "1.0.0");
        let mut persisted = match store::load(&paths, "1.0.0").unwrap() {
            LoadOutcome::Loaded(root) => root,
            other => panic!("unexpected outcome: {:?}", other),
        };
        persisted.not_after = OffsetDateTime::now_utc() + Duration::hours(2);
        store::save(&paths, &persisted).unwrap();

        let renewed = CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap();
        assert!(matches!(renewed.origin(), RootOrigin::Generated { .. }));
        assert_ne!(original.cert_pem(), renewed.cert_pem());
    }

    #[test]
    fn test_unwritable_cache_dir() {
        let result = CertificateAuthority::ensure_root(Path::new("/dev/null/proxywrap"), "1.0.0");
        assert!(matches!(result, Err(CaError::CacheDir { .. })));
    }

    #[test]
    fn test_leaf_chains_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap();

        let a = ca.issue_leaf("a.example").unwrap();
        let b = ca.issue_leaf("b.example").unwrap();

        assert!(verify(&ca, &a, "a.example"));
        assert!(verify(&ca, &b, "b.example"));
        assert!(!verify(&ca, &a, "b.example"));
        assert_eq!(a.certified_key.cert.len(), 2);
        assert_eq!(&a.certified_key.cert[1], ca.root_der());
    }

    #[test]
    fn test_leaf_from_reloaded_root_still_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let original = CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap();
        let reloaded = CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap();

        let leaf = reloaded.issue_leaf("api.example.com").unwrap();
        assert!(verify(&original, &leaf, "api.example.com"));
    }

    #[test]
    fn test_ip_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap();

        let leaf = ca.issue_leaf("127.0.0.1").unwrap();
        assert!(verify(&ca, &leaf, "127.0.0.1"));
    }

    #[test]
    fn test_leaf_cache_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap();

        let first = ca.issue_leaf("Example.COM").unwrap();
        let second = ca.issue_leaf("example.com.").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ca.issued_count(), 1);
        assert_eq!(ca.cached_hosts(), 1);
    }

    #[test]
    fn test_concurrent_issuance_mints_once() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ca = ca.clone();
                std::thread::spawn(move || ca.issue_leaf("same.example").unwrap())
            })
            .collect();
        let leaves: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(ca.issued_count(), 1);
        assert!(leaves.iter().all(|leaf| Arc::ptr_eq(leaf, &leaves[0])));
    }

    #[test]
    fn test_cached_hosts_waits_for_issuance_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap());
        let leaf = ca.issue_leaf("a.example").unwrap();

        let slot: LeafSlot = Arc::default();
        ca.leaves
            .lock()
            .unwrap()
            .insert("b.example".to_string(), slot.clone());
        let mut minting = slot.lock().unwrap();

        let counter = {
            let ca = ca.clone();
            std::thread::spawn(move || ca.cached_hosts())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        *minting = Some(leaf);
        drop(minting);

        assert_eq!(counter.join().unwrap(), 2);
    }

    #[test]
    fn test_empty_host_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::ensure_root(dir.path(), "1.0.0").unwrap();
        assert!(matches!(
            ca.issue_leaf(""),
            Err(CaError::InvalidHostname(_))
        ));
    }
}
