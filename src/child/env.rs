//! Environment handed to the wrapped tool.
//!
//! Starts from a base environment (normally the wrapper's own) and points
//! every common HTTP client at the loopback proxy and at trust material that
//! includes the interception root.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::net::SocketAddr;
use std::path::Path;
use std::process::Command;

/// Proxy variables, in both spellings clients look for.
pub const PROXY_VARS: &[&str] = &["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];

/// Bypass lists that would let traffic skip the proxy.
pub const NO_PROXY_VARS: &[&str] = &["NO_PROXY", "no_proxy"];

/// Variables that replace a client's whole trust store.
pub const BUNDLE_VARS: &[&str] = &["SSL_CERT_FILE", "REQUESTS_CA_BUNDLE", "CURL_CA_BUNDLE"];

/// Node.js adds this file to its built-in roots.
pub const NODE_EXTRA_CA_CERTS: &str = "NODE_EXTRA_CA_CERTS";

/// The child's complete environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildEnvironment {
    vars: BTreeMap<OsString, OsString>,
}

impl ChildEnvironment {
    /// Start from an explicit set of variables.
    pub fn from_base<I, K, V>(base: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        Self {
            vars: base
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Start from the wrapper's own environment.
    pub fn inherit() -> Self {
        Self::from_base(std::env::vars_os())
    }

    /// Route HTTP and HTTPS through the proxy at `addr`.
    pub fn with_proxy(mut self, addr: SocketAddr) -> Self {
        for key in NO_PROXY_VARS {
            self.vars.remove(OsStr::new(key));
        }
        let url = proxy_url(addr);
        for key in PROXY_VARS {
            self.vars.insert((*key).into(), url.clone().into());
        }
        self
    }

    /// Point trust-store variables at the root certificate and the combined bundle.
    pub fn with_trust(mut self, root_cert: &Path, bundle: &Path) -> Self {
        self.vars
            .insert(NODE_EXTRA_CA_CERTS.into(), root_cert.as_os_str().to_owned());
        for key in BUNDLE_VARS {
            self.vars.insert((*key).into(), bundle.as_os_str().to_owned());
        }
        self
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<&OsStr> {
        self.vars.get(OsStr::new(key)).map(OsString::as_os_str)
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the environment is empty.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Replace `cmd`'s environment with this one.
    pub fn apply(&self, cmd: &mut Command) {
        cmd.env_clear().envs(&self.vars);
    }
}

/// Proxy URL for a loopback listener address.
pub fn proxy_url(addr: SocketAddr) -> String {
    format!("http://{}", addr)
}
