//! Run orchestration and lifecycle management.
//!
//! This module coordinates the components for one invocation: it prepares
//! the cache directory and interception root, starts the proxy, launches the
//! wrapped tool with an environment pointing at it, and turns the tool's
//! termination into the wrapper's exit code.
//!
//! The proxy is owned by a [`ProxySession`] guard, so it is closed exactly
//! once on every path out of [`Orchestrator::run`], including early errors
//! and panics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, warn};

use crate::auth::{NegotiateProvider, default_provider};
use crate::ca::{
    CaError, CertificateAuthority, RootOrigin, find_host_ca_bundle, write_combined_bundle,
    write_root_anchor,
};
use crate::child::{
    ChildEnvironment, ChildError, ChildExit, ChildProcess, SignalForwarder, resolve_program,
};
use crate::cli::Invocation;
use crate::config::{ConfigError, WrapperConfig, resolve_cache_dir};
use crate::proxy::{InterceptingProxy, ProxyConfig, ProxyError};
use crate::telemetry::{AuditEvent, AuditLogger};

/// Configuration could not be loaded or validated.
pub const EXIT_CONFIG_INVALID: i32 = 64;
/// The proxy could not bind or start.
pub const EXIT_PROXY_UNAVAILABLE: i32 = 69;
/// The cache directory is unusable or the root could not be persisted.
pub const EXIT_CACHE_DIR_UNAVAILABLE: i32 = 73;
/// The child was killed by a signal or ended without an exit code.
pub const EXIT_CHILD_ABNORMAL: i32 = 125;
/// The tool could not be found or launched.
pub const EXIT_LAUNCH_FAILED: i32 = 127;

/// Identity tag of the persisted root. A new wrapper version gets a new root.
pub const ROOT_IDENTITY: &str = env!("CARGO_PKG_VERSION");

/// Failures that end a run before (or instead of) the child's own result.
#[derive(Debug, Error)]
pub enum WrapperError {
    /// Configuration is invalid or the cache directory cannot be used.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The interception root could not be loaded or persisted.
    #[error("Failed to prepare interception root: {0}")]
    Root(#[from] CaError),

    /// The proxy runtime could not be created.
    #[error("Failed to create proxy runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The proxy could not start.
    #[error("Failed to start proxy: {0}")]
    Proxy(#[from] ProxyError),

    /// The child could not be launched or supervised.
    #[error(transparent)]
    Child(#[from] ChildError),
}

impl WrapperError {
    /// Exit code reported for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            WrapperError::Config(e) if e.is_cache_dir() => EXIT_CACHE_DIR_UNAVAILABLE,
            WrapperError::Config(_) => EXIT_CONFIG_INVALID,
            WrapperError::Root(_) => EXIT_CACHE_DIR_UNAVAILABLE,
            WrapperError::Runtime(_) | WrapperError::Proxy(_) => EXIT_PROXY_UNAVAILABLE,
            WrapperError::Child(ChildError::Wait(_)) => EXIT_CHILD_ABNORMAL,
            WrapperError::Child(_) => EXIT_LAUNCH_FAILED,
        }
    }
}

/// Owns the proxy and its runtime for the duration of a run.
///
/// Closing happens in [`close`](Self::close) or on drop, whichever comes
/// first; the runtime is then shut down with the proxy's grace period.
pub struct ProxySession {
    runtime: Option<Runtime>,
    handle: Handle,
    proxy: Option<InterceptingProxy>,
    local_addr: SocketAddr,
    grace: Duration,
}

impl ProxySession {
    /// Build a runtime and start the proxy on it.
    pub fn start(
        config: ProxyConfig,
        ca: Arc<CertificateAuthority>,
        audit: Arc<AuditLogger>,
        provider: Arc<dyn NegotiateProvider>,
    ) -> Result<Self, WrapperError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("proxywrap-proxy")
            .build()
            .map_err(WrapperError::Runtime)?;

        let grace = config.shutdown_grace;
        let proxy = runtime.block_on(InterceptingProxy::start_with_provider(
            config, ca, audit, provider,
        ))?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            local_addr: proxy.local_addr(),
            proxy: Some(proxy),
            grace,
        })
    }

    /// Address the proxy listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle to the proxy runtime.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Close the proxy and shut down its runtime. Later calls do nothing.
    pub fn close(&mut self) {
        if let Some(proxy) = self.proxy.take() {
            match &self.runtime {
                Some(runtime) => runtime.block_on(proxy.close()),
                None => drop(proxy),
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(self.grace);
            debug!("Proxy runtime shut down");
        }
    }
}

impl Drop for ProxySession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Runs a wrapped tool behind the intercepting proxy.
pub struct Orchestrator {
    identity: String,
    audit: Arc<AuditLogger>,
    base_env: ChildEnvironment,
    provider: Arc<dyn NegotiateProvider>,
}

impl Orchestrator {
    /// Orchestrator using the wrapper's environment and default credentials.
    pub fn new(audit: Arc<AuditLogger>) -> Self {
        Self {
            identity: ROOT_IDENTITY.to_string(),
            audit,
            base_env: ChildEnvironment::inherit(),
            provider: default_provider(),
        }
    }

    /// Use a different root identity tag.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Start the child from `base_env` instead of the wrapper's environment.
    #[must_use]
    pub fn with_base_env(mut self, base_env: ChildEnvironment) -> Self {
        self.base_env = base_env;
        self
    }

    /// Use a different Negotiate credential source.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn NegotiateProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Run the tool and return the wrapper's exit code.
    pub fn run(&self, invocation: &Invocation, config: &WrapperConfig) -> i32 {
        match self.try_run(invocation, config) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("proxywrap: {}", e);
                e.exit_code()
            }
        }
    }

    fn try_run(&self, invocation: &Invocation, config: &WrapperConfig) -> Result<i32, WrapperError> {
        let cache_dir = resolve_cache_dir(config.cache_dir.as_deref())?;

        let ca = CertificateAuthority::ensure_root(&cache_dir, &self.identity)?;
        if let RootOrigin::Generated { reason } = ca.origin() {
            info!("Generated interception root ({})", reason);
            self.audit.log(AuditEvent::RootGenerated {
                identity: ca.identity().to_string(),
                reason: reason.clone(),
            });
        }
        let ca = Arc::new(ca);

        let mut session = ProxySession::start(
            config.proxy.clone(),
            ca.clone(),
            self.audit.clone(),
            self.provider.clone(),
        )?;

        let program = resolve_program(&invocation.tool)?;
        info!("Tool binary: {:?}", program);

        let run_dir = tempfile::Builder::new()
            .prefix("proxywrap-")
            .tempdir()
            .map_err(ChildError::RunDir)?;
        let bundle = write_combined_bundle(run_dir.path(), find_host_ca_bundle(), ca.cert_pem())
            .map_err(ChildError::from)?;
        let anchor = write_root_anchor(run_dir.path(), ca.cert_pem()).map_err(ChildError::from)?;

        let env = self
            .base_env
            .clone()
            .with_proxy(session.local_addr())
            .with_trust(&anchor, &bundle);

        let forwarder = match SignalForwarder::install(session.handle()) {
            Ok(forwarder) => Some(forwarder),
            Err(e) => {
                warn!("{}", e);
                None
            }
        };

        let started = Instant::now();
        let mut child = ChildProcess::spawn(&program, &invocation.tool_args, &env)?;
        if let Some(forwarder) = &forwarder {
            forwarder.attach(child.pid);
        }
        self.audit.log(AuditEvent::SessionStart {
            tool: invocation.tool.clone(),
            pid: child.pid,
        });

        let exit = child.wait();
        drop(forwarder);
        let exit = exit?;

        if let ChildExit::Signaled(signal) = exit {
            warn!("Tool was killed by signal {}", signal);
        }
        let code = exit.code_or(EXIT_CHILD_ABNORMAL);
        info!("Tool exited: {:?} (exit code {})", exit, code);

        session.close();
        drop(run_dir);

        self.audit.log(AuditEvent::SessionEnd {
            tool: invocation.tool.clone(),
            exit_code: code,
            duration_sec: started.elapsed().as_secs(),
        });

        Ok(code)
    }
}
