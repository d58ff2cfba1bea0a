//! Loopback proxy server.
//!
//! The server binds `127.0.0.1` on an ephemeral port and serves each
//! accepted connection on its own task with hyper's HTTP/1.1 server:
//! - `CONNECT` requests are intercepted (see [`super::connect`])
//! - Absolute-form requests are forwarded as plain HTTP
//!
//! # Shutdown
//!
//! [`InterceptingProxy::close`] flips a `watch` signal that every task
//! selects on, waits for the accept loop to release the listener, then waits
//! for in-flight tasks to drain. Each task holds the [`ProxyContext`], which
//! owns the only drain sender, so the drain receiver sees the channel close
//! exactly when the last task is gone. Tasks still alive after the grace
//! period are aborted.
//!
//! # Example
//!
//! ```ignore
//! use proxywrap::proxy::{InterceptingProxy, ProxyConfig};
//!
//! let proxy = InterceptingProxy::start(ProxyConfig::default(), ca, audit).await?;
//! println!("listening on 127.0.0.1:{}", proxy.port());
//! proxy.close().await;
//! ```

use super::connect::{error_response, handle_connect, handle_http};
use super::error::ProxyError;
use super::tls;
use super::upstream::{Dialer, UpstreamProxy};
use crate::auth::{AuthMechanism, NegotiateProvider, UpstreamAuthenticator, default_provider};
use crate::ca::CertificateAuthority;
use crate::telemetry::AuditLogger;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Response body type used by every proxy handler.
pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Default bound on connecting to a destination or the upstream proxy.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a tunnel may stay silent in both directions.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default time `close()` waits for in-flight connections.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(2000);

/// Configuration for the intercepting proxy.
///
/// The listen address is not configurable: the proxy always binds the IPv4
/// loopback address on an ephemeral port.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Skip certificate verification towards destinations.
    pub insecure_upstream_tls: bool,
    /// Corporate proxy to reach destinations through.
    pub upstream: Option<UpstreamProxy>,
    /// How to answer `407` challenges from the upstream proxy.
    pub auth_mechanism: AuthMechanism,
    /// Bound on TCP connect, upstream CONNECT and destination TLS handshake.
    pub connect_timeout: Duration,
    /// Tunnels silent in both directions for this long are closed.
    pub idle_timeout: Duration,
    /// How long `close()` waits for in-flight connections.
    pub shutdown_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            insecure_upstream_tls: false,
            upstream: None,
            auth_mechanism: AuthMechanism::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Registry of every task spawned on behalf of the proxy.
#[derive(Default)]
pub(crate) struct TaskSet {
    tasks: Mutex<JoinSet<()>>,
}

impl TaskSet {
    /// Spawn a task that is aborted if it outlives the shutdown grace.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn len(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    fn abort_all(&self) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }
}

/// State shared by the accept loop and every connection task.
pub(crate) struct ProxyContext {
    pub(crate) ca: Arc<CertificateAuthority>,
    pub(crate) dialer: Dialer,
    pub(crate) destination_tls: TlsConnector,
    pub(crate) audit: Arc<AuditLogger>,
    pub(crate) connect_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) tasks: Arc<TaskSet>,
    _drain: mpsc::Sender<()>,
}

/// Resolve once shutdown has been signalled (or the proxy handle is gone).
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

/// A running intercepting proxy.
///
/// Dropping the handle without calling [`close`](Self::close) still signals
/// every task to stop, but does not wait for them.
pub struct InterceptingProxy {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    drain_rx: Mutex<Option<mpsc::Receiver<()>>>,
    tasks: Arc<TaskSet>,
    grace: Duration,
    closed: AtomicBool,
}

impl InterceptingProxy {
    /// Bind the loopback listener and start accepting connections.
    ///
    /// Uses the default [`NegotiateProvider`] for upstream authentication.
    pub async fn start(
        config: ProxyConfig,
        ca: Arc<CertificateAuthority>,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, ProxyError> {
        Self::start_with_provider(config, ca, audit, default_provider()).await
    }

    /// Like [`start`](Self::start) with an explicit Negotiate credential source.
    pub async fn start_with_provider(
        config: ProxyConfig,
        ca: Arc<CertificateAuthority>,
        audit: Arc<AuditLogger>,
        provider: Arc<dyn NegotiateProvider>,
    ) -> Result<Self, ProxyError> {
        let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let dialer = match &config.upstream {
            Some(proxy) => {
                info!(
                    "Routing outbound connections through {} (auth: {})",
                    proxy, config.auth_mechanism
                );
                let auth = UpstreamAuthenticator::new(config.auth_mechanism, proxy, provider);
                Dialer::via_upstream(proxy.clone(), auth, config.connect_timeout, audit.clone())
            }
            None => Dialer::direct(config.connect_timeout, audit.clone()),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = mpsc::channel(1);
        let tasks = Arc::new(TaskSet::default());

        let ctx = Arc::new(ProxyContext {
            ca,
            dialer,
            destination_tls: tls::destination_connector(config.insecure_upstream_tls),
            audit,
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
            shutdown: shutdown_rx,
            tasks: tasks.clone(),
            _drain: drain_tx,
        });

        let accept_task = tokio::spawn(accept_loop(listener, ctx));

        info!("Intercepting proxy listening on {}", local_addr);

        Ok(Self {
            local_addr,
            shutdown_tx,
            accept_task: Mutex::new(Some(accept_task)),
            drain_rx: Mutex::new(Some(drain_rx)),
            tasks,
            grace: config.shutdown_grace,
            closed: AtomicBool::new(false),
        })
    }

    /// The bound listener port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The bound listener address (always loopback).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting, signal in-flight connections, and wait for them.
    ///
    /// Returns once the listener is released and every connection has
    /// finished or the grace period has passed. Only the first call does
    /// anything.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("Closing intercepting proxy on {}", self.local_addr);
        let _ = self.shutdown_tx.send(true);

        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = accept_task
            && let Err(e) = handle.await
        {
            warn!("Proxy accept loop ended abnormally: {}", e);
        }

        let drain_rx = self
            .drain_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut drain_rx) = drain_rx
            && tokio::time::timeout(self.grace, drain_rx.recv())
                .await
                .is_err()
        {
            warn!(
                "{} connection(s) still open after {:?}, forcing close",
                self.tasks.len(),
                self.grace
            );
            self.tasks.abort_all();
        }

        info!("Intercepting proxy on {} closed", self.local_addr);
    }
}

impl Drop for InterceptingProxy {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(true);
            self.tasks.abort_all();
        }
    }
}

impl std::fmt::Debug for InterceptingProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptingProxy")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ProxyContext>) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        spawn_connection_handler(stream, ctx.clone());
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        // Back off so fd exhaustion doesn't spin the loop.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                debug!("Proxy accept loop shutting down");
                break;
            }
        }
    }
}

/// Spawn a task to handle a single connection.
fn spawn_connection_handler(stream: TcpStream, ctx: Arc<ProxyContext>) {
    let tasks = ctx.tasks.clone();
    tasks.spawn(async move {
        let mut shutdown = ctx.shutdown.clone();
        tokio::select! {
            result = handle_connection(stream, ctx.clone()) => {
                if let Err(e) = result {
                    if e.is_disconnect() {
                        debug!("Connection ended: {}", e);
                    } else {
                        warn!("Connection error: {}", e);
                    }
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                debug!("Connection closed by proxy shutdown");
            }
        }
    });
}

/// Handle a single client connection.
async fn handle_connection(stream: TcpStream, ctx: Arc<ProxyContext>) -> Result<(), ProxyError> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        async move { proxy_request(req, ctx).await }
    });

    // Serve HTTP/1.1 with support for upgrades (needed for CONNECT)
    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}

/// Process a single proxy request.
async fn proxy_request(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> Result<Response<ProxyBody>, ProxyError> {
    if req.method() == Method::CONNECT {
        handle_connect(req, ctx).await
    } else if req.uri().scheme().is_some() {
        handle_http(req, ctx).await
    } else {
        Ok(error_response(
            StatusCode::BAD_REQUEST,
            "this is a proxy; send CONNECT or an absolute-form request",
        ))
    }
}
