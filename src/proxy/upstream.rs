//! Outbound connections: directly or through a corporate proxy.
//!
//! When an upstream proxy is configured, every destination is reached with a
//! `CONNECT` through it. A `407` is handed to the tunnel's [`AuthSession`] and
//! the CONNECT is retried on the same connection with the computed
//! `Proxy-Authorization`, until the proxy accepts or the session gives up.
//!
//! [`AuthSession`]: crate::auth::AuthSession

use super::error::ProxyError;
use crate::auth::{BasicCredentials, UpstreamAuthenticator, challenge};
use crate::telemetry::{AuditEvent, AuditLogger, AuthOutcome};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{HOST, HeaderValue, PROXY_AUTHORIZATION};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

/// Port assumed when the upstream proxy address has none.
pub const DEFAULT_UPSTREAM_PORT: u16 = 80;

/// A byte stream to a destination, direct or tunnelled.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

/// Boxed outbound stream.
pub type UpstreamStream = Box<dyn UpstreamIo>;

/// Address of the corporate proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    /// Host name or IP literal, without brackets.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Basic credentials from the URL userinfo, if present.
    pub credentials: Option<BasicCredentials>,
}

impl UpstreamProxy {
    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        authority(&self.host, self.port)
    }
}

impl FromStr for UpstreamProxy {
    type Err = ProxyError;

    /// Accepts `http://[user:pass@]host[:port]` or a bare `host:port`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ProxyError::InvalidUpstream {
            value: redact_userinfo(value),
            reason: reason.to_string(),
        };

        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty address"));
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{}", trimmed)
        };
        let url = Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;

        if url.scheme() != "http" {
            return Err(invalid("only http:// upstream proxies are supported"));
        }

        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some(BasicCredentials::new(
                percent_decode(url.username()),
                percent_decode(url.password().unwrap_or("")),
            ))
        };

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_UPSTREAM_PORT),
            credentials,
        })
    }
}

impl fmt::Display for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}", self.authority())
    }
}

impl fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credentials", &self.credentials)
            .finish()
    }
}

fn percent_decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

/// Strip `user:pass@` before echoing an address in an error.
fn redact_userinfo(value: &str) -> String {
    match value.rsplit_once('@') {
        Some((prefix, rest)) => match prefix.split_once("://") {
            Some((scheme, _)) => format!("{}://***@{}", scheme, rest),
            None => format!("***@{}", rest),
        },
        None => value.to_string(),
    }
}

/// `host:port` with IPv6 literals bracketed.
pub fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

enum Route {
    Direct,
    Upstream {
        proxy: UpstreamProxy,
        auth: UpstreamAuthenticator,
    },
}

/// Opens outbound streams for tunnels and forwarded requests.
pub struct Dialer {
    route: Route,
    connect_timeout: Duration,
    audit: Arc<AuditLogger>,
}

impl Dialer {
    /// Connect straight to destinations.
    pub fn direct(connect_timeout: Duration, audit: Arc<AuditLogger>) -> Self {
        Self {
            route: Route::Direct,
            connect_timeout,
            audit,
        }
    }

    /// Reach destinations through `proxy`, authenticating with `auth`.
    pub fn via_upstream(
        proxy: UpstreamProxy,
        auth: UpstreamAuthenticator,
        connect_timeout: Duration,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            route: Route::Upstream { proxy, auth },
            connect_timeout,
            audit,
        }
    }

    /// Whether streams go through an upstream proxy.
    pub fn is_upstream(&self) -> bool {
        matches!(self.route, Route::Upstream { .. })
    }

    /// Open a byte stream to `host:port`.
    pub async fn open(&self, host: &str, port: u16) -> Result<UpstreamStream, ProxyError> {
        match &self.route {
            Route::Direct => {
                let stream = self.connect_tcp(host, port).await?;
                Ok(Box::new(stream))
            }
            Route::Upstream { proxy, auth } => self.open_via_proxy(proxy, auth, host, port).await,
        }
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let addr = authority(host, port);
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ProxyError::Timeout { addr: addr.clone() })?
            .map_err(|e| ProxyError::UpstreamConnect {
                addr: addr.clone(),
                message: e.to_string(),
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }
        Ok(stream)
    }

    async fn handshake(&self, proxy: &UpstreamProxy) -> Result<SendRequest<Empty<Bytes>>, ProxyError> {
        let stream = self.connect_tcp(&proxy.host, proxy.port).await?;
        let (sender, conn) = timeout(self.connect_timeout, http1::handshake(TokioIo::new(stream)))
            .await
            .map_err(|_| ProxyError::Timeout {
                addr: proxy.authority(),
            })??;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Upstream proxy connection ended: {}", e);
            }
        });

        Ok(sender)
    }

    async fn open_via_proxy(
        &self,
        proxy: &UpstreamProxy,
        auth: &UpstreamAuthenticator,
        host: &str,
        port: u16,
    ) -> Result<UpstreamStream, ProxyError> {
        let target = authority(host, port);
        let mut session = auth.session();
        let mut authorization: Option<HeaderValue> = None;
        let mut reusable: Option<SendRequest<Empty<Bytes>>> = None;

        loop {
            let mut sender = match reusable.take() {
                Some(sender) => sender,
                None => self.handshake(proxy).await?,
            };
            if sender.ready().await.is_err() {
                debug!("Upstream proxy closed the connection, reconnecting");
                sender = self.handshake(proxy).await?;
            }

            let mut request = Request::builder()
                .method(Method::CONNECT)
                .uri(target.as_str())
                .header(HOST, target.as_str());
            if let Some(value) = &authorization {
                request = request.header(PROXY_AUTHORIZATION, value.clone());
            }
            let request = request
                .body(Empty::<Bytes>::new())
                .map_err(|e| ProxyError::InvalidConnect(e.to_string()))?;

            let response = timeout(self.connect_timeout, sender.send_request(request))
                .await
                .map_err(|_| ProxyError::Timeout {
                    addr: proxy.authority(),
                })??;

            let status = response.status();
            if status.is_success() {
                if session.rounds() > 0 {
                    self.log_auth(&session, AuthOutcome::Accepted);
                }
                let upgraded = hyper::upgrade::on(response)
                    .await
                    .map_err(|e| ProxyError::UpgradeFailed(e.to_string()))?;
                debug!("Upstream proxy {} opened tunnel to {}", proxy, target);
                return Ok(Box::new(TokioIo::new(upgraded)));
            }

            if status != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
                warn!("Upstream proxy {} refused {} with {}", proxy, target, status);
                return Err(ProxyError::UpstreamRefused {
                    target,
                    status: status.as_u16(),
                });
            }

            let challenges = challenge::from_headers(response.headers());
            debug!(
                "Upstream proxy requires authentication for {} (offered: {})",
                target,
                challenge::describe(&challenges)
            );

            // Negotiate is connection-bound, so drain the 407 body and retry on
            // the same connection when the proxy allows it.
            let keep_alive = !closes_connection(response.headers());
            if let Err(e) = response.into_body().collect().await {
                debug!("Failed to drain 407 body: {}", e);
            } else if keep_alive {
                reusable = Some(sender);
            }

            match session.respond(&challenges) {
                Ok(value) => authorization = Some(value),
                Err(e) => {
                    self.log_auth(&session, AuthOutcome::Failed);
                    return Err(ProxyError::UpstreamAuth(e));
                }
            }
        }
    }

    fn log_auth(&self, session: &crate::auth::AuthSession, outcome: AuthOutcome) {
        if outcome == AuthOutcome::Accepted {
            info!(
                "Authenticated to upstream proxy after {} round(s)",
                session.rounds()
            );
        }
        self.audit.log(AuditEvent::UpstreamAuth {
            scheme: session.scheme().unwrap_or("none").to_string(),
            outcome,
            rounds: session.rounds(),
        });
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let route = match &self.route {
            Route::Direct => "direct".to_string(),
            Route::Upstream { proxy, .. } => proxy.to_string(),
        };
        f.debug_struct("Dialer")
            .field("route", &route)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

fn closes_connection(headers: &hyper::HeaderMap) -> bool {
    headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}
