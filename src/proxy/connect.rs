//! Request handling: CONNECT interception and plain HTTP forwarding.
//!
//! A CONNECT is handled in a strict order:
//!
//! 1. Client sends: `CONNECT api.example.com:443 HTTP/1.1`
//! 2. Proxy returns `200` and the connection is upgraded to a raw tunnel
//! 3. TLS is accepted from the client with a leaf issued for the host
//! 4. The destination is reached, directly or through the upstream proxy,
//!    and a verified TLS session is opened to it
//! 5. Decrypted bytes are piped between the two sessions
//!
//! A failure in step 4 is reported to the client as `502`/`504` inside its
//! TLS session. A failure in step 3 (including certificate issuance) just
//! aborts the handshake.

use super::error::ProxyError;
use super::server::{ProxyBody, ProxyContext, wait_for_shutdown};
use super::tls;
use super::tunnel;
use super::upstream::{UpstreamStream, authority};
use crate::telemetry::AuditEvent;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

/// Headers that apply to one hop only and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Handle a CONNECT request.
///
/// Answers `200` right away and runs the interception on a separate task
/// once hyper hands over the upgraded connection.
pub(crate) async fn handle_connect(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let Some(target) = req.uri().authority().map(|a| a.to_string()) else {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            "CONNECT requires a host:port target",
        ));
    };

    let (host, port) = match parse_host_port(&target) {
        Ok(parsed) => parsed,
        Err(e) => return Ok(error_response(StatusCode::BAD_REQUEST, &e.to_string())),
    };

    debug!("CONNECT request to {}:{}", host, port);

    let task_ctx = ctx.clone();
    ctx.tasks.spawn(async move {
        let mut shutdown = task_ctx.shutdown.clone();
        tokio::select! {
            result = intercept(req, &host, port, &task_ctx) => {
                if let Err(e) = result {
                    if e.is_disconnect() {
                        debug!("Tunnel ended for {}:{}: {}", host, port, e);
                    } else {
                        warn!("Tunnel to {}:{} failed: {}", host, port, e);
                    }
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                debug!("Tunnel to {}:{} closed by proxy shutdown", host, port);
            }
        }
    });

    Ok(Response::new(empty_body()))
}

/// Run one intercepted tunnel after the CONNECT upgrade.
async fn intercept(
    req: Request<Incoming>,
    host: &str,
    port: u16,
    ctx: &ProxyContext,
) -> Result<(), ProxyError> {
    let upgraded = hyper::upgrade::on(req)
        .await
        .map_err(|e| ProxyError::UpgradeFailed(e.to_string()))?;

    let acceptor = tls::client_acceptor(ctx.ca.clone(), host);
    let mut client = acceptor
        .accept(TokioIo::new(upgraded))
        .await
        .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))?;

    debug!("TLS established with client for {}:{}", host, port);

    let destination = match open_destination(host, port, ctx).await {
        Ok(destination) => destination,
        Err(e) => {
            ctx.audit.log(AuditEvent::TunnelFailed {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            });
            if let Err(write_err) = write_gateway_error(&mut client, &e).await {
                debug!("Failed to report gateway error to client: {}", write_err);
            }
            return Err(e);
        }
    };

    ctx.audit.log(AuditEvent::TunnelOpen {
        host: host.to_string(),
        port,
        via_upstream: ctx.dialer.is_upstream(),
    });
    info!("Intercepting {}:{}", host, port);

    let stats = tunnel::pipe(client, destination, ctx.idle_timeout).await?;
    debug!(
        "Tunnel closed for {}:{} ({} bytes sent, {} bytes received)",
        host, port, stats.sent, stats.received
    );
    Ok(())
}

async fn open_destination(
    host: &str,
    port: u16,
    ctx: &ProxyContext,
) -> Result<TlsStream<UpstreamStream>, ProxyError> {
    let stream = ctx.dialer.open(host, port).await?;
    let server_name = tls::server_name(host)?;

    let tls = timeout(
        ctx.connect_timeout,
        ctx.destination_tls.connect(server_name, stream),
    )
    .await
    .map_err(|_| ProxyError::Timeout {
        addr: authority(host, port),
    })?
    .map_err(|e| ProxyError::Tls(format!("Destination TLS handshake failed: {}", e)))?;

    debug!("TLS established with destination {}:{}", host, port);
    Ok(tls)
}

/// Status reported to the client for an outbound failure.
fn gateway_status(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Write a minimal HTTP error response on an already intercepted stream.
async fn write_gateway_error<S>(stream: &mut S, err: &ProxyError) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let status = gateway_status(err);
    let body = format!("proxywrap: {}\n", err);
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error"),
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// Parse host:port string from CONNECT authority.
///
/// Examples:
/// - `api.example.com:443` -> ("api.example.com", 443)
/// - `api.example.com` -> ("api.example.com", 443) (default port)
/// - `[::1]:8443` -> ("::1", 8443)
pub(crate) fn parse_host_port(target: &str) -> Result<(String, u16), ProxyError> {
    let invalid = |reason: &str| ProxyError::InvalidConnect(format!("{}: {}", reason, target));

    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => return Err(invalid("unexpected characters after IPv6 literal")),
        }
    } else {
        match target.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (target, None),
        }
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| invalid("invalid port"))?,
        None => 443,
    };
    if port == 0 {
        return Err(invalid("invalid port"));
    }

    Ok((host.to_string(), port))
}

/// Handle a plain HTTP proxy request (absolute-form URI).
///
/// The request is rewritten to origin-form and sent over a stream from the
/// same dialer as tunnels, so an upstream proxy is honoured here too.
pub(crate) async fn handle_http(
    req: Request<Incoming>,
    ctx: Arc<ProxyContext>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let uri = req.uri();
    let Some(host) = uri.host().map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
    else {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            "proxy requests must use an absolute http:// URI",
        ));
    };
    if uri.scheme_str() != Some("http") {
        return Ok(error_response(
            StatusCode::BAD_REQUEST,
            "only http:// URIs can be forwarded; use CONNECT for https",
        ));
    }
    let port = uri.port_u16().unwrap_or(80);

    debug!("HTTP proxy request to {}:{}", host, port);

    let req = match to_origin_form(req, &host, port) {
        Ok(req) => req,
        Err(e) => return Ok(error_response(StatusCode::BAD_REQUEST, &e.to_string())),
    };

    match forward_http_request(req, &host, port, &ctx).await {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!("Forwarding to {}:{} failed: {}", host, port, e);
            Ok(error_response(gateway_status(&e), &e.to_string()))
        }
    }
}

async fn forward_http_request(
    req: Request<Incoming>,
    host: &str,
    port: u16,
    ctx: &ProxyContext,
) -> Result<Response<ProxyBody>, ProxyError> {
    let stream = ctx.dialer.open(host, port).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    ctx.tasks.spawn(async move {
        if let Err(e) = conn.await {
            debug!("Forwarded HTTP connection ended: {}", e);
        }
    });

    let response = timeout(ctx.idle_timeout, sender.send_request(req))
        .await
        .map_err(|_| ProxyError::Timeout {
            addr: authority(host, port),
        })??;

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Ok(Response::from_parts(parts, body.boxed()))
}

/// Rewrite an absolute-form proxy request into origin-form.
fn to_origin_form(
    req: Request<Incoming>,
    host: &str,
    port: u16,
) -> Result<Request<Incoming>, ProxyError> {
    let (mut parts, body) = req.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    parts.uri = path
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

    strip_hop_by_hop(&mut parts.headers);

    if !parts.headers.contains_key(header::HOST) {
        let value = match (port, host.contains(':')) {
            (80, true) => format!("[{}]", host),
            (80, false) => host.to_string(),
            _ => authority(host, port),
        };
        let value = HeaderValue::from_str(&value)
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        parts.headers.insert(header::HOST, value);
    }

    Ok(Request::from_parts(parts, body))
}

/// Remove hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Create an empty response body.
pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a response body with content.
fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

/// Create a plain-text error response.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("proxywrap: {}\n", message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port_with_port() {
        let (host, port) = parse_host_port("api.example.com:443").unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_host_port_default() {
        let (host, port) = parse_host_port("api.example.com").unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_host_port_invalid() {
        assert!(parse_host_port("api.example.com:invalid").is_err());
        assert!(parse_host_port("api.example.com:0").is_err());
        assert!(parse_host_port(":443").is_err());
        assert!(parse_host_port("[::1").is_err());
    }

    #[test]
    fn test_parse_host_port_ipv6() {
        let (host, port) = parse_host_port("[::1]:8443").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 8443);

        let (host, port) = parse_host_port("[::1]").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic abc"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key(header::CONNECTION));
        assert!(!headers.contains_key("x-trace"));
        assert!(!headers.contains_key("proxy-authorization"));
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn test_gateway_status() {
        let timeout = ProxyError::Timeout {
            addr: "a:1".to_string(),
        };
        assert_eq!(gateway_status(&timeout), StatusCode::GATEWAY_TIMEOUT);
        let refused = ProxyError::UpstreamConnect {
            addr: "a:1".to_string(),
            message: "refused".to_string(),
        };
        assert_eq!(gateway_status(&refused), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_write_gateway_error() {
        let (mut ours, mut theirs) = tokio::io::duplex(1024);
        let err = ProxyError::UpstreamConnect {
            addr: "api.example.com:443".to_string(),
            message: "refused".to_string(),
        };

        write_gateway_error(&mut ours, &err).await.unwrap();
        drop(ours);

        let mut text = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut theirs, &mut text)
            .await
            .unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("api.example.com:443"));
    }

    #[test]
    fn test_error_response() {
        let response = error_response(StatusCode::BAD_REQUEST, "bad target");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
