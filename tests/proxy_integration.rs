mod common;

use common::{
    ORIGIN_BODY, UpstreamScript, get, http_origin, https_origin, open_tunnel, read_all,
    scripted_upstream, silent_upstream,
};
use proxywrap::auth::{AuthError, AuthMechanism, MAX_AUTH_ROUNDS, NegotiateContext, NegotiateProvider};
use proxywrap::ca::CertificateAuthority;
use proxywrap::proxy::{InterceptingProxy, ProxyConfig, UpstreamProxy};
use proxywrap::telemetry::AuditLogger;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

/// Hands out the same token every round.
struct FixedTokenProvider;

struct FixedTokenContext;

impl NegotiateProvider for FixedTokenProvider {
    fn start(&self, _service: &str) -> Result<Box<dyn NegotiateContext>, AuthError> {
        Ok(Box::new(FixedTokenContext))
    }
}

impl NegotiateContext for FixedTokenContext {
    fn step(&mut self, _server_token: Option<&[u8]>) -> Result<Option<Vec<u8>>, AuthError> {
        Ok(Some(b"client-token".to_vec()))
    }
}

fn authority() -> (tempfile::TempDir, Arc<CertificateAuthority>) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let ca = CertificateAuthority::ensure_root(dir.path(), "test").expect("Failed to create root");
    (dir, Arc::new(ca))
}

fn insecure_config() -> ProxyConfig {
    ProxyConfig {
        insecure_upstream_tls: true,
        connect_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(10),
        ..ProxyConfig::default()
    }
}

fn via_upstream(upstream: SocketAddr, mechanism: AuthMechanism) -> ProxyConfig {
    ProxyConfig {
        upstream: Some(
            upstream
                .to_string()
                .parse::<UpstreamProxy>()
                .expect("Failed to parse upstream"),
        ),
        auth_mechanism: mechanism,
        ..insecure_config()
    }
}

async fn start(config: ProxyConfig, ca: Arc<CertificateAuthority>) -> InterceptingProxy {
    InterceptingProxy::start_with_provider(
        config,
        ca,
        Arc::new(AuditLogger::new_null()),
        Arc::new(FixedTokenProvider),
    )
    .await
    .expect("Failed to start proxy")
}

#[tokio::test]
async fn test_https_request_is_intercepted() {
    let origin = https_origin().await;
    let (_dir, ca) = authority();
    let proxy = start(insecure_config(), ca.clone()).await;

    let mut tls = open_tunnel(proxy.local_addr(), "localhost", origin.port(), ca.root_der()).await;

    let presented = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first().cloned())
        .expect("proxy presented no certificate");
    assert_ne!(&presented, ca.root_der());

    let response = get(&mut tls, "localhost").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with(ORIGIN_BODY));
    assert_eq!(ca.issued_count(), 1);

    proxy.close().await;
}

#[tokio::test]
async fn test_ip_literal_destination() {
    let origin = https_origin().await;
    let (_dir, ca) = authority();
    let proxy = start(insecure_config(), ca.clone()).await;

    let mut tls = open_tunnel(proxy.local_addr(), "127.0.0.1", origin.port(), ca.root_der()).await;
    let response = get(&mut tls, "127.0.0.1").await;
    assert!(response.ends_with(ORIGIN_BODY));

    proxy.close().await;
}

#[tokio::test]
async fn test_concurrent_tunnels_share_one_leaf() {
    let origin = https_origin().await;
    let (_dir, ca) = authority();
    let proxy = start(insecure_config(), ca.clone()).await;
    let addr = proxy.local_addr();

    let mut clients = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let root = ca.root_der().clone();
        clients.spawn(async move {
            let mut tls = open_tunnel(addr, "localhost", origin.port(), &root).await;
            get(&mut tls, "localhost").await
        });
    }
    while let Some(result) = clients.join_next().await {
        assert!(result.expect("client panicked").ends_with(ORIGIN_BODY));
    }

    assert_eq!(ca.issued_count(), 1);
    proxy.close().await;
}

#[tokio::test]
async fn test_unreachable_destination_reports_502() {
    // Grab a free port and release it so nothing listens there.
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let (_dir, ca) = authority();
    let proxy = start(insecure_config(), ca.clone()).await;

    let mut tls = open_tunnel(proxy.local_addr(), "localhost", closed_port, ca.root_der()).await;
    let response = read_all(&mut tls).await;
    assert!(response.starts_with("HTTP/1.1 502"), "{response}");

    proxy.close().await;
}

#[tokio::test]
async fn test_unresponsive_upstream_reports_504() {
    let upstream = silent_upstream().await;
    let (_dir, ca) = authority();
    let config = ProxyConfig {
        connect_timeout: Duration::from_secs(1),
        ..via_upstream(upstream, AuthMechanism::None)
    };
    let proxy = start(config, ca.clone()).await;

    let started = Instant::now();
    let mut tls = open_tunnel(proxy.local_addr(), "localhost", 443, ca.root_der()).await;
    let response = tokio::time::timeout(Duration::from_secs(5), read_all(&mut tls))
        .await
        .expect("no answer after the connect timeout");

    assert!(response.starts_with("HTTP/1.1 504"), "{response}");
    assert!(started.elapsed() < Duration::from_secs(4));

    proxy.close().await;
}

#[tokio::test]
async fn test_plain_http_is_forwarded() {
    let (origin, seen) = http_origin().await;
    let (_dir, ca) = authority();
    let proxy = start(insecure_config(), ca).await;

    let mut stream = TcpStream::connect(proxy.local_addr()).await.expect("connect");
    let request = format!(
        "GET http://{origin}/status?q=1 HTTP/1.1\r\nHost: {origin}\r\nProxy-Connection: keep-alive\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.expect("write");

    let response = read_all(&mut stream).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with(ORIGIN_BODY));

    let heads = seen.lock().unwrap().clone();
    assert_eq!(heads.len(), 1);
    assert!(heads[0].starts_with("GET /status?q=1 HTTP/1.1\r\n"), "{}", heads[0]);
    assert!(!heads[0].to_ascii_lowercase().contains("proxy-connection"));

    proxy.close().await;
}

#[tokio::test]
async fn test_upstream_407_without_auth_fails_once() {
    let origin = https_origin().await;
    let (upstream, connects) = scripted_upstream(UpstreamScript::AlwaysChallenge, origin).await;
    let (_dir, ca) = authority();
    let proxy = start(via_upstream(upstream, AuthMechanism::None), ca.clone()).await;

    let mut tls = open_tunnel(proxy.local_addr(), "localhost", origin.port(), ca.root_der()).await;
    let response = read_all(&mut tls).await;
    assert!(response.starts_with("HTTP/1.1 502"), "{response}");
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    proxy.close().await;
}

#[tokio::test]
async fn test_upstream_negotiate_then_tunnel() {
    let origin = https_origin().await;
    let (upstream, connects) = scripted_upstream(UpstreamScript::ChallengeOnce, origin).await;
    let (_dir, ca) = authority();
    let proxy = start(via_upstream(upstream, AuthMechanism::Negotiate), ca.clone()).await;

    let mut tls = open_tunnel(proxy.local_addr(), "localhost", origin.port(), ca.root_der()).await;
    let response = get(&mut tls, "localhost").await;
    assert!(response.ends_with(ORIGIN_BODY), "{response}");
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    proxy.close().await;
}

#[tokio::test]
async fn test_endless_challenges_are_bounded() {
    let origin = https_origin().await;
    let (upstream, connects) = scripted_upstream(UpstreamScript::AlwaysChallenge, origin).await;
    let (_dir, ca) = authority();
    let proxy = start(via_upstream(upstream, AuthMechanism::Negotiate), ca.clone()).await;

    let mut tls = open_tunnel(proxy.local_addr(), "localhost", origin.port(), ca.root_der()).await;
    let response = read_all(&mut tls).await;
    assert!(response.starts_with("HTTP/1.1 502"), "{response}");
    assert_eq!(connects.load(Ordering::SeqCst), 1 + MAX_AUTH_ROUNDS);

    proxy.close().await;
}

#[tokio::test]
async fn test_close_drains_idle_tunnel() {
    let origin = https_origin().await;
    let (_dir, ca) = authority();
    let config = ProxyConfig {
        shutdown_grace: Duration::from_millis(500),
        ..insecure_config()
    };
    let proxy = start(config, ca.clone()).await;
    let port = proxy.port();

    // Handshake done, nothing sent: the tunnel task is parked on the client.
    let mut tls = open_tunnel(proxy.local_addr(), "localhost", origin.port(), ca.root_der()).await;

    tokio::time::timeout(Duration::from_secs(5), proxy.close())
        .await
        .expect("close did not return within the grace period");
    assert!(proxy.is_closed());

    let _ = read_all(&mut tls).await;
    TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("listener port still held after close");
}
