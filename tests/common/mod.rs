//! Local servers and a raw proxy client shared by the integration tests.

#![allow(dead_code)]

use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Body served by [`https_origin`] and [`http_origin`].
pub const ORIGIN_BODY: &str = "hello from origin";

/// HTTPS server for `localhost` with a self-signed certificate.
///
/// Answers every request with [`ORIGIN_BODY`] and closes.
pub async fn https_origin() -> SocketAddr {
    let key = KeyPair::generate().expect("Failed to generate origin key");
    let cert = CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
        .expect("Failed to build origin params")
        .self_signed(&key)
        .expect("Failed to self-sign origin cert");

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
        .expect("Failed to build origin TLS config");
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind origin");
    let addr = listener.local_addr().expect("origin addr");

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut tls) = acceptor.accept(stream).await {
                    let _ = read_head(&mut tls).await;
                    let _ = tls.write_all(ok_response().as_bytes()).await;
                    let _ = tls.shutdown().await;
                }
            });
        }
    });

    addr
}

/// Plain HTTP server. Every received request head is pushed to the returned log.
pub async fn http_origin() -> (SocketAddr, Arc<std::sync::Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind origin");
    let addr = listener.local_addr().expect("origin addr");
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let log = seen.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                log.lock().unwrap().push(head);
                let _ = stream.write_all(ok_response().as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, seen)
}

fn ok_response() -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        ORIGIN_BODY.len(),
        ORIGIN_BODY
    )
}

/// How a [`scripted_upstream`] proxy answers CONNECT.
#[derive(Debug, Clone, Copy)]
pub enum UpstreamScript {
    /// `407` with a Negotiate token, forever.
    AlwaysChallenge,
    /// `407` until a `Proxy-Authorization: Negotiate` header arrives, then tunnel.
    ChallengeOnce,
}

/// A corporate proxy stand-in that tunnels every accepted CONNECT to `origin`.
///
/// Returns its address and a counter of CONNECT requests received.
pub async fn scripted_upstream(script: UpstreamScript, origin: SocketAddr) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_upstream(stream, script, origin, counter.clone()));
        }
    });

    (addr, connects)
}

async fn serve_upstream(
    mut stream: TcpStream,
    script: UpstreamScript,
    origin: SocketAddr,
    connects: Arc<AtomicUsize>,
) {
    loop {
        let head = read_head(&mut stream).await;
        if head.is_empty() {
            return;
        }
        connects.fetch_add(1, Ordering::SeqCst);

        let authorized = head
            .to_ascii_lowercase()
            .contains("proxy-authorization: negotiate ");

        let challenge = match script {
            UpstreamScript::AlwaysChallenge => "Negotiate c2VydmVyLXRva2Vu",
            UpstreamScript::ChallengeOnce if authorized => {
                let Ok(mut destination) = TcpStream::connect(origin).await else {
                    return;
                };
                if stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut destination).await;
                return;
            }
            UpstreamScript::ChallengeOnce => "Negotiate",
        };

        let response = format!(
            "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: {}\r\nContent-Length: 0\r\n\r\n",
            challenge
        );
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// An upstream proxy that accepts connections and never answers.
pub async fn silent_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind upstream");
    let addr = listener.local_addr().expect("upstream addr");

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut sink = [0u8; 1024];
                while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
            });
        }
    });

    addr
}

/// Read one HTTP head, byte by byte so nothing after it is consumed.
///
/// Returns an empty string on EOF before any byte.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Read until EOF or error.
pub async fn read_all<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// CONNECT through `proxy` and complete TLS trusting only `root`.
pub async fn open_tunnel(
    proxy: SocketAddr,
    host: &str,
    port: u16,
    root: &CertificateDer<'static>,
) -> TlsStream<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await.expect("Failed to reach proxy");
    let connect = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n"
    );
    stream
        .write_all(connect.as_bytes())
        .await
        .expect("Failed to send CONNECT");

    let head = read_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected CONNECT reply: {head}");

    let mut roots = RootCertStore::empty();
    roots.add(root.clone()).expect("Failed to add interception root");
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = ServerName::try_from(host.to_string()).expect("invalid server name");
    TlsConnector::from(Arc::new(config))
        .connect(name, stream)
        .await
        .expect("TLS handshake with the proxy failed")
}

/// Send a `GET /` over `stream` and return everything read back.
pub async fn get<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, host: &str) -> String {
    let request = format!("GET / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("Failed to send request");
    read_all(stream).await
}
