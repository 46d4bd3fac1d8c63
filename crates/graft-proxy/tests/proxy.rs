//! End-to-end tests against a running proxy on a loopback port.

use std::convert::Infallible;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use graft_core::DomainSet;
use graft_proxy::{CaManager, CertificateStore, ProxyConfig, ProxyHandle, ProxyServer};

type Handler = fn(&Request<Incoming>) -> Response<Full<Bytes>>;

async fn spawn_upstream(handler: Handler) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    Ok::<_, Infallible>(handler(&req))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// Upstream that answers every request with the request body it received.
async fn spawn_body_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let body = req.into_body().collect().await?.to_bytes();
                    Ok::<_, hyper::Error>(
                        Response::builder()
                            .header("content-type", "application/octet-stream")
                            .body(Full::new(body))
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// Upstream that reads one request head and sends it back as the body.
async fn spawn_head_capture() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if stream.read_exact(&mut byte).await.is_err() {
                        return;
                    }
                    head.push(byte[0]);
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    head.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.write_all(&head).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// HTTPS upstream for `localhost`, with a leaf issued from `dir`'s own CA.
async fn spawn_tls_upstream(dir: &TempDir, handler: Handler) -> SocketAddr {
    let store = CertificateStore::open(dir.path()).unwrap();
    let record = store.get_or_create("localhost").unwrap();
    let certs = rustls_pemfile::certs(&mut record.cert_pem().as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut record.key_pem().as_bytes())
        .unwrap()
        .unwrap();

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let server_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let service = service_fn(move |req: Request<Incoming>| async move {
                    Ok::<_, Infallible>(handler(&req))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });
    addr
}

async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn html_page(_req: &Request<Incoming>) -> Response<Full<Bytes>> {
    Response::builder()
        .header("content-type", "text/html; charset=utf-8")
        .header("content-security-policy", "script-src 'self'")
        .body(Full::new(Bytes::from_static(
            b"<html><head></head><body><p>hello</p></body></html>",
        )))
        .unwrap()
}

fn large_page(_req: &Request<Incoming>) -> Response<Full<Bytes>> {
    let body = format!("<html><body>{}</body></html>", "x".repeat(200));
    Response::builder()
        .header("content-type", "text/html")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn header_names(req: &Request<Incoming>) -> Response<Full<Bytes>> {
    let names: Vec<&str> = req.headers().keys().map(|k| k.as_str()).collect();
    Response::builder()
        .header("content-type", "text/plain")
        .body(Full::new(Bytes::from(names.join("\n"))))
        .unwrap()
}

fn config(dir: &TempDir) -> ProxyConfig {
    ProxyConfig::default()
        .with_port(0)
        .with_cert_dir(dir.path())
        .with_inject_html("<b id=\"graft\">injected</b>")
        .with_inject_script("window.grafted = true;")
}

async fn start(config: ProxyConfig) -> ProxyHandle {
    ProxyServer::new(config).unwrap().start().await.unwrap()
}

/// Reads until the peer closes (or errors) and splits head from body.
async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    split_head(&buf)
}

fn split_head(buf: &[u8]) -> (String, Vec<u8>) {
    let end = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head");
    let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
    (head, buf[end + 4..].to_vec())
}

async fn get(proxy: SocketAddr, url: &str, host: &str, extra: &str) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request =
        format!("GET {url} HTTP/1.1\r\nHost: {host}\r\n{extra}Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    read_response(&mut stream).await
}

/// Opens a CONNECT tunnel to `authority` and completes TLS trusting the
/// proxy's root CA under `dir`.
async fn connect_intercepted(
    proxy: SocketAddr,
    dir: &TempDir,
    authority: &str,
) -> TlsStream<TcpStream> {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    assert!(head.starts_with(b"HTTP/1.1 200"));

    let ca_path = CaManager::new(dir.path()).cert_path();
    let pem = std::fs::read(&ca_path).unwrap();
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut BufReader::new(pem.as_slice())) {
        roots.add(cert.unwrap()).unwrap();
    }
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let client_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::try_from("localhost").unwrap();
    connector.connect(server_name, stream).await.unwrap()
}

#[tokio::test]
async fn html_is_injected_with_csp_nonce() {
    let dir = TempDir::new().unwrap();
    let upstream = spawn_upstream(html_page).await;
    let proxy = start(config(&dir)).await;

    let url = format!("http://{upstream}/");
    let (head, body) = get(proxy.addr(), &url, &upstream.to_string(), "").await;
    let body = String::from_utf8(body).unwrap();

    assert!(head.starts_with("http/1.1 200"), "{head}");
    assert!(head.contains("content-security-policy: script-src 'self' 'nonce-"));

    let fragment = body.find("<b id=\"graft\">injected</b>").unwrap();
    let script = body.find("window.grafted = true;</script>").unwrap();
    let close = body.rfind("</body>").unwrap();
    assert!(fragment < script && script < close);
    assert!(body.contains("<script nonce=\""));
    assert!(head.contains(&format!("content-length: {}", body.len())));

    proxy.stop().await;
}

#[tokio::test]
async fn non_matching_host_is_forwarded_untouched() {
    let dir = TempDir::new().unwrap();
    let upstream = spawn_upstream(html_page).await;
    let config = config(&dir).with_inject_domains(DomainSet::parse_list("example.com"));
    let proxy = start(config).await;

    let url = format!("http://{upstream}/");
    let (head, body) = get(proxy.addr(), &url, &upstream.to_string(), "").await;

    assert!(head.starts_with("http/1.1 200"));
    assert_eq!(body, b"<html><head></head><body><p>hello</p></body></html>");
    assert!(head.contains("content-security-policy: script-src 'self'"));
    assert!(!head.contains("'nonce-"));

    proxy.stop().await;
}

#[tokio::test]
async fn proxy_headers_are_not_forwarded() {
    let dir = TempDir::new().unwrap();
    let upstream = spawn_upstream(header_names).await;
    let proxy = start(config(&dir)).await;

    let (_, body) = get(
        proxy.addr(),
        &format!("http://{upstream}/"),
        &upstream.to_string(),
        "Proxy-Connection: keep-alive\r\nProxy-Authorization: Basic eDp5\r\nX-Kept: 1\r\n",
    )
    .await;
    let names = String::from_utf8(body).unwrap();

    assert!(names.contains("x-kept"));
    assert!(names.contains("host"));
    assert!(!names.contains("proxy-"));

    proxy.stop().await;
}

#[tokio::test]
async fn oversized_body_is_streamed_unmodified() {
    let dir = TempDir::new().unwrap();
    let upstream = spawn_upstream(large_page).await;
    let proxy = start(config(&dir).with_max_buffered_body(64)).await;

    let url = format!("http://{upstream}/");
    let (head, body) = get(proxy.addr(), &url, &upstream.to_string(), "").await;
    let body = String::from_utf8(body).unwrap();

    assert!(head.starts_with("http/1.1 200"));
    assert!(body.contains(&"x".repeat(200)));
    assert!(!body.contains("injected"));

    proxy.stop().await;
}

#[tokio::test]
async fn unreachable_upstream_is_502_json() {
    let dir = TempDir::new().unwrap();
    let port = closed_port().await;
    let proxy = start(config(&dir)).await;

    let url = format!("http://127.0.0.1:{port}/");
    let (head, body) = get(proxy.addr(), &url, &format!("127.0.0.1:{port}"), "").await;

    assert!(head.starts_with("http/1.1 502"), "{head}");
    assert!(head.contains("content-type: application/json"));
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "Bad gateway");
    assert_eq!(json["target"], url);

    proxy.stop().await;
}

#[tokio::test]
async fn health_endpoint_answers_locally() {
    let dir = TempDir::new().unwrap();
    let proxy = start(config(&dir)).await;

    let (head, body) = get(proxy.addr(), "/proxy-health", &proxy.addr().to_string(), "").await;

    assert!(head.starts_with("http/1.1 200"));
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["port"], proxy.addr().port());

    proxy.stop().await;
}

#[tokio::test]
async fn passthrough_relays_bytes_sent_with_connect() {
    let dir = TempDir::new().unwrap();
    let echo = spawn_echo().await;
    let proxy = start(config(&dir)).await;

    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\nPING");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "proxy closed before answering");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    let mut echoed = buf[head_end..].to_vec();
    while echoed.len() < 4 {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0);
        echoed.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(&echoed[..4], b"PING");

    let payload: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
    stream.write_all(&payload).await.unwrap();
    let mut back = vec![0u8; payload.len()];
    stream.read_exact(&mut back).await.unwrap();
    assert_eq!(back, payload);

    proxy.stop().await;
}

#[tokio::test]
async fn connect_to_closed_port_is_refused() {
    let dir = TempDir::new().unwrap();
    let port = closed_port().await;
    let proxy = start(config(&dir)).await;

    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let request = format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("http/1.1 502"), "{head}");
    assert!(head.contains("connection: close"));
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "Bad gateway");

    proxy.stop().await;
}

#[tokio::test]
async fn intercepted_tunnel_serves_leaf_signed_by_root() {
    let dir = TempDir::new().unwrap();
    let port = closed_port().await;
    let config = config(&dir).with_intercept_domains(DomainSet::parse_list("localhost"));
    let proxy = start(config).await;

    let mut tls = connect_intercepted(proxy.addr(), &dir, &format!("localhost:{port}")).await;

    let request = format!("GET / HTTP/1.1\r\nHost: localhost:{port}\r\nConnection: close\r\n\r\n");
    tls.write_all(request.as_bytes()).await.unwrap();
    let (head, body) = read_response(&mut tls).await;

    // The origin itself is down, so the decrypted request ends in a 502.
    assert!(head.starts_with("http/1.1 502"), "{head}");
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["target"], format!("https://localhost:{port}/"));

    assert!(dir.path().join("domains").join("localhost.crt").exists());

    proxy.stop().await;
}

#[tokio::test]
async fn intercepted_html_is_injected() {
    let dir = TempDir::new().unwrap();
    let upstream_dir = TempDir::new().unwrap();
    let upstream = spawn_tls_upstream(&upstream_dir, html_page).await;
    let config = config(&dir)
        .with_intercept_domains(DomainSet::parse_list("localhost"))
        .with_upstream_ca_file(CaManager::new(upstream_dir.path()).cert_path());
    let proxy = start(config).await;

    let authority = format!("localhost:{}", upstream.port());
    let mut tls = connect_intercepted(proxy.addr(), &dir, &authority).await;
    let request = format!("GET / HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\n\r\n");
    tls.write_all(request.as_bytes()).await.unwrap();
    let (head, body) = read_response(&mut tls).await;
    let body = String::from_utf8(body).unwrap();

    assert!(head.starts_with("http/1.1 200"), "{head}");
    assert!(head.contains("content-security-policy: script-src 'self' 'nonce-"));
    assert!(body.contains("<b id=\"graft\">injected</b>"));
    assert!(body.contains("window.grafted = true;</script>"));

    proxy.stop().await;
}

#[tokio::test]
async fn post_body_is_streamed_byte_for_byte() {
    let dir = TempDir::new().unwrap();
    let upstream = spawn_body_echo().await;
    let proxy = start(config(&dir)).await;

    let payload: Vec<u8> = (0..=255u8).cycle().take(256 * 1024).collect();
    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let head = format!(
        "POST http://{upstream}/upload HTTP/1.1\r\nHost: {upstream}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        payload.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(&payload).await.unwrap();

    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("http/1.1 200"), "{head}");
    assert_eq!(body.len(), payload.len());
    assert!(body == payload);

    proxy.stop().await;
}

#[tokio::test]
async fn chunked_post_body_reaches_upstream_whole() {
    let dir = TempDir::new().unwrap();
    let upstream = spawn_body_echo().await;
    let proxy = start(config(&dir)).await;

    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let request = format!(
        "POST http://{upstream}/ HTTP/1.1\r\nHost: {upstream}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("http/1.1 200"), "{head}");
    assert_eq!(body, b"hello world");

    proxy.stop().await;
}

#[tokio::test]
async fn get_body_and_its_length_are_not_forwarded() {
    let dir = TempDir::new().unwrap();
    let upstream = spawn_head_capture().await;
    let proxy = start(config(&dir)).await;

    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let request = format!(
        "GET http://{upstream}/ HTTP/1.1\r\nHost: {upstream}\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let (head, body) = tokio::time::timeout(Duration::from_secs(5), read_response(&mut stream))
        .await
        .expect("proxy answered");
    assert!(head.starts_with("http/1.1 200"), "{head}");

    let forwarded = String::from_utf8(body).unwrap().to_lowercase();
    assert!(forwarded.starts_with("get / http/1.1"), "{forwarded}");
    assert!(!forwarded.contains("content-length"), "{forwarded}");
    assert!(!forwarded.contains("hello"));
    assert!(forwarded.contains("via: 1.1 graft"));

    proxy.stop().await;
}

#[tokio::test]
async fn origin_form_request_for_the_proxy_is_answered_locally() {
    let dir = TempDir::new().unwrap();
    let proxy = start(config(&dir)).await;

    let host = proxy.addr().to_string();
    let (head, body) = tokio::time::timeout(
        Duration::from_secs(5),
        get(proxy.addr(), "/", &host, ""),
    )
    .await
    .expect("request did not loop");

    assert!(head.starts_with("http/1.1 404"), "{head}");
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "Not found");

    let localhost = format!("localhost:{}", proxy.addr().port());
    let (head, _) = tokio::time::timeout(
        Duration::from_secs(5),
        get(proxy.addr(), "/index.html", &localhost, ""),
    )
    .await
    .expect("request did not loop");
    assert!(head.starts_with("http/1.1 404"), "{head}");

    proxy.stop().await;
}

#[tokio::test]
async fn absolute_request_for_the_proxy_serves_status() {
    let dir = TempDir::new().unwrap();
    let proxy = start(config(&dir)).await;

    let url = format!("http://{}/proxy-health", proxy.addr());
    let (head, body) = get(proxy.addr(), &url, &proxy.addr().to_string(), "").await;

    assert!(head.starts_with("http/1.1 200"), "{head}");
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");

    proxy.stop().await;
}

#[tokio::test]
async fn request_that_already_passed_through_is_refused() {
    let dir = TempDir::new().unwrap();
    let upstream = spawn_upstream(html_page).await;
    let proxy = start(config(&dir)).await;

    let url = format!("http://{upstream}/");
    let (head, body) = get(
        proxy.addr(),
        &url,
        &upstream.to_string(),
        "Via: 1.1 graft\r\n",
    )
    .await;

    assert!(head.starts_with("http/1.1 508"), "{head}");
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"], "Loop detected");

    proxy.stop().await;
}

#[tokio::test]
async fn connect_to_the_proxy_itself_is_refused() {
    let dir = TempDir::new().unwrap();
    let proxy = start(config(&dir)).await;

    let authority = proxy.addr().to_string();
    let mut stream = TcpStream::connect(proxy.addr()).await.unwrap();
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let (head, _) = tokio::time::timeout(Duration::from_secs(5), read_response(&mut stream))
        .await
        .expect("proxy answered");
    assert!(head.starts_with("http/1.1 508"), "{head}");

    proxy.stop().await;
}
