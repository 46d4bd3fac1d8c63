//! Proxy request handler.
//!
//! One code path serves plain forward-proxy requests and the decrypted
//! requests coming out of intercepted tunnels: resolve the target, forward
//! upstream, buffer the response (up to a bound), run it through the
//! [`ContentRewriter`] and answer.

use std::convert::Infallible;
use std::error::Error as StdError;
use std::fs;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::{ClientConfig, RootCertStore};
use serde::Serialize;
use tracing::{debug, info, warn};

use graft_core::{
    narrow_accept_encoding, normalize_host, strip_hop_by_hop, strip_proxy_headers,
    ContentRewriter,
};

use crate::error::{ProxyError, Result, UpstreamError};
use crate::proxy::ProxyConfig;
use crate::status::StatusInfo;
use crate::tunnel::{ConnectTarget, Tunnel, TunnelManager};

/// Body type used for every response the proxy produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

type UpstreamClient = Client<HttpsConnector<HttpConnector>, ProxyBody>;

/// Via `received-by` token marking requests this proxy has forwarded.
const VIA_PSEUDONYM: &str = "graft";
const VIA_HOP: &str = "1.1 graft";

type ServiceFuture =
    Pin<Box<dyn Future<Output = std::result::Result<Response<ProxyBody>, Infallible>> + Send>>;

/// Wraps bytes in a [`ProxyBody`].
pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// An empty [`ProxyBody`].
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Serialises `value` as a JSON response.
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    target: &'a str,
    timestamp: String,
}

/// The machine-readable answer for an upstream failure.
pub fn upstream_error_response(err: &UpstreamError) -> Response<ProxyBody> {
    let target = match err {
        UpstreamError::Unreachable { target, .. } => target.as_str(),
        UpstreamError::MalformedTarget(raw) | UpstreamError::LoopDetected(raw) => raw.as_str(),
    };
    let body = ErrorBody {
        error: err.label(),
        message: err.to_string(),
        target,
        timestamp: Utc::now().to_rfc3339(),
    };
    json_response(err.status(), &body)
}

/// Where a request entered the proxy.
#[derive(Debug, Clone)]
pub enum Origin {
    /// A plaintext client connection.
    Direct,
    /// Decrypted from an intercepted tunnel to the given target.
    Intercepted(ConnectTarget),
}

/// The upstream's answer, body not yet read.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Incoming,
}

impl UpstreamResponse {
    /// Declared `content-length`, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Result of reading an upstream body with a size bound.
enum Buffered {
    Complete(Bytes),
    /// The bound was exceeded; `prefix` holds what was read so far.
    Overflow { prefix: Vec<Bytes>, rest: Incoming },
}

struct Inner {
    client: UpstreamClient,
    local_addr: SocketAddr,
    rewriter: ContentRewriter,
    tunnels: TunnelManager,
    status: StatusInfo,
    max_buffered_body: usize,
}

/// Shared request handler. Cheap to clone.
#[derive(Clone)]
pub struct ProxyHandler {
    inner: Arc<Inner>,
}

impl ProxyHandler {
    /// Creates the handler for a proxy listening on `local_addr`.
    pub fn new(
        config: &ProxyConfig,
        local_addr: SocketAddr,
        tunnels: TunnelManager,
        status: StatusInfo,
    ) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(config.connect_timeout()));

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(upstream_tls_config(config)?)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                local_addr,
                rewriter: ContentRewriter::new(config.rewrite_config()),
                tunnels,
                status,
                max_buffered_body: config.max_buffered_body,
            }),
        })
    }

    /// Handles a request from a plaintext client connection.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if has_passed_through(req.headers()) {
            return self.refuse_loop(&req);
        }

        if req.method() == Method::CONNECT {
            return self.handle_connect(req).await;
        }

        if req.uri().scheme().is_none() {
            if let Some(response) = self.inner.status.route(req.method(), req.uri().path()) {
                return response;
            }
        }

        self.forward(req, &Origin::Direct).await
    }

    /// Handles a request decrypted from an intercepted tunnel.
    pub async fn handle_intercepted(
        &self,
        req: Request<Incoming>,
        target: &ConnectTarget,
    ) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            return json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &serde_json::json!({
                    "error": "Method not allowed",
                    "message": "CONNECT inside an intercepted tunnel is not supported",
                }),
            );
        }
        self.forward(req, &Origin::Intercepted(target.clone())).await
    }

    async fn handle_connect(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let Some(target) = ConnectTarget::from_uri(req.uri()) else {
            let err = UpstreamError::MalformedTarget(req.uri().to_string());
            warn!(uri = %req.uri(), "CONNECT without host:port");
            return upstream_error_response(&err);
        };
        if targets_listener(target.host(), target.port(), self.inner.local_addr) {
            return self.refuse_loop(&req);
        }

        let tunnel = match self.inner.tunnels.open(target.clone()).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                let err = UpstreamError::Unreachable {
                    target: target.to_string(),
                    reason: e.to_string(),
                };
                let mut response = upstream_error_response(&err);
                response
                    .headers_mut()
                    .insert(header::CONNECTION, HeaderValue::from_static("close"));
                return response;
            }
        };

        let handler = self.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => handler.run_tunnel(tunnel, upgraded).await,
                Err(e) => warn!(target = %target, error = %e, "CONNECT upgrade failed"),
            }
        });

        let mut response = Response::new(empty());
        response
            .extensions_mut()
            .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
        response
    }

    async fn run_tunnel(&self, tunnel: Tunnel, upgraded: hyper::upgrade::Upgraded) {
        let target = tunnel.target().clone();
        let handler = self.clone();
        let service_target = target.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let target = service_target.clone();
            let fut: ServiceFuture =
                Box::pin(async move { Ok(handler.handle_intercepted(req, &target).await) });
            fut
        });

        if let Err(e) = tunnel.run(upgraded, service).await {
            debug!(target = %target, error = %e, "tunnel ended with error");
        }
    }

    /// Forwards one request upstream and rewrites the answer.
    pub async fn forward(&self, req: Request<Incoming>, origin: &Origin) -> Response<ProxyBody> {
        let started = Instant::now();
        let method = req.method().clone();

        let target = match resolve_target(&req, origin) {
            Ok(target) => target,
            Err(e) => {
                warn!(uri = %req.uri(), error = %e, "rejecting request");
                let response = upstream_error_response(&e);
                access_log(&method, &req.uri().to_string(), response.status(), false, started);
                return response;
            }
        };
        let target_str = target.to_string();
        let host = target.host().map(normalize_host).unwrap_or_default();

        if self.is_listener(&target) {
            let response = self.answer_locally(&method, target.path());
            access_log(&method, &target_str, response.status(), false, started);
            return response;
        }

        let upstream_req = match build_upstream_request(req, &target) {
            Ok(r) => r,
            Err(e) => {
                let response = upstream_error_response(&e);
                access_log(&method, &target_str, response.status(), false, started);
                return response;
            }
        };

        let upstream = match self.inner.client.request(upstream_req).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                UpstreamResponse {
                    status: parts.status,
                    headers: parts.headers,
                    body,
                }
            }
            Err(e) => {
                let err = UpstreamError::Unreachable {
                    target: target_str.clone(),
                    reason: error_chain(&e),
                };
                warn!(error = %err, "upstream request failed");
                let response = upstream_error_response(&err);
                access_log(&method, &target_str, response.status(), false, started);
                return response;
            }
        };

        let (response, injected) = self.respond(upstream, &host, &target_str).await;
        access_log(&method, &target_str, response.status(), injected, started);
        response
    }

    /// True when `target` names this proxy's own listener.
    fn is_listener(&self, target: &Uri) -> bool {
        let Some(host) = target.host() else {
            return false;
        };
        let port = target.port_u16().unwrap_or(match target.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });
        targets_listener(host, port, self.inner.local_addr)
    }

    /// Serves a request addressed to the proxy itself.
    fn answer_locally(&self, method: &Method, path: &str) -> Response<ProxyBody> {
        self.inner.status.route(method, path).unwrap_or_else(|| {
            json_response(
                StatusCode::NOT_FOUND,
                &serde_json::json!({
                    "error": "Not found",
                    "message": format!("{path} is not served by the proxy"),
                }),
            )
        })
    }

    fn refuse_loop<B>(&self, req: &Request<B>) -> Response<ProxyBody> {
        let err = UpstreamError::LoopDetected(req.uri().to_string());
        warn!(uri = %req.uri(), "request loops back through the proxy");
        upstream_error_response(&err)
    }

    /// Buffers, rewrites and packages an upstream response.
    async fn respond(
        &self,
        upstream: UpstreamResponse,
        host: &str,
        target: &str,
    ) -> (Response<ProxyBody>, bool) {
        let limit = self.inner.max_buffered_body;
        let declared_too_large = upstream
            .content_length()
            .map_or(false, |len| len > limit as u64);
        let UpstreamResponse {
            status,
            mut headers,
            body,
        } = upstream;

        let read = if declared_too_large {
            Ok(Buffered::Overflow {
                prefix: Vec::new(),
                rest: body,
            })
        } else {
            buffer_body(body, limit).await
        };
        let buffered = match read {
            Ok(buffered) => buffered,
            Err(e) => {
                let err = UpstreamError::Unreachable {
                    target: target.to_string(),
                    reason: format!("response body failed: {}", error_chain(&e)),
                };
                warn!(error = %err, "upstream body read failed");
                return (upstream_error_response(&err), false);
            }
        };

        match buffered {
            Buffered::Complete(bytes) => {
                let outcome = self.inner.rewriter.rewrite(status, headers, bytes, host);
                if outcome.injected {
                    debug!(target = %target, nonce = ?outcome.nonce, "payload injected");
                }
                let mut response = Response::new(full(outcome.body));
                *response.status_mut() = status;
                *response.headers_mut() = outcome.headers;
                (response, outcome.injected)
            }
            Buffered::Overflow { prefix, rest } => {
                debug!(target = %target, limit, "body exceeds buffer limit, streaming");
                strip_hop_by_hop(&mut headers);
                let prefix = stream::iter(
                    prefix
                        .into_iter()
                        .map(|chunk| Ok::<_, hyper::Error>(Frame::data(chunk))),
                );
                let body = StreamBody::new(prefix.chain(BodyStream::new(rest))).boxed_unsync();
                let mut response = Response::new(body);
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                (response, false)
            }
        }
    }
}

/// Computes the absolute URL a request is addressed to.
///
/// Absolute-form request targets are used as they are; origin-form targets
/// are joined with the `Host` header (or the tunnel target when the request
/// came out of an intercepted tunnel).
pub fn resolve_target<B>(
    req: &Request<B>,
    origin: &Origin,
) -> std::result::Result<Uri, UpstreamError> {
    let uri = req.uri();
    let malformed = || UpstreamError::MalformedTarget(uri.to_string());

    if let Some(scheme) = uri.scheme_str() {
        let supported = scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https");
        if !supported || uri.host().map_or(true, str::is_empty) {
            return Err(malformed());
        }
        return Ok(uri.clone());
    }

    let host_header = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty());

    let (scheme, authority) = match origin {
        Origin::Direct => ("http", host_header.map(str::to_string).ok_or_else(malformed)?),
        Origin::Intercepted(target) => (
            "https",
            host_header
                .map(str::to_string)
                .unwrap_or_else(|| target.authority()),
        ),
    };

    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{scheme}://{authority}{path}")
        .parse::<Uri>()
        .map_err(|_| malformed())
}

/// True when `host:port` reaches the listener bound at `local`.
pub fn targets_listener(host: &str, port: u16, local: SocketAddr) -> bool {
    if port != local.port() {
        return false;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let local_ip = local.ip();
    let listens_on_loopback = local_ip.is_loopback() || local_ip.is_unspecified();

    if host.eq_ignore_ascii_case("localhost") {
        return listens_on_loopback;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => {
            ip == local_ip || ip.is_unspecified() || (ip.is_loopback() && listens_on_loopback)
        }
        Err(_) => false,
    }
}

/// True when a `Via` entry names this proxy as a hop.
pub fn has_passed_through(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::VIA)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|hop| hop.split_whitespace().nth(1))
        .any(|received_by| received_by.eq_ignore_ascii_case(VIA_PSEUDONYM))
}

/// Headers for the outbound request.
pub fn outbound_headers(
    inbound: &HeaderMap,
    target: &Uri,
) -> std::result::Result<HeaderMap, UpstreamError> {
    let mut headers = inbound.clone();
    strip_proxy_headers(&mut headers);
    strip_hop_by_hop(&mut headers);

    let authority = target
        .authority()
        .ok_or_else(|| UpstreamError::MalformedTarget(target.to_string()))?;
    let host = HeaderValue::from_str(authority.as_str())
        .map_err(|_| UpstreamError::MalformedTarget(target.to_string()))?;
    headers.insert(header::HOST, host);
    headers.append(header::VIA, HeaderValue::from_static(VIA_HOP));

    let narrowed = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(narrow_accept_encoding);
    match narrowed {
        Some(Some(value)) => {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(header::ACCEPT_ENCODING, value);
            }
        }
        Some(None) => {
            headers.remove(header::ACCEPT_ENCODING);
        }
        None => {}
    }

    Ok(headers)
}

fn build_upstream_request<B>(
    req: Request<B>,
    target: &Uri,
) -> std::result::Result<Request<ProxyBody>, UpstreamError>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Send + 'static,
{
    let (parts, body) = req.into_parts();
    let mut headers = outbound_headers(&parts.headers, target)?;

    let body = if parts.method == Method::GET || parts.method == Method::HEAD {
        // The client's framing no longer describes the body sent upstream.
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        empty()
    } else {
        body.boxed_unsync()
    };

    let mut upstream = Request::new(body);
    *upstream.method_mut() = parts.method;
    *upstream.uri_mut() = target.clone();
    *upstream.version_mut() = Version::HTTP_11;
    *upstream.headers_mut() = headers;
    Ok(upstream)
}

/// TLS settings for upstream connections: the bundled web roots plus the
/// configured extra CA file, if any.
fn upstream_tls_config(config: &ProxyConfig) -> Result<ClientConfig> {
    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    if let Some(path) = &config.upstream_ca_file {
        let pem = fs::read(path).map_err(|e| {
            ProxyError::Config(format!("cannot read upstream CA {}: {e}", path.display()))
        })?;
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| ProxyError::Tls(e.to_string()))?;
            roots.add(cert).map_err(|e| ProxyError::Tls(e.to_string()))?;
            added += 1;
        }
        if added == 0 {
            return Err(ProxyError::Config(format!(
                "no certificates found in {}",
                path.display()
            )));
        }
        debug!(path = %path.display(), added, "trusting extra upstream roots");
    }

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Reads `body` until it ends or grows past `limit`.
async fn buffer_body(mut body: Incoming, limit: usize) -> std::result::Result<Buffered, hyper::Error> {
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;

    while let Some(frame) = body.frame().await {
        // Trailers are dropped along with the other hop-by-hop metadata.
        if let Ok(data) = frame?.into_data() {
            total += data.len();
            chunks.push(data);
            if total > limit {
                return Ok(Buffered::Overflow {
                    prefix: chunks,
                    rest: body,
                });
            }
        }
    }

    let bytes = match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.pop().unwrap_or_default(),
        _ => {
            let mut buf = BytesMut::with_capacity(total);
            for chunk in chunks {
                buf.extend_from_slice(&chunk);
            }
            buf.freeze()
        }
    };
    Ok(Buffered::Complete(bytes))
}

/// Flattens an error and its sources into one line.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn access_log(method: &Method, target: &str, status: StatusCode, injected: bool, started: Instant) {
    info!(
        method = %method,
        target = %target,
        status = status.as_u16(),
        injected,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "proxied request"
    );
}
