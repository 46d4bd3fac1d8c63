//! CONNECT tunnels.
//!
//! Every CONNECT is either relayed untouched (passthrough) or terminated
//! with a locally issued certificate so the decrypted requests can be fed
//! back through the regular request handler (intercept). Everything that can
//! fail before the client is told `200 Connection Established` happens in
//! [`TunnelManager::open`]; a tunnel that comes out of it is ready to run.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use graft_core::{normalize_host, DomainSet};

use crate::certs::CertificateStore;
use crate::error::{CertIssuanceError, TunnelError, UpstreamError};

/// Default port for a CONNECT target without one.
const DEFAULT_TLS_PORT: u16 = 443;

/// What happens to a CONNECT tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelDecision {
    /// Relay bytes without looking at them.
    Passthrough,
    /// Terminate TLS and process the requests inside.
    Intercept,
}

/// Lifecycle of one CONNECT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Received,
    PassthroughConnecting,
    InterceptIssuingCert,
    Established,
    Relaying,
    Closed,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::PassthroughConnecting => "passthrough-connecting",
            Self::InterceptIssuingCert => "intercept-issuing-cert",
            Self::Established => "established",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
        }
    }

    /// Returns true if `next` may follow `self`.
    pub fn can_advance_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Received, PassthroughConnecting)
                | (Received, InterceptIssuingCert)
                | (PassthroughConnecting, Established)
                | (InterceptIssuingCert, Established)
                | (Established, Relaying)
                | (Received | PassthroughConnecting | InterceptIssuingCert, Closed)
                | (Established | Relaying, Closed)
        )
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `host:port` a CONNECT asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    host: String,
    port: u16,
}

impl ConnectTarget {
    /// Parses an authority such as `example.com:443` or `[::1]:8443`.
    pub fn parse(authority: &str) -> Result<Self, TunnelError> {
        let invalid = || TunnelError::InvalidTarget(authority.to_string());

        let uri: Uri = authority.parse().map_err(|_| invalid())?;
        Self::from_uri(&uri).ok_or_else(invalid)
    }

    /// Extracts the target from a CONNECT request URI.
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        let authority = uri.authority()?;
        let host = normalize_host(authority.host());
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host,
            port: authority.port_u16().unwrap_or(DEFAULT_TLS_PORT),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Authority to use in absolute URLs for intercepted requests.
    pub fn authority(&self) -> String {
        let host = if self.host.parse::<IpAddr>().map_or(false, |ip| ip.is_ipv6()) {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == DEFAULT_TLS_PORT {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

enum Endpoint {
    Pending,
    Upstream(TcpStream),
    Acceptor(TlsAcceptor),
}

/// A CONNECT tunnel and its lifecycle state.
pub struct Tunnel {
    target: ConnectTarget,
    decision: TunnelDecision,
    state: TunnelState,
    endpoint: Endpoint,
}

impl Tunnel {
    fn new(target: ConnectTarget, decision: TunnelDecision) -> Self {
        Self {
            target,
            decision,
            state: TunnelState::Received,
            endpoint: Endpoint::Pending,
        }
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    pub fn decision(&self) -> TunnelDecision {
        self.decision
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    fn advance(&mut self, next: TunnelState) -> Result<(), TunnelError> {
        if !self.state.can_advance_to(next) {
            return Err(TunnelError::InvalidTransition {
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        debug!(target = %self.target, from = %self.state, to = %next, "tunnel state");
        self.state = next;
        Ok(())
    }

    /// Runs an established tunnel over the upgraded client connection.
    ///
    /// Intercepted tunnels serve HTTP/1.1 over TLS with `service`, so the
    /// requests on one tunnel are handled strictly in order.
    pub async fn run<S, B>(mut self, client: Upgraded, service: S) -> Result<(), TunnelError>
    where
        S: Service<Request<Incoming>, Response = Response<B>>,
        S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
        B: Body + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.advance(TunnelState::Relaying)?;
        let endpoint = std::mem::replace(&mut self.endpoint, Endpoint::Pending);

        let result = match endpoint {
            Endpoint::Upstream(upstream) => relay(client, upstream).await.map(|(up, down)| {
                debug!(target = %self.target, up, down, "passthrough closed");
            }),
            Endpoint::Acceptor(acceptor) => match acceptor.accept(TokioIo::new(client)).await {
                Ok(tls) => http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(TokioIo::new(tls), service)
                    .await
                    .map_err(|e| TunnelError::Io(std::io::Error::other(e))),
                Err(e) => Err(TunnelError::Tls(e.to_string())),
            },
            Endpoint::Pending => Err(TunnelError::InvalidTransition {
                from: TunnelState::Received.as_str(),
                to: TunnelState::Relaying.as_str(),
            }),
        };

        self.advance(TunnelState::Closed)?;
        result
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("target", &self.target)
            .field("decision", &self.decision)
            .field("state", &self.state)
            .finish()
    }
}

/// Decides and prepares CONNECT tunnels.
pub struct TunnelManager {
    intercept_domains: DomainSet,
    store: Option<Arc<CertificateStore>>,
    connect_timeout: Duration,
}

impl TunnelManager {
    pub fn new(
        intercept_domains: DomainSet,
        store: Option<Arc<CertificateStore>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            intercept_domains,
            store,
            connect_timeout,
        }
    }

    /// Intercepts only hosts in the configured set; an empty set means
    /// passthrough for everything.
    pub fn decide(&self, target: &ConnectTarget) -> TunnelDecision {
        if self.intercept_domains.contains_host(target.host()) {
            TunnelDecision::Intercept
        } else {
            TunnelDecision::Passthrough
        }
    }

    /// Connects upstream (passthrough) or obtains a leaf (intercept).
    ///
    /// An error here means no tunnel: the caller answers the CONNECT with
    /// 502 and closes.
    pub async fn open(&self, target: ConnectTarget) -> Result<Tunnel, TunnelError> {
        let decision = self.decide(&target);
        let mut tunnel = Tunnel::new(target, decision);

        let prepared = match decision {
            TunnelDecision::Passthrough => {
                tunnel.advance(TunnelState::PassthroughConnecting)?;
                self.connect(tunnel.target()).await.map(Endpoint::Upstream)
            }
            TunnelDecision::Intercept => {
                tunnel.advance(TunnelState::InterceptIssuingCert)?;
                self.acceptor(tunnel.target()).await.map(Endpoint::Acceptor)
            }
        };

        match prepared {
            Ok(endpoint) => {
                tunnel.endpoint = endpoint;
                tunnel.advance(TunnelState::Established)?;
                info!(target = %tunnel.target, ?decision, "tunnel established");
                Ok(tunnel)
            }
            Err(e) => {
                tunnel.advance(TunnelState::Closed)?;
                warn!(target = %tunnel.target, ?decision, error = %e, "tunnel refused");
                Err(e)
            }
        }
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<TcpStream, TunnelError> {
        let unreachable = |reason: String| UpstreamError::Unreachable {
            target: target.to_string(),
            reason,
        };

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((target.host(), target.port())),
        )
        .await
        .map_err(|_| unreachable(format!("connect timed out after {:?}", self.connect_timeout)))?
        .map_err(|e| unreachable(e.to_string()))?;

        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn acceptor(&self, target: &ConnectTarget) -> Result<TlsAcceptor, TunnelError> {
        let store = self.store.as_ref().ok_or_else(|| {
            TunnelError::Certificate(CertIssuanceError::Generation {
                domain: target.host().to_string(),
                reason: "no certificate store configured".into(),
            })
        })?;

        let record = store.get_or_create_async(target.host()).await?;
        server_acceptor(record.certified_key())
    }
}

impl fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelManager")
            .field("intercept_domains", &self.intercept_domains)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// Serves the one leaf issued for the tunnel regardless of SNI.
#[derive(Debug)]
struct AlwaysResolves(Arc<CertifiedKey>);

impl ResolvesServerCert for AlwaysResolves {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

fn server_acceptor(key: Arc<CertifiedKey>) -> Result<TlsAcceptor, TunnelError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(AlwaysResolves(key)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Relays bytes between the upgraded client connection and `upstream`.
///
/// Bytes the client sent along with the CONNECT request are written
/// upstream before anything else.
pub async fn relay(client: Upgraded, mut upstream: TcpStream) -> Result<(u64, u64), TunnelError> {
    match client.downcast::<TokioIo<TcpStream>>() {
        Ok(parts) => {
            let mut pre_read = 0u64;
            if !parts.read_buf.is_empty() {
                upstream.write_all(&parts.read_buf).await?;
                pre_read = parts.read_buf.len() as u64;
            }
            let mut client = parts.io.into_inner();
            let (up, down) = copy_bidirectional(&mut client, &mut upstream).await?;
            Ok((up + pre_read, down))
        }
        Err(client) => {
            // Pre-read bytes are replayed by the upgraded stream itself.
            let mut client = TokioIo::new(client);
            Ok(copy_bidirectional(&mut client, &mut upstream).await?)
        }
    }
}
