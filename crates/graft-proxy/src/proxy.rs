//! Proxy server.
//!
//! Binds the listener, owns the accept loop and hands every client
//! connection to a [`ProxyHandler`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use graft_core::{DomainSet, RewriteConfig, DEFAULT_INJECT_HTML, DEFAULT_MAX_DECODED_BODY};

use crate::ca::{default_cert_dir, CaManager};
use crate::certs::CertificateStore;
use crate::error::{ProxyError, Result};
use crate::handler::ProxyHandler;
use crate::status::StatusInfo;
use crate::tunnel::TunnelManager;
use crate::DEFAULT_PROXY_PORT;

/// Default upstream connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Proxy server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address to bind the proxy to.
    pub addr: SocketAddr,
    /// Hosts whose HTML is injected. Empty means all hosts.
    pub inject_domains: DomainSet,
    /// Hosts whose CONNECT tunnels are intercepted. Empty means none.
    pub intercept_domains: DomainSet,
    /// Fragment inserted before `</body>`.
    pub inject_html: String,
    /// Inline script body. Empty means no script.
    pub inject_script: String,
    /// Root CA and leaf certificate directory.
    pub cert_dir: PathBuf,
    /// Largest response body buffered for rewriting.
    pub max_buffered_body: usize,
    /// Upstream connect timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// Extra PEM roots trusted for upstream TLS, next to the web roots.
    pub upstream_ca_file: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PROXY_PORT)),
            inject_domains: DomainSet::new(),
            intercept_domains: DomainSet::new(),
            inject_html: DEFAULT_INJECT_HTML.to_string(),
            inject_script: String::new(),
            cert_dir: default_cert_dir().unwrap_or_else(|| PathBuf::from("certs")),
            max_buffered_body: DEFAULT_MAX_DECODED_BODY,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            upstream_ca_file: None,
        }
    }
}

impl ProxyConfig {
    /// Creates a new configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Sets the port (uses 127.0.0.1 as host).
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr = SocketAddr::from(([127, 0, 0, 1], port));
        self
    }

    pub fn with_inject_domains(mut self, domains: DomainSet) -> Self {
        self.inject_domains = domains;
        self
    }

    pub fn with_intercept_domains(mut self, domains: DomainSet) -> Self {
        self.intercept_domains = domains;
        self
    }

    pub fn with_inject_html(mut self, html: impl Into<String>) -> Self {
        self.inject_html = html.into();
        self
    }

    pub fn with_inject_script(mut self, script: impl Into<String>) -> Self {
        self.inject_script = script.into();
        self
    }

    pub fn with_cert_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cert_dir = dir.into();
        self
    }

    pub fn with_max_buffered_body(mut self, bytes: usize) -> Self {
        self.max_buffered_body = bytes;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_upstream_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.upstream_ca_file = Some(path.into());
        self
    }

    /// Upstream connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Settings for the rewrite pipeline.
    pub fn rewrite_config(&self) -> RewriteConfig {
        RewriteConfig {
            inject_domains: self.inject_domains.clone(),
            inject_html: self.inject_html.clone(),
            inject_script: self.inject_script.clone(),
            max_decoded_body: self.max_buffered_body,
        }
    }

    /// Rejects settings the proxy cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffered_body == 0 {
            return Err(ProxyError::Config(
                "max_buffered_body must be greater than zero".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ProxyError::Config(
                "connect timeout must be at least one second".into(),
            ));
        }
        Ok(())
    }
}

/// The injecting forward proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    store: Option<Arc<CertificateStore>>,
}

impl ProxyServer {
    /// Creates a new proxy server with the given configuration.
    ///
    /// The root CA is only loaded (or generated) when interception is
    /// configured.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let store = if config.intercept_domains.is_empty() {
            None
        } else {
            Some(Arc::new(CertificateStore::open(&config.cert_dir)?))
        };

        Ok(Self { config, store })
    }

    /// Creates a proxy server with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ProxyConfig::default())
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Returns the CA certificate path for user installation.
    pub fn ca_cert_path(&self) -> PathBuf {
        CaManager::new(&self.config.cert_dir).cert_path()
    }

    /// Returns true if some CONNECT tunnels will be intercepted.
    pub fn intercepts(&self) -> bool {
        self.store.is_some()
    }

    /// Binds the listener and serves in the background.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(self.config.addr).await?;
        let addr = listener.local_addr()?;

        let tunnels = TunnelManager::new(
            self.config.intercept_domains.clone(),
            self.store.clone(),
            self.config.connect_timeout(),
        );
        let status = StatusInfo::new(
            addr.port(),
            self.config.inject_domains.clone(),
            self.config.intercept_domains.clone(),
            self.store.as_ref().map(|s| s.ca_cert_pem().to_string()),
        );
        let handler = ProxyHandler::new(&self.config, addr, tunnels, status)?;

        info!("Starting graft proxy on {}", addr);
        info!(
            inject = %display_set(&self.config.inject_domains, "all hosts"),
            intercept = %display_set(&self.config.intercept_domains, "none"),
            "Domain configuration"
        );
        if self.store.is_some() {
            info!("CA certificate: {:?}", self.ca_cert_path());
        }

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let handler = handler.clone();
                            tokio::spawn(serve_client(stream, peer, handler));
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        info!("Proxy shutdown signal received");
                        break;
                    }
                }
            }
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }

    /// Serves until the task ends.
    pub async fn run(self) -> Result<()> {
        let handle = self.start().await?;
        handle.wait().await;
        info!("Proxy server stopped");
        Ok(())
    }
}

fn display_set(set: &DomainSet, empty: &str) -> String {
    if set.is_empty() {
        empty.to_string()
    } else {
        set.to_string()
    }
}

async fn serve_client(stream: TcpStream, peer: SocketAddr, handler: ProxyHandler) {
    let _ = stream.set_nodelay(true);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!(%peer, error = %e, "client connection ended with error");
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
