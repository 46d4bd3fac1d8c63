//! Graft Proxy - HTTP/HTTPS forward proxy that injects content into HTML.
//!
//! Plain HTTP requests are forwarded and their HTML responses rewritten by
//! [`graft_core::ContentRewriter`]. CONNECT tunnels are relayed untouched
//! unless the host is in the intercept set, in which case TLS is terminated
//! with a leaf certificate signed by a local root CA and the decrypted
//! requests go through the same rewriting path.
//!
//! ## Features
//!
//! - Generates the root CA on first run, only when interception is enabled
//! - Issues and caches per-domain leaf certificates on demand
//! - Fails closed: a leaf that cannot be issued refuses the CONNECT
//! - Patches Content-Security-Policy so the injected script may run
//!
//! ## Architecture
//!
//! ```text
//! Client Request → ProxyHandler ─┬─ CONNECT → TunnelManager ─┬─ Passthrough → relay
//!                                │                           └─ Intercept → TLS → ProxyHandler
//!                                └─ HTTP → upstream → ContentRewriter → client
//! ```

mod ca;
mod certs;
mod error;
mod handler;
mod proxy;
mod status;
mod tunnel;

pub use ca::{default_cert_dir, CaManager, RootAuthority};
pub use certs::{CertificateRecord, CertificateStore};
pub use error::{
    CaManagerError, CertIssuanceError, ProxyError, Result, TunnelError, UpstreamError,
};
pub use handler::{
    has_passed_through, outbound_headers, resolve_target, targets_listener,
    upstream_error_response, Origin, ProxyBody, ProxyHandler,
};
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer, DEFAULT_CONNECT_TIMEOUT_SECS};
pub use status::{StatusInfo, CA_PATH, HEALTH_PATH};
pub use tunnel::{relay, ConnectTarget, Tunnel, TunnelDecision, TunnelManager, TunnelState};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;
