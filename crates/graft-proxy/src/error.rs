//! Error types for the proxy.

use hyper::StatusCode;
use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// Leaf certificate error.
    #[error("certificate error: {0}")]
    Cert(#[from] CertIssuanceError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate CA certificate.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),
}

/// Failure to produce a leaf certificate for an intercepted domain.
///
/// Always fatal for the tunnel that asked; never downgraded to passthrough.
#[derive(Debug, Error)]
pub enum CertIssuanceError {
    #[error("invalid domain for certificate: {0:?}")]
    InvalidDomain(String),

    #[error("failed to generate certificate for {domain}: {reason}")]
    Generation { domain: String, reason: String },

    #[error("failed to persist certificate for {domain}: {source}")]
    Persist {
        domain: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load stored certificate for {domain}: {reason}")]
    Load { domain: String, reason: String },

    #[error("root CA unavailable: {0}")]
    Root(#[from] CaManagerError),

    #[error("certificate task failed: {0}")]
    Task(String),
}

/// Failure to reach or address the upstream origin.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// DNS, connect or TLS failure towards the target.
    #[error("upstream {target} unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    /// The request could not be turned into an absolute target URL.
    #[error("malformed target URL: {0}")]
    MalformedTarget(String),

    /// The request already passed through this proxy.
    #[error("request to {0} loops back through the proxy")]
    LoopDetected(String),
}

/// Failure while setting up or running a CONNECT tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The CONNECT authority was not `host:port`.
    #[error("invalid CONNECT target: {0}")]
    InvalidTarget(String),

    /// Passthrough upstream could not be reached.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Intercept leaf could not be produced.
    #[error(transparent)]
    Certificate(#[from] CertIssuanceError),

    /// Client-facing TLS setup or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Relay or connection I/O failed after establishment.
    #[error("tunnel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A lifecycle step was attempted out of order.
    #[error("invalid tunnel transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

impl UpstreamError {
    /// Status code presented to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unreachable { .. } => StatusCode::BAD_GATEWAY,
            Self::MalformedTarget(_) => StatusCode::BAD_REQUEST,
            Self::LoopDetected(_) => StatusCode::LOOP_DETECTED,
        }
    }

    /// Short label used in the JSON error body.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unreachable { .. } => "Bad gateway",
            Self::MalformedTarget(_) => "Bad request",
            Self::LoopDetected(_) => "Loop detected",
        }
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
