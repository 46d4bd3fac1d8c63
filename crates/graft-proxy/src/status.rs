//! Endpoints the proxy answers itself.
//!
//! Reached by origin-form requests (a browser talking to the proxy
//! directly) and by absolute-form requests naming the proxy's own address.
//! Anything addressed to another host is forwarded as usual.

use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use serde::Serialize;

use graft_core::DomainSet;

use crate::handler::{full, json_response, ProxyBody};

/// Health endpoint path.
pub const HEALTH_PATH: &str = "/proxy-health";
/// Root CA download path.
pub const CA_PATH: &str = "/proxy-ca.pem";

#[derive(Debug, Serialize)]
struct Health<'a> {
    status: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    port: u16,
    supports: [&'static str; 2],
    inject_domains: &'a DomainSet,
    intercept_domains: &'a DomainSet,
    uptime_secs: u64,
    timestamp: String,
}

/// Read-only facts about the running proxy.
#[derive(Debug, Clone)]
pub struct StatusInfo {
    port: u16,
    inject_domains: DomainSet,
    intercept_domains: DomainSet,
    ca_pem: Option<String>,
    started: Instant,
}

impl StatusInfo {
    pub fn new(
        port: u16,
        inject_domains: DomainSet,
        intercept_domains: DomainSet,
        ca_pem: Option<String>,
    ) -> Self {
        Self {
            port,
            inject_domains,
            intercept_domains,
            ca_pem,
            started: Instant::now(),
        }
    }

    /// Answers `method path` if it names a status endpoint.
    pub fn route(&self, method: &Method, path: &str) -> Option<Response<ProxyBody>> {
        if method != Method::GET && method != Method::HEAD {
            return None;
        }
        match path {
            HEALTH_PATH => Some(self.health()),
            CA_PATH => Some(self.ca_certificate()),
            _ => None,
        }
    }

    /// JSON summary of the proxy configuration.
    pub fn health(&self) -> Response<ProxyBody> {
        let health = Health {
            status: "healthy",
            kind: "forward-proxy",
            port: self.port,
            supports: ["http", "https"],
            inject_domains: &self.inject_domains,
            intercept_domains: &self.intercept_domains,
            uptime_secs: self.started.elapsed().as_secs(),
            timestamp: Utc::now().to_rfc3339(),
        };
        json_response(StatusCode::OK, &health)
    }

    /// The root CA in PEM form, or 404 when interception is off.
    pub fn ca_certificate(&self) -> Response<ProxyBody> {
        let Some(pem) = &self.ca_pem else {
            return json_response(
                StatusCode::NOT_FOUND,
                &serde_json::json!({
                    "error": "Not found",
                    "message": "TLS interception is not enabled",
                }),
            );
        };

        let mut response = Response::new(full(Bytes::from(pem.clone())));
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-x509-ca-cert"),
        );
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"graft-ca.pem\""),
        );
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}
