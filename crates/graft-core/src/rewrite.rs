//! The content rewrite pipeline.
//!
//! Turns an upstream response (status, headers, fully buffered body) into the
//! response relayed to the client. No I/O happens here; everything the
//! pipeline needs arrives through [`RewriteConfig`] or the call arguments.

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::csp;
use crate::domains::DomainSet;
use crate::encoding::decode_all;
use crate::headers::{is_html, set_content_length, strip_hop_by_hop};
use crate::html::{build_payload, insert_payload};
use crate::nonce::generate_nonce;

/// Fragment injected when none is configured.
pub const DEFAULT_INJECT_HTML: &str = "<div id=\"graft-banner\" style=\"position:fixed;bottom:0;left:0;right:0;padding:4px 8px;background:#222;color:#fff;font:12px sans-serif;z-index:2147483647\">Served through graft</div>";

/// Default bound on a decoded body.
pub const DEFAULT_MAX_DECODED_BODY: usize = 8 * 1024 * 1024;

/// Rewrite settings, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteConfig {
    /// Hosts whose HTML gets injected. Empty means every host.
    pub inject_domains: DomainSet,
    /// Fragment inserted at the end of `<body>`.
    pub inject_html: String,
    /// Inline script body. Empty means no script tag.
    pub inject_script: String,
    /// Upper bound for a decoded body.
    pub max_decoded_body: usize,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            inject_domains: DomainSet::new(),
            inject_html: DEFAULT_INJECT_HTML.to_string(),
            inject_script: String::new(),
            max_decoded_body: DEFAULT_MAX_DECODED_BODY,
        }
    }
}

/// State derived for one response before injection.
#[derive(Debug)]
pub struct RewriteContext {
    /// Decoded body.
    pub body: Vec<u8>,
    /// Nonce authorising the injected script.
    pub nonce: String,
    /// Whether this response is eligible for injection.
    pub inject: bool,
}

/// Result of running the pipeline on one response.
#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub headers: HeaderMap,
    pub body: Bytes,
    /// True when `content-encoding` was undone and removed.
    pub encoding_removed: bool,
    /// True when the payload was inserted.
    pub injected: bool,
    /// Nonce used for the injected script, if any.
    pub nonce: Option<String>,
}

/// Applies decoding, injection and header fixups to upstream responses.
#[derive(Debug, Clone)]
pub struct ContentRewriter {
    config: RewriteConfig,
}

impl ContentRewriter {
    pub fn new(config: RewriteConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RewriteConfig {
        &self.config
    }

    /// Returns true if HTML from `host` should be injected.
    pub fn should_inject(&self, host: &str) -> bool {
        self.has_payload() && self.config.inject_domains.matches_or_empty(host)
    }

    fn has_payload(&self) -> bool {
        !self.config.inject_html.trim().is_empty() || !self.config.inject_script.trim().is_empty()
    }

    /// Runs the pipeline.
    pub fn rewrite(
        &self,
        status: StatusCode,
        mut headers: HeaderMap,
        body: Bytes,
        target_host: &str,
    ) -> RewriteOutcome {
        let (decoded, decode_failed) = self.decode(&headers, &body);

        let bodyless = status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED;
        let current_len = decoded.as_ref().map_or(body.len(), Vec::len);
        let inject = is_html(&headers)
            && !decode_failed
            && !bodyless
            && current_len > 0
            && self.should_inject(target_host);

        let encoding_removed = decoded.is_some();
        let mut injected = false;
        let mut nonce = None;

        let final_body = if inject {
            let ctx = RewriteContext {
                body: decoded.unwrap_or_else(|| body.to_vec()),
                nonce: generate_nonce(),
                inject,
            };
            let out = self.inject(&mut headers, &ctx);
            debug!(host = %target_host, bytes = out.len(), "injected payload");
            injected = true;
            nonce = Some(ctx.nonce);
            Bytes::from(out)
        } else {
            match decoded {
                Some(decoded) => Bytes::from(decoded),
                None => body,
            }
        };

        if encoding_removed || injected {
            headers.remove(header::CONTENT_ENCODING);
            set_content_length(&mut headers, final_body.len());
        }
        strip_hop_by_hop(&mut headers);

        RewriteOutcome {
            headers,
            body: final_body,
            encoding_removed,
            injected,
            nonce,
        }
    }

    /// Undoes any declared content-coding.
    ///
    /// Returns the decoded body (if decoding happened) and whether decoding
    /// was attempted and failed.
    fn decode(&self, headers: &HeaderMap, body: &[u8]) -> (Option<Vec<u8>>, bool) {
        let Some(value) = headers.get(header::CONTENT_ENCODING) else {
            return (None, false);
        };
        if body.is_empty() {
            return (None, false);
        }

        let Ok(value) = value.to_str() else {
            warn!("content-encoding is not valid ASCII, passing body through");
            return (None, true);
        };

        match decode_all(body, value, self.config.max_decoded_body) {
            Ok(decoded) => (Some(decoded), false),
            Err(e) => {
                warn!(encoding = %value, error = %e, "passing encoded body through untouched");
                (None, true)
            }
        }
    }

    fn inject(&self, headers: &mut HeaderMap, ctx: &RewriteContext) -> Vec<u8> {
        let payload = build_payload(
            &self.config.inject_html,
            &self.config.inject_script,
            &ctx.nonce,
        );
        let patched = csp::patch_meta_tags(&ctx.body, &ctx.nonce);
        let out = insert_payload(&patched, &payload);

        patch_csp_headers(headers, &ctx.nonce);
        out
    }
}

/// Patches every CSP header, or adds one when the response has none.
fn patch_csp_headers(headers: &mut HeaderMap, nonce: &str) {
    let existing: Vec<String> = headers
        .get_all(header::CONTENT_SECURITY_POLICY)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .collect();

    let policies = if existing.is_empty() {
        vec![csp::synthesize_policy(nonce)]
    } else {
        existing
            .iter()
            .map(|policy| csp::patch_policy(policy, nonce))
            .collect()
    };

    headers.remove(header::CONTENT_SECURITY_POLICY);
    for policy in policies {
        match HeaderValue::from_str(&policy) {
            Ok(value) => {
                headers.append(header::CONTENT_SECURITY_POLICY, value);
            }
            Err(e) => warn!(error = %e, "dropping unrepresentable CSP header"),
        }
    }
}
