//! Header hygiene shared by the request and response paths.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};

/// Connection-scoped headers that must never cross a proxy hop.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers addressed to the proxy rather than the origin.
pub const PROXY_REQUEST_HEADERS: &[&str] =
    &["proxy-connection", "proxy-authorization", "proxy-authenticate"];

/// Media types the rewrite pipeline knows how to treat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Html,
    Other,
}

const MEDIA_KINDS: &[(&str, MediaKind)] = &[("text/html", MediaKind::Html)];

/// Classifies a `content-type` value.
pub fn media_kind(content_type: &str) -> MediaKind {
    let content_type = content_type.to_ascii_lowercase();
    MEDIA_KINDS
        .iter()
        .find(|(prefix, _)| content_type.contains(prefix))
        .map(|(_, kind)| *kind)
        .unwrap_or(MediaKind::Other)
}

/// Returns true if the headers declare an HTML body.
pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| media_kind(ct) == MediaKind::Html)
        .unwrap_or(false)
}

/// Removes hop-by-hop headers, including any named by `Connection`.
///
/// Idempotent: once the `Connection` header is gone a second pass finds
/// nothing further to strip.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Removes headers meant for the proxy itself.
pub fn strip_proxy_headers(headers: &mut HeaderMap) {
    for name in PROXY_REQUEST_HEADERS {
        headers.remove(*name);
    }
}

/// Replaces `content-length` with the given length.
pub fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
}
