//! Graft core library.
//!
//! I/O-free building blocks for the injecting proxy: domain sets, content
//! codings, CSP nonce patching, HTML insertion, header hygiene and the
//! [`ContentRewriter`] that ties them together.

pub mod csp;
pub mod domains;
pub mod encoding;
pub mod error;
pub mod headers;
pub mod html;
pub mod nonce;
pub mod rewrite;

pub use domains::{normalize_host, DomainSet};
pub use encoding::{decode_all, narrow_accept_encoding, ContentCoding};
pub use error::{Result, RewriteError};
pub use headers::{strip_hop_by_hop, strip_proxy_headers, HOP_BY_HOP_HEADERS};
pub use nonce::generate_nonce;
pub use rewrite::{
    ContentRewriter, RewriteConfig, RewriteContext, RewriteOutcome, DEFAULT_INJECT_HTML,
    DEFAULT_MAX_DECODED_BODY,
};
