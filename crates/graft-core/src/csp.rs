//! Content-Security-Policy patching.
//!
//! Makes a policy admit one extra inline script identified by a nonce,
//! without widening it any further than that.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};

/// Directives that govern `<script>` elements.
const SCRIPT_DIRECTIVES: &[&str] = &["script-src", "script-src-elem"];

static META_CSP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)<meta\b[^>]*?\bhttp-equiv\s*=\s*["']?content-security-policy["']?[^>]*>"#,
    )
    .expect("valid meta CSP pattern")
});

static CONTENT_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bcontent\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid content pattern")
});

/// Formats the source expression for a nonce.
pub fn nonce_source(nonce: &str) -> String {
    format!("'nonce-{nonce}'")
}

/// Policy used when the response carried none.
pub fn synthesize_policy(nonce: &str) -> String {
    format!(
        "script-src 'self' {}; object-src 'none'; base-uri 'self'",
        nonce_source(nonce)
    )
}

/// Patches a serialized policy so `nonce` is admitted by `script-src`.
///
/// - an existing `script-src` (or `script-src-elem`) gains the nonce once;
/// - a directive that already allows `'unsafe-inline'` is left alone;
/// - a missing `script-src` is added as `script-src 'self' 'nonce-N'`.
pub fn patch_policy(policy: &str, nonce: &str) -> String {
    let source = nonce_source(nonce);
    let mut has_script_src = false;

    let mut directives: Vec<String> = policy
        .split(';')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .map(|directive| {
            let name = directive
                .split_ascii_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase();
            if name == "script-src" {
                has_script_src = true;
            }
            if SCRIPT_DIRECTIVES.contains(&name.as_str()) {
                patch_directive(directive, &source)
            } else {
                directive.to_string()
            }
        })
        .collect();

    if !has_script_src {
        directives.insert(0, format!("script-src 'self' {source}"));
    }

    directives.join("; ")
}

fn patch_directive(directive: &str, source: &str) -> String {
    let mut tokens: Vec<&str> = directive.split_ascii_whitespace().collect();

    let permissive = tokens
        .iter()
        .any(|t| t.eq_ignore_ascii_case("'unsafe-inline'"));
    if permissive || tokens.contains(&source) {
        return directive.to_string();
    }

    // 'none' cannot be combined with other sources.
    tokens.retain(|t| !t.eq_ignore_ascii_case("'none'"));
    tokens.push(source);
    tokens.join(" ")
}

/// Patches every `<meta http-equiv="Content-Security-Policy">` in a document.
pub fn patch_meta_tags<'a>(html: &'a [u8], nonce: &str) -> Cow<'a, [u8]> {
    META_CSP.replace_all(html, |tag: &Captures<'_>| patch_meta_tag(&tag[0], nonce))
}

fn patch_meta_tag(tag: &[u8], nonce: &str) -> Vec<u8> {
    CONTENT_ATTR
        .replace(tag, |attr: &Captures<'_>| {
            let raw = attr
                .get(1)
                .or_else(|| attr.get(2))
                .map(|m| m.as_bytes())
                .unwrap_or_default();
            let policy = unescape_attr(&String::from_utf8_lossy(raw));
            format!("content=\"{}\"", escape_attr(&patch_policy(&policy, nonce))).into_bytes()
        })
        .into_owned()
}

fn unescape_attr(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}
