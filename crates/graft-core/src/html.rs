//! Payload construction and insertion into HTML documents.

use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};

static BODY_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</body\s*>").expect("valid body close pattern"));

static BODY_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<body(?:\s[^>]*)?>").expect("valid body open pattern"));

static HTML_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</html\s*>").expect("valid html close pattern"));

static SCRIPT_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<script\b([^>]*)>").expect("valid script open pattern"));

static NONCE_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\snonce\s*=").expect("valid nonce attribute pattern"));

/// Builds the markup inserted into a page.
///
/// The fragment comes first with the nonce stamped on any `<script>` tags it
/// contains, followed by the script body wrapped in a nonce-bearing tag.
pub fn build_payload(fragment: &str, script: &str, nonce: &str) -> String {
    let mut payload = stamp_nonce(fragment, nonce);
    let script = script.trim();
    if !script.is_empty() {
        payload.push_str(&format!(
            "<script nonce=\"{nonce}\">{}</script>",
            escape_script(script)
        ));
    }
    payload
}

fn stamp_nonce(fragment: &str, nonce: &str) -> String {
    let stamped = SCRIPT_OPEN.replace_all(fragment.as_bytes(), |caps: &Captures<'_>| {
        let attrs = &caps[1];
        if NONCE_ATTR.is_match(attrs) {
            return caps[0].to_vec();
        }
        let mut tag = format!("<script nonce=\"{nonce}\"").into_bytes();
        tag.extend_from_slice(attrs);
        tag.push(b'>');
        tag
    });
    String::from_utf8_lossy(&stamped).into_owned()
}

fn escape_script(script: &str) -> String {
    // Only a closing tag can end the element early.
    script.replace("</script", "<\\/script").replace("</SCRIPT", "<\\/SCRIPT")
}

/// Inserts `payload` into `html`.
///
/// Prefers the position just before the last `</body>`. Documents with an
/// opening `<body>` but no closing tag get the payload appended; documents
/// with no body at all get a `<body>` wrapper before `</html>` (or at the end).
pub fn insert_payload(html: &[u8], payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(html.len() + payload.len() + 16);

    if let Some(close) = BODY_CLOSE.find_iter(html).last() {
        out.extend_from_slice(&html[..close.start()]);
        out.extend_from_slice(payload.as_bytes());
        out.extend_from_slice(&html[close.start()..]);
        return out;
    }

    if BODY_OPEN.is_match(html) {
        out.extend_from_slice(html);
        out.extend_from_slice(payload.as_bytes());
        return out;
    }

    let wrapped = format!("<body>{payload}</body>");
    match HTML_CLOSE.find_iter(html).last() {
        Some(close) => {
            out.extend_from_slice(&html[..close.start()]);
            out.extend_from_slice(wrapped.as_bytes());
            out.extend_from_slice(&html[close.start()..]);
        }
        None => {
            out.extend_from_slice(html);
            out.extend_from_slice(wrapped.as_bytes());
        }
    }
    out
}
