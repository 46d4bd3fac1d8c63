//! Content-coding table.
//!
//! Maps `content-encoding` tokens to decoders. Stacked codings are applied
//! left-to-right by the origin, so they are undone right-to-left here.

use std::io::{self, Read};

use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};

use crate::error::{Result, RewriteError};

/// A content-coding the pipeline knows how to undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentCoding {
    /// No transformation.
    Identity,
    /// RFC 1952 gzip (also `x-gzip`).
    Gzip,
    /// zlib-wrapped DEFLATE, with raw DEFLATE accepted as a fallback.
    Deflate,
    /// RFC 7932 brotli.
    Brotli,
}

type Decoder = fn(&[u8], usize) -> io::Result<Vec<u8>>;

/// Token -> coding lookup table.
const CODINGS: &[(&str, ContentCoding)] = &[
    ("identity", ContentCoding::Identity),
    ("gzip", ContentCoding::Gzip),
    ("x-gzip", ContentCoding::Gzip),
    ("deflate", ContentCoding::Deflate),
    ("br", ContentCoding::Brotli),
];

impl ContentCoding {
    /// Looks up a coding by its (case-insensitive) token.
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.trim();
        CODINGS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(token))
            .map(|(_, coding)| *coding)
    }

    /// Canonical token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Brotli => "br",
        }
    }

    fn decoder(self) -> Decoder {
        match self {
            Self::Identity => decode_identity,
            Self::Gzip => decode_gzip,
            Self::Deflate => decode_deflate,
            Self::Brotli => decode_brotli,
        }
    }

    /// Decodes `input`, failing if the output would exceed `limit` bytes.
    pub fn decode(self, input: &[u8], limit: usize) -> Result<Vec<u8>> {
        (self.decoder())(input, limit).map_err(|e| {
            if e.kind() == io::ErrorKind::OutOfMemory {
                RewriteError::DecodedTooLarge { limit }
            } else {
                RewriteError::DecompressionFailure {
                    encoding: self.as_str(),
                    reason: e.to_string(),
                }
            }
        })
    }
}

/// Parses a `content-encoding` value into codings, in declared order.
pub fn parse_codings(value: &str) -> Result<Vec<ContentCoding>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            ContentCoding::from_token(token)
                .ok_or_else(|| RewriteError::UnsupportedEncoding(token.to_string()))
        })
        .collect()
}

/// Undoes every coding declared in `value`, right-to-left.
pub fn decode_all(body: &[u8], value: &str, limit: usize) -> Result<Vec<u8>> {
    let codings = parse_codings(value)?;
    let mut current = body.to_vec();
    for coding in codings.iter().rev() {
        current = coding.decode(&current, limit)?;
    }
    Ok(current)
}

/// Filters an `accept-encoding` value down to codings we can undo.
///
/// Returns `None` when nothing usable remains, meaning the header should be
/// dropped so the origin answers with an identity body.
pub fn narrow_accept_encoding(value: &str) -> Option<String> {
    let kept: Vec<&str> = value
        .split(',')
        .map(str::trim)
        .filter(|item| {
            let token = item.split(';').next().unwrap_or("").trim();
            ContentCoding::from_token(token).is_some()
        })
        .collect();

    if kept.is_empty() {
        None
    } else {
        Some(kept.join(", "))
    }
}

fn read_limited(reader: impl Read, limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    reader.take(cap).read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::OutOfMemory,
            "decoded body too large",
        ));
    }
    Ok(out)
}

fn decode_identity(input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    read_limited(input, limit)
}

fn decode_gzip(input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    read_limited(MultiGzDecoder::new(input), limit)
}

fn decode_deflate(input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    match read_limited(ZlibDecoder::new(input), limit) {
        Ok(out) => Ok(out),
        Err(e) if e.kind() == io::ErrorKind::OutOfMemory => Err(e),
        Err(_) => read_limited(DeflateDecoder::new(input), limit),
    }
}

fn decode_brotli(input: &[u8], limit: usize) -> io::Result<Vec<u8>> {
    read_limited(brotli::Decompressor::new(input, 4096), limit)
}
