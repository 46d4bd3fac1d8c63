//! Error types for the rewrite pipeline.

use thiserror::Error;

/// Rewrite pipeline error type.
///
/// None of these reach the client: the pipeline recovers by passing the
/// original bytes through untouched.
#[derive(Debug, Error)]
pub enum RewriteError {
    /// A declared content-coding token has no decoder.
    #[error("unsupported content-coding: {0}")]
    UnsupportedEncoding(String),

    /// The body could not be decoded with the declared coding.
    #[error("failed to decode {encoding} body: {reason}")]
    DecompressionFailure {
        /// The coding that failed.
        encoding: &'static str,
        /// Underlying decoder message.
        reason: String,
    },

    /// The decoded body exceeded the configured limit.
    #[error("decoded body exceeds {limit} bytes")]
    DecodedTooLarge {
        /// The limit that was hit.
        limit: usize,
    },
}

/// Result type for rewrite operations.
pub type Result<T> = std::result::Result<T, RewriteError>;
