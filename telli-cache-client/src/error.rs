//! # Client Errors
//!
//! One taxonomy for every cache failure. Only `Configuration` is meant to be
//! fatal; the per-operation kinds let callers fall back to recomputing from
//! the source of truth.

use thiserror::Error;

use telli_cache_common::ProtocolError;

/// Result type for the cache client.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by the cache client.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Missing or malformed configuration; raised at construction.
    #[error("cache configuration error: {0}")]
    Configuration(String),
    /// Connection failure, closed socket or command timeout.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    /// Corrupt framing, unexpected reply type, or a server error reply.
    #[error("cache protocol error: {0}")]
    Protocol(String),
    /// A JSON helper could not (de)serialize the value.
    #[error("cache value codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl CacheError {
    /// True for transport failures that callers should treat as a soft miss.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::Unavailable(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, CacheError::Protocol(_))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

impl From<ProtocolError> for CacheError {
    fn from(err: ProtocolError) -> Self {
        CacheError::Protocol(err.to_string())
    }
}
