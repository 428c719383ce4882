//! # Engine Trait
//!
//! Strategy interface between the RESP server and a storage backend.

use std::sync::Arc;
use std::time::Duration;

use telli_cache_common::TtlStatus;

/// Storage operations the server dispatches to.
///
/// Every method observes expiry: an entry whose deadline has passed behaves
/// exactly like a missing one.
pub trait KVEngine: Send + Sync {
    /// Returns the live value for `key`.
    fn get(&self, key: &[u8]) -> Option<Arc<[u8]>>;

    /// Inserts or replaces `key`. `ttl` of `None` clears any previous expiry.
    fn set(&self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>);

    /// Removes `key`. Returns true when a live entry was removed.
    fn delete(&self, key: &[u8]) -> bool;

    /// Returns true when `key` holds a live entry.
    fn exists(&self, key: &[u8]) -> bool;

    /// Sets a TTL on a live key. Returns false when the key is missing.
    fn expire(&self, key: &[u8], ttl: Duration) -> bool;

    /// Returns the TTL state of `key`.
    fn ttl(&self, key: &[u8]) -> TtlStatus;

    /// Returns all live keys matching a glob `pattern`, sorted.
    fn keys(&self, pattern: &[u8]) -> Vec<Vec<u8>>;

    /// Number of stored entries, including expired ones not yet purged.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
