//! # In-Memory Engine
//!
//! Provide the in-memory backend with sharded locking and TTL-aware lookups
//! for the development cache server.
//!
//! ## Usage
//!
//! - Use `MemoryEngine::new()` for a default sharded engine.
//! - Use `MemoryEngine::with_shard_count` to pin the shard count (tests).
//! - Use `start_expirer` to enable active TTL cleanup in the background.
//!
//! ## Design Principles
//!
//! 1. **Sharded Locks**: Per-shard locks reduce contention under concurrency.
//! 2. **Arc-backed Buffers**: Values are `Arc<[u8]>` so reads never copy under the lock.
//! 3. **TTL Fast Path**: Expiration is checked on access; the sweeper only reclaims memory.
//! 4. **Strategy Pattern**: Implements `KVEngine` to keep the server decoupled.
//!
//! ## Structure Overview
//!
//! ```text
//! MemoryEngine
//!   └── shards: Vec<Shard>
//!         └── Shard
//!               └── inner: RwLock<ShardInner>
//!                     └── map: HashMap<Arc<[u8]>, Entry>
//!                           └── Entry { value, expires_at }
//! ```

use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use telli_cache_common::TtlStatus;

use crate::engine::KVEngine;
use crate::glob::glob_match;

/// Default shards = CPU count * multiplier to reduce lock contention.
const DEFAULT_SHARD_MULTIPLIER: usize = 4;

/// A stored value and its optional deadline.
#[derive(Debug)]
struct Entry {
    value: Arc<[u8]>,
    expires_at: Option<Instant>,
}

impl Entry {
    /// Returns true when the entry has expired at `now`.
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

#[derive(Debug)]
struct ShardInner {
    map: HashMap<Arc<[u8]>, Entry, RandomState>,
}

impl ShardInner {
    /// Removes `key` if it is present but expired. Returns true when removed.
    fn evict_if_expired(&mut self, key: &[u8], now: Instant) -> bool {
        let expired = self
            .map
            .get(key)
            .map(|entry| entry.is_expired(now))
            .unwrap_or(false);
        if expired {
            self.map.remove(key);
        }
        expired
    }
}

/// Per-shard lock wrapper.
#[derive(Debug)]
struct Shard {
    inner: RwLock<ShardInner>,
}

/// Sharded in-memory implementation of `KVEngine`.
#[derive(Debug)]
pub struct MemoryEngine {
    /// Per-shard storage.
    shards: Vec<Shard>,
    /// Bitmask for fast shard selection (power-of-two shard count).
    shard_mask: usize,
    /// Hash state used to pick shards deterministically.
    hash_state: RandomState,
}

/// Handle for the background expiration sweeper.
///
/// Call `stop` on shutdown; dropping the handle also stops the task.
pub struct ExpirationHandle {
    task: Option<JoinHandle<()>>,
}

impl ExpirationHandle {
    /// Stops the sweeper task.
    pub fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ExpirationHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Creates a new engine with a default shard count based on CPU parallelism.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1);
        Self::with_shard_count(threads.saturating_mul(DEFAULT_SHARD_MULTIPLIER))
    }

    /// Creates a new engine with a caller-provided shard count.
    ///
    /// The count is normalized to the next power of two to enable fast masking.
    pub fn with_shard_count(shards: usize) -> Self {
        let shard_count = normalize_shard_count(shards);
        let hash_state = RandomState::new();
        let shards = (0..shard_count)
            .map(|_| Shard {
                inner: RwLock::new(ShardInner {
                    map: HashMap::with_hasher(hash_state.clone()),
                }),
            })
            .collect();

        MemoryEngine {
            shards,
            shard_mask: shard_count - 1,
            hash_state,
        }
    }

    /// Removes expired entries across all shards.
    ///
    /// This is an O(n) scan and is intended for a periodic background sweep.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut inner = shard.inner.write();
            let before = inner.map.len();
            inner.map.retain(|_, entry| !entry.is_expired(now));
            removed += before - inner.map.len();
        }
        removed
    }

    /// Spawns a tokio task that periodically removes expired entries.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_expirer(self: &Arc<Self>, interval: Duration) -> ExpirationHandle {
        let interval = if interval.is_zero() {
            Duration::from_millis(1)
        } else {
            interval
        };

        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = engine.purge_expired(Instant::now());
                if removed > 0 {
                    debug!(removed, "purged expired entries");
                }
            }
        });

        ExpirationHandle { task: Some(task) }
    }

    /// Hashes a key to its owning shard index.
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key);
        (hasher.finish() as usize) & self.shard_mask
    }

    /// Returns the shard responsible for a given key.
    fn shard_for(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }
}

impl KVEngine for MemoryEngine {
    /// Looks up a key; an expired hit is removed under the write lock.
    fn get(&self, key: &[u8]) -> Option<Arc<[u8]>> {
        let shard = self.shard_for(key);
        let now = Instant::now();
        {
            let inner = shard.inner.read();
            match inner.map.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(Arc::clone(&entry.value)),
                Some(_) => {}
            }
        }
        shard.inner.write().evict_if_expired(key, now);
        None
    }

    fn set(&self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>) {
        let shard = self.shard_for(&key);
        let entry = Entry {
            value: Arc::from(value),
            expires_at: ttl.and_then(|ttl| deadline_after(Instant::now(), ttl)),
        };
        shard.inner.write().map.insert(Arc::from(key), entry);
    }

    /// Expired entries are removed but reported as missing, matching Redis.
    fn delete(&self, key: &[u8]) -> bool {
        let shard = self.shard_for(key);
        let now = Instant::now();
        let mut inner = shard.inner.write();
        match inner.map.remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    fn exists(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        self.shard_for(key)
            .inner
            .read()
            .map
            .get(key)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false)
    }

    fn expire(&self, key: &[u8], ttl: Duration) -> bool {
        let shard = self.shard_for(key);
        let now = Instant::now();
        let mut inner = shard.inner.write();
        if inner.evict_if_expired(key, now) {
            return false;
        }
        match inner.map.get_mut(key) {
            Some(entry) => {
                entry.expires_at = deadline_after(now, ttl);
                true
            }
            None => false,
        }
    }

    fn ttl(&self, key: &[u8]) -> TtlStatus {
        let now = Instant::now();
        let inner = self.shard_for(key).inner.read();
        match inner.map.get(key) {
            None => TtlStatus::Missing,
            Some(entry) => match entry.expires_at {
                None => TtlStatus::NoExpiry,
                Some(deadline) if deadline <= now => TtlStatus::Missing,
                Some(deadline) => TtlStatus::ExpiresIn(deadline - now),
            },
        }
    }

    fn keys(&self, pattern: &[u8]) -> Vec<Vec<u8>> {
        let now = Instant::now();
        let mut keys = Vec::new();
        for shard in &self.shards {
            let inner = shard.inner.read();
            keys.extend(
                inner
                    .map
                    .iter()
                    .filter(|(key, entry)| !entry.is_expired(now) && glob_match(pattern, key))
                    .map(|(key, _)| key.to_vec()),
            );
        }
        // Sorted output gives SCAN a stable cursor order.
        keys.sort_unstable();
        keys
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.inner.read().map.len()).sum()
    }
}

/// Deadline `ttl` after `now`, or `None` (never expires) past `Instant`'s range.
fn deadline_after(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(ttl)
}

/// Normalizes shard counts to a power of two for fast masking.
fn normalize_shard_count(count: usize) -> usize {
    count.max(1).next_power_of_two()
}
