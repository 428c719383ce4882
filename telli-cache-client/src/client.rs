//! # Namespaced Cache Client
//!
//! Purpose: Expose a compact async API over the hosted key-value cache, with
//! every key scoped under one namespace and every call bounded by a fixed
//! command timeout.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `CacheClient` hides pooling and protocol details.
//! 2. **Fail Fast**: A slow or unreachable store yields `Unavailable` within
//!    the timeout; nothing is retried here.
//! 3. **Opaque Values**: The byte API makes no assumption about value shape;
//!    the JSON helpers are an opt-in convenience on top.
//! 4. **Explicit Wiring**: Build one client at startup and clone it into the
//!    components that need it. Clones share the pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use telli_cache_common::{RespValue, TtlStatus};

use crate::config::ClientConfig;
use crate::error::{CacheError, CacheResult};
use crate::namespace::Namespace;
use crate::pool::{ConnectionPool, PoolConfig};

/// Keys requested per `SCAN` round trip.
const SCAN_BATCH: &[u8] = b"100";

/// Keys removed per `DEL` when clearing a namespace.
const DELETE_BATCH: usize = 100;

/// Async cache client scoped to one namespace.
///
/// ```no_run
/// use std::time::Duration;
/// use telli_cache_client::{CacheClient, CacheResult};
///
/// async fn remember_status(cache: &CacheClient) -> CacheResult<()> {
///     cache.set_with_ttl("user:42", "active", Duration::from_secs(60)).await?;
///     let status = cache.get_string("user:42").await?;
///     assert_eq!(status.as_deref(), Some("active"));
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct CacheClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    namespace: Namespace,
    command_timeout: Duration,
    pool: ConnectionPool,
}

impl CacheClient {
    /// Builds a client. No connection is opened until the first command.
    pub fn new(config: ClientConfig) -> CacheResult<Self> {
        config.validate()?;
        let namespace = Namespace::new(config.namespace)?;
        let pool = ConnectionPool::new(PoolConfig {
            target: config.target,
            max_idle: config.max_idle,
            max_total: config.max_total,
        });
        Ok(CacheClient {
            inner: Arc::new(ClientInner {
                namespace,
                command_timeout: config.command_timeout,
                pool,
            }),
        })
    }

    /// Builds a client from `VALKEY_URL` with the default namespace and timeout.
    pub fn from_env() -> CacheResult<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    pub fn command_timeout(&self) -> Duration {
        self.inner.command_timeout
    }

    /// Idle pooled connections, exposed for diagnostics.
    pub fn idle_connections(&self) -> usize {
        self.inner.pool.idle_count()
    }

    /// Fetches a value. Returns `Ok(None)` when the key is missing.
    pub async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let full = self.inner.namespace.key(key);
        match self.execute(&[b"GET", full.as_bytes()]).await? {
            RespValue::Bulk(value) => Ok(value),
            other => Err(unexpected("GET", &other)),
        }
    }

    /// Fetches a value and decodes it as UTF-8.
    pub async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
        match self.get(key).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| CacheError::Protocol(format!("value for '{key}' is not valid UTF-8"))),
            None => Ok(None),
        }
    }

    /// Stores a value without expiration, clearing any previous TTL.
    pub async fn set(&self, key: &str, value: impl AsRef<[u8]>) -> CacheResult<()> {
        let full = self.inner.namespace.key(key);
        let reply = self
            .execute(&[b"SET", full.as_bytes(), value.as_ref()])
            .await?;
        expect_ok("SET", reply)
    }

    /// Stores a value that expires after `ttl`.
    ///
    /// Whole seconds are sent as `EX`, anything finer as `PX`. A zero TTL is
    /// rounded up to one millisecond.
    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        ttl: Duration,
    ) -> CacheResult<()> {
        let full = self.inner.namespace.key(key);
        let (unit, amount) = expiry_args(ttl);
        let reply = self
            .execute(&[b"SET", full.as_bytes(), value.as_ref(), unit, amount.as_bytes()])
            .await?;
        expect_ok("SET", reply)
    }

    /// Deletes a key. Returns true when a key was removed; deleting a missing
    /// key is not an error.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        let full = self.inner.namespace.key(key);
        match self.execute(&[b"DEL", full.as_bytes()]).await? {
            RespValue::Integer(count) => Ok(count > 0),
            other => Err(unexpected("DEL", &other)),
        }
    }

    /// Checks whether a key exists without transferring its value.
    pub async fn has(&self, key: &str) -> CacheResult<bool> {
        let full = self.inner.namespace.key(key);
        match self.execute(&[b"EXISTS", full.as_bytes()]).await? {
            RespValue::Integer(count) => Ok(count > 0),
            other => Err(unexpected("EXISTS", &other)),
        }
    }

    /// Returns the TTL state of a key.
    pub async fn ttl(&self, key: &str) -> CacheResult<TtlStatus> {
        let full = self.inner.namespace.key(key);
        match self.execute(&[b"PTTL", full.as_bytes()]).await? {
            RespValue::Integer(value) => TtlStatus::from_millis_reply(value)
                .ok_or_else(|| CacheError::Protocol(format!("invalid PTTL reply {value}"))),
            other => Err(unexpected("PTTL", &other)),
        }
    }

    /// Lists the caller keys stored in this namespace, prefix stripped.
    ///
    /// Each `SCAN` round trip is bounded by the command timeout; the listing
    /// as a whole is not.
    pub async fn keys(&self) -> CacheResult<Vec<String>> {
        let full_keys = self.scan_namespace().await?;
        Ok(full_keys
            .iter()
            .filter_map(|full| self.inner.namespace.strip(full))
            .map(|key| String::from_utf8_lossy(key).into_owned())
            .collect())
    }

    /// Deletes every key in this namespace and returns how many were removed.
    ///
    /// Keys outside the namespace are never touched.
    pub async fn clear(&self) -> CacheResult<usize> {
        let full_keys = self.scan_namespace().await?;
        let mut removed = 0usize;
        for chunk in full_keys.chunks(DELETE_BATCH) {
            let mut args: Vec<&[u8]> = Vec::with_capacity(chunk.len() + 1);
            args.push(b"DEL");
            args.extend(chunk.iter().map(Vec::as_slice));
            match self.execute(&args).await? {
                RespValue::Integer(count) => removed += count.max(0) as usize,
                other => return Err(unexpected("DEL", &other)),
            }
        }
        debug!(namespace = %self.inner.namespace, removed, "cleared cache namespace");
        Ok(removed)
    }

    /// Round-trips a `PING`.
    pub async fn ping(&self) -> CacheResult<()> {
        match self.execute(&[b"PING"]).await? {
            RespValue::Simple(text) if text == b"PONG" => Ok(()),
            other => Err(unexpected("PING", &other)),
        }
    }

    /// Fetches and deserializes a JSON value.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Serializes `value` as JSON and stores it without expiration.
    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CacheResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes).await
    }

    /// Serializes `value` as JSON and stores it with a TTL.
    pub async fn set_json_with_ttl<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> CacheResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set_with_ttl(key, bytes, ttl).await
    }

    /// Collects every full key matching this namespace.
    ///
    /// The whole keyspace walk finishes before callers mutate anything, so
    /// deletes cannot shift the server-side cursor under us.
    async fn scan_namespace(&self) -> CacheResult<Vec<Vec<u8>>> {
        let pattern = self.inner.namespace.match_pattern();
        let mut cursor = String::from("0");
        let mut keys = Vec::new();
        loop {
            let reply = self
                .execute(&[
                    b"SCAN",
                    cursor.as_bytes(),
                    b"MATCH",
                    pattern.as_bytes(),
                    b"COUNT",
                    SCAN_BATCH,
                ])
                .await?;
            let (next, batch) = parse_scan_reply(reply)?;
            keys.extend(batch);
            if next == "0" {
                break;
            }
            cursor = next;
        }
        // SCAN may report a key more than once.
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    /// Runs one command under the command timeout.
    async fn execute(&self, args: &[&[u8]]) -> CacheResult<RespValue> {
        let command = String::from_utf8_lossy(args[0]);
        let started = Instant::now();
        let timeout = self.inner.command_timeout;

        let result = match tokio::time::timeout(timeout, self.execute_once(args)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Unavailable(format!(
                "{command} timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        let elapsed_us = started.elapsed().as_micros() as u64;
        match &result {
            Ok(_) => debug!(command = %command, elapsed_us, "cache command completed"),
            Err(err) => warn!(
                command = %command,
                namespace = %self.inner.namespace,
                elapsed_us,
                error = %err,
                "cache command failed"
            ),
        }
        result
    }

    async fn execute_once(&self, args: &[&[u8]]) -> CacheResult<RespValue> {
        let mut conn = self.inner.pool.acquire().await?;
        match conn.exec(args).await? {
            RespValue::Error(message) => Err(CacheError::Protocol(format!(
                "{} rejected: {}",
                String::from_utf8_lossy(args[0]),
                String::from_utf8_lossy(&message)
            ))),
            reply => Ok(reply),
        }
    }
}

/// Picks `EX` for whole seconds and `PX` otherwise, rounding up to whole
/// milliseconds so an entry never outlives less than its requested TTL.
fn expiry_args(ttl: Duration) -> (&'static [u8], String) {
    if ttl.subsec_nanos() == 0 && ttl.as_secs() > 0 {
        return (b"EX", ttl.as_secs().to_string());
    }
    let millis = ttl.as_nanos().div_ceil(1_000_000).max(1);
    (b"PX", millis.to_string())
}

/// Splits a `SCAN` reply into the next cursor and the returned keys.
fn parse_scan_reply(reply: RespValue) -> CacheResult<(String, Vec<Vec<u8>>)> {
    let mut parts = match reply {
        RespValue::Array(Some(parts)) if parts.len() == 2 => parts,
        other => return Err(unexpected("SCAN", &other)),
    };
    let items = parts.pop();
    let cursor = parts.pop();

    let cursor = match cursor {
        Some(RespValue::Bulk(Some(raw))) => String::from_utf8(raw)
            .ok()
            .filter(|text| !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| CacheError::Protocol("invalid SCAN cursor".to_string()))?,
        _ => return Err(CacheError::Protocol("invalid SCAN cursor".to_string())),
    };

    let keys = match items {
        Some(RespValue::Array(Some(items))) => items
            .into_iter()
            .map(|item| match item {
                RespValue::Bulk(Some(key)) => Ok(key),
                other => Err(unexpected("SCAN", &other)),
            })
            .collect::<CacheResult<Vec<_>>>()?,
        Some(other) => return Err(unexpected("SCAN", &other)),
        None => Vec::new(),
    };

    Ok((cursor, keys))
}

fn expect_ok(command: &str, reply: RespValue) -> CacheResult<()> {
    match reply {
        RespValue::Simple(_) => Ok(()),
        other => Err(unexpected(command, &other)),
    }
}

fn unexpected(command: &str, reply: &RespValue) -> CacheError {
    CacheError::Protocol(format!("unexpected {command} reply: {reply:?}"))
}
