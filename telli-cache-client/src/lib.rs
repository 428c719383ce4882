//! # telli Cache Client
//!
//! Purpose: Give the dialog app and admin console one namespaced, fail-fast
//! client for the hosted Valkey cache.
//!
//! ## Design Principles
//! 1. **Namespace Isolation**: Every key is `"<namespace>:<key>"`; no
//!    operation can reach a key outside its namespace.
//! 2. **Bounded Latency**: Every call is capped by the command timeout and
//!    reports `CacheError::Unavailable` instead of hanging.
//! 3. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 4. **Protocol Clarity**: RESP2 is encoded and parsed explicitly.
//!
//! A failed cache call is a soft failure: callers are expected to skip the
//! cache and recompute from the source of truth.

mod client;
mod config;
mod connection;
mod error;
mod namespace;
mod pool;

pub use client::CacheClient;
pub use config::{
    ClientConfig, ConnectionTarget, DEFAULT_COMMAND_TIMEOUT, DEFAULT_MAX_IDLE, DEFAULT_MAX_TOTAL,
    DEFAULT_NAMESPACE, DEFAULT_PORT, VALKEY_URL_ENV,
};
pub use error::{CacheError, CacheResult};
pub use namespace::{Namespace, KEY_SEPARATOR};
pub use telli_cache_common::TtlStatus;
