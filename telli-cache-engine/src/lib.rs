//! # telli-cache-engine
//!
//! In-memory key/value storage backing the development cache server.

mod engine;
mod glob;
mod memory;

pub use engine::KVEngine;
pub use glob::glob_match;
pub use memory::{ExpirationHandle, MemoryEngine};
pub use telli_cache_common::TtlStatus;
