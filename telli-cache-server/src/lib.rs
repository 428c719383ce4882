//! # telli-cache-server
//!
//! A RESP2-compatible in-memory cache server for local development and
//! integration tests of the telli cache client. It speaks the subset of the
//! Redis protocol the client relies on; it is not a production store.

pub mod server;

pub use server::{bind, handle_connection, serve, ScanCursors};
