// telli-cache-common - Shared wire codec and types for telli-cache
//
// This crate defines the RESP2 framing used by both the client and the
// in-memory development server.

pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use types::*;
