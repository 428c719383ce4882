//! # Shared Types
//!
//! Types that appear on both sides of the wire.

use std::time::Duration;

/// TTL state of a key, mirroring Redis `TTL`/`PTTL` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlStatus {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

impl TtlStatus {
    /// Interprets a `PTTL` integer reply (`-2`, `-1` or remaining millis).
    ///
    /// Returns `None` for values Redis never produces.
    pub fn from_millis_reply(value: i64) -> Option<Self> {
        match value {
            -2 => Some(TtlStatus::Missing),
            -1 => Some(TtlStatus::NoExpiry),
            ms if ms >= 0 => Some(TtlStatus::ExpiresIn(Duration::from_millis(ms as u64))),
            _ => None,
        }
    }

    /// Encodes the status as a `PTTL` integer reply.
    pub fn to_millis_reply(self) -> i64 {
        match self {
            TtlStatus::Missing => -2,
            TtlStatus::NoExpiry => -1,
            TtlStatus::ExpiresIn(remaining) => {
                i64::try_from(remaining.as_millis()).unwrap_or(i64::MAX)
            }
        }
    }

    /// Encodes the status as a `TTL` integer reply, rounding up so a live
    /// key never reports zero seconds.
    pub fn to_secs_reply(self) -> i64 {
        match self {
            TtlStatus::Missing => -2,
            TtlStatus::NoExpiry => -1,
            TtlStatus::ExpiresIn(remaining) => {
                let millis = remaining.as_millis();
                i64::try_from(millis.div_ceil(1000)).unwrap_or(i64::MAX)
            }
        }
    }
}
