//! Stored entry format.

use serde::{Deserialize, Serialize};

/// Fixed per-entry bookkeeping charged against `max_inuse`.
pub const ENTRY_OVERHEAD: usize = 64;

/// A versioned value held in a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    /// Opaque payload.
    pub value: Vec<u8>,
    /// Strictly increasing per key across successful writes.
    pub version: u64,
    /// Wall-clock write time (millis since epoch). Breaks version ties.
    pub timestamp_ms: u64,
    /// Absolute expiry (millis since epoch), if the entry has a TTL.
    pub expires_at_ms: Option<u64>,
    /// Last read or write (millis since epoch).
    pub last_access_ms: u64,
}

impl Entry {
    pub fn new(key: String, value: Vec<u8>, version: u64, now_ms: u64) -> Self {
        Self {
            key,
            value,
            version,
            timestamp_ms: now_ms,
            expires_at_ms: None,
            last_access_ms: now_ms,
        }
    }

    pub fn with_expiry(mut self, expires_at_ms: Option<u64>) -> Self {
        self.expires_at_ms = expires_at_ms;
        self
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }

    /// Whether the entry has not been touched for `max_idle_ms`. Zero
    /// disables idle expiry.
    pub fn is_idle(&self, now_ms: u64, max_idle_ms: u64) -> bool {
        max_idle_ms > 0 && now_ms.saturating_sub(self.last_access_ms) >= max_idle_ms
    }

    /// Last-writer-wins order: version, then write timestamp.
    pub fn supersedes(&self, other: &Entry) -> bool {
        (self.version, self.timestamp_ms) > (other.version, other.timestamp_ms)
    }

    pub fn approximate_size(&self) -> usize {
        self.key.len() + self.value.len() + ENTRY_OVERHEAD
    }
}
