//! In-memory partition storage for dmap.
//!
//! Entries are grouped into fragments (one per map per partition). Expiry
//! is checked lazily on read and enforced in the background by sampling
//! eviction workers.

pub mod engine;
pub mod entry;
pub mod eviction;
pub mod fragment;

pub use engine::{FragmentData, StorageConfig, StorageEngine, StorageStats};
pub use entry::Entry;
pub use eviction::{EvictionPolicy, EvictionSettings};
