//! dmap-common: shared types for the dmap workspace.
//!
//! Provides the 160-bit `NodeId`, the stable key hash that places keys
//! into the global partition space, and the transport-level error type.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::net::SocketAddr;

/// Number of bytes in a node identifier.
pub const ID_BYTES: usize = 20;

/// Index of a partition in `[0, partition_count)`.
pub type PartitionId = u64;

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// A 160-bit node identifier, derived from the node's address so that a
/// restarted node keeps its ring position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    /// The all-zeros identifier.
    pub const ZERO: Self = Self([0u8; ID_BYTES]);

    /// Create a `NodeId` from raw bytes.
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Generate a random `NodeId`.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::thread_rng().fill(&mut bytes);
        Self(bytes)
    }

    /// Create a `NodeId` by SHA-1 hashing arbitrary data.
    pub fn from_sha1(data: &[u8]) -> Self {
        let hash = Sha1::digest(data);
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    /// The identifier of the node listening on `addr`.
    pub fn from_addr(addr: &SocketAddr) -> Self {
        Self::from_sha1(addr.to_string().as_bytes())
    }

    /// Position of this node on the 64-bit placement ring.
    pub fn ring_position(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(head)
    }

    /// Full hex encoding, used as a stable string key (lock owners, logs).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Show first 4 bytes as hex for readability
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "…")
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Stable 64-bit hash of a key inside a named map.
///
/// The map name is part of the hashed material, so equal keys in different
/// maps land on unrelated partitions.
pub fn key_hash(dmap: &str, key: &str) -> u64 {
    let mut hasher = Sha1::new();
    hasher.update(dmap.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Position of a partition on the placement ring.
pub fn partition_position(partition: PartitionId) -> u64 {
    let digest = Sha1::digest(partition.to_be_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Partition owning `(dmap, key)` in a cluster of `partition_count` partitions.
pub fn partition_for(dmap: &str, key: &str, partition_count: u64) -> PartitionId {
    debug_assert!(partition_count > 0);
    key_hash(dmap, key) % partition_count
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall-clock milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wall-clock microseconds since the Unix epoch.
pub fn unix_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("RPC timeout contacting {0}")]
    Timeout(NodeId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("node unreachable: {0}")]
    Unreachable(String),

    #[error("node is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_from_sha1() {
        let id = NodeId::from_sha1(b"hello");
        assert_ne!(id, NodeId::ZERO);
        // SHA-1 of "hello" is deterministic
        let id2 = NodeId::from_sha1(b"hello");
        assert_eq!(id, id2);
        let id3 = NodeId::from_sha1(b"world");
        assert_ne!(id, id3);
    }

    #[test]
    fn test_node_id_from_addr_stable() {
        let addr: SocketAddr = "127.0.0.1:3320".parse().unwrap();
        assert_eq!(NodeId::from_addr(&addr), NodeId::from_addr(&addr));

        let other: SocketAddr = "127.0.0.1:3321".parse().unwrap();
        assert_ne!(NodeId::from_addr(&addr), NodeId::from_addr(&other));
    }

    #[test]
    fn test_ring_position_uses_leading_bytes() {
        let mut bytes = [0u8; ID_BYTES];
        bytes[7] = 0x01;
        bytes[19] = 0xFF; // ignored
        assert_eq!(NodeId::from_bytes(bytes).ring_position(), 1);
    }

    #[test]
    fn test_node_id_random_uniqueness() {
        let ids: Vec<NodeId> = (0..1000).map(|_| NodeId::random()).collect();
        let unique: std::collections::HashSet<NodeId> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 1000, "expected 1000 unique random IDs");
    }

    #[test]
    fn test_key_hash_deterministic() {
        assert_eq!(key_hash("users", "alice"), key_hash("users", "alice"));
        assert_ne!(key_hash("users", "alice"), key_hash("users", "bob"));
    }

    #[test]
    fn test_key_hash_includes_map_name() {
        // "ab" + "c" must not collide with "a" + "bc"
        assert_ne!(key_hash("ab", "c"), key_hash("a", "bc"));
        assert_ne!(key_hash("orders", "k"), key_hash("users", "k"));
    }

    #[test]
    fn test_partition_for_in_range() {
        for i in 0..500 {
            let key = format!("key-{}", i);
            assert!(partition_for("m", &key, 271) < 271);
        }
    }

    #[test]
    fn test_partition_for_spreads_keys() {
        let mut hit = std::collections::HashSet::new();
        for i in 0..2000 {
            hit.insert(partition_for("m", &format!("k{}", i), 7));
        }
        assert_eq!(hit.len(), 7, "2000 keys should touch every one of 7 partitions");
    }

    #[test]
    fn test_display_and_debug() {
        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = 0xAB;
        bytes[1] = 0xCD;
        let id = NodeId::from_bytes(bytes);
        let s = format!("{}", id);
        assert!(s.starts_with("abcd"));
        assert!(s.contains("…"), "Display should truncate with …");

        let d = format!("{:?}", id);
        assert!(d.starts_with("NodeId("), "Debug should start with NodeId(");
        assert_eq!(id.to_hex().len(), ID_BYTES * 2);
    }

    #[test]
    fn test_serde_roundtrip() {
        let id = NodeId::random();
        let json = serde_json::to_string(&id).unwrap();
        let id2: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, id2);
    }
}
