//! Partition-to-owner assignment.
//!
//! A [`RoutingTable`] is an immutable, versioned snapshot. It is built from
//! a set of live members by walking the ring of node positions: the primary
//! of a partition is the ring successor of the partition's hash position and
//! the backups are the next distinct nodes around the ring. The same member
//! set always yields the same assignment, whatever order it was given in.

use crate::node_info::NodeInfo;
use dmap_common::{partition_for, partition_position, NodeId, PartitionId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTable {
    version: u64,
    partition_count: u64,
    replica_count: usize,
    /// `owners[p][0]` is the primary of partition `p`.
    owners: Vec<Vec<NodeInfo>>,
}

impl RoutingTable {
    /// Build the assignment of `partition_count` partitions over `members`.
    pub fn build(
        version: u64,
        partition_count: u64,
        replica_count: usize,
        members: &[NodeInfo],
    ) -> Self {
        let mut ring: Vec<(u64, NodeInfo)> = members
            .iter()
            .map(|m| (m.id.ring_position(), m.clone()))
            .collect();
        ring.sort_by(|a, b| (a.0, a.1.id).cmp(&(b.0, b.1.id)));
        ring.dedup_by(|a, b| a.1.id == b.1.id);

        let width = replica_count.min(ring.len());
        let owners = (0..partition_count)
            .map(|partition| {
                if ring.is_empty() {
                    return Vec::new();
                }
                let position = partition_position(partition);
                let start = ring.partition_point(|(p, _)| *p < position) % ring.len();
                (0..width)
                    .map(|i| ring[(start + i) % ring.len()].1.clone())
                    .collect()
            })
            .collect();

        Self {
            version,
            partition_count,
            replica_count,
            owners,
        }
    }

    /// A table with no owners, used before the first membership view exists.
    pub fn empty(partition_count: u64, replica_count: usize) -> Self {
        Self::build(0, partition_count, replica_count, &[])
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn partition_count(&self) -> u64 {
        self.partition_count
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn partition_for(&self, dmap: &str, key: &str) -> PartitionId {
        partition_for(dmap, key, self.partition_count)
    }

    /// Ordered owners of `partition`; empty when out of range.
    pub fn owners_of(&self, partition: PartitionId) -> &[NodeInfo] {
        self.owners
            .get(partition as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn primary_of(&self, partition: PartitionId) -> Option<&NodeInfo> {
        self.owners_of(partition).first()
    }

    pub fn is_owner(&self, partition: PartitionId, node: &NodeId) -> bool {
        self.owners_of(partition).iter().any(|o| o.id == *node)
    }

    /// Partitions for which `node` is primary or backup.
    pub fn partitions_owned_by(&self, node: &NodeId) -> Vec<PartitionId> {
        (0..self.partition_count)
            .filter(|p| self.is_owner(*p, node))
            .collect()
    }

    /// Distinct nodes appearing anywhere in the table, sorted by id.
    pub fn members(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.owners.iter().flatten().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        nodes.dedup_by(|a, b| a.id == b.id);
        nodes
    }

    /// Whether both tables assign every partition to the same owners, in the
    /// same order. Versions are ignored.
    pub fn same_assignment(&self, other: &RoutingTable) -> bool {
        self.partition_count == other.partition_count
            && self.owners.iter().zip(other.owners.iter()).all(|(a, b)| {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.id == y.id)
            })
    }

    /// Copy of this assignment under a different version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn nodes(n: u16) -> Vec<NodeInfo> {
        (0..n)
            .map(|i| NodeInfo::with_birthdate(format!("10.0.0.{}:3320", i + 1).parse().unwrap(), 0))
            .collect()
    }

    #[test]
    fn test_owner_lists_are_unique_and_sized() {
        let members = nodes(5);
        let table = RoutingTable::build(1, 271, 3, &members);
        for p in 0..271 {
            let owners = table.owners_of(p);
            assert_eq!(owners.len(), 3);
            let unique: HashSet<NodeId> = owners.iter().map(|o| o.id).collect();
            assert_eq!(unique.len(), 3, "partition {} has duplicate owners", p);
        }
    }

    #[test]
    fn test_owner_list_capped_by_member_count() {
        let table = RoutingTable::build(1, 16, 3, &nodes(2));
        for p in 0..16 {
            assert_eq!(table.owners_of(p).len(), 2);
        }
    }

    #[test]
    fn test_empty_membership_has_no_owners() {
        let table = RoutingTable::empty(8, 2);
        assert_eq!(table.version(), 0);
        assert!(table.primary_of(0).is_none());
        assert!(table.members().is_empty());
    }

    #[test]
    fn test_build_is_independent_of_input_order() {
        let members = nodes(7);
        let mut reversed = members.clone();
        reversed.reverse();
        let mut duplicated = members.clone();
        duplicated.extend(members.iter().take(3).cloned());

        let a = RoutingTable::build(1, 271, 2, &members);
        let b = RoutingTable::build(9, 271, 2, &reversed);
        let c = RoutingTable::build(4, 271, 2, &duplicated);
        assert!(a.same_assignment(&b));
        assert!(a.same_assignment(&c));
    }

    #[test]
    fn test_backups_follow_ring_order() {
        let members = nodes(4);
        let table = RoutingTable::build(1, 64, 4, &members);
        let mut ring: Vec<NodeInfo> = members.clone();
        ring.sort_by_key(|m| (m.id.ring_position(), m.id));

        for p in 0..64 {
            let owners = table.owners_of(p);
            let start = ring.iter().position(|n| n.id == owners[0].id).unwrap();
            for (i, owner) in owners.iter().enumerate() {
                assert_eq!(owner.id, ring[(start + i) % ring.len()].id);
            }
        }
    }

    #[test]
    fn test_adding_a_node_only_moves_primaries_to_it() {
        let all = nodes(10);
        let newcomer = all[9].id;
        let before = RoutingTable::build(1, 271, 1, &all[..9]);
        let after = RoutingTable::build(2, 271, 1, &all);
        for p in 0..271 {
            let old = before.primary_of(p).unwrap().id;
            let new = after.primary_of(p).unwrap().id;
            assert!(new == old || new == newcomer, "partition {} moved between old nodes", p);
        }
    }

    #[test]
    fn test_every_member_owns_something() {
        let members = nodes(5);
        let table = RoutingTable::build(1, 271, 2, &members);
        for m in &members {
            assert!(!table.partitions_owned_by(&m.id).is_empty());
        }
        assert_eq!(table.members().len(), 5);
    }
}
