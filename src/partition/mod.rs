/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Partition functions: the rules assigning every key to a partition
//! group (for node routing) and to a partition within the group.

mod key_partitioner;
mod maps;

pub use key_partitioner::KeyPartitioner;
pub use maps::{KeyRangeFilter, PartitionFunctionMap, RecordFilter, RecordFilterMap};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::record::hashed_key_bytes;

/// Partitions the key space for record routing.
///
/// The global partitioning is identical on every node; the local
/// partitioning may be specific to one node. Local partitions are
/// globally numbered: partition `group * partitions_per_group + local`.
pub trait PartitionFunction: Send + Sync {
    /// The partition group a key belongs to.
    fn global_partition(&self, key: &[u8]) -> u64;

    /// The partition a key belongs to, given its group.
    fn local_partition(&self, key: &[u8], partition_group: u64) -> u64;

    /// The number of partition groups this function produces.
    fn num_global_partitions(&self) -> u64;

    /// Whether keys are hashed before partitioning; hashed functions are
    /// not order-preserving.
    fn hashes_keys(&self) -> bool;

    /// Whether the filter accepts the key, after whatever transformation
    /// this function applies to keys.
    fn accepted_by_filter(&self, key: &[u8], filter: &dyn RecordFilter) -> bool {
        filter.pass(key)
    }
}

/// The order-preserving boundary-list partition function backed by a
/// [`KeyPartitioner`] built in phase zero.
pub struct BoundaryListPartitionFunction {
    partitioner: Arc<KeyPartitioner>,
}

impl BoundaryListPartitionFunction {
    pub fn new(partitioner: Arc<KeyPartitioner>) -> Self {
        BoundaryListPartitionFunction { partitioner }
    }
}

impl PartitionFunction for BoundaryListPartitionFunction {
    fn global_partition(&self, key: &[u8]) -> u64 {
        self.partitioner.global_partition(key)
    }

    fn local_partition(&self, key: &[u8], partition_group: u64) -> u64 {
        self.partitioner.local_partition(key, partition_group)
    }

    fn num_global_partitions(&self) -> u64 {
        self.partitioner.num_partition_groups()
    }

    fn hashes_keys(&self) -> bool {
        false
    }
}

/// The hashed variant: searches boundary lists built over hashed keys.
/// Not order-preserving.
pub struct HashedBoundaryListPartitionFunction {
    partitioner: Arc<KeyPartitioner>,
}

impl HashedBoundaryListPartitionFunction {
    pub fn new(partitioner: Arc<KeyPartitioner>) -> Self {
        HashedBoundaryListPartitionFunction { partitioner }
    }
}

impl PartitionFunction for HashedBoundaryListPartitionFunction {
    fn global_partition(&self, key: &[u8]) -> u64 {
        self.partitioner.global_partition(&hashed_key_bytes(key))
    }

    fn local_partition(&self, key: &[u8], partition_group: u64) -> u64 {
        self.partitioner
            .local_partition(&hashed_key_bytes(key), partition_group)
    }

    fn num_global_partitions(&self) -> u64 {
        self.partitioner.num_partition_groups()
    }

    fn hashes_keys(&self) -> bool {
        true
    }

    fn accepted_by_filter(&self, key: &[u8], filter: &dyn RecordFilter) -> bool {
        filter.pass(&hashed_key_bytes(key))
    }
}

/// Number of distinct values of the 24-bit prefix the uniform function
/// reads from a key.
const UNIFORM_KEY_SPACE: u64 = 1 << 24;

/// Partitions by scaling the first three key bytes, read as a big-endian
/// 24-bit integer. Only sound when keys are independently uniform; keys
/// must be at least three bytes long.
pub struct UniformPartitionFunction {
    global_partitions: u64,
    local_partitions: u64,
}

impl UniformPartitionFunction {
    pub fn new(global_partitions: u64, local_partitions: u64) -> Self {
        assert!(
            global_partitions > 0 && global_partitions <= UNIFORM_KEY_SPACE,
            "unsupported number of global partitions"
        );
        UniformPartitionFunction {
            global_partitions,
            local_partitions,
        }
    }

    fn prefix(key: &[u8]) -> u64 {
        assert!(
            key.len() >= 3,
            "uniform partitioning needs keys of at least 3 bytes"
        );
        (key[0] as u64) << 16 | (key[1] as u64) << 8 | key[2] as u64
    }
}

impl PartitionFunction for UniformPartitionFunction {
    fn global_partition(&self, key: &[u8]) -> u64 {
        Self::prefix(key) * self.global_partitions / UNIFORM_KEY_SPACE
    }

    fn local_partition(&self, key: &[u8], _partition_group: u64) -> u64 {
        Self::prefix(key) * self.local_partitions / UNIFORM_KEY_SPACE
    }

    fn num_global_partitions(&self) -> u64 {
        self.global_partitions
    }

    fn hashes_keys(&self) -> bool {
        false
    }
}

/// Funnels every key into partition 0, globally and locally.
pub struct SinglePartitionMergingPartitionFunction;

impl PartitionFunction for SinglePartitionMergingPartitionFunction {
    fn global_partition(&self, _key: &[u8]) -> u64 {
        0
    }

    fn local_partition(&self, _key: &[u8], _partition_group: u64) -> u64 {
        0
    }

    fn num_global_partitions(&self) -> u64 {
        1
    }

    fn hashes_keys(&self) -> bool {
        false
    }
}

/// Spreads keys over nodes uniformly at random; used by the phase-zero
/// shuffle to even out sample placement.
pub struct RandomNodePartitionFunction {
    num_nodes: u64,
}

impl RandomNodePartitionFunction {
    pub fn new(num_nodes: u64) -> Self {
        assert!(num_nodes > 0, "need at least one node");
        RandomNodePartitionFunction { num_nodes }
    }
}

impl PartitionFunction for RandomNodePartitionFunction {
    fn global_partition(&self, _key: &[u8]) -> u64 {
        rand::rng().random_range(0..self.num_nodes)
    }

    fn local_partition(&self, _key: &[u8], _partition_group: u64) -> u64 {
        0
    }

    fn num_global_partitions(&self) -> u64 {
        self.num_nodes
    }

    fn hashes_keys(&self) -> bool {
        false
    }
}

/// Deals boundary records out to nodes in arrival order, `partitions_per_node`
/// apiece. Only used when distributing boundary picks at the end of phase
/// zero; it does not partition general keys.
pub struct BoundaryScannerPartitionFunction {
    partitions_per_node: u64,
    num_nodes: u64,
    partitions_seen: AtomicU64,
}

impl BoundaryScannerPartitionFunction {
    pub fn new(partitions_per_node: u64, num_nodes: u64) -> Self {
        BoundaryScannerPartitionFunction {
            partitions_per_node,
            num_nodes,
            partitions_seen: AtomicU64::new(0),
        }
    }
}

impl PartitionFunction for BoundaryScannerPartitionFunction {
    fn global_partition(&self, _key: &[u8]) -> u64 {
        let seen = self.partitions_seen.fetch_add(1, Ordering::Relaxed);
        let node = seen / self.partitions_per_node;
        assert!(
            node < self.num_nodes,
            "boundary scanner assigned node {} of {}",
            node,
            self.num_nodes
        );
        node
    }

    fn local_partition(&self, _key: &[u8], _partition_group: u64) -> u64 {
        unimplemented!("boundary scanner does not partition locally")
    }

    fn num_global_partitions(&self) -> u64 {
        self.num_nodes
    }

    fn hashes_keys(&self) -> bool {
        false
    }

    fn accepted_by_filter(&self, _key: &[u8], _filter: &dyn RecordFilter) -> bool {
        unimplemented!("boundary scanner does not filter")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_uniform_scales_prefix() {
        let function = UniformPartitionFunction::new(4, 16);
        assert_eq!(function.global_partition(&[0, 0, 0]), 0);
        assert_eq!(function.global_partition(&[0x40, 0, 0]), 1);
        assert_eq!(function.global_partition(&[0x80, 0, 0, 99]), 2);
        assert_eq!(function.global_partition(&[0xff, 0xff, 0xff]), 3);
        assert_eq!(function.local_partition(&[0x10, 0, 0], 0), 1);
    }

    #[test]
    #[should_panic(expected = "at least 3 bytes")]
    fn test_uniform_rejects_short_keys() {
        UniformPartitionFunction::new(4, 4).global_partition(&[1, 2]);
    }

    #[test]
    fn test_random_node_in_range() {
        let function = RandomNodePartitionFunction::new(5);
        for _ in 0..100 {
            assert!(function.global_partition(b"key") < 5);
            assert_eq!(function.local_partition(b"key", 0), 0);
        }
    }

    #[test]
    fn test_boundary_scanner_deals_in_order() {
        let function = BoundaryScannerPartitionFunction::new(2, 3);
        let nodes: Vec<u64> = (0..6).map(|_| function.global_partition(b"x")).collect();
        assert_eq!(nodes, vec![0, 0, 1, 1, 2, 2]);
    }
}
