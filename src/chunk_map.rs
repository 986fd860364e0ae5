/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The process-wide map recording where the sorted chunks of every
//! partition live.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// One sorted on-disk run of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_id: u64,
    pub size: u64,
    pub disk_id: u64,
}

/// A thread-safe mapping from partition id to the chunks written for it,
/// with round-robin disk assignment.
///
/// Chunks are appended as sorted runs are handed to the writer; chunk ids
/// for a partition are allocated densely from 0, and once inserted a
/// `(partition, chunk)` record is never removed or re-keyed. The map lives
/// from the chunk-writing half of a run through merging.
pub struct ChunkMap {
    disks_per_node: u64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    chunks: BTreeMap<u64, Vec<ChunkInfo>>,
    next_disk: u64,
}

impl ChunkMap {
    pub fn new(disks_per_node: u64) -> Self {
        assert!(disks_per_node > 0, "chunk map needs at least one disk");
        ChunkMap {
            disks_per_node,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Registers a new chunk for `partition`, assigning it the next disk
    /// round-robin. Returns the chunk id and the disk it landed on.
    pub fn add_chunk(&self, partition: u64, size: u64) -> (u64, u64) {
        let mut inner = self.inner.lock().unwrap();
        let disk_id = inner.next_disk;
        inner.next_disk = (inner.next_disk + 1) % self.disks_per_node;
        let chunks = inner.chunks.entry(partition).or_default();
        let chunk_id = chunks.len() as u64;
        chunks.push(ChunkInfo {
            chunk_id,
            size,
            disk_id,
        });
        (chunk_id, disk_id)
    }

    /// The disk a chunk was assigned to.
    pub fn disk_id(&self, partition: u64, chunk_id: u64) -> u64 {
        self.chunk(partition, chunk_id).disk_id
    }

    /// The byte size recorded for a chunk.
    pub fn chunk_size(&self, partition: u64, chunk_id: u64) -> u64 {
        self.chunk(partition, chunk_id).size
    }

    fn chunk(&self, partition: u64, chunk_id: u64) -> ChunkInfo {
        let inner = self.inner.lock().unwrap();
        *inner
            .chunks
            .get(&partition)
            .and_then(|chunks| chunks.get(chunk_id as usize))
            .unwrap_or_else(|| panic!("unknown chunk {} of partition {}", chunk_id, partition))
    }

    /// A point-in-time copy of the whole map, in partition order.
    pub fn snapshot(&self) -> BTreeMap<u64, Vec<ChunkInfo>> {
        self.inner.lock().unwrap().chunks.clone()
    }

    /// The total number of chunks across all partitions.
    pub fn total_chunks(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.chunks.values().map(|chunks| chunks.len() as u64).sum()
    }

    /// For each partition in id order, the index of its first queue in a
    /// one-queue-per-chunk layout.
    pub fn queue_offsets(&self) -> BTreeMap<u64, u64> {
        let inner = self.inner.lock().unwrap();
        let mut offsets = BTreeMap::new();
        let mut offset = 0;
        for (&partition, chunks) in &inner.chunks {
            offsets.insert(partition, offset);
            offset += chunks.len() as u64;
        }
        offsets
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dense_chunk_ids_and_round_robin_disks() {
        let map = ChunkMap::new(3);
        assert_eq!(map.add_chunk(7, 100), (0, 0));
        assert_eq!(map.add_chunk(7, 200), (1, 1));
        assert_eq!(map.add_chunk(2, 300), (0, 2));
        assert_eq!(map.add_chunk(7, 400), (2, 0));
        assert_eq!(map.disk_id(2, 0), 2);
        assert_eq!(map.chunk_size(7, 1), 200);
        assert_eq!(map.total_chunks(), 4);
    }

    #[test]
    fn test_queue_offsets_in_partition_order() {
        let map = ChunkMap::new(2);
        map.add_chunk(5, 10);
        map.add_chunk(5, 10);
        map.add_chunk(1, 10);
        let offsets = map.queue_offsets();
        assert_eq!(offsets[&1], 0);
        assert_eq!(offsets[&5], 1);
    }
}
