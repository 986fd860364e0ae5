/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Routing specializations for the pipeline's stages.
//!
//! Each router encodes one stage boundary's placement rule; all of them
//! plug into [`RoutedQueueingPolicy`](crate::runtime::RoutedQueueingPolicy)
//! except the disk-fair policy, whose choice of queue depends on queue
//! state and therefore implements [`QueueingPolicy`] directly.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::chunk_map::ChunkMap;
use crate::job::ReadRequest;
use crate::record::{ByteBuffer, KvBuffer};
use crate::runtime::{QueueingPolicy, Router, WorkQueue};

/// Pins a byte stream to a converter worker: queue `stream_id % n`.
pub struct ByteStreamRouter {
    num_workers: usize,
}

impl ByteStreamRouter {
    pub fn new(num_workers: usize) -> Self {
        ByteStreamRouter { num_workers }
    }
}

impl Router<ByteBuffer> for ByteStreamRouter {
    fn route(&self, unit: &mut ByteBuffer) -> usize {
        unit.stream_id as usize % self.num_workers
    }
}

/// Routes a shuffle buffer to its destination node's sender queue.
///
/// When the buffer carries a partition group, the node is derived from it
/// and stamped onto the buffer; otherwise the buffer must already be
/// node-tagged.
pub struct NetworkDestinationRouter {
    partition_groups_per_node: u64,
}

impl NetworkDestinationRouter {
    pub fn new(partition_groups_per_node: u64) -> Self {
        NetworkDestinationRouter {
            partition_groups_per_node,
        }
    }
}

impl Router<KvBuffer> for NetworkDestinationRouter {
    fn route(&self, unit: &mut KvBuffer) -> usize {
        match unit.partition_group() {
            Some(group) => {
                let node = group / self.partition_groups_per_node;
                unit.set_node(node);
                node as usize
            }
            None => unit
                .node()
                .expect("buffer has neither partition group nor node") as usize,
        }
    }
}

/// Pins a partition group to a demultiplexer: queue
/// `partition_group % groups_per_node`.
pub struct PartitionGroupRouter {
    partition_groups_per_node: u64,
}

impl PartitionGroupRouter {
    pub fn new(partition_groups_per_node: u64) -> Self {
        PartitionGroupRouter {
            partition_groups_per_node,
        }
    }
}

impl Router<KvBuffer> for PartitionGroupRouter {
    fn route(&self, unit: &mut KvBuffer) -> usize {
        let group = unit
            .partition_group()
            .expect("buffer entering a demux must carry a partition group");
        (group % self.partition_groups_per_node) as usize
    }
}

/// Routes a partition-tagged buffer to the writer owning its physical
/// disk.
pub struct PhysicalDiskRouter {
    disks_per_worker: u64,
    partitions_per_disk: u64,
    partitions_per_node: u64,
}

impl PhysicalDiskRouter {
    pub fn new(disks_per_worker: u64, partitions_per_disk: u64, partitions_per_node: u64) -> Self {
        PhysicalDiskRouter {
            disks_per_worker,
            partitions_per_disk,
            partitions_per_node,
        }
    }

    fn disk_of(&self, unit: &KvBuffer) -> u64 {
        let partition = unit
            .logical_disk_id()
            .expect("buffer entering a disk-routed stage must carry a partition");
        (partition % self.partitions_per_node) / self.partitions_per_disk
    }
}

impl Router<KvBuffer> for PhysicalDiskRouter {
    fn route(&self, unit: &mut KvBuffer) -> usize {
        (self.disk_of(unit) / self.disks_per_worker) as usize
    }
}

/// Pins a read request to the reader serving its disk: queue
/// `disk_id % n`.
pub struct ReadRequestRouter {
    num_readers: usize,
}

impl ReadRequestRouter {
    pub fn new(num_readers: usize) -> Self {
        ReadRequestRouter { num_readers }
    }
}

impl Router<ReadRequest> for ReadRequestRouter {
    fn route(&self, unit: &mut ReadRequest) -> usize {
        unit.disk_id as usize % self.num_readers
    }
}

/// Allocates a chunk id and a round-robin disk for each sorted run as it
/// is routed to its writer.
///
/// This router owns the chunk map's critical section of
/// allocate-chunk-id-and-assign-disk; no other router mutates the map.
pub struct ChunkingRouter {
    disks_per_worker: u64,
    chunk_map: Arc<ChunkMap>,
}

impl ChunkingRouter {
    pub fn new(disks_per_worker: u64, chunk_map: Arc<ChunkMap>) -> Self {
        ChunkingRouter {
            disks_per_worker,
            chunk_map,
        }
    }
}

impl Router<KvBuffer> for ChunkingRouter {
    fn route(&self, unit: &mut KvBuffer) -> usize {
        let partition = unit
            .logical_disk_id()
            .expect("buffer entering the chunking boundary must carry a partition");
        let (chunk_id, disk_id) = self
            .chunk_map
            .add_chunk(partition, unit.current_size() as u64);
        unit.set_chunk_id(chunk_id);
        (disk_id / self.disks_per_worker) as usize
    }
}

/// One queue per `(partition, chunk)` pair: queue
/// `base_offset[partition] + chunk_id`.
pub struct MergerRouter {
    offsets: BTreeMap<u64, u64>,
    total_chunks: u64,
}

impl MergerRouter {
    pub fn from_chunk_map(chunk_map: &ChunkMap) -> Self {
        MergerRouter {
            offsets: chunk_map.queue_offsets(),
            total_chunks: chunk_map.total_chunks(),
        }
    }
}

impl Router<KvBuffer> for MergerRouter {
    fn route(&self, unit: &mut KvBuffer) -> usize {
        let partition = unit
            .logical_disk_id()
            .expect("buffer entering the merger must carry a partition");
        let chunk_id = unit
            .chunk_id()
            .expect("buffer entering the merger must carry a chunk id");
        let queue = self.offsets[&partition] + chunk_id;
        assert!(
            queue < self.total_chunks,
            "chunk {} of partition {} routed past the last chunk queue",
            chunk_id,
            partition
        );
        queue as usize
    }
}

/// A disk-fair policy for stages that feed the writers but do not care
/// which disk they process data for.
///
/// Buffers are parked in per-disk sub-queues on enqueue; dequeues pop from
/// the round-robin cursor's first nonempty sub-queue and advance it, so
/// the load offered to each disk stays within one buffer of the others.
pub struct FairDiskQueueingPolicy {
    state: Mutex<FairDiskState>,
    pushed: Condvar,
    num_disks: usize,
    partitions_per_disk: u64,
    partitions_per_node: u64,
}

struct FairDiskState {
    queues: Vec<WorkQueue<KvBuffer>>,
    cursor: usize,
    done: bool,
}

impl FairDiskQueueingPolicy {
    pub fn new(num_disks: usize, partitions_per_disk: u64, partitions_per_node: u64) -> Self {
        assert!(num_disks > 0, "disk-fair policy needs at least one disk");
        FairDiskQueueingPolicy {
            state: Mutex::new(FairDiskState {
                queues: (0..num_disks).map(|_| WorkQueue::new()).collect(),
                cursor: 0,
                done: false,
            }),
            pushed: Condvar::new(),
            num_disks,
            partitions_per_disk,
            partitions_per_node,
        }
    }

    fn disk_of(&self, unit: &KvBuffer) -> usize {
        let partition = unit
            .logical_disk_id()
            .expect("buffer entering the disk-fair policy must carry a partition");
        (((partition % self.partitions_per_node) / self.partitions_per_disk) as usize)
            % self.num_disks
    }

    fn pop_round_robin(state: &mut FairDiskState) -> Option<KvBuffer> {
        let n = state.queues.len();
        for step in 0..n {
            let index = (state.cursor + step) % n;
            if !state.queues[index].is_empty() {
                let unit = state.queues[index].pop_front();
                state.cursor = (index + 1) % n;
                return unit;
            }
        }
        None
    }
}

impl QueueingPolicy<KvBuffer> for FairDiskQueueingPolicy {
    fn enqueue(&self, unit: KvBuffer) {
        let disk = self.disk_of(&unit);
        let mut state = self.state.lock().unwrap();
        state.queues[disk].push(Some(unit));
        drop(state);
        self.pushed.notify_one();
    }

    fn dequeue(&self, _queue: usize) -> Option<KvBuffer> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(unit) = Self::pop_round_robin(&mut state) {
                return Some(unit);
            }
            if state.done {
                return None;
            }
            state = self.pushed.wait(state).unwrap();
        }
    }

    fn try_dequeue(&self, _queue: usize) -> (bool, Option<KvBuffer>) {
        let mut state = self.state.lock().unwrap();
        match Self::pop_round_robin(&mut state) {
            Some(unit) => (true, Some(unit)),
            None => (state.done, None),
        }
    }

    fn batch_dequeue(&self, _queue: usize, dest: &mut WorkQueue<KvBuffer>) {
        let mut state = self.state.lock().unwrap();
        let n = state.queues.len();
        let cursor = state.cursor;
        for step in 0..n {
            let index = (cursor + step) % n;
            state.queues[index].move_work_to(dest);
        }
        if state.done {
            dest.push(None);
        }
    }

    fn teardown(&self) {
        let mut state = self.state.lock().unwrap();
        state.done = true;
        drop(state);
        self.pushed.notify_all();
    }

    fn num_queues(&self) -> usize {
        self.num_disks
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::KvPair;

    fn buffer_for_partition(partition: u64) -> KvBuffer {
        let mut buffer = KvBuffer::new(64, 8);
        buffer.append(&KvPair::new(b"k", b"v"));
        buffer.set_logical_disk_id(partition);
        buffer
    }

    #[test]
    fn test_fair_disk_round_robins_between_disks() {
        // Two disks, two partitions per disk, four partitions per node.
        let policy = FairDiskQueueingPolicy::new(2, 2, 4);
        // Three buffers for disk 0, one for disk 1.
        for partition in [0, 1, 0, 2] {
            policy.enqueue(buffer_for_partition(partition));
        }
        policy.teardown();
        let order: Vec<u64> = std::iter::from_fn(|| policy.dequeue(0))
            .map(|b| b.logical_disk_id().unwrap())
            .collect();
        // Disk 0 holds partitions 0, 1, 0; disk 1 holds partition 2. The
        // cursor alternates while both disks have work.
        assert_eq!(order, vec![0, 2, 1, 0]);
    }

    #[test]
    fn test_chunking_router_allocates_chunks() {
        let chunk_map = Arc::new(ChunkMap::new(4));
        let router = ChunkingRouter::new(2, chunk_map.clone());
        let mut first = buffer_for_partition(9);
        let mut second = buffer_for_partition(9);
        assert_eq!(router.route(&mut first), 0);
        assert_eq!(router.route(&mut second), 0);
        assert_eq!(first.chunk_id(), Some(0));
        assert_eq!(second.chunk_id(), Some(1));
        assert_eq!(chunk_map.total_chunks(), 2);
        assert_eq!(chunk_map.disk_id(9, 1), 1);
    }

    #[test]
    fn test_byte_stream_pins_streams_to_workers() {
        let router = ByteStreamRouter::new(3);
        for stream_id in 0..9u64 {
            let mut buffer = crate::record::ByteBuffer::new(stream_id, vec![1, 2, 3]);
            assert_eq!(router.route(&mut buffer), (stream_id % 3) as usize);
        }
    }

    #[test]
    fn test_read_requests_pin_disks_to_readers() {
        let router = ReadRequestRouter::new(2);
        let mut request = crate::job::ReadRequest {
            disk_id: 5,
            partition: 0,
            chunk_id: 0,
            size: 64,
        };
        assert_eq!(router.route(&mut request), 1);
    }

    #[test]
    fn test_physical_disk_groups_partitions_per_worker() {
        // Eight partitions per node, two per disk, two disks per worker.
        let router = PhysicalDiskRouter::new(2, 2, 8);
        let expectations = [(0, 0), (1, 0), (2, 0), (3, 0), (4, 1), (6, 1), (9, 0), (13, 1)];
        for (partition, queue) in expectations {
            let mut buffer = buffer_for_partition(partition);
            assert_eq!(router.route(&mut buffer), queue, "partition {}", partition);
        }
    }

    #[test]
    fn test_network_destination_stamps_node() {
        let router = NetworkDestinationRouter::new(2);
        let mut buffer = buffer_for_partition(0);
        buffer.set_partition_group(5);
        assert_eq!(router.route(&mut buffer), 2);
        assert_eq!(buffer.node(), Some(2));
    }
}
