/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use dary_heap::QuaternaryHeap;
use log::debug;

use crate::chunk_map::ChunkMap;
use crate::job::JobId;
use crate::record::KvBuffer;
use crate::runtime::{KvBufferFactory, QueueingPolicy, WriteTokenPool};

/// A k-way merge entry: the head key of one chunk. Ordering is reversed
/// so the quaternary max-heap pops the smallest key; ties go to the
/// lowest chunk id, keeping equal-key duplicates in a deterministic
/// order.
struct HeapEntry {
    key: Box<[u8]>,
    chunk_id: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.chunk_id == other.chunk_id
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&other.key, other.chunk_id).cmp(&(&self.key, self.chunk_id))
    }
}

struct ChunkCursor {
    buffer: Option<KvBuffer>,
    offset: usize,
    bytes_merged: u64,
    chunk_size: u64,
}

struct PartitionState {
    partition: u64,
    queue_offset: u64,
    heap: QuaternaryHeap<HeapEntry>,
    chunks: BTreeMap<u64, ChunkCursor>,
    output: Option<KvBuffer>,
    completed_chunks: usize,
}

/// Statistics of one merge run.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergerStats {
    pub partitions: u64,
    pub buffers_out: u64,
    pub tuples_out: u64,
    pub bytes_out: u64,
}

/// Merges the sorted chunks of every partition into a single sorted
/// stream of buffers per partition.
///
/// The merger owns one input queue per `(partition, chunk)` pair and
/// services partitions round-robin: each turn runs one partition until it
/// either emits an output buffer or completes, so no partition ever has
/// more than one output buffer outstanding. That bound is what keeps the
/// merge deadlock-free; the upstream reader must be allowed to keep
/// enough buffers in flight to always satisfy the next blocking fetch.
pub struct Merger {
    input: Arc<dyn QueueingPolicy<KvBuffer>>,
    output: Arc<dyn QueueingPolicy<KvBuffer>>,
    factory: KvBufferFactory,
    token_pool: Option<Arc<WriteTokenPool>>,
    partitions: VecDeque<PartitionState>,
    job_id: Option<JobId>,
    stats: MergerStats,
}

impl Merger {
    pub fn new(
        input: Arc<dyn QueueingPolicy<KvBuffer>>,
        output: Arc<dyn QueueingPolicy<KvBuffer>>,
        factory: KvBufferFactory,
        chunk_map: &ChunkMap,
        token_pool: Option<Arc<WriteTokenPool>>,
    ) -> Self {
        let offsets = chunk_map.queue_offsets();
        let partitions = chunk_map
            .snapshot()
            .into_iter()
            .map(|(partition, chunks)| PartitionState {
                partition,
                queue_offset: offsets[&partition],
                heap: QuaternaryHeap::with_capacity(chunks.len()),
                chunks: chunks
                    .into_iter()
                    .map(|info| {
                        (
                            info.chunk_id,
                            ChunkCursor {
                                buffer: None,
                                offset: 0,
                                bytes_merged: 0,
                                chunk_size: info.size,
                            },
                        )
                    })
                    .collect(),
                output: None,
                completed_chunks: 0,
            })
            .collect();
        Merger {
            input,
            output,
            factory,
            token_pool,
            partitions,
            job_id: None,
            stats: MergerStats::default(),
        }
    }

    /// Block-fetches the next buffer of a chunk, returning its read token
    /// to the pool.
    fn fetch(&self, queue: u64, chunk_id: u64) -> Result<KvBuffer> {
        let mut buffer = self
            .input
            .dequeue(queue as usize)
            .ok_or_else(|| anyhow!("chunk queue {} ended before its chunk was delivered", queue))?;
        assert_eq!(
            buffer.chunk_id(),
            Some(chunk_id),
            "merger fetched a buffer for the wrong chunk from queue {}",
            queue
        );
        if let Some(token) = buffer.take_token() {
            if let Some(pool) = &self.token_pool {
                pool.put(token);
            }
        }
        Ok(buffer)
    }

    fn emit(&mut self, buffer: KvBuffer) {
        self.stats.buffers_out += 1;
        self.stats.tuples_out += buffer.record_count();
        self.stats.bytes_out += buffer.current_size() as u64;
        self.output.enqueue(buffer);
    }

    /// Loads the first buffer and head record of every chunk.
    fn prime(&mut self) -> Result<()> {
        let mut partitions = std::mem::take(&mut self.partitions);
        for state in &mut partitions {
            for (&chunk_id, cursor) in &mut state.chunks {
                let buffer = self.fetch(state.queue_offset + chunk_id, chunk_id)?;
                assert!(
                    !buffer.is_empty(),
                    "first buffer for chunk {} of partition {} holds no record",
                    chunk_id,
                    state.partition
                );
                if self.job_id.is_none() {
                    self.job_id = buffer.job_id();
                }
                let (head, _) = buffer.pair_at(0).unwrap();
                state.heap.push(HeapEntry {
                    key: head.key().into(),
                    chunk_id,
                });
                cursor.buffer = Some(buffer);
                cursor.offset = 0;
            }
        }
        self.partitions = partitions;
        Ok(())
    }

    /// Services one partition until it emits a buffer or completes.
    /// Returns true when the partition is done.
    fn service(&mut self, state: &mut PartitionState) -> Result<bool> {
        loop {
            let entry = state
                .heap
                .pop()
                .expect("merge heap drained while chunks are still open");
            let chunk_id = entry.chunk_id;

            let cursor = state.chunks.get_mut(&chunk_id).unwrap();
            let (kv, next_offset) = cursor
                .buffer
                .as_ref()
                .unwrap()
                .pair_at(cursor.offset)
                .expect("heap entry without a backing record");
            let size = kv.framed_size();

            // Acquire the output buffer before consuming the record, and
            // emit only a buffer the record does not fit.
            let mut emitted = false;
            if state
                .output
                .as_ref()
                .is_some_and(|out| out.current_size() + size > out.capacity())
            {
                let full = state.output.take().unwrap();
                self.emit(full);
                emitted = true;
            }
            if state.output.is_none() {
                let mut out = self.factory.create_with_capacity(size);
                out.set_logical_disk_id(state.partition);
                if let Some(job_id) = self.job_id {
                    out.set_job_id(job_id);
                }
                state.output = Some(out);
            }
            state.output.as_mut().unwrap().append(&kv);

            // Advance the chunk the record came from.
            cursor.offset = next_offset;
            cursor.bytes_merged += size as u64;
            let mut has_head = cursor.offset < cursor.buffer.as_ref().unwrap().current_size();
            if !has_head {
                cursor.buffer = None;
                if cursor.bytes_merged == cursor.chunk_size {
                    state.completed_chunks += 1;
                } else {
                    let buffer = self.fetch(state.queue_offset + chunk_id, chunk_id)?;
                    assert!(
                        !buffer.is_empty(),
                        "buffer for chunk {} holds no record",
                        chunk_id
                    );
                    let cursor = state.chunks.get_mut(&chunk_id).unwrap();
                    cursor.buffer = Some(buffer);
                    cursor.offset = 0;
                    has_head = true;
                }
            }
            if has_head {
                let cursor = state.chunks.get_mut(&chunk_id).unwrap();
                let (head, _) = cursor
                    .buffer
                    .as_ref()
                    .unwrap()
                    .pair_at(cursor.offset)
                    .unwrap();
                state.heap.push(HeapEntry {
                    key: head.key().into(),
                    chunk_id,
                });
            }

            if state.completed_chunks == state.chunks.len() {
                if let Some(out) = state.output.take() {
                    self.emit(out);
                }
                assert!(
                    state.heap.is_empty(),
                    "partition {} completed with {} heap entries left",
                    state.partition,
                    state.heap.len()
                );
                return Ok(true);
            }
            if emitted {
                return Ok(false);
            }
        }
    }

    /// Runs the merge to completion.
    pub fn run(mut self) -> Result<MergerStats> {
        self.stats.partitions = self.partitions.len() as u64;
        self.prime()?;

        // Round-robin: take a partition, run it to its next emission,
        // requeue it unless it finished.
        while let Some(mut state) = self.partitions.pop_front() {
            let finished = self.service(&mut state)?;
            if !finished {
                self.partitions.push_back(state);
            }
        }
        debug!(
            "merged {} partitions: {} buffers, {} tuples, {} bytes",
            self.stats.partitions, self.stats.buffers_out, self.stats.tuples_out, self.stats.bytes_out
        );
        Ok(self.stats)
    }
}
