/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Tests for the k-way chunk merger.

use std::sync::Arc;

use anyhow::Result;
use stagesort::prelude::*;

/// Builds a chunk buffer of single-byte keys with empty values.
fn chunk_buffer(partition: u64, chunk_id: u64, keys: &[u8]) -> KvBuffer {
    let mut buffer = KvBuffer::new(4096, 8);
    buffer.set_job_id(1);
    buffer.set_logical_disk_id(partition);
    buffer.set_chunk_id(chunk_id);
    for &key in keys {
        buffer.append(&KvPair::new(&[key], b""));
    }
    buffer
}

/// Wires a merger over the given chunks and returns the emitted buffers
/// in emission order.
fn merge(
    chunks: Vec<(u64, &[u8])>,
    output_capacity: usize,
) -> Result<(MergerStats, Vec<KvBuffer>)> {
    let partitions: std::collections::BTreeSet<u64> =
        chunks.iter().map(|(partition, _)| *partition).collect();
    let chunk_map = ChunkMap::new(2);
    let mut buffers = Vec::new();
    for &partition in &partitions {
        for (chunk_partition, keys) in &chunks {
            if *chunk_partition != partition {
                continue;
            }
            let record_bytes = keys.len() * (HEADER_SIZE + 1);
            let (chunk_id, _) = chunk_map.add_chunk(partition, record_bytes as u64);
            buffers.push(chunk_buffer(partition, chunk_id, keys));
        }
    }

    let input: Arc<dyn QueueingPolicy<KvBuffer>> = Arc::new(RoutedQueueingPolicy::new(
        chunk_map.total_chunks() as usize,
        MergerRouter::from_chunk_map(&chunk_map),
    ));
    for buffer in buffers {
        input.enqueue(buffer);
    }
    input.teardown();

    let output: Arc<dyn QueueingPolicy<KvBuffer>> = Arc::new(RoutedQueueingPolicy::single(1));
    let merger = Merger::new(
        input,
        output.clone(),
        KvBufferFactory::new(output_capacity, 8),
        &chunk_map,
        None,
    );
    let stats = merger.run()?;
    output.teardown();

    let mut emitted = Vec::new();
    while let Some(buffer) = output.dequeue(0) {
        emitted.push(buffer);
    }
    Ok((stats, emitted))
}

fn keys_of(buffers: &[KvBuffer], partition: u64) -> Vec<u8> {
    buffers
        .iter()
        .filter(|buffer| buffer.logical_disk_id() == Some(partition))
        .flat_map(|buffer| buffer.iter().map(|kv| kv.key()[0]).collect::<Vec<_>>())
        .collect()
}

#[test]
fn test_two_partitions_two_chunks_each() -> Result<()> {
    let (stats, emitted) = merge(
        vec![
            (0, &[1, 3, 5][..]),
            (0, &[2, 4, 6][..]),
            (1, &[10, 30][..]),
            (1, &[20, 40][..]),
        ],
        4096,
    )?;
    assert_eq!(stats.partitions, 2);
    assert_eq!(stats.tuples_out, 10);
    assert_eq!(keys_of(&emitted, 0), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(keys_of(&emitted, 1), vec![10, 20, 30, 40]);
    Ok(())
}

#[test]
fn test_round_robin_alternates_between_partitions() -> Result<()> {
    // Output buffers that hold a single 9-byte record force an emission
    // per service turn, making the rotation visible.
    let (_, emitted) = merge(
        vec![
            (0, &[1, 3, 5][..]),
            (0, &[2, 4, 6][..]),
            (1, &[10, 30][..]),
            (1, &[20, 40][..]),
        ],
        16,
    )?;
    let order: Vec<u64> = emitted
        .iter()
        .map(|buffer| buffer.logical_disk_id().unwrap())
        .collect();
    // While both partitions are live, emissions alternate between them.
    assert_eq!(&order[..6], &[0, 1, 0, 1, 0, 1]);
    // Contents stay sorted regardless of buffer size.
    assert_eq!(keys_of(&emitted, 0), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(keys_of(&emitted, 1), vec![10, 20, 30, 40]);
    Ok(())
}

#[test]
fn test_duplicate_keys_keep_chunk_order() -> Result<()> {
    // Both chunks of partition 0 carry the same key; chunk 0's copies
    // must all precede chunk 1's only when they compare equal through
    // the tie-break, i.e. the merge is deterministic.
    let (_, emitted) = merge(vec![(0, &[7, 7][..]), (0, &[7, 7][..])], 4096)?;
    assert_eq!(keys_of(&emitted, 0), vec![7, 7, 7, 7]);
    Ok(())
}

#[test]
fn test_single_chunk_passthrough() -> Result<()> {
    let (stats, emitted) = merge(vec![(3, &[9, 11, 13][..])], 4096)?;
    assert_eq!(stats.partitions, 1);
    assert_eq!(keys_of(&emitted, 3), vec![9, 11, 13]);
    Ok(())
}

#[test]
fn test_multi_buffer_chunks() -> Result<()> {
    // A chunk delivered as several buffers: split [1, 3, 5, 7] in two.
    let chunk_map = ChunkMap::new(1);
    let (chunk_0, _) = chunk_map.add_chunk(0, 4 * (HEADER_SIZE as u64 + 1));
    let (chunk_1, _) = chunk_map.add_chunk(0, 2 * (HEADER_SIZE as u64 + 1));

    let input: Arc<dyn QueueingPolicy<KvBuffer>> = Arc::new(RoutedQueueingPolicy::new(
        2,
        MergerRouter::from_chunk_map(&chunk_map),
    ));
    input.enqueue(chunk_buffer(0, chunk_0, &[1, 3]));
    input.enqueue(chunk_buffer(0, chunk_0, &[5, 7]));
    input.enqueue(chunk_buffer(0, chunk_1, &[2, 4]));
    input.teardown();

    let output: Arc<dyn QueueingPolicy<KvBuffer>> = Arc::new(RoutedQueueingPolicy::single(1));
    let merger = Merger::new(
        input,
        output.clone(),
        KvBufferFactory::new(4096, 8),
        &chunk_map,
        None,
    );
    merger.run()?;
    output.teardown();

    let mut emitted = Vec::new();
    while let Some(buffer) = output.dequeue(0) {
        emitted.push(buffer);
    }
    assert_eq!(keys_of(&emitted, 0), vec![1, 2, 3, 4, 5, 7]);
    Ok(())
}
