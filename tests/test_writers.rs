/*
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Cross-cutting writer properties: routing, byte conservation, and the
//! phase-zero sampling record format.

use std::sync::Arc;

use anyhow::Result;
use stagesort::prelude::*;

/// A host that keeps every emitted buffer, for driving writers directly.
struct Collector {
    factory: KvBufferFactory,
    emitted: Vec<(u64, KvBuffer)>,
}

impl Collector {
    fn new(factory: KvBufferFactory) -> Self {
        Collector {
            factory,
            emitted: Vec::new(),
        }
    }
}

impl WriterHost for Collector {
    fn emit(&mut self, buffer: KvBuffer, dest: u64) {
        self.emitted.push((dest, buffer));
    }

    fn get_buffer(&mut self, min_capacity: usize) -> KvBuffer {
        self.factory.create_with_capacity(min_capacity)
    }
}

#[test]
fn test_every_mapped_record_lands_in_its_partition() {
    // Each record ends up in exactly one buffer, tagged with the global
    // partition of its key.
    let function = Arc::new(UniformPartitionFunction::new(4, 8));
    let mut writer = FastKvWriter::new(
        Collector::new(KvBufferFactory::new(64, 8)),
        function.clone(),
        Framing::Framed,
        0,
    );
    let records: Vec<(Vec<u8>, Vec<u8>)> = (0..200u8)
        .map(|i| (vec![i, i ^ 0x55, 7], vec![i; 3]))
        .collect();
    for (key, value) in &records {
        writer.write(&KvPair::new(key, value));
    }
    writer.flush_buffers();

    let mut seen = 0;
    for (dest, buffer) in &writer.host().emitted {
        for kv in buffer.iter() {
            assert_eq!(function.global_partition(kv.key()), *dest);
            seen += 1;
        }
    }
    assert_eq!(seen, records.len());
}

#[test]
fn test_partial_writer_conserves_bytes() {
    // Any write sequence totalling B bytes emits buffers whose summed
    // sizes equal B.
    for capacity in [16, 32, 57, 1024] {
        let mut writer = PartialKvWriter::new(
            Collector::new(KvBufferFactory::new(capacity, 8)),
            true,
        );
        let mut total = 0u64;
        for i in 0..50u64 {
            let key = i.to_be_bytes();
            let value = vec![i as u8; (i % 23) as usize];
            let kv = KvPair::new(&key, &value);
            total += kv.framed_size() as u64;
            writer.write(&kv);
        }
        writer.flush_buffers();
        let emitted: u64 = writer
            .host()
            .emitted
            .iter()
            .map(|(_, buffer)| buffer.current_size() as u64)
            .sum();
        assert_eq!(emitted, total, "capacity {}", capacity);
        assert_eq!(writer.bytes_written(), total);
    }
}

#[test]
fn test_reservoir_setup_write_before_sampling() {
    // One record written through setup/commit, hashed phase-zero
    // strategy: the single emitted tuple carries the key hash and the
    // tuple size.
    let mut writer = ReservoirSamplingWriter::new(
        Collector::new(KvBufferFactory::new(10_000, 8)),
        Box::new(HashedPhaseZeroWriteStrategy),
        None,
        1,
        0,
        0,
    );
    let key: Vec<u8> = (0..10).collect();
    let value = writer.setup_write(&key, 1000);
    for (i, byte) in value[..300].iter_mut().enumerate() {
        *byte = i as u8;
    }
    writer.commit_write(300);
    writer.flush_buffers();

    assert_eq!(writer.host().emitted.len(), 1);
    let (_, buffer) = &writer.host().emitted[0];
    assert_eq!(buffer.record_count(), 1);
    let kv = buffer.iter().next().unwrap();
    assert_eq!(kv.key_len(), 8);
    assert_eq!(u64::from_be_bytes(kv.key().try_into().unwrap()), hash64(&key));
    assert_eq!(kv.value_len(), 8);
    assert_eq!(
        u64::from_ne_bytes(kv.value().try_into().unwrap()),
        (8 + 10 + 300) as u64
    );
}

#[test]
fn test_framed_serialize_round_trip() {
    // Framed serialize then parse yields a bitwise-equal record.
    let key: Vec<u8> = (0..17).collect();
    let value: Vec<u8> = (0..255).rev().collect();
    let mut buffer = KvBuffer::new(1024, 8);
    buffer.append(&KvPair::new(&key, &value));
    let kv = buffer.iter().next().unwrap();
    assert_eq!(kv.key(), &key[..]);
    assert_eq!(kv.value(), &value[..]);
}

#[test]
fn test_demux_places_records_by_local_partition() -> Result<()> {
    // A partial writer in local mode, pinned to group 1 of a 2x2 layout:
    // slot i receives the records of partition offset + i.
    let mut keys: Vec<[u8; 8]> = (0u64..64).map(|i| hashed_key_bytes(&i.to_be_bytes())).collect();
    keys.sort();
    // Four evenly spaced boundaries for the four partitions.
    let mut boundary_buffer = KvBuffer::new(4096, 8);
    for index in [0, 16, 32, 48] {
        boundary_buffer.append(&KvPair::new(&keys[index], b""));
    }
    let partitioner = Arc::new(KeyPartitioner::from_boundary_buffer(&boundary_buffer, 2, 2)?);
    let function = Arc::new(BoundaryListPartitionFunction::new(partitioner));

    let mut writer = PartialKvWriter::with_local_partitioning(
        Collector::new(KvBufferFactory::new(4096, 8)),
        false,
        function.clone(),
        2,
        1,
        2,
    );
    for key in &keys {
        if function.global_partition(key) == 1 {
            writer.write(&KvPair::new(key, b"x"));
        }
    }
    writer.flush_buffers();

    for (dest, buffer) in &writer.host().emitted {
        for kv in buffer.iter() {
            assert_eq!(function.local_partition(kv.key(), 1) - 2, *dest);
        }
    }
    Ok(())
}
