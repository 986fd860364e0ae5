/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::sync::Arc;

use crate::partition::PartitionFunction;
use crate::record::{AppendSlot, Framing, KvBuffer, KvPair};
use crate::writer::{KvWriter, WriteStats, WriterHost};

/// The hot-path writer: no filter, no write strategy, every input record
/// written. Owns one buffer per global partition and emits a buffer
/// whenever the next record for its partition does not fit.
pub struct FastKvWriter<H: WriterHost> {
    host: H,
    partition_function: Arc<dyn PartitionFunction>,
    framing: Framing,
    buffers: Vec<Option<KvBuffer>>,
    sample_rate: u64,
    pending: Option<Pending>,
    tuples_written: u64,
    bytes_written: u64,
}

struct Pending {
    partition: usize,
    slot: AppendSlot,
    key_len: u32,
}

impl<H: WriterHost> FastKvWriter<H> {
    pub fn new(
        host: H,
        partition_function: Arc<dyn PartitionFunction>,
        framing: Framing,
        sample_rate: u64,
    ) -> Self {
        let num_buffers = partition_function.num_global_partitions() as usize;
        assert!(num_buffers > 0, "partition function produces no partitions");
        FastKvWriter {
            host,
            partition_function,
            framing,
            buffers: (0..num_buffers).map(|_| None).collect(),
            sample_rate,
            pending: None,
            tuples_written: 0,
            bytes_written: 0,
        }
    }

    /// The host this writer emits through.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Makes sure the partition's buffer can hold `size` more bytes,
    /// emitting the current buffer if not.
    fn reserve(&mut self, partition: usize, size: usize) {
        let needs_new = match &self.buffers[partition] {
            None => true,
            Some(buffer) => buffer.current_size() + size > buffer.capacity(),
        };
        if needs_new {
            if let Some(full) = self.buffers[partition].take() {
                self.host.emit(full, partition as u64);
            }
            let buffer = self.host.get_buffer(size);
            assert_eq!(buffer.framing(), self.framing, "host buffer framing mismatch");
            self.buffers[partition] = Some(buffer);
        }
    }
}

impl<H: WriterHost> KvWriter for FastKvWriter<H> {
    fn write(&mut self, kv: &KvPair) {
        assert!(self.pending.is_none(), "cannot write during a setup write");
        if self.sample_rate > 0 && self.tuples_written % self.sample_rate == 0 {
            self.host.log_sample(kv);
        }
        let partition = self.partition_function.global_partition(kv.key()) as usize;
        let size = kv.write_size(self.framing);
        self.reserve(partition, size);
        self.buffers[partition].as_mut().unwrap().append(kv);
        self.tuples_written += 1;
        self.bytes_written += size as u64;
    }

    fn setup_write(&mut self, key: &[u8], max_value_len: u32) -> &mut [u8] {
        assert!(
            self.pending.is_none(),
            "uncommitted write is already in progress; can't start another one"
        );
        let partition = self.partition_function.global_partition(key) as usize;
        let size = self.framing.record_size(key.len() as u32, max_value_len);
        self.reserve(partition, size);
        let buffer = self.buffers[partition].as_mut().unwrap();
        let slot = buffer.setup_append(key.len() as u32, max_value_len);
        buffer.pending_key_mut(&slot).copy_from_slice(key);
        self.pending = Some(Pending {
            partition,
            slot,
            key_len: key.len() as u32,
        });
        self.buffers[partition]
            .as_mut()
            .unwrap()
            .pending_value_mut(&slot)
    }

    fn commit_write(&mut self, value_len: u32) {
        let pending = self
            .pending
            .take()
            .expect("must set up a write before committing one");
        let buffer = self.buffers[pending.partition].as_mut().unwrap();
        buffer.commit_append(&pending.slot, value_len);
        self.tuples_written += 1;
        self.bytes_written += self.framing.record_size(pending.key_len, value_len) as u64;
    }

    fn flush_buffers(&mut self) {
        assert!(self.pending.is_none(), "flushed with an uncommitted write");
        for partition in 0..self.buffers.len() {
            if let Some(buffer) = self.buffers[partition].take() {
                if buffer.is_empty() {
                    self.host.put_buffer(buffer);
                } else {
                    self.host.emit(buffer, partition as u64);
                }
            }
        }
        self.host.log_write_stats(WriteStats {
            bytes_out: self.bytes_written,
            bytes_in: self.bytes_written,
            tuples_out: self.tuples_written,
            tuples_in: self.tuples_written,
        });
    }

    fn tuples_written(&self) -> u64 {
        self.tuples_written
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::partition::UniformPartitionFunction;
    use crate::record::HEADER_SIZE;
    use crate::runtime::KvBufferFactory;
    use crate::writer::test_host::CollectingHost;

    fn writer(capacity: usize, partitions: u64) -> FastKvWriter<CollectingHost> {
        let host = CollectingHost::new(KvBufferFactory::new(capacity, 8));
        FastKvWriter::new(
            host,
            Arc::new(UniformPartitionFunction::new(partitions, partitions)),
            Framing::Framed,
            0,
        )
    }

    #[test]
    fn test_routes_by_global_partition() {
        let mut writer = writer(1024, 4);
        // Keys with distinct 24-bit prefixes land in distinct partitions.
        writer.write(&KvPair::new(&[0x00, 0, 0], b"low"));
        writer.write(&KvPair::new(&[0xc0, 0, 0], b"high"));
        writer.flush_buffers();
        let mut dests: Vec<u64> = writer.host.emitted.iter().map(|(dest, _)| *dest).collect();
        dests.sort();
        assert_eq!(dests, vec![0, 3]);
        for (dest, buffer) in &writer.host.emitted {
            for kv in buffer.iter() {
                assert_eq!(
                    UniformPartitionFunction::new(4, 4).global_partition(kv.key()),
                    *dest
                );
            }
        }
    }

    #[test]
    fn test_emits_on_overflow() {
        // Room for exactly one record of 3 + 3 + header bytes.
        let mut writer = writer(HEADER_SIZE + 6, 1);
        writer.write(&KvPair::new(&[9, 9, 9], b"aaa"));
        writer.write(&KvPair::new(&[9, 9, 9], b"bbb"));
        assert_eq!(writer.host.emitted.len(), 1);
        writer.flush_buffers();
        assert_eq!(writer.host.emitted.len(), 2);
        assert_eq!(writer.tuples_written(), 2);
    }

    #[test]
    fn test_setup_commit_round_trip() {
        let mut writer = writer(1024, 1);
        let value = writer.setup_write(&[1, 2, 3], 100);
        value[..4].copy_from_slice(b"abcd");
        writer.commit_write(4);
        writer.flush_buffers();
        let (_, buffer) = &writer.host.emitted[0];
        let kv = buffer.iter().next().unwrap();
        assert_eq!(kv.key(), &[1, 2, 3]);
        assert_eq!(kv.value(), b"abcd");
    }
}
