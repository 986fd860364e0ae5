/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::sync::Arc;

use crate::partition::{PartitionFunction, RecordFilter};
use crate::record::{AppendSlot, Framing, KvBuffer, KvPair};
use crate::writer::{KvWriter, WriteStats, WriteStrategy, WriterHost};

/// The general writer: per-global-partition buffers, an optional write
/// strategy transforming keys and values on the way in, and an optional
/// record filter under which rejected records are silently dropped (and
/// counted).
pub struct BufferedKvWriter<H: WriterHost> {
    host: H,
    partition_function: Arc<dyn PartitionFunction>,
    strategy: Box<dyn WriteStrategy>,
    filter: Option<Arc<dyn RecordFilter>>,
    buffers: Vec<Option<KvBuffer>>,
    sample_rate: u64,
    pending: Option<Pending>,
    tuples_in: u64,
    bytes_in: u64,
    tuples_written: u64,
    bytes_written: u64,
}

struct Pending {
    partition: usize,
    slot: AppendSlot,
    key: Vec<u8>,
    // Scratch the caller writes into when the strategy transforms values.
    temp_value: Option<Vec<u8>>,
}

impl<H: WriterHost> BufferedKvWriter<H> {
    pub fn new(
        host: H,
        partition_function: Arc<dyn PartitionFunction>,
        strategy: Box<dyn WriteStrategy>,
        filter: Option<Arc<dyn RecordFilter>>,
        sample_rate: u64,
    ) -> Self {
        let num_buffers = partition_function.num_global_partitions() as usize;
        assert!(num_buffers > 0, "writer must write to at least one buffer");
        BufferedKvWriter {
            host,
            partition_function,
            strategy,
            filter,
            buffers: (0..num_buffers).map(|_| None).collect(),
            sample_rate,
            pending: None,
            tuples_in: 0,
            bytes_in: 0,
            tuples_written: 0,
            bytes_written: 0,
        }
    }

    /// The host this writer emits through.
    pub fn host(&self) -> &H {
        &self.host
    }

    fn rejected(&self, key: &[u8]) -> bool {
        match &self.filter {
            Some(filter) => !self.partition_function.accepted_by_filter(key, &**filter),
            None => false,
        }
    }

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
            assert!(buffer.framing() == Framing::Framed, "general writer is framed");
            self.buffers[partition] = Some(buffer);
        }
    }
}

impl<H: WriterHost> KvWriter for BufferedKvWriter<H> {
    fn write(&mut self, kv: &KvPair) {
        assert!(self.pending.is_none(), "cannot write during a setup write");
        self.tuples_in += 1;
        self.bytes_in += kv.framed_size() as u64;
        if self.rejected(kv.key()) {
            return;
        }
        if self.sample_rate > 0 && self.tuples_written % self.sample_rate == 0 {
            self.host.log_sample(kv);
        }

        let out_key_len = self.strategy.output_key_len(kv.key_len());
        let out_value_len = self.strategy.output_value_len(kv.value_len());
        let size = Framing::Framed.record_size(out_key_len, out_value_len);
        let partition = self.partition_function.global_partition(kv.key()) as usize;
        assert!(
            partition < self.buffers.len(),
            "invalid buffer number provided by partition function"
        );
        self.reserve(partition, size);
        let buffer = self.buffers[partition].as_mut().unwrap();

        if self.strategy.alters_key() || self.strategy.alters_value() {
            let slot = buffer.setup_append(out_key_len, out_value_len);
            self.strategy.write_key(kv.key(), buffer.pending_key_mut(&slot));
            self.strategy
                .write_value(kv.value(), kv.key_len(), buffer.pending_value_mut(&slot));
            buffer.commit_append(&slot, out_value_len);
        } else {
            buffer.append(kv);
        }
        self.tuples_written += 1;
        self.bytes_written += size as u64;
    }

    fn setup_write(&mut self, key: &[u8], max_value_len: u32) -> &mut [u8] {
        assert!(
            self.pending.is_none(),
            "uncommitted write is already in progress; can't start another one"
        );
        let out_key_len = self.strategy.output_key_len(key.len() as u32);
        let out_max_value_len = self.strategy.output_value_len(max_value_len);
        let size = Framing::Framed.record_size(out_key_len, out_max_value_len);
        let partition = self.partition_function.global_partition(key) as usize;
        self.reserve(partition, size);

        let buffer = self.buffers[partition].as_mut().unwrap();
        let slot = buffer.setup_append(out_key_len, out_max_value_len);
        self.strategy.write_key(key, buffer.pending_key_mut(&slot));

        let temp_value = self
            .strategy
            .alters_value()
            .then(|| vec![0u8; max_value_len as usize]);
        self.pending = Some(Pending {
            partition,
            slot,
            key: key.to_vec(),
            temp_value,
        });

        let pending = self.pending.as_mut().unwrap();
        match pending.temp_value.as_mut() {
            // The strategy will transform the value at commit time; hand
            // out internal scratch instead of buffer memory.
            Some(temp) => temp.as_mut_slice(),
            None => self.buffers[partition]
                .as_mut()
                .unwrap()
                .pending_value_mut(&slot),
        }
    }

    fn commit_write(&mut self, value_len: u32) {
        let pending = self
            .pending
            .take()
            .expect("must set up a write before committing one");
        self.tuples_in += 1;
        self.bytes_in +=
            Framing::Framed.record_size(pending.key.len() as u32, value_len) as u64;
        let rejected = self.rejected(&pending.key);
        let buffer = self.buffers[pending.partition].as_mut().unwrap();

        if rejected {
            buffer.cancel_append(pending.slot);
            return;
        }

        let out_value_len = self.strategy.output_value_len(value_len);
        if let Some(temp) = &pending.temp_value {
            self.strategy.write_value(
                &temp[..value_len as usize],
                pending.key.len() as u32,
                &mut buffer.pending_value_mut(&pending.slot)[..out_value_len as usize],
            );
        }
        buffer.commit_append(&pending.slot, out_value_len);

        let size = Framing::Framed
            .record_size(self.strategy.output_key_len(pending.key.len() as u32), out_value_len);
        self.tuples_written += 1;
        self.bytes_written += size as u64;
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
            bytes_in: self.bytes_in,
            tuples_out: self.tuples_written,
            tuples_in: self.tuples_in,
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
    use crate::partition::{KeyRangeFilter, UniformPartitionFunction};
    use crate::runtime::KvBufferFactory;
    use crate::writer::test_host::CollectingHost;
    use crate::writer::{DefaultWriteStrategy, PhaseZeroWriteStrategy};

    fn writer(
        strategy: Box<dyn WriteStrategy>,
        filter: Option<Arc<dyn RecordFilter>>,
    ) -> BufferedKvWriter<CollectingHost> {
        BufferedKvWriter::new(
            CollectingHost::new(KvBufferFactory::new(1024, 8)),
            Arc::new(UniformPartitionFunction::new(2, 2)),
            strategy,
            filter,
            0,
        )
    }

    #[test]
    fn test_filtered_records_are_dropped_and_counted() {
        // Accept only keys starting at 0x80 0 0.
        let filter: Arc<dyn RecordFilter> = Arc::new(KeyRangeFilter::new(&[0x80, 0, 0], None));
        let mut writer = writer(Box::new(DefaultWriteStrategy), Some(filter));
        writer.write(&KvPair::new(&[0x00, 0, 0], b"dropped"));
        writer.write(&KvPair::new(&[0x90, 0, 0], b"kept"));
        writer.flush_buffers();
        assert_eq!(writer.tuples_written(), 1);
        let stats = writer.host.stats.unwrap();
        assert_eq!(stats.tuples_in, 2);
        assert_eq!(stats.tuples_out, 1);
        assert_eq!(writer.host.emitted.len(), 1);
        assert_eq!(writer.host.emitted[0].0, 1);
    }

    #[test]
    fn test_strategy_transforms_value_in_place() {
        let mut writer = writer(Box::new(PhaseZeroWriteStrategy), None);
        writer.write(&KvPair::new(&[0x10, 0, 0], &[0u8; 42]));
        writer.flush_buffers();
        let (_, buffer) = &writer.host.emitted[0];
        let kv = buffer.iter().next().unwrap();
        assert_eq!(kv.key(), &[0x10, 0, 0]);
        assert_eq!(
            u64::from_ne_bytes(kv.value().try_into().unwrap()),
            8 + 3 + 42
        );
    }

    #[test]
    fn test_setup_commit_with_transforming_strategy() {
        let mut writer = writer(Box::new(PhaseZeroWriteStrategy), None);
        let value = writer.setup_write(&[0x10, 0, 0], 100);
        assert_eq!(value.len(), 100);
        value[..7].copy_from_slice(b"payload");
        writer.commit_write(7);
        writer.flush_buffers();
        let (_, buffer) = &writer.host.emitted[0];
        let kv = buffer.iter().next().unwrap();
        // The committed value is the tuple size, not the payload.
        assert_eq!(u64::from_ne_bytes(kv.value().try_into().unwrap()), 8 + 3 + 7);
    }

    #[test]
    #[should_panic(expected = "uncommitted write")]
    fn test_nested_setup_write_asserts() {
        let mut writer = writer(Box::new(DefaultWriteStrategy), None);
        writer.setup_write(&[1, 2, 3], 10);
        writer.setup_write(&[4, 5, 6], 10);
    }
}
