/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::sync::Arc;

use crate::partition::PartitionFunction;
use crate::record::{write_header, AppendSlot, KvBuffer, KvPair, HEADER_SIZE};
use crate::writer::{KvWriter, WriteStats, WriterHost};

/// A writer that fills every buffer to the brim, down to the byte,
/// splitting records across buffer boundaries when partial serialization
/// is enabled. Consumers stitch the splits back together through the
/// length prefix.
///
/// With partial serialization disabled the writer still packs buffers
/// tightly but keeps records whole, emitting early when the next record
/// does not fit.
///
/// The writer optionally partitions its input: in local mode (used by the
/// demultiplexers) each record goes to
/// `local_partition(key, group) - partition_offset`; without a partition
/// function everything goes to slot 0.
pub struct PartialKvWriter<H: WriterHost> {
    host: H,
    partial_serialize: bool,
    partitioning: Option<Partitioning>,
    slots: Vec<Option<KvBuffer>>,
    pending: Option<Pending>,
    tuples_written: u64,
    bytes_written: u64,
}

struct Partitioning {
    function: Arc<dyn PartitionFunction>,
    partition_group: u64,
    partition_offset: u64,
}

struct Pending {
    partition: usize,
    key_len: u32,
    max_value_len: u32,
    slot: Option<AppendSlot>,
    // When the record might overflow the current buffer, the caller
    // writes into this scratch image instead of buffer memory.
    temp_tuple: Option<Vec<u8>>,
}

impl<H: WriterHost> PartialKvWriter<H> {
    /// A single-slot writer.
    pub fn new(host: H, partial_serialize: bool) -> Self {
        PartialKvWriter {
            host,
            partial_serialize,
            partitioning: None,
            slots: vec![None],
            pending: None,
            tuples_written: 0,
            bytes_written: 0,
        }
    }

    /// A writer splitting records over the local partitions of one
    /// partition group; slot `i` holds partition `partition_offset + i`.
    pub fn with_local_partitioning(
        host: H,
        partial_serialize: bool,
        function: Arc<dyn PartitionFunction>,
        num_partitions: usize,
        partition_group: u64,
        partition_offset: u64,
    ) -> Self {
        assert!(num_partitions > 0, "writer needs at least one partition");
        PartialKvWriter {
            host,
            partial_serialize,
            partitioning: Some(Partitioning {
                function,
                partition_group,
                partition_offset,
            }),
            slots: (0..num_partitions).map(|_| None).collect(),
            pending: None,
            tuples_written: 0,
            bytes_written: 0,
        }
    }

    /// The host this writer emits through.
    pub fn host(&self) -> &H {
        &self.host
    }

    fn partition_of(&self, key: &[u8]) -> usize {
        match &self.partitioning {
            None => 0,
            Some(partitioning) => {
                let partition = partitioning
                    .function
                    .local_partition(key, partitioning.partition_group);
                partition
                    .checked_sub(partitioning.partition_offset)
                    .expect("key partitioned below this writer's partition offset")
                    as usize
            }
        }
    }

    /// Makes sure the slot has a buffer; a fresh one is default-sized.
    fn ensure_buffer(&mut self, partition: usize) {
        if self.slots[partition].is_none() {
            let buffer = self.host.get_buffer(0);
            assert!(
                !self.partial_serialize || buffer.framing().is_framed(),
                "partial serialization is forbidden in unframed mode"
            );
            self.slots[partition] = Some(buffer);
        }
    }

    fn emit_slot(&mut self, partition: usize) {
        let buffer = self.slots[partition]
            .take()
            .expect("emitting an empty writer slot");
        self.host.emit(buffer, partition as u64);
    }

    /// Streams a full framed image across as many buffers as needed,
    /// emitting each buffer it fills exactly.
    fn stream_image(&mut self, partition: usize, image: &[u8]) {
        let mut copied = 0;
        while copied < image.len() {
            self.ensure_buffer(partition);
            let buffer = self.slots[partition].as_mut().unwrap();
            let n = buffer.remaining().min(image.len() - copied);
            buffer.append_raw(&image[copied..copied + n]);
            copied += n;
            if buffer.is_full() {
                self.emit_slot(partition);
            }
        }
    }
}

impl<H: WriterHost> KvWriter for PartialKvWriter<H> {
    fn write(&mut self, kv: &KvPair) {
        assert!(self.pending.is_none(), "cannot write during a setup write");
        let partition = self.partition_of(kv.key());
        self.ensure_buffer(partition);

        let buffer = self.slots[partition].as_mut().unwrap();
        let size = kv.write_size(buffer.framing());
        if size <= buffer.remaining() {
            buffer.append(kv);
            if buffer.is_full() {
                self.emit_slot(partition);
            }
        } else if self.partial_serialize {
            // Copy whatever fits, emit the exactly full buffer, continue
            // into fresh ones.
            let mut offset = buffer.append_partial_record(kv, 0);
            self.emit_slot(partition);
            while offset < size {
                self.ensure_buffer(partition);
                let buffer = self.slots[partition].as_mut().unwrap();
                offset += buffer.append_partial_record(kv, offset);
                if buffer.is_full() {
                    self.emit_slot(partition);
                }
            }
        } else {
            let current = self.slots[partition].take().unwrap();
            if current.is_empty() {
                self.host.put_buffer(current);
            } else {
                self.host.emit(current, partition as u64);
            }
            let buffer = self.host.get_buffer(size);
            self.slots[partition] = Some(buffer);
            let buffer = self.slots[partition].as_mut().unwrap();
            assert!(
                size <= buffer.remaining(),
                "fresh buffer of {} bytes cannot hold record of {}",
                buffer.capacity(),
                size
            );
            buffer.append(kv);
            if buffer.is_full() {
                self.emit_slot(partition);
            }
        }
        self.tuples_written += 1;
        self.bytes_written += size as u64;
    }

    fn setup_write(&mut self, key: &[u8], max_value_len: u32) -> &mut [u8] {
        assert!(
            self.pending.is_none(),
            "uncommitted write is already in progress; can't start another one"
        );
        let partition = self.partition_of(key);
        self.ensure_buffer(partition);

        let buffer = self.slots[partition].as_mut().unwrap();
        let size = buffer.framing().record_size(key.len() as u32, max_value_len);
        if size <= buffer.remaining() {
            let slot = buffer.setup_append(key.len() as u32, max_value_len);
            buffer.pending_key_mut(&slot).copy_from_slice(key);
            self.pending = Some(Pending {
                partition,
                key_len: key.len() as u32,
                max_value_len,
                slot: Some(slot),
                temp_tuple: None,
            });
            self.slots[partition]
                .as_mut()
                .unwrap()
                .pending_value_mut(&slot)
        } else {
            // The record may overflow the buffer once the value is
            // written, so stage the whole framed image on the heap and
            // stream it across buffers at commit time.
            let mut image = vec![0u8; HEADER_SIZE + key.len() + max_value_len as usize];
            write_header(&mut image, key.len() as u32, 0);
            image[HEADER_SIZE..HEADER_SIZE + key.len()].copy_from_slice(key);
            self.pending = Some(Pending {
                partition,
                key_len: key.len() as u32,
                max_value_len,
                slot: None,
                temp_tuple: Some(image),
            });
            let key_len = key.len();
            let image = self.pending.as_mut().unwrap().temp_tuple.as_mut().unwrap();
            &mut image[HEADER_SIZE + key_len..]
        }
    }

    fn commit_write(&mut self, value_len: u32) {
        let pending = self
            .pending
            .take()
            .expect("must set up a write before committing one");
        assert!(
            value_len <= pending.max_value_len,
            "committed more value bytes than reserved"
        );
        let size;
        match pending.temp_tuple {
            Some(mut image) => {
                // Trim the image to the actual value length and fix up the
                // header before streaming.
                image.truncate(HEADER_SIZE + pending.key_len as usize + value_len as usize);
                write_header(&mut image, pending.key_len, value_len);
                size = image.len();
                self.stream_image(pending.partition, &image);
            }
            None => {
                let slot = pending.slot.unwrap();
                let buffer = self.slots[pending.partition].as_mut().unwrap();
                buffer.commit_append(&slot, value_len);
                size = buffer.framing().record_size(pending.key_len, value_len);
                if buffer.is_full() {
                    self.emit_slot(pending.partition);
                }
            }
        }
        self.tuples_written += 1;
        self.bytes_written += size as u64;
    }

    fn flush_buffers(&mut self) {
        assert!(self.pending.is_none(), "flushed with an uncommitted write");
        for partition in 0..self.slots.len() {
            if let Some(buffer) = self.slots[partition].take() {
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
    use crate::record::RecordStitcher;
    use crate::runtime::KvBufferFactory;
    use crate::writer::test_host::CollectingHost;

    fn writer(capacity: usize, partial: bool) -> PartialKvWriter<CollectingHost> {
        PartialKvWriter::new(CollectingHost::new(KvBufferFactory::new(capacity, 8)), partial)
    }

    #[test]
    fn test_fills_buffers_to_the_brim() {
        let mut writer = writer(32, true);
        let mut total = 0;
        for i in 0..20u8 {
            let key = [i; 5];
            let value = [i; 11];
            let kv = KvPair::new(&key, &value);
            total += kv.framed_size();
            writer.write(&kv);
        }
        writer.flush_buffers();
        // Every emitted buffer except the last is exactly full, and the
        // byte count is conserved.
        let emitted = &writer.host.emitted;
        for (_, buffer) in &emitted[..emitted.len() - 1] {
            assert_eq!(buffer.current_size(), buffer.capacity());
        }
        let written: usize = emitted.iter().map(|(_, b)| b.current_size()).sum();
        assert_eq!(written, total);
        assert_eq!(writer.bytes_written(), total as u64);
    }

    #[test]
    fn test_split_records_stitch_back() -> anyhow::Result<()> {
        let mut writer = writer(32, true);
        let records: Vec<(Vec<u8>, Vec<u8>)> = (0..10u8)
            .map(|i| (vec![i; 7], vec![i ^ 0xff; 13]))
            .collect();
        for (key, value) in &records {
            writer.write(&KvPair::new(key, value));
        }
        writer.flush_buffers();

        let mut stitcher = RecordStitcher::new(KvBufferFactory::new(4096, 8));
        let mut out = Vec::new();
        for (_, buffer) in &writer.host.emitted {
            stitcher.feed(buffer.bytes(), &mut out);
        }
        stitcher.finish(&mut out)?;
        let stitched: Vec<(Vec<u8>, Vec<u8>)> = out
            .iter()
            .flat_map(|b| b.iter().map(|kv| (kv.key().to_vec(), kv.value().to_vec())))
            .collect();
        assert_eq!(stitched, records);
        Ok(())
    }

    #[test]
    fn test_oversized_record_takes_heap_path() {
        // A record larger than any buffer the default size produces.
        let mut writer = writer(16, true);
        let value = writer.setup_write(b"key", 100);
        for (i, byte) in value.iter_mut().enumerate() {
            *byte = i as u8;
        }
        writer.commit_write(100);
        writer.flush_buffers();
        let written: usize = writer
            .host
            .emitted
            .iter()
            .map(|(_, b)| b.current_size())
            .sum();
        assert_eq!(written, HEADER_SIZE + 3 + 100);
    }

    #[test]
    fn test_whole_records_when_partial_disabled() {
        let mut writer = writer(32, false);
        for i in 0..10u8 {
            writer.write(&KvPair::new(&[i; 5], &[i; 11]));
        }
        writer.flush_buffers();
        // No record is split: every buffer parses cleanly.
        let mut count = 0;
        for (_, buffer) in &writer.host.emitted {
            count += buffer.iter().count();
        }
        assert_eq!(count, 10);
    }
}
