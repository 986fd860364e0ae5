/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::job::JobId;
use crate::partition::RecordFilter;
use crate::record::{Framing, KvBuffer, KvPair, SampleMetadata};
use crate::writer::{KvWriter, WriteStats, WriteStrategy, WriterHost};

/// The phase-zero writer: keeps a size-bounded, unbiased reservoir sample
/// of everything written through it.
///
/// Records are accepted sequentially until the reservoir (half of the
/// first buffer's capacity) fills; from then on each incoming record
/// replaces a uniformly random earlier one with probability
/// `max_samples / tuples_seen`. Replacement appends the new record and
/// invalidates the replaced position in a side vector; when append space
/// runs out, a compaction pass rewrites the buffer keeping only valid
/// records. The flushed buffer carries the sample statistics blob.
pub struct ReservoirSamplingWriter<H: WriterHost> {
    host: H,
    strategy: Box<dyn WriteStrategy>,
    filter: Option<Arc<dyn RecordFilter>>,
    job_id: JobId,
    buffer: Option<KvBuffer>,
    /// `valid[i]` is the buffer position of reservoir entry `i`.
    valid: Vec<u64>,
    max_samples: u64,
    reservoir_bytes: usize,
    sample_rate: u64,
    rng: SmallRng,
    tuples_seen: u64,
    bytes_seen: u64,
    tuples_written: u64,
    bytes_written: u64,
    pending: Option<Pending>,
}

struct Pending {
    key: Vec<u8>,
    max_value_len: u32,
    value: Vec<u8>,
}

impl<H: WriterHost> ReservoirSamplingWriter<H> {
    pub fn new(
        mut host: H,
        strategy: Box<dyn WriteStrategy>,
        filter: Option<Arc<dyn RecordFilter>>,
        job_id: JobId,
        sample_rate: u64,
        seed: u64,
    ) -> Self {
        let buffer = host.get_buffer(0);
        assert!(buffer.framing() == Framing::Framed, "sampling needs framed buffers");
        // Half the buffer holds the reservoir; the other half is append
        // slack between compactions.
        let reservoir_bytes = buffer.capacity() / 2;
        ReservoirSamplingWriter {
            host,
            strategy,
            filter,
            job_id,
            buffer: Some(buffer),
            valid: Vec::new(),
            max_samples: u64::MAX,
            reservoir_bytes,
            sample_rate,
            rng: SmallRng::seed_from_u64(seed),
            tuples_seen: 0,
            bytes_seen: 0,
            tuples_written: 0,
            bytes_written: 0,
            pending: None,
        }
    }

    /// The host this writer emits through.
    pub fn host(&self) -> &H {
        &self.host
    }

    fn accepts(&self, key: &[u8]) -> bool {
        self.filter.as_deref().is_none_or(|filter| filter.pass(key))
    }

    /// Rewrites the buffer keeping only the records still referenced by
    /// the validity vector, renumbering the vector in place.
    fn compact(&mut self) {
        let old = self.buffer.take().unwrap();
        let mut new = self.host.get_buffer(0);

        self.valid.sort_unstable();
        let mut kept = self.valid.iter().peekable();
        for (index, kv) in old.iter().enumerate() {
            match kept.peek() {
                Some(&&position) if position == index as u64 => {
                    new.append(&kv);
                    kept.next();
                }
                Some(_) => {}
                None => break,
            }
        }
        // Every surviving record now sits at its rank in the new buffer.
        for (rank, position) in self.valid.iter_mut().enumerate() {
            *position = rank as u64;
        }
        self.host.put_buffer(old);
        self.buffer = Some(new);
    }

    fn write_sample(&mut self, key: &[u8], value: &[u8]) {
        let mut write_index = self.tuples_seen;
        self.tuples_seen += 1;
        self.bytes_seen += Framing::Framed
            .record_size(key.len() as u32, value.len() as u32) as u64;

        // Once the reservoir is full, replace a random earlier record
        // with probability max_samples / tuples_seen.
        if write_index >= self.max_samples {
            write_index = self.rng.random_range(0..self.tuples_seen);
        }
        if write_index >= self.max_samples {
            return;
        }

        let out_key_len = self.strategy.output_key_len(key.len() as u32);
        let out_value_len = self.strategy.output_value_len(value.len() as u32);
        let size = Framing::Framed.record_size(out_key_len, out_value_len);
        if self.buffer.as_ref().unwrap().remaining() < size {
            self.compact();
            assert!(
                self.buffer.as_ref().unwrap().remaining() >= size,
                "after compaction, buffer still cannot hold a record of {} bytes",
                size
            );
        }

        let buffer = self.buffer.as_mut().unwrap();
        let slot = buffer.setup_append(out_key_len, out_value_len);
        self.strategy.write_key(key, buffer.pending_key_mut(&slot));
        self.strategy
            .write_value(value, key.len() as u32, buffer.pending_value_mut(&slot));
        buffer.commit_append(&slot, out_value_len);

        if self.tuples_seen < self.max_samples
            && buffer.current_size() > self.reservoir_bytes
        {
            // The reservoir just filled; replacement starts here.
            self.max_samples = self.tuples_seen;
        }

        let position = buffer.record_count() - 1;
        if write_index as usize >= self.valid.len() {
            self.valid.resize(write_index as usize + 1, 0);
        }
        self.valid[write_index as usize] = position;
    }
}

impl<H: WriterHost> KvWriter for ReservoirSamplingWriter<H> {
    fn write(&mut self, kv: &KvPair) {
        assert!(self.pending.is_none(), "cannot write during a setup write");
        if !self.accepts(kv.key()) {
            return;
        }
        if self.sample_rate > 0 && self.tuples_seen % self.sample_rate == 0 {
            self.host.log_sample(kv);
        }
        self.write_sample(kv.key(), kv.value());
    }

    fn setup_write(&mut self, key: &[u8], max_value_len: u32) -> &mut [u8] {
        assert!(
            self.pending.is_none(),
            "uncommitted write is already in progress; can't start another one"
        );
        // The record may be discarded rather than sampled, so the caller
        // always writes into scratch.
        self.pending = Some(Pending {
            key: key.to_vec(),
            max_value_len,
            value: vec![0u8; max_value_len as usize],
        });
        self.pending.as_mut().unwrap().value.as_mut_slice()
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
        if self.accepts(&pending.key) {
            self.write_sample(&pending.key, &pending.value[..value_len as usize]);
        }
    }

    fn flush_buffers(&mut self) {
        assert!(self.pending.is_none(), "flushed with an uncommitted write");
        self.compact();

        self.tuples_written = self.tuples_seen.min(self.max_samples);
        // The surviving values are transformed tuple sizes; their sum is
        // the sampled byte count.
        let buffer = self.buffer.as_ref().unwrap();
        self.bytes_written = buffer
            .iter()
            .map(|kv| u64::from_ne_bytes(kv.value().try_into().expect("sample value is 8 bytes")))
            .sum();

        let stats = WriteStats {
            bytes_out: self.bytes_written,
            bytes_in: self.bytes_seen,
            tuples_out: self.tuples_written,
            tuples_in: self.tuples_seen,
        };

        let mut buffer = self.buffer.take().unwrap();
        if buffer.is_empty() {
            self.host.put_buffer(buffer);
        } else {
            buffer.set_node(0);
            buffer.set_sample_metadata(SampleMetadata {
                job_id: self.job_id,
                tuples_in: self.tuples_seen,
                bytes_in: self.bytes_seen,
                tuples_out: self.tuples_written,
                bytes_out: self.bytes_written,
                bytes_caller_tried_to_write: self.bytes_seen,
            });
            self.host.emit(buffer, 0);
        }
        self.host.log_write_stats(stats);
    }

    fn tuples_written(&self) -> u64 {
        self.tuples_written
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
