/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Phase zero: turning reservoir samples into the boundary list that
//! seeds the key partitioner.

use anyhow::{ensure, Result};

use crate::record::{KvBuffer, KvPair, SampleMetadata};
use crate::runtime::KvBufferFactory;

/// The gathered output of the phase-zero samplers: every sampled
/// `(key, tuple size)` record plus the merged sample statistics.
pub struct SampleSet {
    samples: Vec<(Box<[u8]>, u64)>,
    metadata: SampleMetadata,
}

impl SampleSet {
    /// Collects sample buffers produced by the reservoir-sampling
    /// writers. Values must be the 8-byte tuple sizes the phase-zero
    /// write strategies produce.
    pub fn collect<'a>(buffers: impl IntoIterator<Item = &'a KvBuffer>) -> Self {
        let mut samples = Vec::new();
        let mut metadata = SampleMetadata::default();
        for buffer in buffers {
            for kv in buffer.iter() {
                let size = u64::from_ne_bytes(
                    kv.value().try_into().expect("sample value is 8 bytes"),
                );
                samples.push((kv.key().to_vec().into_boxed_slice(), size));
            }
            if let Some(buffer_metadata) = buffer.sample_metadata() {
                metadata.job_id = buffer_metadata.job_id;
                metadata.tuples_in += buffer_metadata.tuples_in;
                metadata.bytes_in += buffer_metadata.bytes_in;
                metadata.tuples_out += buffer_metadata.tuples_out;
                metadata.bytes_out += buffer_metadata.bytes_out;
                metadata.bytes_caller_tried_to_write +=
                    buffer_metadata.bytes_caller_tried_to_write;
            }
        }
        SampleSet { samples, metadata }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[inline]
    pub fn metadata(&self) -> &SampleMetadata {
        &self.metadata
    }

    /// Scans the samples in key order and emits one boundary key per
    /// partition: the picker keeps a running byte total and, each time it
    /// crosses one of `num_partitions` equal-weight strata, records the
    /// current key as the next boundary. The last boundary is implicit.
    ///
    /// The result is the boundary buffer [`KeyPartitioner`] construction
    /// expects: `num_partitions - 1` records in key order with empty
    /// values.
    ///
    /// [`KeyPartitioner`]: crate::partition::KeyPartitioner
    pub fn boundary_buffer(
        &mut self,
        num_partitions: u64,
        factory: &KvBufferFactory,
    ) -> Result<KvBuffer> {
        ensure!(num_partitions > 0, "need at least one partition");
        ensure!(
            self.samples.len() as u64 >= num_partitions,
            "{} samples cannot bound {} partitions",
            self.samples.len(),
            num_partitions
        );
        self.samples.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let total_bytes: u64 = self.samples.iter().map(|(_, size)| size).sum();
        ensure!(total_bytes > 0, "sampled zero bytes");

        let boundary_bytes: usize = self
            .samples
            .iter()
            .map(|(key, _)| crate::record::HEADER_SIZE + key.len())
            .sum();
        let mut buffer = factory.create_with_capacity(boundary_bytes);

        let mut bytes_seen = 0u64;
        let mut next_boundary = 1u64;
        for (key, size) in &self.samples {
            bytes_seen += size;
            // Emit every stratum boundary this sample crosses.
            while next_boundary < num_partitions
                && bytes_seen * num_partitions >= next_boundary * total_bytes
            {
                buffer.append(&KvPair::new(key, b""));
                next_boundary += 1;
            }
        }
        ensure!(
            buffer.record_count() == num_partitions - 1,
            "picked {} boundaries, expected {}",
            buffer.record_count(),
            num_partitions - 1
        );
        Ok(buffer)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::partition::KeyPartitioner;

    fn sample_buffer(keys: &[&[u8]]) -> KvBuffer {
        let mut buffer = KvBuffer::new(4096, 8);
        for key in keys {
            // Every tuple weighs the same 32 bytes.
            buffer.append(&KvPair::new(key, &32u64.to_ne_bytes()));
        }
        buffer
    }

    #[test]
    fn test_equal_strata_over_uniform_sizes() -> Result<()> {
        // Eight equal-weight samples, four partitions: boundaries at the
        // 2nd, 4th and 6th keys.
        let buffer = sample_buffer(&[b"a", b"b", b"c", b"d", b"e", b"f", b"g", b"h"]);
        let mut samples = SampleSet::collect([&buffer]);
        let boundaries = samples.boundary_buffer(4, &KvBufferFactory::new(1024, 8))?;
        let keys: Vec<&[u8]> = boundaries.iter().map(|kv| kv.key()).collect();
        assert_eq!(keys, vec![b"b".as_ref(), b"d".as_ref(), b"f".as_ref()]);
        Ok(())
    }

    #[test]
    fn test_boundaries_seed_a_partitioner() -> Result<()> {
        let buffer = sample_buffer(&[b"a", b"b", b"c", b"d", b"e", b"f", b"g", b"h"]);
        let mut samples = SampleSet::collect([&buffer]);
        let boundaries = samples.boundary_buffer(4, &KvBufferFactory::new(1024, 8))?;
        let partitioner = KeyPartitioner::from_boundary_buffer(&boundaries, 2, 2)?;
        assert_eq!(partitioner.global_partition(b"a"), 0);
        assert_eq!(partitioner.global_partition(b"d"), 1);
        assert_eq!(partitioner.global_partition(b"zzz"), 1);
        assert_eq!(partitioner.local_partition(b"b", 0), 1);
        assert_eq!(partitioner.local_partition(b"f", 1), 3);
        Ok(())
    }

    #[test]
    fn test_too_few_samples_rejected() {
        let buffer = sample_buffer(&[b"a", b"b"]);
        let mut samples = SampleSet::collect([&buffer]);
        assert!(samples
            .boundary_buffer(4, &KvBufferFactory::new(1024, 8))
            .is_err());
    }
}
