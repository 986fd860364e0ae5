/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::sync::Arc;

use anyhow::Result;

use crate::record::KvBuffer;
use crate::runtime::{KvBufferFactory, QueueingPolicy, Worker};

/// Turns each demuxed partition buffer into a sorted run.
///
/// Records are ordered lexicographically by key; the sort is stable, so
/// equal keys keep their arrival order. The sorted buffer keeps the input
/// buffer's partition and job tags and flows to the chunking boundary,
/// which assigns it a chunk id and a disk.
pub struct Sorter {
    factory: KvBufferFactory,
    output: Arc<dyn QueueingPolicy<KvBuffer>>,
    tuples_out: u64,
    bytes_out: u64,
}

impl Sorter {
    pub fn new(factory: KvBufferFactory, output: Arc<dyn QueueingPolicy<KvBuffer>>) -> Self {
        Sorter {
            factory,
            output,
            tuples_out: 0,
            bytes_out: 0,
        }
    }
}

impl Worker for Sorter {
    type Input = KvBuffer;

    fn run(&mut self, buffer: KvBuffer) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let mut records: Vec<_> = buffer.iter().collect();
        records.sort_by(|a, b| a.key().cmp(b.key()));

        let mut sorted = self.factory.create_with_capacity(buffer.current_size());
        if let Some(job_id) = buffer.job_id() {
            sorted.set_job_id(job_id);
        }
        if let Some(partition) = buffer.logical_disk_id() {
            sorted.set_logical_disk_id(partition);
        }
        for kv in &records {
            sorted.append(kv);
        }

        self.tuples_out += sorted.record_count();
        self.bytes_out += sorted.current_size() as u64;
        self.output.enqueue(sorted);
        Ok(())
    }

    fn output_stats(&self) -> (u64, u64) {
        (self.tuples_out, self.bytes_out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::KvPair;
    use crate::runtime::{QueueingPolicy, RoutedQueueingPolicy};

    #[test]
    fn test_sorts_by_key_stably() -> Result<()> {
        let output: Arc<dyn QueueingPolicy<KvBuffer>> =
            Arc::new(RoutedQueueingPolicy::single(1));
        let mut sorter = Sorter::new(KvBufferFactory::new(1024, 8), output.clone());

        let mut buffer = KvBuffer::new(1024, 8);
        buffer.set_job_id(1);
        buffer.set_logical_disk_id(3);
        for (key, value) in [(b"b", b"1"), (b"a", b"2"), (b"b", b"3"), (b"a", b"4")] {
            buffer.append(&KvPair::new(key, value));
        }
        sorter.run(buffer)?;
        output.teardown();

        let sorted = output.dequeue(0).unwrap();
        assert_eq!(sorted.logical_disk_id(), Some(3));
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = sorted
            .iter()
            .map(|kv| (kv.key().to_vec(), kv.value().to_vec()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (b"a".to_vec(), b"2".to_vec()),
                (b"a".to_vec(), b"4".to_vec()),
                (b"b".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"3".to_vec()),
            ]
        );
        Ok(())
    }
}
