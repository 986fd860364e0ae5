/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::sync::Arc;

use anyhow::Result;

use crate::job::{JobId, JobInfoSource, ReduceFunction, ReduceFunctionRegistry};
use crate::params::Params;
use crate::record::{KvBuffer, KvPair};
use crate::runtime::{KvBufferFactory, QueueingPolicy, Worker};
use crate::workers::{EmitTag, StageWriterHost};
use crate::writer::{KvWriter, PartialKvWriter};

/// The two-level iterator reduce functions consume: the outer level walks
/// distinct keys, the inner level walks the records of the current key.
///
/// The driver calls [`start_next_key`](Self::start_next_key) to advance
/// to each key group; the reduce function then draws records through
/// [`next`](Self::next) and may [`reset`](Self::reset) to the group's
/// first record. A group abandoned early is fast-forwarded past on the
/// next `start_next_key`.
pub struct ReduceKvIterator<'b> {
    buffer: &'b KvBuffer,
    position: usize,
    current_key: Option<&'b [u8]>,
    current_key_start: usize,
    next_key: Option<&'b [u8]>,
    next_key_start: usize,
    next_key_start_known: bool,
    done_with_group: bool,
    no_more_records: bool,
}

impl<'b> ReduceKvIterator<'b> {
    pub fn new(buffer: &'b KvBuffer) -> Self {
        ReduceKvIterator {
            buffer,
            position: 0,
            current_key: None,
            current_key_start: 0,
            next_key: None,
            next_key_start: 0,
            next_key_start_known: true,
            done_with_group: false,
            no_more_records: false,
        }
    }

    /// Advances to the next key group, returning its key, or `None` at
    /// the end of the buffer.
    pub fn start_next_key(&mut self) -> Option<&'b [u8]> {
        if self.no_more_records {
            return None;
        }
        // If the caller abandoned the previous group early, scan forward
        // to find where the next group starts.
        if !self.next_key_start_known {
            while self.next().is_some() {}
            if self.no_more_records {
                return None;
            }
            assert!(
                self.next_key_start_known,
                "fast-forward ended without finding the next key"
            );
        }
        self.next_key_start_known = false;
        self.done_with_group = false;
        self.position = self.next_key_start;

        if self.next_key.is_none() {
            // First group: peek the first record for its key.
            match self.buffer.pair_at(self.position) {
                None => {
                    self.no_more_records = true;
                    return None;
                }
                Some((kv, _)) => self.next_key = Some(kv.key()),
            }
        }
        self.current_key_start = self.next_key_start;
        self.current_key = self.next_key;
        self.current_key
    }

    /// The next record of the current key group, or `None` when the
    /// group is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<KvPair<'b>> {
        assert!(
            !self.done_with_group,
            "next() called after the end of a key group"
        );
        let record_start = self.position;
        let Some((kv, next)) = self.buffer.pair_at(record_start) else {
            self.done_with_group = true;
            self.no_more_records = true;
            return None;
        };
        if Some(kv.key()) != self.current_key {
            // A different key: the current group ends here.
            self.next_key_start = record_start;
            self.next_key_start_known = true;
            self.next_key = Some(kv.key());
            self.done_with_group = true;
            return None;
        }
        self.position = next;
        Some(kv)
    }

    /// Returns to the first record of the current key group.
    pub fn reset(&mut self) {
        self.done_with_group = false;
        self.position = self.current_key_start;
    }
}

/// The reducer stage: for each sorted partition buffer, invokes the
/// job's reduce function once per distinct key and funnels the output
/// through a brim-packing writer tagged with the partition.
pub struct Reducer {
    params: Arc<Params>,
    output: Arc<dyn QueueingPolicy<KvBuffer>>,
    factory: KvBufferFactory,
    reduce_registry: Arc<ReduceFunctionRegistry>,
    job_info_source: Arc<dyn JobInfoSource>,
    state: Option<Bound>,
    tuples_out: u64,
    bytes_out: u64,
}

struct Bound {
    job_id: JobId,
    reduce_function: Box<dyn ReduceFunction>,
}

impl Reducer {
    pub fn new(
        params: Arc<Params>,
        output: Arc<dyn QueueingPolicy<KvBuffer>>,
        factory: KvBufferFactory,
        reduce_registry: Arc<ReduceFunctionRegistry>,
        job_info_source: Arc<dyn JobInfoSource>,
    ) -> Self {
        Reducer {
            params,
            output,
            factory,
            reduce_registry,
            job_info_source,
            state: None,
            tuples_out: 0,
            bytes_out: 0,
        }
    }
}

impl Worker for Reducer {
    type Input = KvBuffer;

    fn run(&mut self, buffer: KvBuffer) -> Result<()> {
        let job_id = buffer
            .job_id()
            .expect("buffer entering a reducer must carry a job id");
        let partition = buffer
            .logical_disk_id()
            .expect("buffer entering a reducer must carry a partition");

        if self.state.is_none() {
            let info = self.job_info_source.job_info(job_id)?;
            self.state = Some(Bound {
                job_id,
                reduce_function: self
                    .reduce_registry
                    .create(&info.reduce_function, &self.params)?,
            });
        }
        let bound = self.state.as_mut().unwrap();
        assert_eq!(
            bound.job_id, job_id,
            "a reducer drives one reduce function at a time"
        );
        bound.reduce_function.configure();

        // One brim-packing writer per buffer keeps the output buffers of
        // different partitions apart.
        let host = StageWriterHost::new(
            self.output.clone(),
            self.factory,
            job_id,
            EmitTag::LogicalDisk {
                partition_offset: partition,
            },
        );
        let mut writer = PartialKvWriter::new(host, true);

        let mut values = ReduceKvIterator::new(&buffer);
        while let Some(key) = values.start_next_key() {
            bound
                .reduce_function
                .reduce(key, &mut values, &mut writer);
        }
        writer.flush_buffers();
        self.tuples_out += writer.tuples_written();
        self.bytes_out += writer.bytes_written();
        Ok(())
    }

    fn output_stats(&self) -> (u64, u64) {
        (self.tuples_out, self.bytes_out)
    }
}
