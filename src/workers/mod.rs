/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The pipeline's stages: mapper, demultiplexer, sorter, sink writer,
//! merger, and reducer.

mod demux;
mod mapper;
mod merger;
mod reducer;
mod sorter;
mod writer;

pub use demux::TupleDemux;
pub use mapper::{Mapper, MapperMode};
pub use merger::{Merger, MergerStats};
pub use reducer::{ReduceKvIterator, Reducer};
pub use sorter::Sorter;
pub use writer::{SinkWriter, WriterMode};

use std::sync::Arc;

use log::debug;

use crate::job::JobId;
use crate::record::{KvBuffer, KvPair};
use crate::runtime::{KvBufferFactory, QueueingPolicy};
use crate::writer::{WriteStats, WriterHost};

/// How a stage's writer host tags the buffers it emits.
pub enum EmitTag {
    /// `dest` is the destination partition group.
    PartitionGroup,
    /// `dest` is the destination node.
    Node,
    /// `dest` is a 0-based local partition; the tagged partition is
    /// `partition_offset + dest`.
    LogicalDisk { partition_offset: u64 },
}

/// The host wiring a writer to its owning worker: buffers come from the
/// stage's factory and leave through the stage's output policy, stamped
/// with the job id and the routing tag.
pub struct StageWriterHost {
    output: Arc<dyn QueueingPolicy<KvBuffer>>,
    factory: KvBufferFactory,
    job_id: JobId,
    tag: EmitTag,
    buffers_emitted: u64,
}

impl StageWriterHost {
    pub fn new(
        output: Arc<dyn QueueingPolicy<KvBuffer>>,
        factory: KvBufferFactory,
        job_id: JobId,
        tag: EmitTag,
    ) -> Self {
        StageWriterHost {
            output,
            factory,
            job_id,
            tag,
            buffers_emitted: 0,
        }
    }
}

impl WriterHost for StageWriterHost {
    fn emit(&mut self, mut buffer: KvBuffer, dest: u64) {
        buffer.set_job_id(self.job_id);
        match self.tag {
            EmitTag::PartitionGroup => buffer.set_partition_group(dest),
            EmitTag::Node => buffer.set_node(dest),
            EmitTag::LogicalDisk { partition_offset } => {
                buffer.set_logical_disk_id(partition_offset + dest)
            }
        }
        self.buffers_emitted += 1;
        self.output.enqueue(buffer);
    }

    fn get_buffer(&mut self, min_capacity: usize) -> KvBuffer {
        if min_capacity == 0 {
            self.factory.create()
        } else {
            self.factory.create_with_capacity(min_capacity)
        }
    }

    fn log_sample(&mut self, kv: &KvPair) {
        debug!(
            "job {}: sampled output tuple, {} key bytes, {} value bytes",
            self.job_id,
            kv.key_len(),
            kv.value_len()
        );
    }

    fn log_write_stats(&mut self, stats: WriteStats) {
        debug!(
            "job {}: writer done, {} tuples in, {} tuples out, {} bytes out, {} buffers",
            self.job_id, stats.tuples_in, stats.tuples_out, stats.bytes_out, self.buffers_emitted
        );
    }
}
