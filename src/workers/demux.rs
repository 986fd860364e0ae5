/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::sync::Arc;

use anyhow::Result;

use crate::job::JobId;
use crate::params::Params;
use crate::partition::PartitionFunctionMap;
use crate::record::KvBuffer;
use crate::runtime::{KvBufferFactory, QueueingPolicy, Worker};
use crate::workers::{EmitTag, StageWriterHost};
use crate::writer::{KvWriter, PartialKvWriter};

/// The demultiplexer: consumes shuffle buffers for a single partition
/// group and splits their records into per-partition buffers.
///
/// Each demux is pinned to one group; buffer routing must agree
/// (`partition_group % num_demuxes == demux_id`), anything else aborts.
/// The job's partition function and partition geometry bind lazily on the
/// first buffer.
pub struct TupleDemux {
    demux_id: usize,
    node_id: u64,
    num_demuxes: u64,
    partitions_per_node: u64,
    partitions_per_group: u64,
    partial_serialize: bool,
    output: Arc<dyn QueueingPolicy<KvBuffer>>,
    factory: KvBufferFactory,
    partition_map: Arc<PartitionFunctionMap>,
    state: Option<Bound>,
}

struct Bound {
    job_id: JobId,
    writer: PartialKvWriter<StageWriterHost>,
}

impl TupleDemux {
    pub fn new(
        demux_id: usize,
        params: &Params,
        partial_serialize: bool,
        output: Arc<dyn QueueingPolicy<KvBuffer>>,
        factory: KvBufferFactory,
        partition_map: Arc<PartitionFunctionMap>,
    ) -> Self {
        TupleDemux {
            demux_id,
            node_id: params.node_id,
            num_demuxes: params.num_demuxes() as u64,
            partitions_per_node: params.partitions_per_node(),
            partitions_per_group: params.partitions_per_group,
            partial_serialize,
            output,
            factory,
            partition_map,
            state: None,
        }
    }

    fn bind(&mut self, job_id: JobId, partition_group: u64) -> Result<Bound> {
        let partition_function = self.partition_map.get(job_id)?;
        // The first partition of this demux's group, so buffers can be
        // numbered from zero inside the writer.
        let partition_offset = self.partitions_per_node * self.node_id
            + self.partitions_per_group * self.demux_id as u64;
        let host = StageWriterHost::new(
            self.output.clone(),
            self.factory,
            job_id,
            EmitTag::LogicalDisk { partition_offset },
        );
        Ok(Bound {
            job_id,
            writer: PartialKvWriter::with_local_partitioning(
                host,
                self.partial_serialize,
                partition_function,
                self.partitions_per_group as usize,
                partition_group,
                partition_offset,
            ),
        })
    }
}

impl Worker for TupleDemux {
    type Input = KvBuffer;

    fn run(&mut self, buffer: KvBuffer) -> Result<()> {
        let partition_group = buffer
            .partition_group()
            .expect("buffer entering a demux must carry a partition group");
        assert_eq!(
            partition_group % self.num_demuxes,
            self.demux_id as u64,
            "demux {} got a buffer for partition group {}",
            self.demux_id,
            partition_group
        );
        let job_id = buffer
            .job_id()
            .expect("buffer entering a demux must carry a job id");

        if self.state.is_none() {
            let bound = self.bind(job_id, partition_group)?;
            self.state = Some(bound);
        }
        let bound = self.state.as_mut().unwrap();
        assert_eq!(
            bound.job_id, job_id,
            "all buffers entering a demux must share one job id"
        );

        let writer = &mut bound.writer;
        for kv in buffer.iter() {
            writer.write(&kv);
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        if let Some(bound) = &mut self.state {
            bound.writer.flush_buffers();
        }
        Ok(())
    }

    fn output_stats(&self) -> (u64, u64) {
        match &self.state {
            Some(bound) => (bound.writer.tuples_written(), bound.writer.bytes_written()),
            None => (0, 0),
        }
    }
}
