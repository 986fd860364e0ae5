/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::sync::Arc;

use anyhow::Result;
use log::debug;

use crate::job::{
    CoordinatorClient, JobId, JobInfoSource, MapFunction, MapFunctionRegistry, PassThroughMap,
};
use crate::params::Params;
use crate::partition::{PartitionFunctionMap, RandomNodePartitionFunction, RecordFilterMap};
use crate::record::{Framing, KvBuffer};
use crate::runtime::{KvBufferFactory, QueueingPolicy, Worker};
use crate::workers::{EmitTag, StageWriterHost};
use crate::writer::{
    BufferedKvWriter, DefaultWriteStrategy, FastKvWriter, HashedPhaseZeroWriteStrategy, KvWriter,
    PhaseZeroWriteStrategy, ReservoirSamplingWriter, WriteStrategy,
};

/// What a mapper stage is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperMode {
    /// Apply the job's map function and repartition by the job's
    /// partition function.
    Standard,
    /// Phase zero: spread records over nodes uniformly at random to even
    /// out sample placement. Identity map function.
    Shuffle,
    /// Phase zero: collect a reservoir sample. Identity map function.
    ReservoirSample,
}

/// The mapper stage: drives the job's map function over every record of
/// every input buffer and routes the output through a writer.
pub struct Mapper {
    worker_id: usize,
    mode: MapperMode,
    params: Arc<Params>,
    output: Arc<dyn QueueingPolicy<KvBuffer>>,
    factory: KvBufferFactory,
    partition_map: Arc<PartitionFunctionMap>,
    filter_map: Arc<RecordFilterMap>,
    map_registry: Arc<MapFunctionRegistry>,
    job_info_source: Arc<dyn JobInfoSource>,
    coordinator: Arc<dyn CoordinatorClient>,
    state: Option<Bound>,
    tuples_in: u64,
    bytes_in: u64,
}

struct Bound {
    job_id: JobId,
    map_function: Box<dyn MapFunction>,
    writer: Box<dyn KvWriter>,
}

impl Mapper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: usize,
        mode: MapperMode,
        params: Arc<Params>,
        output: Arc<dyn QueueingPolicy<KvBuffer>>,
        factory: KvBufferFactory,
        partition_map: Arc<PartitionFunctionMap>,
        filter_map: Arc<RecordFilterMap>,
        map_registry: Arc<MapFunctionRegistry>,
        job_info_source: Arc<dyn JobInfoSource>,
        coordinator: Arc<dyn CoordinatorClient>,
    ) -> Self {
        Mapper {
            worker_id,
            mode,
            params,
            output,
            factory,
            partition_map,
            filter_map,
            map_registry,
            job_info_source,
            coordinator,
            state: None,
            tuples_in: 0,
            bytes_in: 0,
        }
    }

    /// Resolves the map function and writer for the job on first contact.
    fn bind(&mut self, job_id: JobId) -> Result<Bound> {
        let info = self.job_info_source.job_info(job_id)?;
        let filter = self.filter_map.get(job_id);
        let sample_rate = self.params.map_output_sample_rate;

        let writer: Box<dyn KvWriter> = match self.mode {
            MapperMode::ReservoirSample => {
                // The boundary-list artifact does not exist yet, so the
                // choice of sampling strategy follows the declared
                // partition function.
                let strategy: Box<dyn WriteStrategy> =
                    if info.partition_function == "hashed_boundary_list" {
                        Box::new(HashedPhaseZeroWriteStrategy)
                    } else {
                        Box::new(PhaseZeroWriteStrategy)
                    };
                let host = StageWriterHost::new(
                    self.output.clone(),
                    self.factory,
                    job_id,
                    EmitTag::Node,
                );
                Box::new(ReservoirSamplingWriter::new(
                    host,
                    strategy,
                    filter,
                    job_id,
                    sample_rate,
                    self.params.sample_seed ^ self.worker_id as u64,
                ))
            }
            MapperMode::Shuffle => {
                let host = StageWriterHost::new(
                    self.output.clone(),
                    self.factory,
                    job_id,
                    EmitTag::Node,
                );
                Box::new(FastKvWriter::new(
                    host,
                    Arc::new(RandomNodePartitionFunction::new(self.params.num_nodes)),
                    Framing::Framed,
                    sample_rate,
                ))
            }
            MapperMode::Standard => {
                let partition_function = self.partition_map.get(job_id)?;
                let host = StageWriterHost::new(
                    self.output.clone(),
                    self.factory,
                    job_id,
                    EmitTag::PartitionGroup,
                );
                if filter.is_some() {
                    Box::new(BufferedKvWriter::new(
                        host,
                        partition_function,
                        Box::new(DefaultWriteStrategy),
                        filter,
                        sample_rate,
                    ))
                } else {
                    Box::new(FastKvWriter::new(
                        host,
                        partition_function,
                        Framing::Framed,
                        sample_rate,
                    ))
                }
            }
        };

        let map_function: Box<dyn MapFunction> = match self.mode {
            MapperMode::Standard => self
                .map_registry
                .create(&info.map_function, &self.params)?,
            // Phase-zero mappers always pass records through unchanged.
            MapperMode::Shuffle | MapperMode::ReservoirSample => Box::new(PassThroughMap),
        };

        Ok(Bound {
            job_id,
            map_function,
            writer,
        })
    }
}

impl Worker for Mapper {
    type Input = KvBuffer;

    fn run(&mut self, buffer: KvBuffer) -> Result<()> {
        let job_id = buffer
            .job_id()
            .expect("buffer entering a mapper must carry a job id");
        if self.state.is_none() {
            let bound = self.bind(job_id)?;
            self.state = Some(bound);
        }
        let bound = self.state.as_mut().unwrap();
        assert_eq!(
            bound.job_id, job_id,
            "a mapper drives one map function at a time"
        );
        bound.map_function.configure(&buffer);

        self.bytes_in += buffer.current_size() as u64;
        let input_sample_rate = self.params.map_input_sample_rate;
        for kv in buffer.iter() {
            if input_sample_rate > 0 && self.tuples_in % input_sample_rate == 0 {
                debug!(
                    "mapper {}: input tuple {} has {} key bytes, {} value bytes",
                    self.worker_id,
                    self.tuples_in,
                    kv.key_len(),
                    kv.value_len()
                );
            }
            bound.map_function.map(&kv, bound.writer.as_mut());
            self.tuples_in += 1;
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        if let Some(bound) = &mut self.state {
            bound.map_function.teardown(bound.writer.as_mut());
            bound.writer.flush_buffers();
            if self.mode == MapperMode::ReservoirSample {
                self.coordinator.upload_sample_statistics(
                    bound.job_id,
                    self.bytes_in,
                    bound.writer.bytes_written(),
                );
            }
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
