/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The run driver: wires the stages and queueing policies of a complete
//! sort job and executes its phases.

use std::io::Read;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use dsi_progress_logger::prelude::*;
use log::info;

use crate::chunk_map::ChunkMap;
use crate::job::{
    CoordinatorClient, JobId, JobInfoSource, LoggingCoordinatorClient, MapFunctionRegistry,
    ReadRequest, ReduceFunctionRegistry, StorageBackend,
};
use crate::params::Params;
use crate::partition::{KeyPartitioner, PartitionFunctionMap, RecordFilterMap};
use crate::phase_zero::SampleSet;
use crate::record::{KvBuffer, RecordStitcher};
use crate::runtime::{
    run_stage, ChunkingRouter, FairDiskQueueingPolicy, KvBufferFactory, MergerRouter,
    NetworkDestinationRouter, PartitionGroupRouter, QueueingPolicy, ReadRequestRouter,
    RoutedQueueingPolicy, Worker, WriteTokenPool,
};
use crate::workers::{Mapper, MapperMode, Merger, Reducer, SinkWriter, Sorter, TupleDemux,
    WriterMode,
};

/// What a finished run produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub partitions: u64,
    pub chunks: u64,
    pub mapped_tuples: u64,
    pub merged_tuples: u64,
    pub output_tuples: u64,
    pub output_bytes: u64,
}

/// The engine: owns the ports and registries shared by every run.
///
/// A run executes the full pipeline on this node, shuffling through the
/// loopback path; multi-node transports plug in at the
/// network-destination boundary and are wired by the harness, not here.
pub struct Engine {
    params: Arc<Params>,
    job_info_source: Arc<dyn JobInfoSource>,
    storage: Arc<dyn StorageBackend>,
    coordinator: Arc<dyn CoordinatorClient>,
    map_registry: Arc<MapFunctionRegistry>,
    reduce_registry: Arc<ReduceFunctionRegistry>,
    filter_map: Arc<RecordFilterMap>,
}

impl Engine {
    pub fn new(
        params: Params,
        job_info_source: Arc<dyn JobInfoSource>,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        params.validate().context("invalid run configuration")?;
        ensure!(
            params.num_nodes == 1,
            "this driver runs single-node; multi-node runs need a shuffle transport"
        );
        Ok(Engine {
            params: Arc::new(params),
            job_info_source,
            storage,
            coordinator: Arc::new(LoggingCoordinatorClient),
            map_registry: Arc::new(MapFunctionRegistry::default()),
            reduce_registry: Arc::new(ReduceFunctionRegistry::default()),
            filter_map: Arc::new(RecordFilterMap::new()),
        })
    }

    pub fn set_coordinator(&mut self, coordinator: Arc<dyn CoordinatorClient>) {
        self.coordinator = coordinator;
    }

    pub fn set_map_registry(&mut self, registry: Arc<MapFunctionRegistry>) {
        self.map_registry = registry;
    }

    pub fn set_reduce_registry(&mut self, registry: Arc<ReduceFunctionRegistry>) {
        self.reduce_registry = registry;
    }

    pub fn set_filter_map(&mut self, filter_map: Arc<RecordFilterMap>) {
        self.filter_map = filter_map;
    }

    /// Runs a job over the given input buffers.
    pub fn run(&self, job_id: JobId, inputs: Vec<KvBuffer>) -> Result<RunSummary> {
        let factory = KvBufferFactory::new(
            self.params.default_buffer_size,
            self.params.buffer_alignment,
        );
        let partition_map = Arc::new(PartitionFunctionMap::new(
            &self.params,
            self.job_info_source.clone(),
        ));

        let mut inputs = inputs;
        for buffer in &mut inputs {
            buffer.set_job_id(job_id);
        }

        let info = self.job_info_source.job_info(job_id)?;
        if matches!(
            info.partition_function.as_str(),
            "boundary_list" | "hashed_boundary_list"
        ) {
            self.phase_zero(job_id, &inputs, &factory, &partition_map)?;
        }

        let chunk_map = Arc::new(ChunkMap::new(self.params.num_disks));
        let mapped_tuples = self.sort_phase(&inputs, &factory, &partition_map, &chunk_map)?;
        drop(inputs);

        let summary = self.merge_phase(job_id, &factory, &chunk_map)?;
        Ok(RunSummary {
            mapped_tuples,
            ..summary
        })
    }

    /// Phase zero: reservoir-sample the input, pick boundaries, install
    /// the key partitioner.
    fn phase_zero(
        &self,
        job_id: JobId,
        inputs: &[KvBuffer],
        factory: &KvBufferFactory,
        partition_map: &Arc<PartitionFunctionMap>,
    ) -> Result<()> {
        let mut pl = ProgressLogger::default();
        pl.item_name("buffer")
            .expected_updates(Some(inputs.len()));
        pl.start("Sampling input...");

        let sample_in: Arc<dyn QueueingPolicy<KvBuffer>> =
            Arc::new(RoutedQueueingPolicy::single(1));
        let sample_out: Arc<dyn QueueingPolicy<KvBuffer>> =
            Arc::new(RoutedQueueingPolicy::single(1));
        for buffer in inputs {
            sample_in.enqueue(buffer.clone());
            pl.light_update();
        }
        sample_in.teardown();

        run_stage(
            "sample",
            self.params.workers.mappers,
            &sample_in,
            |worker_id| {
                Ok(Mapper::new(
                    worker_id,
                    MapperMode::ReservoirSample,
                    self.params.clone(),
                    sample_out.clone(),
                    *factory,
                    partition_map.clone(),
                    self.filter_map.clone(),
                    self.map_registry.clone(),
                    self.job_info_source.clone(),
                    self.coordinator.clone(),
                ))
            },
        )?;
        sample_out.teardown();

        let mut sample_buffers = Vec::new();
        while let Some(buffer) = sample_out.dequeue(0) {
            sample_buffers.push(buffer);
        }
        let mut samples = SampleSet::collect(&sample_buffers);
        info!(
            "phase zero sampled {} records ({} bytes seen)",
            samples.len(),
            samples.metadata().bytes_in
        );

        let boundaries = samples
            .boundary_buffer(self.params.num_partitions(), factory)
            .context("picking partition boundaries")?;
        let partitioner = KeyPartitioner::from_boundary_buffer(
            &boundaries,
            self.params.num_partition_groups(),
            self.params.partitions_per_group,
        )?;
        partition_map.set_key_partitioner(job_id, Arc::new(partitioner));
        pl.done();
        Ok(())
    }

    /// Map, shuffle, demux, sort, and write chunks.
    fn sort_phase(
        &self,
        inputs: &[KvBuffer],
        factory: &KvBufferFactory,
        partition_map: &Arc<PartitionFunctionMap>,
        chunk_map: &Arc<ChunkMap>,
    ) -> Result<u64> {
        let params = &self.params;
        let mut pl = ProgressLogger::default();
        pl.item_name("buffer")
            .expected_updates(Some(inputs.len()));
        pl.start("Mapping and writing sorted chunks...");

        let map_in: Arc<dyn QueueingPolicy<KvBuffer>> =
            Arc::new(RoutedQueueingPolicy::single(1));
        for buffer in inputs {
            map_in.enqueue(buffer.clone());
            pl.light_update();
        }
        map_in.teardown();

        let shuffle: Arc<dyn QueueingPolicy<KvBuffer>> = Arc::new(RoutedQueueingPolicy::new(
            params.num_nodes as usize,
            NetworkDestinationRouter::new(params.partition_groups_per_node),
        ));
        let demux_in: Arc<dyn QueueingPolicy<KvBuffer>> = Arc::new(RoutedQueueingPolicy::new(
            params.num_demuxes(),
            PartitionGroupRouter::new(params.partition_groups_per_node),
        ));
        let sort_in: Arc<dyn QueueingPolicy<KvBuffer>> =
            Arc::new(RoutedQueueingPolicy::single(1));
        let chunk_in: Arc<dyn QueueingPolicy<KvBuffer>> = Arc::new(RoutedQueueingPolicy::new(
            params.num_writers(),
            ChunkingRouter::new(params.disks_per_writer, chunk_map.clone()),
        ));

        let mut mapped_tuples = 0;
        std::thread::scope(|scope| -> Result<()> {
            let mappers = scope.spawn(|| {
                let stats = run_stage("map", params.workers.mappers, &map_in, |worker_id| {
                    Ok(Mapper::new(
                        worker_id,
                        MapperMode::Standard,
                        params.clone(),
                        shuffle.clone(),
                        *factory,
                        partition_map.clone(),
                        self.filter_map.clone(),
                        self.map_registry.clone(),
                        self.job_info_source.clone(),
                        self.coordinator.clone(),
                    ))
                });
                shuffle.teardown();
                stats
            });

            // Loopback shuffle: this node's outgoing buffers feed its own
            // demultiplexers.
            let transport = scope.spawn(|| {
                while let Some(buffer) = shuffle.dequeue(params.node_id as usize) {
                    demux_in.enqueue(buffer);
                }
                demux_in.teardown();
            });

            let demuxes = scope.spawn(|| {
                let stats = run_stage("demux", params.num_demuxes(), &demux_in, |worker_id| {
                    Ok(TupleDemux::new(
                        worker_id,
                        params,
                        false,
                        sort_in.clone(),
                        *factory,
                        partition_map.clone(),
                    ))
                });
                sort_in.teardown();
                stats
            });

            let sorters = scope.spawn(|| {
                let stats = run_stage("sort", params.workers.sorters, &sort_in, |_| {
                    Ok(Sorter::new(*factory, chunk_in.clone()))
                });
                chunk_in.teardown();
                stats
            });

            let writers = scope.spawn(|| {
                run_stage("chunk write", params.num_writers(), &chunk_in, |_| {
                    Ok(SinkWriter::new(
                        self.storage.clone(),
                        WriterMode::Chunk {
                            chunk_map: chunk_map.clone(),
                        },
                    ))
                })
            });

            mapped_tuples = mappers.join().unwrap()?.tuples_out;
            transport.join().unwrap();
            demuxes.join().unwrap()?;
            sorters.join().unwrap()?;
            writers.join().unwrap()?;
            Ok(())
        })?;
        pl.done();
        Ok(mapped_tuples)
    }

    /// Re-read chunks, merge, reduce, and write the final output.
    fn merge_phase(
        &self,
        job_id: JobId,
        factory: &KvBufferFactory,
        chunk_map: &Arc<ChunkMap>,
    ) -> Result<RunSummary> {
        let params = &self.params;
        let total_chunks = chunk_map.total_chunks();
        if total_chunks == 0 {
            return Ok(RunSummary::default());
        }
        let mut pl = ProgressLogger::default();
        pl.item_name("chunk")
            .expected_updates(Some(total_chunks as usize));
        pl.start("Merging and reducing...");

        let read_in: Arc<dyn QueueingPolicy<ReadRequest>> = Arc::new(RoutedQueueingPolicy::new(
            params.num_disks as usize,
            ReadRequestRouter::new(params.num_disks as usize),
        ));
        for (partition, chunks) in chunk_map.snapshot() {
            for chunk in chunks {
                read_in.enqueue(ReadRequest {
                    disk_id: chunk.disk_id,
                    partition,
                    chunk_id: chunk.chunk_id,
                    size: chunk.size,
                });
                pl.light_update();
            }
        }
        read_in.teardown();

        let merge_in: Arc<dyn QueueingPolicy<KvBuffer>> = Arc::new(RoutedQueueingPolicy::new(
            total_chunks as usize,
            MergerRouter::from_chunk_map(chunk_map),
        ));
        let reduce_in: Arc<dyn QueueingPolicy<KvBuffer>> =
            Arc::new(RoutedQueueingPolicy::single(1));
        let write_out: Arc<dyn QueueingPolicy<KvBuffer>> = Arc::new(FairDiskQueueingPolicy::new(
            params.num_disks as usize,
            params.partitions_per_disk(),
            params.partitions_per_node(),
        ));
        // The merger fetches chunks in its own order, so the read quota
        // must never be the thing that stalls a reader: raise it to an
        // upper bound on the buffers any disk can have in flight.
        let mut max_disk_buffers = 0u64;
        {
            let mut per_disk = vec![0u64; params.num_disks as usize];
            for chunks in chunk_map.snapshot().values() {
                for chunk in chunks {
                    per_disk[chunk.disk_id as usize] +=
                        chunk.size / crate::record::HEADER_SIZE as u64 + 1;
                }
            }
            for buffers in per_disk {
                max_disk_buffers = max_disk_buffers.max(buffers);
            }
        }
        let token_pool = Arc::new(WriteTokenPool::new(
            params.read_tokens_per_disk.max(max_disk_buffers),
            params.num_disks,
        ));

        let mut summary = RunSummary {
            partitions: 0,
            chunks: total_chunks,
            ..RunSummary::default()
        };
        std::thread::scope(|scope| -> Result<()> {
            let readers = scope.spawn(|| {
                let stats = run_stage(
                    "chunk read",
                    params.num_disks as usize,
                    &read_in,
                    |_| {
                        Ok(ChunkReadWorker {
                            storage: self.storage.clone(),
                            factory: *factory,
                            read_buffer_size: params.read_buffer_size,
                            output: merge_in.clone(),
                            token_pool: token_pool.clone(),
                            job_id,
                        })
                    },
                );
                merge_in.teardown();
                stats
            });

            let merger = scope.spawn(|| {
                let merger = Merger::new(
                    merge_in.clone(),
                    reduce_in.clone(),
                    *factory,
                    chunk_map,
                    Some(token_pool.clone()),
                );
                let stats = merger.run();
                reduce_in.teardown();
                stats
            });

            let reducers = scope.spawn(|| {
                let stats = run_stage("reduce", params.workers.reducers, &reduce_in, |_| {
                    Ok(Reducer::new(
                        params.clone(),
                        write_out.clone(),
                        *factory,
                        self.reduce_registry.clone(),
                        self.job_info_source.clone(),
                    ))
                });
                write_out.teardown();
                stats
            });

            let writers = scope.spawn(|| {
                run_stage("output write", params.workers.writers, &write_out, |worker_id| {
                    Ok(SinkWriter::new(
                        self.storage.clone(),
                        WriterMode::Output {
                            disk_id: (worker_id as u64 * params.disks_per_writer)
                                % params.num_disks,
                        },
                    ))
                })
            });

            readers.join().unwrap()?;
            let merge_stats = merger.join().unwrap()?;
            summary.partitions = merge_stats.partitions;
            summary.merged_tuples = merge_stats.tuples_out;
            let reduce_stats = reducers.join().unwrap()?;
            summary.output_tuples = reduce_stats.tuples_out;
            summary.output_bytes = reduce_stats.bytes_out;
            writers.join().unwrap()?;
            Ok(())
        })?;
        pl.done();
        Ok(summary)
    }
}

/// Reads one chunk per request, reassembling whole-record buffers through
/// the stitcher and attaching a read token per buffer.
struct ChunkReadWorker {
    storage: Arc<dyn StorageBackend>,
    factory: KvBufferFactory,
    read_buffer_size: usize,
    output: Arc<dyn QueueingPolicy<KvBuffer>>,
    token_pool: Arc<WriteTokenPool>,
    job_id: JobId,
}

impl ChunkReadWorker {
    fn dispatch(&self, request: &ReadRequest, buffers: Vec<KvBuffer>) {
        for mut buffer in buffers {
            buffer.set_job_id(self.job_id);
            buffer.set_logical_disk_id(request.partition);
            buffer.set_chunk_id(request.chunk_id);
            buffer.set_token(self.token_pool.get(&[request.disk_id]));
            self.output.enqueue(buffer);
        }
    }
}

impl Worker for ChunkReadWorker {
    type Input = ReadRequest;

    fn run(&mut self, request: ReadRequest) -> Result<()> {
        let mut reader = self
            .storage
            .chunk_reader(request.disk_id, request.partition, request.chunk_id)
            .with_context(|| {
                format!(
                    "opening chunk {} of partition {}",
                    request.chunk_id, request.partition
                )
            })?;
        let mut stitcher = RecordStitcher::new(self.factory);
        let mut slice = vec![0u8; self.read_buffer_size];
        let mut stitched = Vec::new();
        loop {
            let n = reader.read(&mut slice)?;
            if n == 0 {
                break;
            }
            stitcher.feed(&slice[..n], &mut stitched);
            self.dispatch(&request, std::mem::take(&mut stitched));
        }
        stitcher
            .finish(&mut stitched)
            .with_context(|| format!("chunk {} of partition {}", request.chunk_id, request.partition))?;
        self.dispatch(&request, stitched);
        Ok(())
    }
}
