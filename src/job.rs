/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Job descriptions and the ports through which the engine talks to its
//! external collaborators: user functions, storage, and the coordinator.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use log::info;

use crate::params::Params;
use crate::record::{KvBuffer, KvPair};
use crate::runtime::WorkUnit;
use crate::workers::ReduceKvIterator;
use crate::writer::KvWriter;

/// Job identifier; 0 is reserved for "unset".
pub type JobId = u64;

/// The description of one job: which user functions it runs and how its
/// keys are partitioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub job_id: JobId,
    pub map_function: String,
    pub reduce_function: String,
    pub partition_function: String,
}

impl JobInfo {
    pub fn new(
        job_id: JobId,
        map_function: &str,
        reduce_function: &str,
        partition_function: &str,
    ) -> Self {
        assert!(job_id != 0, "job id 0 is reserved for \"unset\"");
        JobInfo {
            job_id,
            map_function: map_function.into(),
            reduce_function: reduce_function.into(),
            partition_function: partition_function.into(),
        }
    }
}

/// Source of job descriptions, usually backed by the coordinator.
pub trait JobInfoSource: Send + Sync {
    fn job_info(&self, job_id: JobId) -> Result<JobInfo>;
}

/// A fixed table of jobs, enough for single-run drivers and tests.
pub struct StaticJobInfoSource {
    jobs: HashMap<JobId, JobInfo>,
}

impl StaticJobInfoSource {
    pub fn new(jobs: impl IntoIterator<Item = JobInfo>) -> Self {
        StaticJobInfoSource {
            jobs: jobs.into_iter().map(|job| (job.job_id, job)).collect(),
        }
    }
}

impl JobInfoSource for StaticJobInfoSource {
    fn job_info(&self, job_id: JobId) -> Result<JobInfo> {
        self.jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| anyhow!("no job info for job {}", job_id))
    }
}

/// The client through which phase-zero statistics reach the coordinator.
pub trait CoordinatorClient: Send + Sync {
    fn upload_sample_statistics(&self, job_id: JobId, bytes_in: u64, bytes_mapped: u64);
}

/// A coordinator client that only logs, used when no coordinator is wired.
pub struct LoggingCoordinatorClient;

impl CoordinatorClient for LoggingCoordinatorClient {
    fn upload_sample_statistics(&self, job_id: JobId, bytes_in: u64, bytes_mapped: u64) {
        info!(
            "job {}: sampled {} bytes in, {} bytes mapped",
            job_id, bytes_in, bytes_mapped
        );
    }
}

/// A user map function.
///
/// Instances are created per worker through the registry and live for the
/// worker's lifetime.
pub trait MapFunction {
    /// Called once per input buffer, before its records are mapped.
    fn configure(&mut self, _buffer: &KvBuffer) {}

    /// Maps one record, writing any number of output records.
    fn map(&mut self, kv: &KvPair, writer: &mut dyn KvWriter);

    /// Called once after the last record, before the writer is flushed.
    fn teardown(&mut self, _writer: &mut dyn KvWriter) {}
}

/// A user reduce function, invoked once per distinct key with an iterator
/// over all values carrying that key.
pub trait ReduceFunction {
    /// Called once per input buffer.
    fn configure(&mut self) {}

    fn reduce(&mut self, key: &[u8], values: &mut ReduceKvIterator, writer: &mut dyn KvWriter);
}

/// The identity map function, used by the phase-zero modes and available
/// to jobs under the name `pass_through`.
pub struct PassThroughMap;

impl MapFunction for PassThroughMap {
    fn map(&mut self, kv: &KvPair, writer: &mut dyn KvWriter) {
        writer.write(kv);
    }
}

/// The identity reduce function, available under the name `identity`.
pub struct IdentityReduce;

impl ReduceFunction for IdentityReduce {
    fn reduce(&mut self, _key: &[u8], values: &mut ReduceKvIterator, writer: &mut dyn KvWriter) {
        while let Some(kv) = values.next() {
            writer.write(&kv);
        }
    }
}

type MapFunctionCtor = Box<dyn Fn(&Params) -> Box<dyn MapFunction> + Send + Sync>;
type ReduceFunctionCtor = Box<dyn Fn(&Params) -> Box<dyn ReduceFunction> + Send + Sync>;

/// Resolves map function names to instances.
pub struct MapFunctionRegistry {
    ctors: HashMap<String, MapFunctionCtor>,
}

impl Default for MapFunctionRegistry {
    fn default() -> Self {
        let mut registry = MapFunctionRegistry {
            ctors: HashMap::new(),
        };
        registry.register("pass_through", |_| Box::new(PassThroughMap));
        registry
    }
}

impl MapFunctionRegistry {
    pub fn register(
        &mut self,
        name: &str,
        ctor: impl Fn(&Params) -> Box<dyn MapFunction> + Send + Sync + 'static,
    ) {
        self.ctors.insert(name.into(), Box::new(ctor));
    }

    pub fn create(&self, name: &str, params: &Params) -> Result<Box<dyn MapFunction>> {
        let ctor = self
            .ctors
            .get(name)
            .ok_or_else(|| anyhow!("unknown map function {:?}", name))?;
        Ok(ctor(params))
    }
}

/// Resolves reduce function names to instances.
pub struct ReduceFunctionRegistry {
    ctors: HashMap<String, ReduceFunctionCtor>,
}

impl Default for ReduceFunctionRegistry {
    fn default() -> Self {
        let mut registry = ReduceFunctionRegistry {
            ctors: HashMap::new(),
        };
        registry.register("identity", |_| Box::new(IdentityReduce));
        registry
    }
}

impl ReduceFunctionRegistry {
    pub fn register(
        &mut self,
        name: &str,
        ctor: impl Fn(&Params) -> Box<dyn ReduceFunction> + Send + Sync + 'static,
    ) {
        self.ctors.insert(name.into(), Box::new(ctor));
    }

    pub fn create(&self, name: &str, params: &Params) -> Result<Box<dyn ReduceFunction>> {
        let ctor = self
            .ctors
            .get(name)
            .ok_or_else(|| anyhow!("unknown reduce function {:?}", name))?;
        Ok(ctor(params))
    }
}

/// The sink the engine appends buffers to, one open sink per file.
pub trait WriterSink: Send {
    /// Appends the bytes, returning how many were written.
    fn write(&mut self, bytes: &[u8]) -> Result<u64>;

    fn close(&mut self) -> Result<()>;
}

/// The storage port: chunk files written during the sort half of a run
/// and re-read by the merge half, plus the final per-partition output.
pub trait StorageBackend: Send + Sync {
    /// Opens the sink for one sorted chunk of a partition.
    fn chunk_writer(&self, disk_id: u64, partition: u64, chunk_id: u64)
        -> Result<Box<dyn WriterSink>>;

    /// Re-opens a written chunk for sequential reading.
    fn chunk_reader(&self, disk_id: u64, partition: u64, chunk_id: u64)
        -> Result<Box<dyn Read + Send>>;

    /// Opens (or re-opens, appending) the final output of a partition.
    fn output_writer(&self, disk_id: u64, partition: u64) -> Result<Box<dyn WriterSink>>;
}

/// A request to read one chunk of one partition from a disk.
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    pub disk_id: u64,
    pub partition: u64,
    pub chunk_id: u64,
    pub size: u64,
}

impl WorkUnit for ReadRequest {
    fn size_bytes(&self) -> u64 {
        self.size
    }
}

/// In-memory storage, used by tests and single-node loopback runs.
#[derive(Default)]
pub struct InMemoryStorage {
    chunks: Arc<Mutex<HashMap<(u64, u64, u64), Vec<u8>>>>,
    outputs: Arc<Mutex<HashMap<u64, Vec<u8>>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The final output bytes of a partition.
    pub fn output(&self, partition: u64) -> Option<Vec<u8>> {
        self.outputs.lock().unwrap().get(&partition).cloned()
    }

    /// The raw bytes of a written chunk.
    pub fn chunk(&self, disk_id: u64, partition: u64, chunk_id: u64) -> Option<Vec<u8>> {
        self.chunks
            .lock()
            .unwrap()
            .get(&(disk_id, partition, chunk_id))
            .cloned()
    }
}

// Sinks buffer in a side vector and fold it into the map on close, so
// concurrent writers to different files never contend.
struct BufferedMapSink<K> {
    bytes: Vec<u8>,
    store: Arc<Mutex<HashMap<K, Vec<u8>>>>,
    key: K,
    append: bool,
}

impl<K: std::hash::Hash + Eq + Clone + Send> WriterSink for BufferedMapSink<K> {
    fn write(&mut self, bytes: &[u8]) -> Result<u64> {
        self.bytes.extend_from_slice(bytes);
        Ok(bytes.len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        let bytes = std::mem::take(&mut self.bytes);
        let mut store = self.store.lock().unwrap();
        if self.append {
            store
                .entry(self.key.clone())
                .or_default()
                .extend_from_slice(&bytes);
        } else {
            let previous = store.insert(self.key.clone(), bytes);
            assert!(previous.is_none(), "chunk written twice");
        }
        Ok(())
    }
}

impl StorageBackend for InMemoryStorage {
    fn chunk_writer(
        &self,
        disk_id: u64,
        partition: u64,
        chunk_id: u64,
    ) -> Result<Box<dyn WriterSink>> {
        Ok(Box::new(BufferedMapSink {
            bytes: Vec::new(),
            store: self.chunks.clone(),
            key: (disk_id, partition, chunk_id),
            append: false,
        }))
    }

    fn chunk_reader(
        &self,
        disk_id: u64,
        partition: u64,
        chunk_id: u64,
    ) -> Result<Box<dyn Read + Send>> {
        let bytes = self
            .chunk(disk_id, partition, chunk_id)
            .with_context(|| {
                format!(
                    "chunk {} of partition {} missing on disk {}",
                    chunk_id, partition, disk_id
                )
            })?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    fn output_writer(&self, _disk_id: u64, partition: u64) -> Result<Box<dyn WriterSink>> {
        Ok(Box::new(BufferedMapSink {
            bytes: Vec::new(),
            store: self.outputs.clone(),
            key: partition,
            append: true,
        }))
    }
}
