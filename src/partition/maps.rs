/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::job::{JobId, JobInfoSource};
use crate::params::Params;
use crate::partition::{
    BoundaryListPartitionFunction, HashedBoundaryListPartitionFunction, KeyPartitioner,
    PartitionFunction, RandomNodePartitionFunction, SinglePartitionMergingPartitionFunction,
    UniformPartitionFunction,
};

/// Decides whether a record takes part in a job at all. Rejected records
/// are silently dropped (and counted) by the writers.
pub trait RecordFilter: Send + Sync {
    fn pass(&self, key: &[u8]) -> bool;
}

/// Accepts keys in `[from, to)`; an absent upper bound means "to the
/// end of the key space".
pub struct KeyRangeFilter {
    from: Box<[u8]>,
    to: Option<Box<[u8]>>,
}

impl KeyRangeFilter {
    pub fn new(from: &[u8], to: Option<&[u8]>) -> Self {
        KeyRangeFilter {
            from: from.into(),
            to: to.map(Into::into),
        }
    }
}

impl RecordFilter for KeyRangeFilter {
    fn pass(&self, key: &[u8]) -> bool {
        key >= &*self.from && self.to.as_deref().is_none_or(|to| key < to)
    }
}

/// Lazily constructs and caches one partition function per job.
///
/// Boundary-list functions need the phase-zero artifact, which the driver
/// installs through [`set_key_partitioner`](Self::set_key_partitioner)
/// before any phase that partitions real records runs.
pub struct PartitionFunctionMap {
    params: Params,
    job_info: Arc<dyn JobInfoSource>,
    functions: Mutex<HashMap<JobId, Arc<dyn PartitionFunction>>>,
    partitioners: Mutex<HashMap<JobId, Arc<KeyPartitioner>>>,
}

impl PartitionFunctionMap {
    pub fn new(params: &Params, job_info: Arc<dyn JobInfoSource>) -> Self {
        PartitionFunctionMap {
            params: params.clone(),
            job_info,
            functions: Mutex::new(HashMap::new()),
            partitioners: Mutex::new(HashMap::new()),
        }
    }

    /// Installs the boundary-list artifact for a job.
    pub fn set_key_partitioner(&self, job_id: JobId, partitioner: Arc<KeyPartitioner>) {
        self.partitioners
            .lock()
            .unwrap()
            .insert(job_id, partitioner);
    }

    /// The partition function of a job, constructing it on first use.
    pub fn get(&self, job_id: JobId) -> Result<Arc<dyn PartitionFunction>> {
        let mut functions = self.functions.lock().unwrap();
        if let Some(function) = functions.get(&job_id) {
            return Ok(function.clone());
        }
        let function = self.construct(job_id)?;
        functions.insert(job_id, function.clone());
        Ok(function)
    }

    fn construct(&self, job_id: JobId) -> Result<Arc<dyn PartitionFunction>> {
        let info = self.job_info.job_info(job_id)?;
        let function: Arc<dyn PartitionFunction> = match info.partition_function.as_str() {
            "uniform" => Arc::new(UniformPartitionFunction::new(
                self.params.num_partition_groups(),
                self.params.num_partitions(),
            )),
            "single_partition_merging" => Arc::new(SinglePartitionMergingPartitionFunction),
            "random_node" => Arc::new(RandomNodePartitionFunction::new(self.params.num_nodes)),
            "boundary_list" => Arc::new(BoundaryListPartitionFunction::new(
                self.key_partitioner(job_id)?,
            )),
            "hashed_boundary_list" => Arc::new(HashedBoundaryListPartitionFunction::new(
                self.key_partitioner(job_id)?,
            )),
            other => return Err(anyhow!("unknown partition function {:?}", other)),
        };
        Ok(function)
    }

    fn key_partitioner(&self, job_id: JobId) -> Result<Arc<KeyPartitioner>> {
        self.partitioners
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "job {} uses a boundary list but no partitioning artifact is installed",
                    job_id
                )
            })
    }
}

/// Lazily resolved per-job record filters; jobs have no filter unless one
/// is registered.
#[derive(Default)]
pub struct RecordFilterMap {
    filters: Mutex<HashMap<JobId, Arc<dyn RecordFilter>>>,
}

impl RecordFilterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: JobId, filter: Arc<dyn RecordFilter>) {
        self.filters.lock().unwrap().insert(job_id, filter);
    }

    pub fn get(&self, job_id: JobId) -> Option<Arc<dyn RecordFilter>> {
        self.filters.lock().unwrap().get(&job_id).cloned()
    }
}
