/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The parsed configuration the engine receives from its harness.

use anyhow::{ensure, Result};

/// Worker counts per stage.
#[derive(Debug, Clone, Copy)]
pub struct StageWorkers {
    pub mappers: usize,
    pub sorters: usize,
    pub writers: usize,
    pub reducers: usize,
}

impl Default for StageWorkers {
    fn default() -> Self {
        let cores = num_cpus::get().max(2);
        StageWorkers {
            mappers: cores / 2,
            sorters: cores / 2,
            writers: 2,
            reducers: cores / 2,
        }
    }
}

/// The engine's run configuration.
///
/// A run executes on a fixed cluster whose peers are enumerated here; the
/// partition geometry is `num_nodes * partition_groups_per_node` groups of
/// `partitions_per_group` partitions each. The number of demultiplexers
/// per node equals the number of partition groups per node, since each
/// demux is pinned to one group.
#[derive(Debug, Clone)]
pub struct Params {
    pub node_id: u64,
    pub num_nodes: u64,
    pub partition_groups_per_node: u64,
    pub partitions_per_group: u64,
    /// Number of physical disks on this node.
    pub num_disks: u64,
    /// Disks served by each writer worker.
    pub disks_per_writer: u64,
    pub default_buffer_size: usize,
    pub buffer_alignment: usize,
    /// Slice size used when re-reading chunk files.
    pub read_buffer_size: usize,
    /// Read tokens in flight per disk during merging.
    pub read_tokens_per_disk: u64,
    pub workers: StageWorkers,
    /// Log every n-th input tuple of the mapper.
    pub map_input_sample_rate: u64,
    /// Log every n-th output tuple of the writers.
    pub map_output_sample_rate: u64,
    /// Seed for the reservoir sampler.
    pub sample_seed: u64,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            node_id: 0,
            num_nodes: 1,
            partition_groups_per_node: 2,
            partitions_per_group: 2,
            num_disks: 2,
            disks_per_writer: 1,
            default_buffer_size: 1 << 20,
            buffer_alignment: 512,
            read_buffer_size: 1 << 16,
            read_tokens_per_disk: 4,
            workers: StageWorkers::default(),
            map_input_sample_rate: 1 << 16,
            map_output_sample_rate: 1 << 16,
            sample_seed: 0,
        }
    }
}

impl Params {
    /// Total number of partition groups in the cluster.
    #[inline]
    pub fn num_partition_groups(&self) -> u64 {
        self.num_nodes * self.partition_groups_per_node
    }

    /// Total number of partitions in the cluster.
    #[inline]
    pub fn num_partitions(&self) -> u64 {
        self.num_partition_groups() * self.partitions_per_group
    }

    /// Number of partitions hosted by each node.
    #[inline]
    pub fn partitions_per_node(&self) -> u64 {
        self.partition_groups_per_node * self.partitions_per_group
    }

    /// Number of partitions mapped to each physical disk.
    #[inline]
    pub fn partitions_per_disk(&self) -> u64 {
        self.partitions_per_node().div_ceil(self.num_disks)
    }

    /// Number of demultiplexers per node; each is pinned to one group.
    #[inline]
    pub fn num_demuxes(&self) -> usize {
        self.partition_groups_per_node as usize
    }

    /// Number of writer workers needed to cover the disk set.
    #[inline]
    pub fn num_writers(&self) -> usize {
        self.num_disks.div_ceil(self.disks_per_writer) as usize
    }

    /// Rejects bad parameter combinations. Fatal at startup.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_nodes > 0, "a run needs at least one node");
        ensure!(
            self.node_id < self.num_nodes,
            "node id {} out of range for {} nodes",
            self.node_id,
            self.num_nodes
        );
        ensure!(
            self.partition_groups_per_node > 0,
            "a node needs at least one partition group"
        );
        ensure!(
            self.partitions_per_group > 0,
            "a group needs at least one partition"
        );
        ensure!(self.num_disks > 0, "a node needs at least one disk");
        ensure!(
            self.disks_per_writer > 0 && self.disks_per_writer <= self.num_disks,
            "disks per writer must be between 1 and the disk count"
        );
        ensure!(
            self.buffer_alignment.is_power_of_two(),
            "buffer alignment must be a power of two"
        );
        ensure!(
            self.default_buffer_size > 0 && self.read_buffer_size > 0,
            "buffer sizes must be nonzero"
        );
        ensure!(
            self.read_tokens_per_disk > 0,
            "merging needs at least one read token per disk"
        );
        ensure!(
            self.workers.mappers > 0
                && self.workers.sorters > 0
                && self.workers.writers > 0
                && self.workers.reducers > 0,
            "every stage needs at least one worker"
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_params_validate() {
        Params::default().validate().unwrap();
    }

    #[test]
    fn test_geometry() {
        let params = Params {
            num_nodes: 3,
            partition_groups_per_node: 2,
            partitions_per_group: 2,
            ..Params::default()
        };
        assert_eq!(params.num_partition_groups(), 6);
        assert_eq!(params.num_partitions(), 12);
        assert_eq!(params.partitions_per_node(), 4);
    }

    #[test]
    fn test_bad_combinations_rejected() {
        let mut params = Params::default();
        params.buffer_alignment = 3;
        assert!(params.validate().is_err());

        let mut params = Params::default();
        params.node_id = 9;
        assert!(params.validate().is_err());
    }
}
