/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::io::{Read, Write};

use anyhow::{bail, ensure, Context, Result};

use crate::record::KvBuffer;

/// A sorted list of boundary keys with lower-bound-inclusive search.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyList {
    keys: Vec<Box<[u8]>>,
}

impl KeyList {
    fn new(keys: Vec<Box<[u8]>>) -> Self {
        debug_assert!(keys.windows(2).all(|pair| pair[0] <= pair[1]));
        KeyList { keys }
    }

    /// The number of boundaries less than or equal to `key`: bucket 0 for
    /// keys below every boundary, bucket `i` for keys in
    /// `[keys[i - 1], keys[i])`.
    fn search(&self, key: &[u8]) -> u64 {
        self.keys.partition_point(|boundary| &**boundary <= key) as u64
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.keys.len() as u64).to_le_bytes())?;
        for key in &self.keys {
            writer.write_all(&(key.len() as u32).to_le_bytes())?;
            writer.write_all(key)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut count = [0u8; 8];
        reader.read_exact(&mut count).context("key list count")?;
        let count = u64::from_le_bytes(count);
        let mut keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len).context("boundary key length")?;
            let mut key = vec![0u8; u32::from_le_bytes(len) as usize];
            reader.read_exact(&mut key).context("boundary key bytes")?;
            keys.push(key.into_boxed_slice());
        }
        Ok(KeyList::new(keys))
    }
}

/// The phase-zero partitioning artifact: boundary keys dividing the key
/// space into groups, and each group into partitions.
///
/// A key belongs to the last bucket whose lower boundary is less than or
/// equal to it; keys below every boundary land in bucket 0, and a key
/// equal to a boundary lands in the bucket that boundary opens. Group
/// lookups search the global list (the lower boundaries of groups
/// `1..G`); partition lookups then search the group's local list (the
/// lower boundaries of its partitions `1..L`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPartitioner {
    num_groups: u64,
    partitions_per_group: u64,
    global_list: KeyList,
    local_lists: Vec<KeyList>,
}

impl KeyPartitioner {
    /// Builds a partitioner from a boundary buffer of one record per
    /// partition in key order.
    ///
    /// The buffer may carry `G * L` records, one per partition (the first
    /// acts as a universal lower bound and is skipped), or `G * L - 1`
    /// records, one per partition past the zeroth.
    pub fn from_boundary_buffer(
        buffer: &KvBuffer,
        num_groups: u64,
        partitions_per_group: u64,
    ) -> Result<Self> {
        ensure!(
            num_groups > 0 && partitions_per_group > 0,
            "partitioner needs at least one group and one partition per group"
        );
        let num_partitions = num_groups * partitions_per_group;
        let mut bounds: Vec<Box<[u8]>> =
            buffer.iter().map(|kv| kv.key().to_vec().into()).collect();
        if bounds.len() as u64 == num_partitions {
            bounds.remove(0);
        }
        if bounds.len() as u64 != num_partitions - 1 {
            bail!(
                "boundary buffer holds {} keys, expected {} for {} partitions",
                bounds.len(),
                num_partitions - 1,
                num_partitions
            );
        }

        // bounds[i] is the lower boundary of partition i + 1. The global
        // list takes the group lower bounds; each local list takes the
        // in-group partition lower bounds.
        let global_list = KeyList::new(
            (1..num_groups)
                .map(|group| bounds[(group * partitions_per_group - 1) as usize].clone())
                .collect(),
        );
        let local_lists = (0..num_groups)
            .map(|group| {
                KeyList::new(
                    (1..partitions_per_group)
                        .map(|local| {
                            bounds[(group * partitions_per_group + local - 1) as usize].clone()
                        })
                        .collect(),
                )
            })
            .collect();

        Ok(KeyPartitioner {
            num_groups,
            partitions_per_group,
            global_list,
            local_lists,
        })
    }

    /// The partition group a key belongs to.
    pub fn global_partition(&self, key: &[u8]) -> u64 {
        self.global_list.search(key)
    }

    /// The partition a key belongs to, globally numbered, given its
    /// group.
    pub fn local_partition(&self, key: &[u8], partition_group: u64) -> u64 {
        assert!(
            partition_group < self.num_groups,
            "partition group {} out of range",
            partition_group
        );
        partition_group * self.partitions_per_group
            + self.local_lists[partition_group as usize].search(key)
    }

    #[inline]
    pub fn num_partition_groups(&self) -> u64 {
        self.num_groups
    }

    #[inline]
    pub fn num_partitions(&self) -> u64 {
        self.num_groups * self.partitions_per_group
    }

    /// Serializes the partitioner: a header of `(num_groups,
    /// partitions_per_group)`, the global key list, then the local lists
    /// in group order. Each list is a count followed by length-prefixed
    /// keys; integers are little-endian.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.num_groups.to_le_bytes())?;
        writer.write_all(&self.partitions_per_group.to_le_bytes())?;
        self.global_list
            .write_to(writer)
            .context("global key list")?;
        for (group, list) in self.local_lists.iter().enumerate() {
            list.write_to(writer)
                .with_context(|| format!("local key list of group {}", group))?;
        }
        Ok(())
    }

    /// Reads back a partitioner written by [`write_to`](Self::write_to).
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 16];
        reader
            .read_exact(&mut header)
            .context("key partitioner header")?;
        let num_groups = u64::from_le_bytes(header[..8].try_into().unwrap());
        let partitions_per_group = u64::from_le_bytes(header[8..].try_into().unwrap());
        ensure!(
            num_groups > 0 && partitions_per_group > 0,
            "corrupt key partitioner header"
        );
        let global_list = KeyList::read_from(reader).context("global key list")?;
        ensure!(
            global_list.keys.len() as u64 == num_groups - 1,
            "global key list holds {} keys, expected {}",
            global_list.keys.len(),
            num_groups - 1
        );
        let mut local_lists = Vec::with_capacity(num_groups as usize);
        for group in 0..num_groups {
            let list = KeyList::read_from(reader)
                .with_context(|| format!("local key list of group {}", group))?;
            ensure!(
                list.keys.len() as u64 == partitions_per_group - 1,
                "local key list of group {} holds {} keys, expected {}",
                group,
                list.keys.len(),
                partitions_per_group - 1
            );
            local_lists.push(list);
        }
        Ok(KeyPartitioner {
            num_groups,
            partitions_per_group,
            global_list,
            local_lists,
        })
    }
}
