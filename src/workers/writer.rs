/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::sync::Arc;

use anyhow::{ensure, Context, Result};

use crate::chunk_map::ChunkMap;
use crate::job::StorageBackend;
use crate::record::KvBuffer;
use crate::runtime::Worker;

/// What a writer stage persists.
pub enum WriterMode {
    /// Sorted runs, one file per `(disk, partition, chunk)`.
    Chunk { chunk_map: Arc<ChunkMap> },
    /// Final merged output, appended per partition.
    Output { disk_id: u64 },
}

/// Thin adapter driving the storage port: one buffer in, one sink write
/// out. The interesting work (chunk accounting, disk choice) happened at
/// the queueing boundary in front of this stage.
pub struct SinkWriter {
    storage: Arc<dyn StorageBackend>,
    mode: WriterMode,
    buffers_written: u64,
    bytes_written: u64,
}

impl SinkWriter {
    pub fn new(storage: Arc<dyn StorageBackend>, mode: WriterMode) -> Self {
        SinkWriter {
            storage,
            mode,
            buffers_written: 0,
            bytes_written: 0,
        }
    }
}

impl Worker for SinkWriter {
    type Input = KvBuffer;

    fn run(&mut self, buffer: KvBuffer) -> Result<()> {
        let partition = buffer
            .logical_disk_id()
            .expect("buffer entering a writer must carry a partition");
        let mut sink = match &self.mode {
            WriterMode::Chunk { chunk_map } => {
                let chunk_id = buffer
                    .chunk_id()
                    .expect("chunk buffer must carry a chunk id");
                let disk_id = chunk_map.disk_id(partition, chunk_id);
                self.storage
                    .chunk_writer(disk_id, partition, chunk_id)
                    .with_context(|| {
                        format!("opening chunk {} of partition {}", chunk_id, partition)
                    })?
            }
            WriterMode::Output { disk_id } => self
                .storage
                .output_writer(*disk_id, partition)
                .with_context(|| format!("opening output of partition {}", partition))?,
        };
        let written = sink.write(buffer.bytes())?;
        ensure!(
            written == buffer.current_size() as u64,
            "sink wrote {} of {} bytes",
            written,
            buffer.current_size()
        );
        sink.close()?;
        self.buffers_written += 1;
        self.bytes_written += written;
        Ok(())
    }

    fn output_stats(&self) -> (u64, u64) {
        (self.buffers_written, self.bytes_written)
    }
}
