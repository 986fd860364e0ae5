/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The worker-stage runtime: typed work queues, queueing policies and
//! their routing specializations, buffer pools, write tokens, and the
//! stage runner that drives worker threads.

mod policy;
mod pool;
mod routers;
mod stage;
mod token;
mod work_queue;

pub use policy::{DefaultRouter, QueueingPolicy, RoutedQueueingPolicy, Router};
pub use pool::{BufferPool, KvBufferFactory};
pub use routers::{
    ByteStreamRouter, ChunkingRouter, FairDiskQueueingPolicy, MergerRouter,
    NetworkDestinationRouter, PartitionGroupRouter, PhysicalDiskRouter, ReadRequestRouter,
};
pub use stage::{run_stage, StageStats, Worker, WorkerStats};
pub use token::{WriteToken, WriteTokenPool};
pub use work_queue::{ThreadSafeWorkQueue, WorkQueue, WorkUnit};
