/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::sync::Arc;

use anyhow::{Context, Result};
use log::debug;

use crate::runtime::{QueueingPolicy, WorkUnit};

/// A stage worker: pulls typed work units from the stage's input policy
/// and processes them one at a time.
///
/// Workers are constructed on their own thread, so they need not be
/// `Send`; anything shared between workers travels through the
/// constructor closure handed to [`run_stage`].
pub trait Worker {
    type Input: WorkUnit + 'static;

    /// Processes one work unit.
    fn run(&mut self, unit: Self::Input) -> Result<()>;

    /// Called once after the input queue turns terminal.
    fn teardown(&mut self) -> Result<()> {
        Ok(())
    }

    /// Tuples and bytes produced, reported after teardown.
    fn output_stats(&self) -> (u64, u64) {
        (0, 0)
    }
}

/// Statistics reported by one worker at teardown.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub units_in: u64,
    pub bytes_in: u64,
    pub tuples_out: u64,
    pub bytes_out: u64,
}

/// Aggregated statistics for a whole stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageStats {
    pub units_in: u64,
    pub bytes_in: u64,
    pub tuples_out: u64,
    pub bytes_out: u64,
}

impl StageStats {
    fn absorb(&mut self, worker: &WorkerStats) {
        self.units_in += worker.units_in;
        self.bytes_in += worker.bytes_in;
        self.tuples_out += worker.tuples_out;
        self.bytes_out += worker.bytes_out;
    }
}

/// Runs a stage to completion: spawns `num_workers` threads, each driving
/// a worker built by `make_worker` over the stage's input policy until it
/// turns terminal, then gathers per-worker statistics.
///
/// Returns after every worker has finished and torn down. Worker errors
/// abort the stage; the first one is returned.
pub fn run_stage<W, F>(
    name: &str,
    num_workers: usize,
    input: &Arc<dyn QueueingPolicy<W::Input>>,
    make_worker: F,
) -> Result<StageStats>
where
    W: Worker,
    F: Fn(usize) -> Result<W> + Sync,
{
    assert!(num_workers > 0, "stage {} needs at least one worker", name);
    let (tx, rx) = crossbeam_channel::unbounded();

    std::thread::scope(|scope| {
        for worker_id in 0..num_workers {
            let tx = tx.clone();
            let input = Arc::clone(input);
            let make_worker = &make_worker;
            scope.spawn(move || {
                let outcome = drive_worker(worker_id, input, make_worker);
                // The receiver outlives the scope.
                let _ = tx.send(outcome);
            });
        }
    });
    drop(tx);

    let mut stats = StageStats::default();
    for outcome in rx {
        let worker = outcome.with_context(|| format!("worker failed in stage {}", name))?;
        stats.absorb(&worker);
    }
    debug!(
        "stage {}: {} units in ({} bytes), {} tuples out ({} bytes)",
        name, stats.units_in, stats.bytes_in, stats.tuples_out, stats.bytes_out
    );
    Ok(stats)
}

fn drive_worker<W, F>(
    worker_id: usize,
    input: Arc<dyn QueueingPolicy<W::Input>>,
    make_worker: &F,
) -> Result<WorkerStats>
where
    W: Worker,
    F: Fn(usize) -> Result<W>,
{
    let mut worker = make_worker(worker_id)?;
    let mut stats = WorkerStats {
        worker_id,
        ..WorkerStats::default()
    };
    while let Some(unit) = input.dequeue(worker_id) {
        stats.units_in += 1;
        stats.bytes_in += unit.size_bytes();
        worker.run(unit)?;
    }
    worker.teardown()?;
    (stats.tuples_out, stats.bytes_out) = worker.output_stats();
    Ok(stats)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runtime::RoutedQueueingPolicy;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Unit(u64);

    impl WorkUnit for Unit {
        fn size_bytes(&self) -> u64 {
            self.0
        }
    }

    struct Summer<'a> {
        total: &'a AtomicU64,
        seen: u64,
    }

    impl Worker for Summer<'_> {
        type Input = Unit;

        fn run(&mut self, unit: Unit) -> Result<()> {
            self.seen += 1;
            self.total.fetch_add(unit.0, Ordering::Relaxed);
            Ok(())
        }

        fn output_stats(&self) -> (u64, u64) {
            (self.seen, 0)
        }
    }

    #[test]
    fn test_stage_drains_queue_and_aggregates() -> Result<()> {
        let total = AtomicU64::new(0);
        let policy: Arc<dyn QueueingPolicy<Unit>> = Arc::new(RoutedQueueingPolicy::single(1));
        for i in 1..=100 {
            policy.enqueue(Unit(i));
        }
        policy.teardown();
        let stats = run_stage("sum", 4, &policy, |_| {
            Ok(Summer {
                total: &total,
                seen: 0,
            })
        })?;
        assert_eq!(total.load(Ordering::Relaxed), 5050);
        assert_eq!(stats.units_in, 100);
        assert_eq!(stats.bytes_in, 5050);
        assert_eq!(stats.tuples_out, 100);
        Ok(())
    }
}
