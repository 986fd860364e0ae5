/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use crate::runtime::{ThreadSafeWorkQueue, WorkQueue, WorkUnit};

/// A queue-like front end for worker stages.
///
/// Work units are enqueued under whatever routing rule the policy encodes
/// and dequeued in three ways: blocking, non-blocking, and batch. Policies
/// never fail individually: routing a work unit whose fields violate the
/// policy's precondition is a programmer error and aborts the process.
pub trait QueueingPolicy<T: WorkUnit>: Send + Sync {
    /// Routes a work unit to one of the policy's queues.
    fn enqueue(&self, unit: T);

    /// Blocks until a unit is available in the queue serving `queue`;
    /// returns `None` when that queue is terminal and empty.
    fn dequeue(&self, queue: usize) -> Option<T>;

    /// Non-blocking dequeue. Returns `(got_work, unit)`; a terminal empty
    /// queue yields `(true, None)` to signal that no further work will
    /// arrive.
    fn try_dequeue(&self, queue: usize) -> (bool, Option<T>);

    /// Splices the current contents of the queue serving `queue` onto
    /// `dest` without blocking.
    fn batch_dequeue(&self, queue: usize, dest: &mut WorkQueue<T>);

    /// Pushes the terminal sentinel to every queue.
    fn teardown(&self);

    fn num_queues(&self) -> usize;
}

/// The routing rule of a [`RoutedQueueingPolicy`].
///
/// `route` may mutate the work unit: some routers stamp routing decisions
/// (destination node, chunk id) onto the unit as they pick its queue.
pub trait Router<T>: Send + Sync {
    fn route(&self, unit: &mut T) -> usize;

    fn dequeue_index(&self, requested: usize, num_queues: usize) -> usize {
        requested % num_queues
    }
}

/// The default routing rule: everything goes to queue 0, dequeues are
/// served from `requested % num_queues`.
pub struct DefaultRouter;

impl<T> Router<T> for DefaultRouter {
    fn route(&self, _unit: &mut T) -> usize {
        0
    }
}

/// A queueing policy backed by a vector of [`ThreadSafeWorkQueue`]s and a
/// [`Router`] choosing the queue on each side.
pub struct RoutedQueueingPolicy<T, R> {
    queues: Vec<ThreadSafeWorkQueue<T>>,
    router: R,
}

impl<T: WorkUnit> RoutedQueueingPolicy<T, DefaultRouter> {
    /// A single-rule policy: all work in queue 0.
    pub fn single(num_queues: usize) -> Self {
        Self::new(num_queues, DefaultRouter)
    }
}

impl<T: WorkUnit, R: Router<T>> RoutedQueueingPolicy<T, R> {
    pub fn new(num_queues: usize, router: R) -> Self {
        assert!(num_queues > 0, "a policy needs at least one queue");
        RoutedQueueingPolicy {
            queues: (0..num_queues).map(|_| ThreadSafeWorkQueue::new()).collect(),
            router,
        }
    }
}

impl<T: WorkUnit, R: Router<T>> QueueingPolicy<T> for RoutedQueueingPolicy<T, R> {
    fn enqueue(&self, mut unit: T) {
        let index = self.router.route(&mut unit);
        assert!(
            index < self.queues.len(),
            "router chose queue {} of {}",
            index,
            self.queues.len()
        );
        self.queues[index].push(Some(unit));
    }

    fn dequeue(&self, queue: usize) -> Option<T> {
        let index = self.router.dequeue_index(queue, self.queues.len());
        self.queues[index].blocking_pop()
    }

    fn try_dequeue(&self, queue: usize) -> (bool, Option<T>) {
        let index = self.router.dequeue_index(queue, self.queues.len());
        let (unit, no_more_work) = self.queues[index].pop();
        match unit {
            Some(unit) => (true, Some(unit)),
            // Terminal and empty: report "no further work" with a None
            // unit; otherwise simply nothing right now.
            None => (no_more_work, None),
        }
    }

    fn batch_dequeue(&self, queue: usize, dest: &mut WorkQueue<T>) {
        let index = self.router.dequeue_index(queue, self.queues.len());
        self.queues[index].move_work_to(dest);
    }

    fn teardown(&self) {
        for queue in &self.queues {
            queue.push(None);
        }
    }

    fn num_queues(&self) -> usize {
        self.queues.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    struct Unit(usize);

    impl WorkUnit for Unit {}

    struct ModRouter(usize);

    impl Router<Unit> for ModRouter {
        fn route(&self, unit: &mut Unit) -> usize {
            unit.0 % self.0
        }
    }

    #[test]
    fn test_default_policy_single_queue() {
        let policy = RoutedQueueingPolicy::single(4);
        policy.enqueue(Unit(10));
        policy.enqueue(Unit(11));
        // All dequeue ids resolve mod the number of queues; the work sits
        // in queue 0.
        assert_eq!(policy.try_dequeue(4).1.map(|u| u.0), Some(10));
        assert_eq!(policy.try_dequeue(0).1.map(|u| u.0), Some(11));
        let (done, unit) = policy.try_dequeue(0);
        assert!(!done && unit.is_none());
        policy.teardown();
        let (done, unit) = policy.try_dequeue(0);
        assert!(done && unit.is_none());
    }

    #[test]
    fn test_routed_enqueue() {
        let policy = RoutedQueueingPolicy::new(3, ModRouter(3));
        for i in 0..9 {
            policy.enqueue(Unit(i));
        }
        for queue in 0..3 {
            for expected in [queue, queue + 3, queue + 6] {
                assert_eq!(policy.dequeue(queue).map(|u| u.0), Some(expected));
            }
        }
    }

    #[test]
    fn test_teardown_unblocks_all_workers() {
        let policy: Arc<dyn QueueingPolicy<Unit>> =
            Arc::new(RoutedQueueingPolicy::single(2));
        let handles: Vec<_> = (0..2)
            .map(|id| {
                let policy = policy.clone();
                std::thread::spawn(move || policy.dequeue(id).is_none())
            })
            .collect();
        policy.teardown();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn test_batch_dequeue_splices() {
        let policy = RoutedQueueingPolicy::single(1);
        policy.enqueue(Unit(1));
        policy.enqueue(Unit(2));
        policy.teardown();
        let mut dest = WorkQueue::new();
        policy.batch_dequeue(0, &mut dest);
        assert_eq!(dest.len(), 2);
        assert!(dest.will_not_receive_more_work());
    }
}
