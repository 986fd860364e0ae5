/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::sync::{Condvar, Mutex};

/// A token granting the right to keep one buffer in flight toward a disk.
#[derive(Debug)]
pub struct WriteToken {
    disk_id: u64,
}

impl WriteToken {
    #[inline]
    pub fn disk_id(&self) -> u64 {
        self.disk_id
    }
}

/// Per-disk token accounting bounding the number of buffers in flight
/// between a producer stage and the reader/writer adapters.
///
/// Tokens must be returned through [`put`](WriteTokenPool::put); a token
/// attached to a buffer travels with it and is returned by the consumer.
pub struct WriteTokenPool {
    available: Mutex<Vec<u64>>,
    returned: Condvar,
}

impl WriteTokenPool {
    /// Creates a pool with `tokens_per_disk` tokens for each of
    /// `num_disks` disks.
    pub fn new(tokens_per_disk: u64, num_disks: u64) -> Self {
        assert!(tokens_per_disk > 0, "token pool needs at least one token per disk");
        WriteTokenPool {
            available: Mutex::new(vec![tokens_per_disk; num_disks as usize]),
            returned: Condvar::new(),
        }
    }

    /// Blocks until a token is available for one of the listed disks,
    /// preferring the first.
    pub fn get(&self, disk_ids: &[u64]) -> WriteToken {
        assert!(!disk_ids.is_empty(), "must request a token for at least one disk");
        let mut available = self.available.lock().unwrap();
        loop {
            if let Some(&disk_id) = disk_ids
                .iter()
                .find(|&&disk| available[disk as usize] > 0)
            {
                available[disk_id as usize] -= 1;
                return WriteToken { disk_id };
            }
            available = self.returned.wait(available).unwrap();
        }
    }

    /// Takes a token for the given disk if one is available right now.
    pub fn try_get(&self, disk_id: u64) -> Option<WriteToken> {
        let mut available = self.available.lock().unwrap();
        if available[disk_id as usize] > 0 {
            available[disk_id as usize] -= 1;
            Some(WriteToken { disk_id })
        } else {
            None
        }
    }

    /// Returns a token to its disk.
    pub fn put(&self, token: WriteToken) {
        let mut available = self.available.lock().unwrap();
        available[token.disk_id as usize] += 1;
        self.returned.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_tokens_bound_in_flight_buffers() {
        let pool = Arc::new(WriteTokenPool::new(2, 1));
        let first = pool.get(&[0]);
        let _second = pool.get(&[0]);
        assert!(pool.try_get(0).is_none());
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.get(&[0]).disk_id())
        };
        pool.put(first);
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn test_get_prefers_first_listed_disk() {
        let pool = WriteTokenPool::new(1, 3);
        let token = pool.get(&[2, 0]);
        assert_eq!(token.disk_id(), 2);
    }
}
