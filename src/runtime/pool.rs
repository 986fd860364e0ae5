/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::sync::{Condvar, Mutex};

use crate::record::{Framing, KvBuffer};

/// Creates [`KvBuffer`]s with a fixed default capacity, alignment, and
/// framing.
///
/// For outsized records, [`create_with_capacity`] synthesizes a one-off
/// larger buffer; the pipeline's buffer sizing is otherwise uniform.
///
/// [`create_with_capacity`]: KvBufferFactory::create_with_capacity
#[derive(Debug, Clone, Copy)]
pub struct KvBufferFactory {
    default_capacity: usize,
    alignment: usize,
    framing: Framing,
}

impl KvBufferFactory {
    pub fn new(default_capacity: usize, alignment: usize) -> Self {
        Self::with_framing(default_capacity, alignment, Framing::Framed)
    }

    pub fn with_framing(default_capacity: usize, alignment: usize, framing: Framing) -> Self {
        assert!(default_capacity > 0, "factory needs a nonzero default capacity");
        KvBufferFactory {
            default_capacity,
            alignment,
            framing,
        }
    }

    /// A buffer of the default capacity.
    pub fn create(&self) -> KvBuffer {
        KvBuffer::with_framing(self.default_capacity, self.alignment, self.framing)
    }

    /// A buffer of at least `min_capacity` bytes.
    pub fn create_with_capacity(&self, min_capacity: usize) -> KvBuffer {
        KvBuffer::with_framing(
            self.default_capacity.max(min_capacity),
            self.alignment,
            self.framing,
        )
    }

    #[inline]
    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    #[inline]
    pub fn framing(&self) -> Framing {
        self.framing
    }
}

/// A fixed-capacity pool of [`KvBuffer`]s.
///
/// The pool discipline is get, fill, emit, consume downstream, return:
/// a worker that takes a buffer must either transfer it downstream or
/// return it before finishing the work unit at hand. `get` blocks until a
/// buffer is returned.
pub struct BufferPool {
    buffers: Mutex<Vec<KvBuffer>>,
    returned: Condvar,
    total: usize,
}

impl BufferPool {
    /// Fills a pool with `num_buffers` default-capacity buffers.
    pub fn new(num_buffers: usize, factory: &KvBufferFactory) -> Self {
        assert!(num_buffers > 0, "a pool needs at least one buffer");
        BufferPool {
            buffers: Mutex::new((0..num_buffers).map(|_| factory.create()).collect()),
            returned: Condvar::new(),
            total: num_buffers,
        }
    }

    /// Blocks until a buffer is available.
    pub fn get(&self) -> KvBuffer {
        let mut buffers = self.buffers.lock().unwrap();
        while buffers.is_empty() {
            buffers = self.returned.wait(buffers).unwrap();
        }
        buffers.pop().unwrap()
    }

    /// Takes a buffer if one is available right now.
    pub fn try_get(&self) -> Option<KvBuffer> {
        self.buffers.lock().unwrap().pop()
    }

    /// Returns a buffer to the pool, cleared.
    pub fn put(&self, mut buffer: KvBuffer) {
        buffer.clear();
        let mut buffers = self.buffers.lock().unwrap();
        assert!(
            buffers.len() < self.total,
            "more buffers returned than the pool ever handed out"
        );
        buffers.push(buffer);
        self.returned.notify_one();
    }

    pub fn available(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
