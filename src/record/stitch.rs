/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::{bail, Result};

use crate::record::{read_header, KvBuffer, KvPair, HEADER_SIZE};
use crate::runtime::KvBufferFactory;

/// Reassembles framed records from a stream of raw byte slices whose
/// boundaries do not respect record boundaries.
///
/// Producers that pack buffers to the brim split records across buffer
/// boundaries; this is the consumer side, which detects the splits through
/// the length prefix and emits buffers that contain only whole records. A
/// nonempty tail at the end of the stream is a fatal error.
pub struct RecordStitcher {
    factory: KvBufferFactory,
    carry: Vec<u8>,
    current: Option<KvBuffer>,
}

impl RecordStitcher {
    /// Creates a stitcher emitting buffers from the given factory, which
    /// must produce framed buffers.
    pub fn new(factory: KvBufferFactory) -> Self {
        assert!(
            factory.framing().is_framed(),
            "record stitching requires framed buffers"
        );
        RecordStitcher {
            factory,
            carry: Vec::new(),
            current: None,
        }
    }

    /// Feeds a slice of the stream, pushing every buffer that fills up
    /// onto `out`.
    pub fn feed(&mut self, mut input: &[u8], out: &mut Vec<KvBuffer>) {
        // First complete any record whose prefix arrived earlier.
        while !self.carry.is_empty() && !input.is_empty() {
            let needed = match complete_record_size(&self.carry) {
                Some(_) => 0,
                None => {
                    if self.carry.len() < HEADER_SIZE {
                        HEADER_SIZE - self.carry.len()
                    } else {
                        let (key_len, value_len) = read_header(&self.carry);
                        HEADER_SIZE + key_len as usize + value_len as usize - self.carry.len()
                    }
                }
            };
            let take = needed.min(input.len());
            self.carry.extend_from_slice(&input[..take]);
            input = &input[take..];
            if complete_record_size(&self.carry).is_some() {
                let carried = std::mem::take(&mut self.carry);
                self.push_record(&carried, out);
            }
        }

        // Then consume whole records directly from the input.
        while let Some(size) = complete_record_size(input) {
            self.push_record(&input[..size], out);
            input = &input[size..];
        }
        self.carry.extend_from_slice(input);
    }

    /// Flushes the last partially filled buffer. Fails if the stream ended
    /// in the middle of a record.
    pub fn finish(mut self, out: &mut Vec<KvBuffer>) -> Result<()> {
        if !self.carry.is_empty() {
            bail!(
                "short last record at end of stream ({} trailing bytes)",
                self.carry.len()
            );
        }
        if let Some(buffer) = self.current.take() {
            if !buffer.is_empty() {
                out.push(buffer);
            }
        }
        Ok(())
    }

    fn push_record(&mut self, image: &[u8], out: &mut Vec<KvBuffer>) {
        let (key_len, _) = read_header(image);
        let key_start = HEADER_SIZE;
        let value_start = key_start + key_len as usize;
        let kv = KvPair::new(&image[key_start..value_start], &image[value_start..]);

        if let Some(buffer) = &self.current {
            if buffer.remaining() < image.len() {
                out.push(self.current.take().unwrap());
            }
        }
        let buffer = self
            .current
            .get_or_insert_with(|| self.factory.create_with_capacity(image.len()));
        buffer.append(&kv);
    }
}

/// The total size of the record at the front of `bytes`, if it is present
/// in full.
fn complete_record_size(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let (key_len, value_len) = read_header(bytes);
    let total = HEADER_SIZE + key_len as usize + value_len as usize;
    (bytes.len() >= total).then_some(total)
}
