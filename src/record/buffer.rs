/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

use crate::job::JobId;
use crate::record::{read_header, write_header, Framing, KvPair, HEADER_SIZE};
use crate::runtime::{WorkUnit, WriteToken};

/// A fixed-capacity, alignment-constrained byte region.
///
/// Alignment is a construction parameter so that buffers can be handed
/// directly to direct-I/O writer sinks.
struct AlignedBytes {
    ptr: NonNull<u8>,
    capacity: usize,
    layout: Layout,
}

impl AlignedBytes {
    fn new(capacity: usize, alignment: usize) -> Self {
        assert!(capacity > 0, "cannot allocate an empty buffer");
        assert!(
            alignment.is_power_of_two(),
            "buffer alignment must be a power of two"
        );
        let layout = Layout::from_size_align(capacity, alignment)
            .expect("invalid buffer capacity/alignment combination");
        let ptr = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        AlignedBytes {
            ptr,
            capacity,
            layout,
        }
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }
}

impl Drop for AlignedBytes {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// The region is uniquely owned and carries no interior mutability.
unsafe impl Send for AlignedBytes {}
unsafe impl Sync for AlignedBytes {}

/// Statistics describing a phase-zero sample, attached to the last sample
/// buffer a reservoir-sampling writer emits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleMetadata {
    pub job_id: u64,
    pub tuples_in: u64,
    pub bytes_in: u64,
    pub tuples_out: u64,
    pub bytes_out: u64,
    pub bytes_caller_tried_to_write: u64,
}

impl SampleMetadata {
    pub const BYTES: usize = 48;

    /// Serializes the metadata as six native-endian `u64`s.
    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        let mut out = [0u8; Self::BYTES];
        for (chunk, field) in out.chunks_exact_mut(8).zip([
            self.job_id,
            self.tuples_in,
            self.bytes_in,
            self.tuples_out,
            self.bytes_out,
            self.bytes_caller_tried_to_write,
        ]) {
            chunk.copy_from_slice(&field.to_ne_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::BYTES]) -> Self {
        let mut fields = [0u64; 6];
        for (chunk, field) in bytes.chunks_exact(8).zip(fields.iter_mut()) {
            *field = u64::from_ne_bytes(chunk.try_into().unwrap());
        }
        SampleMetadata {
            job_id: fields[0],
            tuples_in: fields[1],
            bytes_in: fields[2],
            tuples_out: fields[3],
            bytes_out: fields[4],
            bytes_caller_tried_to_write: fields[5],
        }
    }
}

/// A pending record started with [`KvBuffer::setup_append`] and finished
/// with [`KvBuffer::commit_append`].
#[derive(Debug, Clone, Copy)]
pub struct AppendSlot {
    base: usize,
    key_len: u32,
    max_value_len: u32,
}

/// A contiguous buffer holding a packed sequence of records plus the
/// sidecar metadata that routes it through the pipeline.
///
/// Invariants: `current_size() <= capacity()`; iteration starts at offset
/// zero and advances record by record; a buffer carries at most one job id
/// for its whole lifetime.
pub struct KvBuffer {
    data: AlignedBytes,
    len: usize,
    framing: Framing,
    cursor: usize,
    record_count: u64,
    pending: bool,
    job_id: Option<JobId>,
    partition_group: Option<u64>,
    logical_disk_id: Option<u64>,
    chunk_id: Option<u64>,
    node: Option<u64>,
    sample_metadata: Option<SampleMetadata>,
    token: Option<WriteToken>,
}

impl KvBuffer {
    /// Creates a framed buffer of the given capacity and alignment.
    pub fn new(capacity: usize, alignment: usize) -> Self {
        Self::with_framing(capacity, alignment, Framing::Framed)
    }

    /// Creates a buffer with an explicit framing mode.
    pub fn with_framing(capacity: usize, alignment: usize, framing: Framing) -> Self {
        KvBuffer {
            data: AlignedBytes::new(capacity, alignment),
            len: 0,
            framing,
            cursor: 0,
            record_count: 0,
            pending: false,
            job_id: None,
            partition_group: None,
            logical_disk_id: None,
            chunk_id: None,
            node: None,
            sample_metadata: None,
            token: None,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity
    }

    #[inline]
    pub fn current_size(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.capacity - self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.data.capacity
    }

    #[inline]
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    #[inline]
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// The filled portion of the buffer.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data.as_slice()[..self.len]
    }

    /// Resets contents, cursor and metadata, keeping capacity and framing.
    pub fn clear(&mut self) {
        self.len = 0;
        self.cursor = 0;
        self.record_count = 0;
        self.pending = false;
        self.job_id = None;
        self.partition_group = None;
        self.logical_disk_id = None;
        self.chunk_id = None;
        self.node = None;
        self.sample_metadata = None;
        assert!(self.token.is_none(), "cleared a buffer still holding a token");
    }

    #[inline]
    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    /// Associates the buffer with a job. A buffer carries exactly one job
    /// id; setting a different one is a contract violation.
    pub fn set_job_id(&mut self, job_id: JobId) {
        assert!(job_id != 0, "job id 0 is reserved for \"unset\"");
        match self.job_id {
            None => self.job_id = Some(job_id),
            Some(existing) => assert_eq!(
                existing, job_id,
                "buffer already carries a different job id"
            ),
        }
    }

    #[inline]
    pub fn partition_group(&self) -> Option<u64> {
        self.partition_group
    }

    #[inline]
    pub fn set_partition_group(&mut self, group: u64) {
        self.partition_group = Some(group);
    }

    #[inline]
    pub fn logical_disk_id(&self) -> Option<u64> {
        self.logical_disk_id
    }

    #[inline]
    pub fn set_logical_disk_id(&mut self, id: u64) {
        self.logical_disk_id = Some(id);
    }

    #[inline]
    pub fn chunk_id(&self) -> Option<u64> {
        self.chunk_id
    }

    #[inline]
    pub fn set_chunk_id(&mut self, id: u64) {
        self.chunk_id = Some(id);
    }

    #[inline]
    pub fn node(&self) -> Option<u64> {
        self.node
    }

    #[inline]
    pub fn set_node(&mut self, node: u64) {
        self.node = Some(node);
    }

    #[inline]
    pub fn sample_metadata(&self) -> Option<&SampleMetadata> {
        self.sample_metadata.as_ref()
    }

    #[inline]
    pub fn set_sample_metadata(&mut self, metadata: SampleMetadata) {
        self.sample_metadata = Some(metadata);
    }

    #[inline]
    pub fn take_token(&mut self) -> Option<WriteToken> {
        self.token.take()
    }

    #[inline]
    pub fn set_token(&mut self, token: WriteToken) {
        assert!(self.token.is_none(), "buffer already carries a token");
        self.token = Some(token);
    }

    /// Appends a whole record. The record must fit in the remaining
    /// capacity.
    pub fn append(&mut self, kv: &KvPair) {
        assert!(!self.pending, "cannot append while a setup append is open");
        let size = kv.write_size(self.framing);
        assert!(
            size <= self.remaining(),
            "record of {} bytes does not fit in {} remaining",
            size,
            self.remaining()
        );
        let base = self.len;
        kv.serialize_into(self.framing, &mut self.data.as_mut_slice()[base..base + size]);
        self.len += size;
        self.record_count += 1;
    }

    /// Appends raw bytes. Used for partial record images; does not advance
    /// the record count.
    pub fn append_raw(&mut self, bytes: &[u8]) {
        assert!(!self.pending, "cannot append while a setup append is open");
        assert!(bytes.len() <= self.remaining(), "raw append overflows buffer");
        let base = self.len;
        self.data.as_mut_slice()[base..base + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    /// Appends as much of the framed image of `kv`, starting at
    /// `image_offset`, as fits in the remaining capacity. Returns the
    /// number of bytes copied.
    pub fn append_partial_record(&mut self, kv: &KvPair, image_offset: usize) -> usize {
        assert!(!self.pending, "cannot append while a setup append is open");
        assert!(
            self.framing.is_framed(),
            "partial serialization is forbidden in unframed mode"
        );
        let n = self.remaining().min(kv.framed_size() - image_offset);
        let base = self.len;
        kv.partial_serialize(image_offset, &mut self.data.as_mut_slice()[base..base + n]);
        self.len += n;
        n
    }

    /// Reserves space for a record whose value will be written in place,
    /// up to `max_value_len` bytes. Exactly one append may be pending at a
    /// time.
    pub fn setup_append(&mut self, key_len: u32, max_value_len: u32) -> AppendSlot {
        assert!(!self.pending, "a setup append is already open");
        let size = self.framing.record_size(key_len, max_value_len);
        assert!(
            size <= self.remaining(),
            "pending record of {} bytes does not fit in {} remaining",
            size,
            self.remaining()
        );
        let base = self.len;
        if self.framing.is_framed() {
            write_header(
                &mut self.data.as_mut_slice()[base..base + HEADER_SIZE],
                key_len,
                0,
            );
        }
        self.pending = true;
        AppendSlot {
            base,
            key_len,
            max_value_len,
        }
    }

    /// The key region of a pending append.
    pub fn pending_key_mut(&mut self, slot: &AppendSlot) -> &mut [u8] {
        assert!(self.pending, "no setup append is open");
        let start = slot.base + if self.framing.is_framed() { HEADER_SIZE } else { 0 };
        &mut self.data.as_mut_slice()[start..start + slot.key_len as usize]
    }

    /// The value region of a pending append, `max_value_len` bytes long.
    pub fn pending_value_mut(&mut self, slot: &AppendSlot) -> &mut [u8] {
        assert!(self.pending, "no setup append is open");
        let start = slot.base
            + if self.framing.is_framed() { HEADER_SIZE } else { 0 }
            + slot.key_len as usize;
        &mut self.data.as_mut_slice()[start..start + slot.max_value_len as usize]
    }

    /// Commits a pending append with the actual value length.
    pub fn commit_append(&mut self, slot: &AppendSlot, value_len: u32) {
        assert!(self.pending, "no setup append is open");
        assert!(
            value_len <= slot.max_value_len,
            "committed more value bytes than reserved"
        );
        if self.framing.is_framed() {
            write_header(
                &mut self.data.as_mut_slice()[slot.base..slot.base + HEADER_SIZE],
                slot.key_len,
                value_len,
            );
        } else if let Framing::Unframed { value_len: fixed, .. } = self.framing {
            assert_eq!(value_len, fixed, "unframed value length mismatch");
        }
        self.len += self.framing.record_size(slot.key_len, value_len);
        self.record_count += 1;
        self.pending = false;
    }

    /// Abandons a pending append, leaving the buffer contents unchanged.
    pub fn cancel_append(&mut self, _slot: AppendSlot) {
        assert!(self.pending, "no setup append is open");
        self.pending = false;
    }

    /// Parses the record starting at `offset`. Returns the record and the
    /// offset of the next one, or `None` at the end of the buffer. A
    /// truncated record is a fatal error.
    pub fn pair_at(&self, offset: usize) -> Option<(KvPair<'_>, usize)> {
        if offset == self.len {
            return None;
        }
        let data = self.bytes();
        match self.framing {
            Framing::Framed => {
                assert!(
                    self.len - offset >= HEADER_SIZE,
                    "short record header at offset {}",
                    offset
                );
                let (key_len, value_len) = read_header(&data[offset..]);
                let key_start = offset + HEADER_SIZE;
                let value_start = key_start + key_len as usize;
                let end = value_start + value_len as usize;
                assert!(end <= self.len, "short record at offset {}", offset);
                Some((
                    KvPair::new(&data[key_start..value_start], &data[value_start..end]),
                    end,
                ))
            }
            Framing::Unframed { key_len, value_len } => {
                let value_start = offset + key_len as usize;
                let end = value_start + value_len as usize;
                assert!(end <= self.len, "short record at offset {}", offset);
                Some((
                    KvPair::new(&data[offset..value_start], &data[value_start..end]),
                    end,
                ))
            }
        }
    }

    /// Moves the internal cursor back to the first record.
    #[inline]
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Moves the internal cursor to a byte offset previously obtained from
    /// [`position`](KvBuffer::position).
    #[inline]
    pub fn seek(&mut self, position: usize) {
        assert!(position <= self.len, "seek past the end of the buffer");
        self.cursor = position;
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Returns the record at the cursor and advances it.
    pub fn next_pair(&mut self) -> Option<KvPair<'_>> {
        let start = self.cursor;
        let (_, next) = self.pair_at(start)?;
        self.cursor = next;
        let (kv, _) = self.pair_at(start).unwrap();
        Some(kv)
    }

    /// An iterator over all records, independent of the internal cursor.
    #[inline]
    pub fn iter(&self) -> KvIter<'_> {
        KvIter {
            buffer: self,
            offset: 0,
        }
    }
}

impl Clone for KvBuffer {
    fn clone(&self) -> Self {
        assert!(self.token.is_none(), "cannot clone a buffer holding a token");
        let mut data = AlignedBytes::new(self.data.capacity, self.data.layout.align());
        data.as_mut_slice()[..self.len].copy_from_slice(self.bytes());
        KvBuffer {
            data,
            len: self.len,
            framing: self.framing,
            cursor: 0,
            record_count: self.record_count,
            pending: false,
            job_id: self.job_id,
            partition_group: self.partition_group,
            logical_disk_id: self.logical_disk_id,
            chunk_id: self.chunk_id,
            node: self.node,
            sample_metadata: self.sample_metadata,
            token: None,
        }
    }
}

impl std::fmt::Debug for KvBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.capacity)
            .field("records", &self.record_count)
            .field("framing", &self.framing)
            .field("job_id", &self.job_id)
            .field("partition_group", &self.partition_group)
            .field("logical_disk_id", &self.logical_disk_id)
            .field("chunk_id", &self.chunk_id)
            .field("node", &self.node)
            .finish()
    }
}

impl WorkUnit for KvBuffer {
    #[inline]
    fn size_bytes(&self) -> u64 {
        self.len as u64
    }
}

/// Iterator over the records of a [`KvBuffer`].
pub struct KvIter<'a> {
    buffer: &'a KvBuffer,
    offset: usize,
}

impl<'a> Iterator for KvIter<'a> {
    type Item = KvPair<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (kv, next) = self.buffer.pair_at(self.offset)?;
        self.offset = next;
        Some(kv)
    }
}

/// A plain byte carrier used on the reader side, pinned to a worker by its
/// stream id.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    pub stream_id: u64,
    pub bytes: Vec<u8>,
}

impl ByteBuffer {
    pub fn new(stream_id: u64, bytes: Vec<u8>) -> Self {
        ByteBuffer { stream_id, bytes }
    }
}

impl WorkUnit for ByteBuffer {
    #[inline]
    fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn buffer() -> KvBuffer {
        KvBuffer::new(1024, 8)
    }

    #[test]
    fn test_append_and_iterate() {
        let mut buf = buffer();
        buf.append(&KvPair::new(b"a", b"1"));
        buf.append(&KvPair::new(b"bb", b"22"));
        let records: Vec<_> = buf.iter().map(|kv| kv.key().to_vec()).collect();
        assert_eq!(records, vec![b"a".to_vec(), b"bb".to_vec()]);
        assert_eq!(buf.record_count(), 2);
        assert_eq!(buf.current_size(), HEADER_SIZE * 2 + 2 + 4);
    }

    #[test]
    fn test_setup_commit_append() {
        let mut buf = buffer();
        let slot = buf.setup_append(3, 100);
        buf.pending_key_mut(&slot).copy_from_slice(b"key");
        buf.pending_value_mut(&slot)[..5].copy_from_slice(b"value");
        buf.commit_append(&slot, 5);
        let kv = buf.iter().next().unwrap();
        assert_eq!(kv.key(), b"key");
        assert_eq!(kv.value(), b"value");
    }

    #[test]
    fn test_cancel_append_leaves_no_trace() {
        let mut buf = buffer();
        let slot = buf.setup_append(3, 10);
        buf.cancel_append(slot);
        assert!(buf.is_empty());
        assert_eq!(buf.record_count(), 0);
    }

    #[test]
    fn test_framed_round_trip() {
        let mut buf = buffer();
        let key = [7u8; 10];
        let value: Vec<u8> = (0..90).collect();
        buf.append(&KvPair::new(&key, &value));
        let kv = buf.iter().next().unwrap();
        assert_eq!(kv.key(), &key);
        assert_eq!(kv.value(), &value[..]);
    }

    #[test]
    fn test_unframed_round_trip() {
        let mut buf = KvBuffer::with_framing(
            256,
            8,
            Framing::Unframed {
                key_len: 2,
                value_len: 3,
            },
        );
        buf.append(&KvPair::new(b"ab", b"xyz"));
        buf.append(&KvPair::new(b"cd", b"uvw"));
        let records: Vec<_> = buf.iter().map(|kv| kv.value().to_vec()).collect();
        assert_eq!(records, vec![b"xyz".to_vec(), b"uvw".to_vec()]);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_overflow_asserts() {
        let mut buf = KvBuffer::new(16, 8);
        buf.append(&KvPair::new(b"0123456789", b"0123456789"));
    }

    #[test]
    fn test_sample_metadata_round_trip() {
        let metadata = SampleMetadata {
            job_id: 3,
            tuples_in: 1000,
            bytes_in: 98_765,
            tuples_out: 40,
            bytes_out: 4321,
            bytes_caller_tried_to_write: 98_765,
        };
        assert_eq!(SampleMetadata::from_bytes(&metadata.to_bytes()), metadata);
    }

    #[test]
    fn test_cursor_seek_and_rewind() {
        let mut buf = buffer();
        buf.append(&KvPair::new(b"a", b"1"));
        let second = buf.current_size();
        buf.append(&KvPair::new(b"b", b"2"));

        assert_eq!(buf.next_pair().unwrap().key(), b"a");
        assert_eq!(buf.position(), second);
        assert_eq!(buf.next_pair().unwrap().key(), b"b");
        assert!(buf.next_pair().is_none());

        buf.seek(second);
        assert_eq!(buf.next_pair().unwrap().key(), b"b");
        buf.rewind();
        assert_eq!(buf.next_pair().unwrap().key(), b"a");
    }

    #[test]
    fn test_alignment() {
        for alignment in [8, 512, 4096] {
            let buf = KvBuffer::new(1024, alignment);
            assert_eq!(buf.bytes().as_ptr() as usize % alignment, 0);
        }
    }
}
