// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The header written in front of every arena allocation.

use super::chunk_system::ChunkId;
use std::fmt;
use std::panic::Location;
use std::ptr::{self, NonNull};

/// Guard value of a live allocation.
pub const HEADER_MAGIC: u64 = 0xACC0_500D_6666_6666;

/// Guard value written over a header once the allocation is freed.
pub const FREED_MAGIC: u64 = 0xF4EE_D0FF_DEAD_0000;

/// Filler written into alignment gaps between allocations.
pub const PAD_MAGIC: u64 = 0x9AD9_9AD9_9AD9_9AD9;

/// Prefix of every arena allocation.
///
/// The record sits immediately before the returned pointer. It is plain data:
/// every field is valid for any bit pattern, so a damaged header can still be
/// read and reported.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct AllocationRecord {
    guard: u64,
    size: u64,
    alignment: u32,
    chunk: ChunkId,
    source: *const Location<'static>,
}

impl AllocationRecord {
    /// Size of the header in bytes. A multiple of 8, so data following it
    /// stays 8-aligned.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub(crate) fn new(
        size: usize,
        alignment: usize,
        chunk: ChunkId,
        source: &'static Location<'static>,
    ) -> Self {
        Self {
            guard: HEADER_MAGIC,
            size: size as u64,
            alignment: alignment as u32,
            chunk,
            source,
        }
    }

    /// Reads the header that precedes `data`.
    ///
    /// # Safety
    ///
    /// `data` must have been returned by an arena, so that
    /// [`AllocationRecord::SIZE`] readable bytes precede it.
    pub(crate) unsafe fn read(data: NonNull<u8>) -> Self {
        ptr::read(Self::header_ptr(data))
    }

    /// # Safety
    ///
    /// Same as [`AllocationRecord::read`], and the bytes must be writable.
    pub(crate) unsafe fn write(self, data: NonNull<u8>) {
        ptr::write(Self::header_ptr(data), self);
    }

    /// Overwrites the guard of the header preceding `data` with
    /// [`FREED_MAGIC`].
    ///
    /// # Safety
    ///
    /// Same as [`AllocationRecord::write`].
    pub(crate) unsafe fn mark_freed(data: NonNull<u8>) {
        ptr::write(Self::header_ptr(data).cast::<u64>(), FREED_MAGIC);
    }

    fn header_ptr(data: NonNull<u8>) -> *mut Self {
        data.as_ptr().wrapping_sub(Self::SIZE).cast::<Self>()
    }

    /// The guard value as stored.
    pub fn guard(&self) -> u64 {
        self.guard
    }

    /// Whether the header belongs to a live allocation.
    pub fn is_live(&self) -> bool {
        self.guard == HEADER_MAGIC
    }

    /// Whether the header belongs to a freed allocation.
    pub fn is_freed(&self) -> bool {
        self.guard == FREED_MAGIC
    }

    /// Requested size of the allocation.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Bytes the allocation occupies after its header.
    pub fn span(&self) -> usize {
        self.size().next_multiple_of(8)
    }

    /// Alignment of the allocation.
    pub fn alignment(&self) -> usize {
        self.alignment as usize
    }

    /// Chunk the allocation was carved from.
    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }

    /// Call site of the allocation, trusted only while the guard is intact.
    pub fn source(&self) -> Option<&'static Location<'static>> {
        if self.is_live() || self.is_freed() {
            // SAFETY: written from a `&'static Location` by `new`, and the
            // guard shows the header has not been overwritten.
            unsafe { self.source.as_ref() }
        } else {
            None
        }
    }

    /// Formats the record. With `trust_source` the call site is printed even
    /// though the guard is damaged; callers pass it only after checking that
    /// the rest of the header is consistent.
    pub(crate) fn describe(&self, trust_source: bool) -> String {
        let source = if trust_source && !self.source.is_null() {
            // SAFETY: the caller verified the header's chunk field, so the
            // damage is confined to the guard word.
            unsafe { self.source.as_ref() }
        } else {
            self.source()
        };
        let source = source.map_or_else(|| "<unreadable>".to_owned(), ToString::to_string);

        if self.is_live() {
            format!(
                "guard value: {:#x}, size: {}, alignment: {}, chunk: {}, source: {source}",
                self.guard, self.size, self.alignment, self.chunk
            )
        } else {
            format!(
                "guard value: {:#x} (should be: {HEADER_MAGIC:#x}), size: {}, alignment: {}, chunk: {}, source: {source}",
                self.guard, self.size, self.alignment, self.chunk
            )
        }
    }
}

/// Where an allocation lands inside a chunk, as offsets from the chunk base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placement {
    /// Start of the returned data.
    pub data: usize,
    /// First byte past the allocation; the chunk's next bump offset.
    pub end: usize,
}

/// Effective alignment of an arena allocation: at least 8 so headers and
/// bump offsets stay word-aligned.
pub(crate) fn effective_alignment(alignment: usize) -> Option<usize> {
    alignment.is_power_of_two().then(|| alignment.max(8))
}

/// Upper bound on the chunk bytes an allocation can consume, whatever the
/// chunk's current offset.
pub(crate) fn worst_case_span(header: usize, size: usize, alignment: usize) -> usize {
    header + (alignment - 8) + size.next_multiple_of(8)
}

/// Places `size` bytes with a `header`-byte prefix at or after `offset` in
/// a chunk of `capacity` bytes starting at `base`.
pub(crate) fn place(
    base: usize,
    offset: usize,
    capacity: usize,
    header: usize,
    size: usize,
    alignment: usize,
) -> Option<Placement> {
    let data = (base + offset + header).next_multiple_of(alignment) - base;
    let end = data.checked_add(size.next_multiple_of(8))?;
    (end <= capacity).then_some(Placement { data, end })
}

impl fmt::Debug for AllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe(false))
    }
}

impl fmt::Display for AllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_keeps_data_aligned() {
        assert_eq!(AllocationRecord::SIZE % 8, 0);
        assert_eq!(AllocationRecord::SIZE, 32);
    }

    #[test]
    fn test_write_read_and_free_marking() {
        let mut buffer = [0u64; 8];
        let data = NonNull::new(buffer.as_mut_ptr().wrapping_add(4).cast::<u8>()).expect("non-null");
        let record = AllocationRecord::new(13, 8, ChunkId::new(1, 3), Location::caller());

        unsafe { record.write(data) };
        let read = unsafe { AllocationRecord::read(data) };
        assert!(read.is_live());
        assert_eq!(read.size(), 13);
        assert_eq!(read.span(), 16);
        assert_eq!(read.chunk(), ChunkId::new(1, 3));
        assert_eq!(read.source().map(|l| l.file()), Some(file!()));

        unsafe { AllocationRecord::mark_freed(data) };
        let read = unsafe { AllocationRecord::read(data) };
        assert!(read.is_freed());
        assert!(read.to_string().contains("should be"));
    }

    #[test]
    fn test_placement_respects_alignment_and_capacity() {
        let base = 0x1000;
        let first = place(base, 0, 256, 32, 10, 8).expect("fits");
        assert_eq!(first, Placement { data: 32, end: 48 });

        let second = place(base, first.end, 256, 32, 8, 64).expect("fits");
        assert_eq!(second.data % 64, 0);
        assert!(second.data - 32 >= first.end);

        assert!(place(base, 200, 256, 32, 32, 8).is_none());
        assert!(worst_case_span(32, 10, 64) >= second.end - first.end);
        assert_eq!(effective_alignment(2), Some(8));
        assert_eq!(effective_alignment(3), None);
    }

    #[test]
    fn test_damaged_guard_hides_source() {
        let mut record = AllocationRecord::new(64, 16, ChunkId::new(0, 0), Location::caller());
        record.guard ^= 0xFF;
        assert!(record.source().is_none());
        let text = record.to_string();
        assert!(text.contains("size: 64"));
        assert!(text.contains("alignment: 16"));
        assert!(text.contains("<unreadable>"));
        assert!(record.describe(true).contains(file!()));
    }
}
