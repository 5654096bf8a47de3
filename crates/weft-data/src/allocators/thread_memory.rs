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

//! Per-worker bump arena.

use super::chunk_system::{ChunkId, MemoryChunkSystem};
use super::chunk_table::{ChunkRecord, ChunkTable};
use super::record::{self, AllocationRecord, PAD_MAGIC};
use std::alloc::Layout;
use std::fmt;
use std::panic::Location;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use weft_core::error::{fatal, AllocError};

/// A bump arena owned by one worker thread.
///
/// Allocations are carved from chunks claimed from the shared
/// [`MemoryChunkSystem`], each behind an [`AllocationRecord`]. Freeing an
/// allocation only decrements its chunk's counter; once the counter is back
/// to zero the chunk's bump offset rewinds and the whole chunk is reused.
///
/// The owning worker calls [`free_all_chunks`](Self::free_all_chunks) after
/// every task, which hands every chunk back to the system and logs whatever
/// was not freed.
pub struct ThreadMemory {
    system: Arc<MemoryChunkSystem>,
    tables: Vec<ChunkTable>,
    owner: String,
}

impl ThreadMemory {
    /// Creates an empty arena on top of `system`. `owner` names the arena in
    /// leak reports.
    pub fn new(system: Arc<MemoryChunkSystem>, owner: impl Into<String>) -> Self {
        let tables = (0..system.levels())
            .map(|level| ChunkTable::new(system.class(level)))
            .collect();
        Self {
            system,
            tables,
            owner: owner.into(),
        }
    }

    /// Allocates `size` bytes aligned to `alignment`. Any failure is fatal.
    #[track_caller]
    pub fn alloc(&mut self, size: usize, alignment: usize) -> NonNull<u8> {
        self.try_alloc(size, alignment)
            .unwrap_or_else(|err| fatal(err))
    }

    /// Allocates memory for `layout`. Any failure is fatal.
    #[track_caller]
    pub fn alloc_layout(&mut self, layout: Layout) -> NonNull<u8> {
        self.alloc(layout.size(), layout.align())
    }

    /// Allocates `size` bytes aligned to `alignment`.
    ///
    /// The returned memory is uninitialized and stays valid until it is
    /// freed or [`free_all_chunks`](Self::free_all_chunks) runs.
    #[track_caller]
    pub fn try_alloc(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        let source = Location::caller();
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let align =
            record::effective_alignment(alignment).ok_or(AllocError::InvalidAlignment { alignment })?;
        let level = self.system.size_to_level(record::worst_case_span(
            AllocationRecord::SIZE,
            size,
            align,
        ))?;

        let id = match self.tables[level].find_room(AllocationRecord::SIZE, size, align) {
            Some(id) => id,
            None => {
                let chunk = self.system.alloc(record::worst_case_span(
                    AllocationRecord::SIZE,
                    size,
                    align,
                ));
                log::trace!("{}: adopted chunk {}", self.owner, chunk.id());
                self.tables[chunk.id().level()].adopt(chunk)
            }
        };

        let Some(data) = self.tables[id.level()].carve(id, AllocationRecord::SIZE, size, align) else {
            fatal(format!("{}: chunk {id} cannot hold {size} bytes", self.owner));
        };
        // SAFETY: `carve` reserved the header bytes in front of `data`.
        unsafe { AllocationRecord::new(size, align, id, source).write(data) };
        Ok(data)
    }

    /// Frees an allocation made by this arena.
    ///
    /// A damaged header, a double free or a pointer from another arena is
    /// fatal.
    ///
    /// # Safety
    ///
    /// `data` must have been returned by [`alloc`](Self::alloc) on this arena
    /// and not be used after this call.
    pub unsafe fn free(&mut self, data: NonNull<u8>) {
        let header = AllocationRecord::read(data);
        if header.is_freed() {
            fatal(format!("{}: allocation freed twice: {header}", self.owner));
        }
        if !header.is_live() {
            let header_addr = data.as_ptr() as usize - AllocationRecord::SIZE;
            let trusted = self.system.locate(header_addr) == Some(header.chunk());
            fatal(AllocError::CorruptedRecord {
                record: header.describe(trusted),
            });
        }

        let id = header.chunk();
        let released = self
            .tables
            .get_mut(id.level())
            .filter(|table| table.get(id).is_some())
            .and_then(|table| {
                AllocationRecord::mark_freed(data);
                table.release(id)
            });
        if released.is_none() {
            fatal(format!(
                "{}: allocation from a chunk it does not own: {header}",
                self.owner
            ));
        }
    }

    /// Returns every chunk to the chunk system, logging allocations that
    /// were never freed. Returns the number of leaked allocations.
    pub fn free_all_chunks(&mut self) -> usize {
        let mut leaked = 0;
        let mut released = Vec::new();
        for table in &mut self.tables {
            released.extend(table.drain());
        }
        for record in released {
            if record.allocs > 0 {
                self.report_leaks(&record);
                leaked += record.allocs as usize;
            }
            self.system.free(record.chunk);
        }
        leaked
    }

    /// Number of chunks the arena currently owns.
    pub fn owned_chunks(&self) -> usize {
        self.tables.iter().map(ChunkTable::owned).sum()
    }

    /// Number of allocations not yet freed.
    pub fn outstanding_allocations(&self) -> usize {
        self.tables.iter().map(ChunkTable::outstanding).sum()
    }

    /// Outstanding allocations and bump offset of an owned chunk.
    pub fn chunk_usage(&self, id: ChunkId) -> Option<(u32, usize)> {
        self.tables
            .get(id.level())?
            .get(id)
            .map(|chunk| (chunk.allocs, chunk.offset))
    }

    /// The chunk system this arena draws from.
    pub fn system(&self) -> &Arc<MemoryChunkSystem> {
        &self.system
    }

    fn report_leaks(&self, record: &ChunkRecord) {
        let id = record.chunk.id();
        let base = record.chunk.as_ptr();
        log::warn!(
            "{}: chunk {id} released with {} live allocation(s)",
            self.owner,
            record.allocs
        );

        let mut pos = 0;
        while pos < record.offset {
            // SAFETY: `pos` walks headers and pad words this arena wrote
            // below the chunk's bump offset.
            let header = unsafe {
                if ptr::read(base.add(pos).cast::<u64>().as_ptr()) == PAD_MAGIC {
                    pos += 8;
                    continue;
                }
                AllocationRecord::read(base.add(pos + AllocationRecord::SIZE))
            };

            if header.is_live() {
                log::warn!("{}: leaked allocation: {header}", self.owner);
            } else if !header.is_freed() {
                log::warn!(
                    "{}: chunk {id} has an unreadable record at offset {pos}: {header}",
                    self.owner
                );
                return;
            }
            pos += AllocationRecord::SIZE + header.span();
        }
    }
}

impl Drop for ThreadMemory {
    fn drop(&mut self) {
        let leaked = self.free_all_chunks();
        if leaked > 0 {
            log::warn!("{}: {leaked} allocation(s) leaked at teardown", self.owner);
        }
    }
}

impl fmt::Debug for ThreadMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadMemory")
            .field("owner", &self.owner)
            .field("owned_chunks", &self.owned_chunks())
            .field("outstanding_allocations", &self.outstanding_allocations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(config: &str) -> ThreadMemory {
        let system = Arc::new(MemoryChunkSystem::new(
            &config.parse().expect("valid chunk config"),
        ));
        ThreadMemory::new(system, "test")
    }

    #[test]
    fn test_alloc_respects_alignment() {
        let mut memory = arena("16:4");
        for alignment in [1, 8, 16, 64, 256] {
            let ptr = memory.alloc(24, alignment);
            assert_eq!(ptr.as_ptr() as usize % alignment, 0);
        }
        assert_eq!(memory.outstanding_allocations(), 5);
        assert_eq!(memory.owned_chunks(), 1);
        assert_eq!(memory.free_all_chunks(), 5);
    }

    #[test]
    fn test_free_rewinds_empty_chunk() {
        let mut memory = arena("16:4");
        let keep = memory.alloc(100, 8);
        let id = unsafe { AllocationRecord::read(keep) }.chunk();
        let (allocs_before, offset_before) = memory.chunk_usage(id).expect("owned chunk");

        let ptr = memory.alloc(200, 16);
        unsafe { memory.free(ptr) };
        assert_eq!(memory.chunk_usage(id).expect("owned chunk").0, allocs_before);
        assert!(memory.chunk_usage(id).expect("owned chunk").1 > offset_before);

        unsafe { memory.free(keep) };
        assert_eq!(memory.chunk_usage(id), Some((0, 0)));
        assert_eq!(memory.free_all_chunks(), 0);
    }

    #[test]
    fn test_round_trip_restores_chunk_bitmap() {
        let mut memory = arena("16:8 1024:2");
        let system = Arc::clone(memory.system());
        let free_before = system.available_chunks(0);

        for _ in 0..100 {
            let a = memory.alloc(512, 8);
            let b = memory.alloc(4000, 32);
            unsafe {
                memory.free(b);
                memory.free(a);
            }
        }
        assert_eq!(memory.owned_chunks(), 1);
        assert_eq!(memory.free_all_chunks(), 0);
        assert_eq!(system.available_chunks(0), free_before);
    }

    #[test]
    fn test_full_chunk_claims_another() {
        let mut memory = arena("16:4");
        let mut ptrs = Vec::new();
        for _ in 0..8 {
            ptrs.push(memory.alloc(4000, 8));
        }
        assert!(memory.owned_chunks() >= 2);
        for ptr in ptrs {
            unsafe { memory.free(ptr) };
        }
        assert_eq!(memory.outstanding_allocations(), 0);
    }

    #[test]
    fn test_large_request_uses_larger_class() {
        let mut memory = arena("16:4 1024:4 65536:1");
        let ptr = memory.alloc(2 << 20, 8);
        let record = unsafe { AllocationRecord::read(ptr) };
        assert_eq!(record.chunk().level(), 2);
        assert_eq!(record.size(), 2 << 20);
        unsafe { memory.free(ptr) };
    }

    #[test]
    fn test_invalid_requests_are_errors() {
        let mut memory = arena("16:1");
        assert!(matches!(memory.try_alloc(0, 8), Err(AllocError::ZeroSize)));
        assert!(matches!(
            memory.try_alloc(8, 12),
            Err(AllocError::InvalidAlignment { alignment: 12 })
        ));
        assert!(matches!(
            memory.try_alloc(16 * 1024, 8),
            Err(AllocError::SizeTooLarge { .. })
        ));
    }

    #[test]
    fn test_records_carry_call_site() {
        let mut memory = arena("16:1");
        let ptr = memory.alloc(8, 8);
        let record = unsafe { AllocationRecord::read(ptr) };
        let source = record.source().expect("live record has a source");
        assert_eq!(source.file(), file!());
        unsafe { memory.free(ptr) };
    }

    #[test]
    #[should_panic(expected = "size: 48, alignment: 16")]
    fn test_corrupted_guard_is_fatal() {
        let mut memory = arena("16:1");
        let ptr = memory.alloc(48, 16);
        unsafe {
            let guard = ptr.as_ptr().sub(AllocationRecord::SIZE);
            *guard ^= 0x5A;
            memory.free(ptr);
        }
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_double_free_is_fatal() {
        let mut memory = arena("16:1");
        let keep = memory.alloc(8, 8);
        let ptr = memory.alloc(8, 8);
        unsafe {
            memory.free(ptr);
            memory.free(ptr);
        }
        drop(keep);
    }

    #[test]
    fn test_drop_returns_leaked_chunks() {
        let system = Arc::new(MemoryChunkSystem::new(&"16:2".parse().expect("valid")));
        {
            let mut memory = ThreadMemory::new(Arc::clone(&system), "leaky");
            let _leak = memory.alloc(64, 64);
            assert_eq!(system.available_chunks(0), 1);
        }
        assert_eq!(system.available_chunks(0), 2);
    }
}
