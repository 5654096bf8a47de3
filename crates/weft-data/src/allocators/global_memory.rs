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

//! Process-wide arena with reference-counted allocations.

use super::chunk_system::MemoryChunkSystem;
use super::chunk_table::ChunkTable;
use super::record::{self, AllocationRecord};
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;
use weft_core::error::{fatal, AllocError};
use weft_core::sync::AccessLock;

/// Reference count word placed in front of the [`AllocationRecord`].
const REF_COUNT_SIZE: usize = 8;

/// Bytes in front of every shared allocation.
const SHARED_HEADER: usize = REF_COUNT_SIZE + AllocationRecord::SIZE;

struct SharedLevel {
    lock: AccessLock,
    table: UnsafeCell<ChunkTable>,
}

impl SharedLevel {
    /// Runs `f` with exclusive access to the level's chunk table.
    fn with_table<R>(&self, f: impl FnOnce(&mut ChunkTable) -> R) -> R {
        let _guard = self.lock.write();
        // SAFETY: the write guard gives this thread exclusive access.
        f(unsafe { &mut *self.table.get() })
    }
}

/// An arena shared by every thread.
///
/// Each allocation carries a reference count. The chunk backing it returns
/// to the [`MemoryChunkSystem`] once every allocation carved from it has
/// been released by all of its owners. Allocations are handed out as
/// [`SharedAllocation`] handles that maintain the count.
pub struct GlobalMemory {
    system: Arc<MemoryChunkSystem>,
    levels: Vec<SharedLevel>,
}

// SAFETY: each level's chunk table is only touched under its AccessLock
// write guard; allocation memory is reached through `SharedAllocation`.
unsafe impl Send for GlobalMemory {}
unsafe impl Sync for GlobalMemory {}

impl GlobalMemory {
    /// Creates an empty shared arena on top of `system`.
    pub fn new(system: Arc<MemoryChunkSystem>) -> Arc<Self> {
        let levels = (0..system.levels())
            .map(|level| SharedLevel {
                lock: AccessLock::new(),
                table: UnsafeCell::new(ChunkTable::new(system.class(level))),
            })
            .collect();
        Arc::new(Self { system, levels })
    }

    /// Allocates `size` bytes aligned to `alignment` with one owner. Any
    /// failure is fatal.
    #[track_caller]
    pub fn alloc(self: &Arc<Self>, size: usize, alignment: usize) -> SharedAllocation {
        self.try_alloc(size, alignment)
            .unwrap_or_else(|err| fatal(err))
    }

    /// Allocates `size` bytes aligned to `alignment` with one owner.
    #[track_caller]
    pub fn try_alloc(
        self: &Arc<Self>,
        size: usize,
        alignment: usize,
    ) -> Result<SharedAllocation, AllocError> {
        let source = Location::caller();
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        let align =
            record::effective_alignment(alignment).ok_or(AllocError::InvalidAlignment { alignment })?;
        let span = record::worst_case_span(SHARED_HEADER, size, align);
        let level = self.system.size_to_level(span)?;

        let carved = self.levels[level].with_table(|table| {
            let id = table.find_room(SHARED_HEADER, size, align)?;
            table.carve(id, SHARED_HEADER, size, align).map(|data| (id, data))
        });

        let (id, data) = match carved {
            Some(carved) => carved,
            None => {
                let chunk = self.system.alloc(span);
                let chunk_level = chunk.id().level();
                log::trace!("Global memory adopted chunk {}", chunk.id());
                self.levels[chunk_level].with_table(|table| {
                    let id = table.adopt(chunk);
                    let data = table
                        .carve(id, SHARED_HEADER, size, align)
                        .unwrap_or_else(|| fatal(format!("Chunk {id} cannot hold {size} bytes")));
                    (id, data)
                })
            }
        };

        // SAFETY: `carve` reserved `SHARED_HEADER` bytes in front of `data`.
        unsafe {
            AllocationRecord::new(size, align, id, source).write(data);
            ref_count(data).store(1, Ordering::Release);
        }

        Ok(SharedAllocation {
            memory: Arc::clone(self),
            data,
            len: size,
        })
    }

    /// Number of chunks currently held by the arena.
    pub fn owned_chunks(&self) -> usize {
        self.levels
            .iter()
            .map(|level| level.with_table(|table| table.owned()))
            .sum()
    }

    /// The chunk system this arena draws from.
    pub fn system(&self) -> &Arc<MemoryChunkSystem> {
        &self.system
    }

    /// Drops the last reference to `data`: releases it from its chunk and
    /// returns the chunk once it is empty.
    fn release(&self, data: NonNull<u8>) {
        // SAFETY: `data` came from `try_alloc`, so a full header precedes it.
        let header = unsafe { AllocationRecord::read(data) };
        if !header.is_live() {
            let header_addr = data.as_ptr() as usize - AllocationRecord::SIZE;
            let trusted = self.system.locate(header_addr) == Some(header.chunk());
            fatal(AllocError::CorruptedRecord {
                record: header.describe(trusted),
            });
        }

        let id = header.chunk();
        let Some(level) = self.levels.get(id.level()) else {
            fatal(format!("Shared allocation from unknown chunk: {header}"));
        };

        let emptied = level.with_table(|table| {
            // SAFETY: the header was validated above and the caller held the
            // last reference.
            unsafe { AllocationRecord::mark_freed(data) };
            match table.release(id) {
                Some(0) => table.take(id),
                Some(_) => None,
                None => fatal(format!(
                    "Shared allocation from a chunk the arena does not own: {header}"
                )),
            }
        });

        if let Some(record) = emptied {
            log::trace!("Global memory returned chunk {id}");
            self.system.free(record.chunk);
        }
    }
}

impl Drop for GlobalMemory {
    fn drop(&mut self) {
        // Every allocation holds an `Arc<GlobalMemory>`, so nothing is live.
        for level in &mut self.levels {
            for record in level.table.get_mut().drain() {
                self.system.free(record.chunk);
            }
        }
    }
}

impl fmt::Debug for GlobalMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalMemory")
            .field("owned_chunks", &self.owned_chunks())
            .finish()
    }
}

/// # Safety
///
/// `data` must be a shared allocation, so the reference count word sits
/// `SHARED_HEADER` bytes before it.
unsafe fn ref_count<'a>(data: NonNull<u8>) -> &'a AtomicU32 {
    &*data.as_ptr().sub(SHARED_HEADER).cast::<AtomicU32>()
}

/// An owner of one [`GlobalMemory`] allocation.
///
/// Cloning adds an owner; dropping the last owner releases the memory.
pub struct SharedAllocation {
    memory: Arc<GlobalMemory>,
    data: NonNull<u8>,
    len: usize,
}

// SAFETY: the handle only exposes raw pointers to the allocation; the
// reference count is atomic.
unsafe impl Send for SharedAllocation {}
unsafe impl Sync for SharedAllocation {}

impl SharedAllocation {
    /// Start of the allocation. The memory is uninitialized until written.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.data
    }

    /// Requested size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`: zero-sized shared allocations are rejected.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current number of owners.
    pub fn ref_count(&self) -> u32 {
        // SAFETY: the handle keeps the allocation alive.
        unsafe { ref_count(self.data) }.load(Ordering::Acquire)
    }

    /// The allocation's header.
    pub fn record(&self) -> AllocationRecord {
        // SAFETY: the handle keeps the allocation alive.
        unsafe { AllocationRecord::read(self.data) }
    }
}

impl Clone for SharedAllocation {
    fn clone(&self) -> Self {
        // SAFETY: the handle keeps the allocation alive.
        unsafe { ref_count(self.data) }.fetch_add(1, Ordering::Relaxed);
        Self {
            memory: Arc::clone(&self.memory),
            data: self.data,
            len: self.len,
        }
    }
}

impl Drop for SharedAllocation {
    fn drop(&mut self) {
        // SAFETY: this handle is still an owner.
        let previous = unsafe { ref_count(self.data) }.fetch_sub(1, Ordering::Release);
        if previous == 1 {
            fence(Ordering::Acquire);
            self.memory.release(self.data);
        }
    }
}

impl fmt::Debug for SharedAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedAllocation")
            .field("len", &self.len)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn memory(config: &str) -> Arc<GlobalMemory> {
        GlobalMemory::new(Arc::new(MemoryChunkSystem::new(
            &config.parse().expect("valid chunk config"),
        )))
    }

    #[test]
    fn test_clone_and_drop_track_owners() {
        let memory = memory("16:2");
        let first = memory.alloc(128, 16);
        assert_eq!(first.ref_count(), 1);
        assert_eq!(first.as_ptr().as_ptr() as usize % 16, 0);

        let second = first.clone();
        assert_eq!(first.ref_count(), 2);
        drop(first);
        assert_eq!(second.ref_count(), 1);
        assert_eq!(memory.owned_chunks(), 1);

        drop(second);
        assert_eq!(memory.owned_chunks(), 0);
        assert_eq!(memory.system().available_chunks(0), 2);
    }

    #[test]
    fn test_chunk_returns_only_after_every_allocation() {
        let memory = memory("16:2");
        let a = memory.alloc(64, 8);
        let b = memory.alloc(64, 8);
        assert_eq!(a.record().chunk(), b.record().chunk());

        drop(a);
        assert_eq!(memory.owned_chunks(), 1);
        drop(b);
        assert_eq!(memory.owned_chunks(), 0);
    }

    #[test]
    fn test_owners_release_from_many_threads() {
        let memory = memory("16:4");
        let shared = memory.alloc(1024, 8);
        unsafe { shared.as_ptr().as_ptr().write_bytes(0xAB, shared.len()) };

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let owner = shared.clone();
                thread::spawn(move || {
                    let byte = unsafe { *owner.as_ptr().as_ptr().add(owner.len() - 1) };
                    assert_eq!(byte, 0xAB);
                })
            })
            .collect();
        drop(shared);

        for handle in handles {
            handle.join().expect("owner thread panicked");
        }
        assert_eq!(memory.owned_chunks(), 0);
    }

    #[test]
    fn test_concurrent_allocations_do_not_overlap() {
        let memory = memory("16:64");
        let handles: Vec<_> = (0..4u8)
            .map(|tag| {
                let memory = Arc::clone(&memory);
                thread::spawn(move || {
                    let allocations: Vec<_> = (0..50)
                        .map(|_| {
                            let allocation = memory.alloc(96, 8);
                            unsafe { allocation.as_ptr().as_ptr().write_bytes(tag, 96) };
                            allocation
                        })
                        .collect();
                    for allocation in &allocations {
                        let bytes = unsafe {
                            std::slice::from_raw_parts(allocation.as_ptr().as_ptr(), 96)
                        };
                        assert!(bytes.iter().all(|&b| b == tag));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("allocating thread panicked");
        }
        assert_eq!(memory.owned_chunks(), 0);
    }

    #[test]
    fn test_invalid_requests_are_errors() {
        let memory = memory("16:1");
        assert!(matches!(memory.try_alloc(0, 8), Err(AllocError::ZeroSize)));
        assert!(matches!(
            memory.try_alloc(32 * 1024, 8),
            Err(AllocError::SizeTooLarge { .. })
        ));
    }
}
