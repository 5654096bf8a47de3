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

//! The process-wide, size-classed chunk allocator.

use crossbeam_utils::CachePadded;
use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use weft_core::bits::{self, BitWord};
use weft_core::config::{MemoryChunkConfig, SizeClass};
use weft_core::error::{fatal, AllocError};
use weft_core::memory::{CHUNKS_CLAIMED, CHUNKS_RELEASED, CHUNK_EXHAUSTION_YIELDS};

/// Alignment of every chunk area, and therefore of every chunk.
const AREA_ALIGNMENT: usize = 64;

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Identifies one chunk: its size class (level) and its index in the class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ChunkId(u32);

impl ChunkId {
    /// Packs a level and a chunk index.
    pub fn new(level: usize, index: usize) -> Self {
        debug_assert!(level < 1 << (u32::BITS - INDEX_BITS));
        debug_assert!(index <= INDEX_MASK as usize);
        Self(((level as u32) << INDEX_BITS) | index as u32)
    }

    /// Size class of the chunk.
    pub fn level(self) -> usize {
        (self.0 >> INDEX_BITS) as usize
    }

    /// Index of the chunk within its size class.
    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    /// Index of the 64-chunk lock word holding this chunk.
    pub fn area(self) -> usize {
        self.index() / 64
    }

    /// Bit of this chunk within its lock word.
    pub fn bit(self) -> u32 {
        (self.index() % 64) as u32
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:{}]", self.level(), self.area(), self.bit())
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A claimed chunk.
///
/// Holding a `MemoryChunk` is the claim: it is neither `Clone` nor `Copy`
/// and must be handed back with [`MemoryChunkSystem::free`].
#[must_use = "a claimed chunk stays locked until it is freed"]
pub struct MemoryChunk {
    id: ChunkId,
    memory: NonNull<u8>,
    size: usize,
}

// SAFETY: the chunk's memory is exclusively owned by whoever holds the claim.
unsafe impl Send for MemoryChunk {}

impl MemoryChunk {
    /// Identifier of the chunk.
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Start of the chunk, aligned to 64 bytes.
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.memory
    }

    /// Size of the chunk in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `addr` lies inside this chunk.
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.memory.as_ptr() as usize;
        (base..base + self.size).contains(&addr)
    }
}

impl fmt::Debug for MemoryChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChunk")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

struct MemoryArea {
    class: SizeClass,
    memory: NonNull<u8>,
    layout: Layout,
    locks: Box<[CachePadded<AtomicU64>]>,
}

impl MemoryArea {
    fn new(class: SizeClass) -> Self {
        let bytes = class
            .chunk_size
            .checked_mul(class.chunk_count)
            .unwrap_or_else(|| fatal(format!("Chunk area {class:?} overflows usize")));
        let layout = Layout::from_size_align(bytes, AREA_ALIGNMENT)
            .unwrap_or_else(|err| fatal(format!("Invalid chunk area layout {class:?}: {err}")));

        // SAFETY: `layout` has a non-zero size since both factors are
        // validated to be non-zero by `MemoryChunkConfig`.
        let memory = NonNull::new(unsafe { alloc::alloc(layout) })
            .unwrap_or_else(|| alloc::handle_alloc_error(layout));

        let words = class.chunk_count.div_ceil(64);
        let locks = (0..words)
            .map(|word| {
                // Bits past the last chunk are permanently claimed.
                let valid = (class.chunk_count - word * 64).min(64) as u32;
                CachePadded::new(AtomicU64::new(!bits::low_mask(valid)))
            })
            .collect();

        Self {
            class,
            memory,
            layout,
            locks,
        }
    }

    fn contains(&self, addr: usize) -> bool {
        let base = self.memory.as_ptr() as usize;
        (base..base + self.layout.size()).contains(&addr)
    }

    fn chunk_ptr(&self, index: usize) -> NonNull<u8> {
        // SAFETY: `index < chunk_count`, so the offset stays inside the area.
        unsafe { self.memory.add(index * self.class.chunk_size) }
    }
}

/// Size-classed pools of fixed-size chunks, claimed lock-free through one
/// 64-bit bitmap word per 64 chunks.
///
/// A chunk is either unclaimed or claimed by exactly one owner: claims are
/// published with a CAS on the lock word, so two concurrent callers can
/// never observe the same chunk as free.
pub struct MemoryChunkSystem {
    areas: Vec<MemoryArea>,
}

// SAFETY: the areas are only mutated through claimed chunks; the lock words
// are atomics.
unsafe impl Send for MemoryChunkSystem {}
unsafe impl Sync for MemoryChunkSystem {}

impl MemoryChunkSystem {
    /// Reserves every size class described by `config`.
    pub fn new(config: &MemoryChunkConfig) -> Self {
        let areas: Vec<_> = config.classes().iter().copied().map(MemoryArea::new).collect();
        log::debug!("Chunk system reserved size classes: {config}");
        Self { areas }
    }

    /// Number of size classes.
    pub fn levels(&self) -> usize {
        self.areas.len()
    }

    /// The size class at `level`.
    pub fn class(&self, level: usize) -> SizeClass {
        self.areas[level].class
    }

    /// Chunk size of the largest class.
    pub fn largest_chunk_size(&self) -> usize {
        self.areas.last().map_or(0, |area| area.class.chunk_size)
    }

    /// The smallest level whose chunks hold `size` bytes.
    pub fn size_to_level(&self, size: usize) -> Result<usize, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        self.areas
            .iter()
            .position(|area| area.class.chunk_size >= size)
            .ok_or(AllocError::SizeTooLarge {
                size,
                largest: self.largest_chunk_size(),
            })
    }

    /// Claims one chunk of at least `size` bytes.
    ///
    /// Tries the smallest fitting class first, then every larger one. When
    /// all of them are exhausted the caller yields and rescans; chunks are
    /// always eventually returned, so this does not block forever.
    ///
    /// A size no class can hold in a single chunk is returned as an error.
    pub fn try_alloc(&self, size: usize) -> Result<MemoryChunk, AllocError> {
        let initial = self.size_to_level(size)?;

        let mut warned = false;
        loop {
            if let Some(chunk) = (initial..self.areas.len()).find_map(|level| self.lock_area(level)) {
                return Ok(chunk);
            }

            CHUNK_EXHAUSTION_YIELDS.fetch_add(1, Ordering::Relaxed);
            if !warned {
                log::warn!("No memory chunks available for {size} bytes, yielding");
                warned = true;
            }
            std::thread::yield_now();
        }
    }

    /// Claims one chunk of at least `size` bytes. Oversized requests are
    /// fatal: contiguous multi-chunk spans are not supported.
    #[track_caller]
    pub fn alloc(&self, size: usize) -> MemoryChunk {
        self.try_alloc(size).unwrap_or_else(|err| fatal(err))
    }

    /// One pass over the lock words of `level`, claiming the first free chunk.
    pub fn lock_area(&self, level: usize) -> Option<MemoryChunk> {
        let area = &self.areas[level];
        for (word_index, word) in area.locks.iter().enumerate() {
            if let Some(bit) = bits::claim_lowest_zero(word, 0) {
                let id = ChunkId::new(level, word_index * 64 + bit as usize);
                CHUNKS_CLAIMED.fetch_add(1, Ordering::Relaxed);
                log::trace!("Locked chunk {id}");
                return Some(MemoryChunk {
                    id,
                    memory: area.chunk_ptr(id.index()),
                    size: area.class.chunk_size,
                });
            }
        }
        None
    }

    /// Returns a chunk to its size class.
    pub fn free(&self, chunk: MemoryChunk) {
        let id = chunk.id;
        log::trace!("Freeing chunk {id}");

        let word = &self.areas[id.level()].locks[id.area()];
        if !bits::release_bit(word, id.bit()) {
            fatal(format!("Chunk {id} freed while not claimed"));
        }
        CHUNKS_RELEASED.fetch_add(1, Ordering::Relaxed);
    }

    /// The chunk containing `addr`, if it belongs to any size class.
    pub fn locate(&self, addr: usize) -> Option<ChunkId> {
        self.areas.iter().enumerate().find_map(|(level, area)| {
            area.contains(addr).then(|| {
                let base = area.memory.as_ptr() as usize;
                ChunkId::new(level, (addr - base) / area.class.chunk_size)
            })
        })
    }

    /// Whether the chunk is currently claimed.
    pub fn is_claimed(&self, id: ChunkId) -> bool {
        let word = self.areas[id.level()].locks[id.area()].load(Ordering::Acquire);
        word.has_bit(id.bit())
    }

    /// Number of unclaimed chunks in `level`.
    pub fn available_chunks(&self, level: usize) -> usize {
        self.areas[level]
            .locks
            .iter()
            .map(|word| word.load(Ordering::Acquire).count_zeros() as usize)
            .sum()
    }
}

impl Drop for MemoryChunkSystem {
    fn drop(&mut self) {
        for area in &self.areas {
            // SAFETY: allocated in `MemoryArea::new` with the same layout.
            unsafe { alloc::dealloc(area.memory.as_ptr(), area.layout) };
        }
    }
}

impl fmt::Debug for MemoryChunkSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (level, area) in self.areas.iter().enumerate() {
            list.entry(&format_args!(
                "{}KiB x {} ({} free)",
                area.class.chunk_size / 1024,
                area.class.chunk_count,
                self.available_chunks(level)
            ));
        }
        list.finish()
    }
}
