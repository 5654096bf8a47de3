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

//! Bookkeeping for the chunks one arena owns within a size class.

use super::chunk_system::{ChunkId, MemoryChunk};
use super::record::{self, PAD_MAGIC};
use std::ptr::{self, NonNull};
use weft_core::bits::BitWord;
use weft_core::config::SizeClass;

pub(crate) struct ChunkRecord {
    pub chunk: MemoryChunk,
    pub offset: usize,
    pub allocs: u32,
}

/// Owned chunks of one size class, indexed like the class itself, plus a
/// bitmap of the ones that may still have room.
pub(crate) struct ChunkTable {
    available: Vec<u64>,
    chunks: Vec<Option<ChunkRecord>>,
}

impl ChunkTable {
    pub fn new(class: SizeClass) -> Self {
        Self {
            available: vec![0; class.chunk_count.div_ceil(64)],
            chunks: (0..class.chunk_count).map(|_| None).collect(),
        }
    }

    /// First owned chunk that can place the allocation.
    pub fn find_room(&self, header: usize, size: usize, align: usize) -> Option<ChunkId> {
        for (word_index, &word) in self.available.iter().enumerate() {
            let mut word = word;
            while let Some(bit) = word.find_lsb_set() {
                word = word.without_bit(bit);
                let Some(chunk) = self.chunks[word_index * 64 + bit as usize].as_ref() else {
                    continue;
                };
                let fits = record::place(
                    chunk.chunk.as_ptr().as_ptr() as usize,
                    chunk.offset,
                    chunk.chunk.size(),
                    header,
                    size,
                    align,
                )
                .is_some();
                if fits {
                    return Some(chunk.chunk.id());
                }
            }
        }
        None
    }

    pub fn adopt(&mut self, chunk: MemoryChunk) -> ChunkId {
        let id = chunk.id();
        self.set_available(id, true);
        self.chunks[id.index()] = Some(ChunkRecord {
            chunk,
            offset: 0,
            allocs: 0,
        });
        id
    }

    pub fn get(&self, id: ChunkId) -> Option<&ChunkRecord> {
        self.chunks.get(id.index())?.as_ref()
    }

    /// Bumps the chunk's offset past a new allocation and returns its data
    /// pointer. Alignment gaps in front of the header are filled with
    /// [`PAD_MAGIC`]; the header itself is left to the caller.
    pub fn carve(&mut self, id: ChunkId, header: usize, size: usize, align: usize) -> Option<NonNull<u8>> {
        let chunk = self.chunks.get_mut(id.index())?.as_mut()?;
        let base = chunk.chunk.as_ptr();
        let placement = record::place(
            base.as_ptr() as usize,
            chunk.offset,
            chunk.chunk.size(),
            header,
            size,
            align,
        )?;

        // SAFETY: the pad words and the data lie below `placement.end`,
        // inside a chunk this table owns.
        let data = unsafe {
            let mut pad = chunk.offset;
            while pad + header < placement.data {
                ptr::write(base.add(pad).cast::<u64>().as_ptr(), PAD_MAGIC);
                pad += 8;
            }
            base.add(placement.data)
        };

        chunk.offset = placement.end;
        chunk.allocs += 1;
        let full = chunk.offset == chunk.chunk.size();
        if full {
            self.set_available(id, false);
        }
        Some(data)
    }

    /// Drops one allocation from the chunk's count, rewinding the chunk once
    /// it is empty. Returns the remaining count, or `None` if the chunk is
    /// not owned.
    pub fn release(&mut self, id: ChunkId) -> Option<u32> {
        let chunk = self.chunks.get_mut(id.index())?.as_mut()?;
        chunk.allocs -= 1;
        if chunk.allocs == 0 {
            chunk.offset = 0;
        }
        let remaining = chunk.allocs;
        self.set_available(id, true);
        Some(remaining)
    }

    /// Stops tracking a chunk and hands it back to the caller.
    pub fn take(&mut self, id: ChunkId) -> Option<ChunkRecord> {
        let record = self.chunks.get_mut(id.index())?.take()?;
        self.set_available(id, false);
        Some(record)
    }

    /// Stops tracking every chunk.
    pub fn drain(&mut self) -> impl Iterator<Item = ChunkRecord> + '_ {
        self.available.fill(0);
        self.chunks.iter_mut().filter_map(Option::take)
    }

    pub fn owned(&self) -> usize {
        self.chunks.iter().filter(|chunk| chunk.is_some()).count()
    }

    pub fn outstanding(&self) -> usize {
        self.chunks
            .iter()
            .flatten()
            .map(|chunk| chunk.allocs as usize)
            .sum()
    }

    fn set_available(&mut self, id: ChunkId, available: bool) {
        let word = &mut self.available[id.area()];
        *word = if available {
            word.with_bit(id.bit())
        } else {
            word.without_bit(id.bit())
        };
    }
}
