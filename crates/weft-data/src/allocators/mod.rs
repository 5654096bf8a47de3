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

//! Chunk allocator and arenas.
//!
//! [`MemoryChunkSystem`] owns one contiguous block per size class and hands
//! out whole chunks. [`ThreadMemory`] and [`GlobalMemory`] carve those
//! chunks into individual allocations, each prefixed by an
//! [`AllocationRecord`].

mod chunk_system;
mod chunk_table;
mod global_memory;
mod record;
mod thread_memory;

pub use chunk_system::{ChunkId, MemoryChunk, MemoryChunkSystem};
pub use global_memory::{GlobalMemory, SharedAllocation};
pub use record::AllocationRecord;
pub use thread_memory::ThreadMemory;
