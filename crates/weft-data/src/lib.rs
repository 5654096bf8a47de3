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

//! # Weft Data
//!
//! Memory layouts of the runtime: the process-wide chunk allocator and the
//! two arenas that bump-allocate inside its chunks.

#![warn(missing_docs)]

pub mod allocators;

pub use allocators::{
    AllocationRecord, ChunkId, GlobalMemory, MemoryChunk, MemoryChunkSystem, SharedAllocation,
    ThreadMemory,
};
