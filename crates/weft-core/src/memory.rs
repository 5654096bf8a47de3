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

//! Process-wide chunk allocator counters.
//!
//! The chunk allocator in `weft-data` increments these; anything can read a
//! consistent-enough snapshot through [`chunk_stats`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Total number of chunks claimed from any size class.
pub static CHUNKS_CLAIMED: AtomicU64 = AtomicU64::new(0);

/// Total number of chunks returned to their size class.
pub static CHUNKS_RELEASED: AtomicU64 = AtomicU64::new(0);

/// Number of times a claim found every eligible class exhausted and yielded.
pub static CHUNK_EXHAUSTION_YIELDS: AtomicU64 = AtomicU64::new(0);

/// A snapshot of the chunk counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    /// Chunks claimed over the process lifetime.
    pub claimed: u64,
    /// Chunks released over the process lifetime.
    pub released: u64,
    /// Yields caused by exhausted size classes.
    pub exhaustion_yields: u64,
}

impl ChunkStats {
    /// Chunks currently held by some arena.
    pub fn outstanding(&self) -> i64 {
        self.claimed as i64 - self.released as i64
    }
}

/// Reads all chunk counters.
pub fn chunk_stats() -> ChunkStats {
    ChunkStats {
        claimed: CHUNKS_CLAIMED.load(Ordering::Relaxed),
        released: CHUNKS_RELEASED.load(Ordering::Relaxed),
        exhaustion_yields: CHUNK_EXHAUSTION_YIELDS.load(Ordering::Relaxed),
    }
}
