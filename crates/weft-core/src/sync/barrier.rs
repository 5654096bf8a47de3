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

//! Generation-counting rendezvous barrier.

use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU64, Ordering};

/// Rendezvous point for a fixed number of threads.
///
/// The generation and the arrival count share one word so the last arrival
/// can reset the count and open the next generation in a single CAS.
#[derive(Debug, Default)]
pub struct Barrier {
    state: AtomicU64,
}

impl Barrier {
    /// Creates a barrier in generation zero.
    pub const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    /// Blocks until `participants` threads have arrived.
    ///
    /// Returns `true` on exactly one thread per generation: the last to
    /// arrive.
    pub fn wait(&self, participants: u32) -> bool {
        assert!(participants > 0, "barrier needs at least one participant");

        let mut current = self.state.load(Ordering::Acquire);
        let generation = loop {
            let generation = current >> 32;
            let arrived = (current & u64::from(u32::MAX)) + 1;
            let next = if arrived == u64::from(participants) {
                (generation + 1) << 32
            } else {
                (generation << 32) | arrived
            };
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if next >> 32 != generation => return true,
                Ok(_) => break generation,
                Err(actual) => current = actual,
            }
        };

        let backoff = Backoff::new();
        while self.state.load(Ordering::Acquire) >> 32 == generation {
            backoff.snooze();
        }
        false
    }

    /// Number of generations completed so far.
    pub fn generation(&self) -> u64 {
        self.state.load(Ordering::Acquire) >> 32
    }
}
