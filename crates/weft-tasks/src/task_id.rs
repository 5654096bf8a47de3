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

//! Packed locator of a task inside the ring hierarchy.

use crate::ring::RingKind;
use std::fmt;

const SLOT_BITS: u16 = 6;
const QUEUE_BITS: u16 = 6;
const QUEUE_SHIFT: u16 = SLOT_BITS;
const RING_SHIFT: u16 = SLOT_BITS + QUEUE_BITS;
const ALLOCATED: u16 = 1 << 15;
const FIELD_MASK: u16 = (1 << SLOT_BITS) - 1;

/// Where a task currently sits: ring, queue within the ring, slot within
/// the queue, plus an "allocated" flag.
///
/// A locator, not an owner: it carries no reference to the task and goes
/// stale as soon as the task moves to another ring.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct TaskId(u16);

impl TaskId {
    /// The locator of a task that is not in any ring.
    pub const UNALLOCATED: Self = Self(0);

    /// Packs a ring position.
    pub fn new(ring: RingKind, queue: u32, slot: u32) -> Self {
        debug_assert!(queue < 64 && slot < 64);
        Self(
            ALLOCATED
                | ((ring as u16) << RING_SHIFT)
                | ((queue as u16 & FIELD_MASK) << QUEUE_SHIFT)
                | (slot as u16 & FIELD_MASK),
        )
    }

    /// Rebuilds a locator from its packed form.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// The packed form.
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Whether the locator points into a ring.
    pub fn is_allocated(self) -> bool {
        self.0 & ALLOCATED != 0
    }

    /// Ring holding the task.
    pub fn ring(self) -> RingKind {
        RingKind::from_index((self.0 >> RING_SHIFT) & 0b11)
    }

    /// Queue within the ring.
    pub fn queue(self) -> u32 {
        u32::from((self.0 >> QUEUE_SHIFT) & FIELD_MASK)
    }

    /// Slot within the queue.
    pub fn slot(self) -> u32 {
        u32::from(self.0 & FIELD_MASK)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_allocated() {
            write!(f, "{:?}[{}:{}]", self.ring(), self.queue(), self.slot())
        } else {
            f.write_str("Unallocated")
        }
    }
}
