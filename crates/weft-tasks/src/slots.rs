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

//! Fixed-capacity storage for task bodies and their scheduling state.

use crate::task::{Task, MAX_FORWARD_TASKS};
use crate::task_id::TaskId;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use weft_core::{AccessLock, SchedulerError};

/// Lifecycle of a slot.
pub(crate) mod state {
    pub const FREE: u8 = 0;
    pub const RESERVED: u8 = 1;
    pub const PENDING: u8 = 2;
    pub const READY: u8 = 3;
    pub const DELAYED: u8 = 4;
    pub const RUNNING: u8 = 5;
}

/// One entry of the task buffer.
///
/// The body is written by the submitting thread while the slot is
/// `RESERVED` and taken by the single worker that fetched it. Everything
/// else is atomic.
pub(crate) struct TaskSlot {
    pub state: AtomicU8,
    /// Incremented on every reservation. 0 is never a live generation.
    pub generation: AtomicU32,
    /// Submission bias plus outstanding predecessors.
    pub dependencies: AtomicU32,
    /// Shared side guards registrations; closed once the task has run.
    pub forward_lock: AccessLock,
    pub forward_count: AtomicU32,
    pub forward: [AtomicU16; MAX_FORWARD_TASKS],
    /// Locator in the forward ring while the task is blocked.
    pub location: AtomicU16,
    pub thread_mask: AtomicU64,
    /// Due time in clock nanoseconds, 0 for none.
    pub due: AtomicU64,
    pub expired: AtomicBool,
    task: UnsafeCell<Option<Task>>,
}

// The body cell has a single writer before publication and a single taker
// after fetch; the ring hand-off orders the two.
unsafe impl Sync for TaskSlot {}

impl TaskSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(state::FREE),
            generation: AtomicU32::new(0),
            dependencies: AtomicU32::new(0),
            forward_lock: AccessLock::new(),
            forward_count: AtomicU32::new(0),
            forward: std::array::from_fn(|_| AtomicU16::new(0)),
            location: AtomicU16::new(TaskId::UNALLOCATED.bits()),
            thread_mask: AtomicU64::new(0),
            due: AtomicU64::new(0),
            expired: AtomicBool::new(false),
            task: UnsafeCell::new(None),
        }
    }

    /// Prepares a freshly reserved slot. The generation moves before the
    /// forward lock reopens, so a late registration against the previous
    /// occupant sees the mismatch.
    fn recycle(&self) -> u32 {
        let mut generation = self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        if generation == 0 {
            generation = self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        }
        self.dependencies.store(1, Ordering::Release);
        self.forward_count.store(0, Ordering::Release);
        self.location
            .store(TaskId::UNALLOCATED.bits(), Ordering::Release);
        self.thread_mask.store(0, Ordering::Relaxed);
        self.due.store(0, Ordering::Relaxed);
        self.expired.store(false, Ordering::Relaxed);
        self.forward_lock.reset();
        generation
    }

    /// Stores the body.
    ///
    /// # Safety
    ///
    /// The caller must hold the slot in the `RESERVED` state and not have
    /// published it to any ring yet.
    pub unsafe fn put(&self, task: Task) {
        *self.task.get() = Some(task);
    }

    /// Takes the body.
    ///
    /// # Safety
    ///
    /// The caller must be the worker that fetched this slot from the ready
    /// ring.
    pub unsafe fn take(&self) -> Option<Task> {
        (*self.task.get()).take()
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn set_state(&self, value: u8) {
        self.state.store(value, Ordering::Release);
    }
}

/// The task buffer: a power-of-two ring of [`TaskSlot`]s.
pub(crate) struct TaskSlots {
    slots: Box<[TaskSlot]>,
    cursor: AtomicUsize,
}

impl TaskSlots {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity <= usize::from(u16::MAX));
        Self {
            slots: (0..capacity).map(|_| TaskSlot::new()).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: u16) -> &TaskSlot {
        &self.slots[usize::from(index)]
    }

    /// Claims a free slot, returning its index and new generation.
    ///
    /// Scans at most once around the ring from a shared cursor. Nothing is
    /// modified when every slot is taken.
    pub fn reserve(&self) -> Result<(u16, u32), SchedulerError> {
        let capacity = self.capacity();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..capacity {
            let index = (start + offset) & (capacity - 1);
            let slot = &self.slots[index];
            if slot.state.load(Ordering::Relaxed) != state::FREE {
                continue;
            }
            if slot
                .state
                .compare_exchange(state::FREE, state::RESERVED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let generation = slot.recycle();
                return Ok((index as u16, generation));
            }
        }
        Err(SchedulerError::TaskBufferExhausted { capacity })
    }

    /// Returns a finished slot to the buffer.
    pub fn release(&self, index: u16) {
        self.get(index).set_state(state::FREE);
    }

    /// Number of slots not free.
    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state() != state::FREE)
            .count()
    }
}
