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

//! Sharded concurrent containers of task references.

use crate::task_id::TaskId;
use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use weft_core::bits::{self, BitWord};

/// Number of queues in a ring.
pub const QUEUES: usize = 64;

/// Number of task references a queue holds.
pub const QUEUE_SLOTS: usize = 64;

/// Total capacity of a ring.
pub const RING_CAPACITY: usize = QUEUES * QUEUE_SLOTS;

const EMPTY: u16 = u16::MAX;

/// The rings a task can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RingKind {
    /// Tasks workers may pick up.
    Ready = 0,
    /// Tasks waiting on predecessors; reachable only through forward links.
    Forward = 1,
}

impl RingKind {
    pub(crate) fn from_index(index: u16) -> Self {
        match index {
            1 => Self::Forward,
            _ => Self::Ready,
        }
    }
}

/// Up to 64 task references, claimed through a reservation bitmap and
/// published through an occupancy bitmap.
pub struct TaskQueue {
    /// Slots claimed by a producer or holding a task.
    reserved: AtomicU64,
    /// Slots whose entry is published.
    occupied: AtomicU64,
    entries: [AtomicU16; QUEUE_SLOTS],
}

impl TaskQueue {
    fn new() -> Self {
        Self {
            reserved: AtomicU64::new(0),
            occupied: AtomicU64::new(0),
            entries: std::array::from_fn(|_| AtomicU16::new(EMPTY)),
        }
    }

    /// Number of published entries.
    pub fn len(&self) -> usize {
        self.occupied.load(Ordering::Acquire).count_ones() as usize
    }

    /// Whether no entry is published.
    pub fn is_empty(&self) -> bool {
        self.occupied.load(Ordering::Acquire) == 0
    }

    fn try_push(&self, value: u16) -> Option<u32> {
        let slot = bits::claim_lowest_zero(&self.reserved, 0)?;
        self.entries[slot as usize].store(value, Ordering::Relaxed);
        self.occupied.fetch_or(1 << slot, Ordering::AcqRel);
        Some(slot)
    }

    fn take(&self, slot: u32) -> u16 {
        let value = self.entries[slot as usize].swap(EMPTY, Ordering::Acquire);
        self.occupied.fetch_and(!(1 << slot), Ordering::AcqRel);
        bits::release_bit(&self.reserved, slot);
        value
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.len()).finish()
    }
}

/// A ring of 64 [`TaskQueue`]s.
///
/// Producers never wait: a push claims the lowest free slot of the first
/// queue with room, starting from a rotating cursor to spread contention.
/// Consumers claim a whole queue through the `locked` bitmap while they scan
/// it, so a task reference is taken by exactly one consumer.
pub struct TaskRing {
    kind: RingKind,
    queues: Box<[CachePadded<TaskQueue>]>,
    /// Queues that may hold published entries.
    available: AtomicU64,
    /// Queues currently being scanned by a consumer.
    locked: AtomicU64,
    cursor: AtomicU32,
    len: AtomicUsize,
}

impl TaskRing {
    /// Creates an empty ring.
    pub fn new(kind: RingKind) -> Self {
        Self {
            kind,
            queues: (0..QUEUES).map(|_| CachePadded::new(TaskQueue::new())).collect(),
            available: AtomicU64::new(0),
            locked: AtomicU64::new(0),
            cursor: AtomicU32::new(0),
            len: AtomicUsize::new(0),
        }
    }

    /// Which ring this is.
    pub fn kind(&self) -> RingKind {
        self.kind
    }

    /// Number of task references currently held.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the ring holds no task reference.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The queue at `index`.
    pub fn queue(&self, index: usize) -> &TaskQueue {
        &self.queues[index]
    }

    /// Stores `value`, returning where it landed, or `None` if every slot
    /// of every queue is taken.
    pub fn push(&self, value: u16) -> Option<TaskId> {
        debug_assert_ne!(value, EMPTY);
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) as usize;
        for offset in 0..QUEUES {
            let queue = (start + offset) % QUEUES;
            if let Some(slot) = self.queues[queue].try_push(value) {
                self.len.fetch_add(1, Ordering::AcqRel);
                self.available.fetch_or(1 << queue, Ordering::AcqRel);
                return Some(TaskId::new(self.kind, queue as u32, slot));
            }
        }
        None
    }

    /// Takes the entry at `id`. Only the unique owner of that entry may call
    /// this; rings consumers scan must go through [`fetch`](Self::fetch).
    pub fn remove(&self, id: TaskId) -> u16 {
        debug_assert_eq!(id.ring(), self.kind);
        let queue = id.queue() as usize;
        let value = self.queues[queue].take(id.slot());
        self.len.fetch_sub(1, Ordering::AcqRel);
        self.settle(queue);
        value
    }

    /// Takes one entry accepted by `eligible`.
    ///
    /// Scans the available queues that no other consumer holds, either in
    /// index order or fullest first. A queue that yields nothing is marked
    /// as tried and not revisited during this call.
    pub fn fetch(&self, prefer_longest: bool, mut eligible: impl FnMut(u16) -> bool) -> Option<u16> {
        let mut tried = 0u64;
        loop {
            let candidates = self.available.load(Ordering::Acquire)
                & !self.locked.load(Ordering::Acquire)
                & !tried;
            let next = if prefer_longest {
                self.longest(candidates)
            } else {
                candidates.find_lsb_set()
            };
            let queue = next?;

            tried = tried.with_bit(queue);
            if !bits::try_claim_bit(&self.locked, queue) {
                continue;
            }
            let found = self.scan_queue(queue as usize, &mut eligible);
            bits::release_bit(&self.locked, queue);

            if found.is_some() {
                return found;
            }
        }
    }

    fn scan_queue(&self, index: usize, eligible: &mut impl FnMut(u16) -> bool) -> Option<u16> {
        let queue = &self.queues[index];
        let mut occupied = queue.occupied.load(Ordering::Acquire);
        while let Some(slot) = occupied.find_lsb_set() {
            occupied = occupied.without_bit(slot);
            let value = queue.entries[slot as usize].load(Ordering::Acquire);
            if value == EMPTY || !eligible(value) {
                continue;
            }

            let value = queue.take(slot);
            self.len.fetch_sub(1, Ordering::AcqRel);
            self.settle(index);
            return Some(value);
        }
        self.settle(index);
        None
    }

    /// Clears the queue's availability bit if it drained, re-setting it if a
    /// producer published in the meantime.
    fn settle(&self, index: usize) {
        let queue = &self.queues[index];
        if queue.is_empty() {
            self.available.fetch_and(!(1 << index), Ordering::AcqRel);
            if !queue.is_empty() {
                self.available.fetch_or(1 << index, Ordering::AcqRel);
            }
        }
    }

    fn longest(&self, candidates: u64) -> Option<u32> {
        let mut remaining = candidates;
        let mut best: Option<(u32, usize)> = None;
        while let Some(queue) = remaining.find_lsb_set() {
            remaining = remaining.without_bit(queue);
            let len = self.queues[queue as usize].len();
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((queue, len));
            }
        }
        best.map(|(queue, _)| queue)
    }
}

impl fmt::Debug for TaskRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRing")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn test_push_then_fetch() {
        let ring = TaskRing::new(RingKind::Ready);
        let id = ring.push(7).expect("ring has room");
        assert_eq!(id.ring(), RingKind::Ready);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.queue(id.queue() as usize).len(), 1);

        assert_eq!(ring.fetch(false, |_| true), Some(7));
        assert!(ring.is_empty());
        assert_eq!(ring.fetch(false, |_| true), None);
    }

    #[test]
    fn test_fetch_skips_ineligible_entries() {
        let ring = TaskRing::new(RingKind::Ready);
        for value in 0..10 {
            ring.push(value).expect("ring has room");
        }
        assert_eq!(ring.fetch(true, |value| value == 4), Some(4));
        assert_eq!(ring.fetch(false, |value| value == 4), None);
        assert_eq!(ring.len(), 9);
    }

    #[test]
    fn test_remove_by_id() {
        let ring = TaskRing::new(RingKind::Forward);
        let a = ring.push(1).expect("ring has room");
        let b = ring.push(2).expect("ring has room");
        assert_eq!(ring.remove(b), 2);
        assert_eq!(ring.remove(a), 1);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_fills_to_capacity() {
        let ring = TaskRing::new(RingKind::Forward);
        for value in 0..RING_CAPACITY as u16 {
            assert!(ring.push(value).is_some());
        }
        assert!(ring.push(9).is_none());
        assert_eq!(ring.len(), RING_CAPACITY);
    }

    #[test]
    fn test_concurrent_producers_and_consumers() {
        let ring = Arc::new(TaskRing::new(RingKind::Ready));
        let seen = Arc::new(Mutex::new(HashSet::new()));
        const PER_PRODUCER: u16 = 500;

        let producers: Vec<_> = (0..4u16)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        while ring.push(p * PER_PRODUCER + i).is_none() {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let ring = Arc::clone(&ring);
                let seen = Arc::clone(&seen);
                thread::spawn(move || loop {
                    if seen.lock().expect("set poisoned").len() == 4 * PER_PRODUCER as usize {
                        break;
                    }
                    match ring.fetch(false, |_| true) {
                        Some(value) => {
                            assert!(
                                seen.lock().expect("set poisoned").insert(value),
                                "{value} fetched twice"
                            );
                        }
                        None => thread::yield_now(),
                    }
                })
            })
            .collect();

        for handle in producers.into_iter().chain(consumers) {
            handle.join().expect("ring thread panicked");
        }
        assert!(ring.is_empty());
    }
}
