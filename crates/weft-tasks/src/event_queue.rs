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

//! Hierarchical time wheel for delayed tasks.
//!
//! Rings are ordered from the finest granularity to the coarsest. Each has 8
//! sectors of 64 slots. Sector `j` of a ring (counted from its current
//! sector) is released once `T + (j + 1) * g` has passed, `T` being the
//! ring's last rotation time and `g` its granularity. A task is parked in the
//! finest ring that reaches its due time, in the last sector that closes no
//! later than that due time, so the wheel never releases a task early. A
//! task due beyond a ring's reach is parked at its far end and re-inserted
//! by the scheduler when rotation hands it back.

use crossbeam_utils::Backoff;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft_core::bits::{self, BitWord};
use weft_core::{AccessLock, Clock};

/// Sectors per ring.
pub const SECTORS: usize = 8;

/// Slots per sector.
pub const SECTOR_SLOTS: usize = 64;

/// Granularities of the default wheel, finest first.
pub const DEFAULT_GRANULARITIES: [Duration; 9] = [
    Duration::from_micros(1),
    Duration::from_micros(10),
    Duration::from_micros(50),
    Duration::from_micros(200),
    Duration::from_millis(1),
    Duration::from_millis(16),
    Duration::from_millis(100),
    Duration::from_secs(5),
    Duration::from_secs(60),
];

/// Outcome of [`EventQueue::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResult {
    /// The entry is parked.
    Scheduled {
        /// Index of the ring, 0 being the finest.
        ring: usize,
        /// Physical sector within the ring.
        sector: usize,
    },
    /// The due time has already passed; the caller should run the task now.
    Expired,
    /// No slot could take the entry; the caller should run the task now.
    Full,
}

struct EventRing {
    granularity: u64,
    /// Last rotation time, in clock nanoseconds.
    current_time: AtomicU64,
    current_sector: AtomicU32,
    allocated: [AtomicU64; SECTORS],
    events: [[AtomicU32; SECTOR_SLOTS]; SECTORS],
}

impl EventRing {
    fn new(granularity: Duration, now: u64) -> Self {
        Self {
            granularity: nanos(granularity).max(1),
            current_time: AtomicU64::new(now),
            current_sector: AtomicU32::new(0),
            allocated: std::array::from_fn(|_| AtomicU64::new(0)),
            events: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU32::new(0))),
        }
    }

    /// Whole granularity steps between the last rotation and `due`.
    fn steps_until(&self, due: u64) -> u64 {
        due.saturating_sub(self.current_time.load(Ordering::Acquire)) / self.granularity
    }

    fn physical(&self, relative: usize) -> usize {
        (self.current_sector.load(Ordering::Acquire) as usize + relative) % SECTORS
    }

    /// Claims a slot in relative sector `relative` or any earlier one.
    fn claim(&self, relative: usize, value: u32) -> Option<usize> {
        for candidate in (0..=relative).rev() {
            let sector = self.physical(candidate);
            if let Some(slot) = bits::claim_lowest_zero(&self.allocated[sector], 0) {
                self.events[sector][slot as usize].store(value, Ordering::Release);
                return Some(sector);
            }
        }
        None
    }

    fn drain_sector(&self, sector: usize, out: &mut Vec<u32>) {
        let mut allocated = self.allocated[sector].swap(0, Ordering::AcqRel);
        while let Some(slot) = allocated.find_lsb_set() {
            allocated = allocated.without_bit(slot);
            out.push(self.events[sector][slot as usize].load(Ordering::Acquire));
        }
    }

    /// Releases every sector whose window has closed by `now`.
    fn rotate(&self, now: u64, out: &mut Vec<u32>) -> usize {
        let start = self.current_time.load(Ordering::Acquire);
        let mut count = 0;
        while count < SECTORS && start + (count as u64 + 1) * self.granularity <= now {
            self.drain_sector(self.physical(count), out);
            count += 1;
        }
        if count == 0 {
            return 0;
        }

        let next_time = if count == SECTORS {
            now
        } else {
            start + count as u64 * self.granularity
        };
        self.current_time.store(next_time, Ordering::Release);
        let sector = self.physical(count) as u32;
        self.current_sector.store(sector, Ordering::Release);
        count
    }
}

/// The delay wheel.
///
/// Any number of threads may [`add`](Self::add) concurrently; they share a
/// reader lock. [`rotate`](Self::rotate) takes the writer side, so it sees
/// every completed insertion and none in progress.
pub struct EventQueue {
    clock: Arc<dyn Clock>,
    lock: AccessLock,
    rings: Vec<EventRing>,
    parked: AtomicUsize,
    closed: AtomicBool,
}

impl EventQueue {
    /// A wheel with [`DEFAULT_GRANULARITIES`].
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_granularities(clock, &DEFAULT_GRANULARITIES)
    }

    /// A wheel with one ring per entry of `granularities`, which must be
    /// non-empty and ascending.
    pub fn with_granularities(clock: Arc<dyn Clock>, granularities: &[Duration]) -> Self {
        debug_assert!(!granularities.is_empty());
        debug_assert!(granularities.windows(2).all(|pair| pair[0] < pair[1]));
        let now = nanos(clock.now());
        Self {
            rings: granularities
                .iter()
                .map(|&granularity| EventRing::new(granularity, now))
                .collect(),
            clock,
            lock: AccessLock::new(),
            parked: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Current clock reading in nanoseconds.
    pub fn now(&self) -> u64 {
        nanos(self.clock.now())
    }

    /// The wheel's clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of rings.
    pub fn rings(&self) -> usize {
        self.rings.len()
    }

    /// Number of entries currently parked.
    pub fn len(&self) -> usize {
        self.parked.load(Ordering::Acquire)
    }

    /// Whether nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parks `value` until `due` (clock nanoseconds).
    ///
    /// Returns [`EventResult::Expired`] once the wheel has been closed by
    /// [`drain_all`](Self::drain_all), whatever the due time.
    pub fn add(&self, value: u32, due: u64) -> EventResult {
        let backoff = Backoff::new();
        while !self.lock.lock() {
            backoff.snooze();
        }
        let result = if self.closed.load(Ordering::Acquire) {
            EventResult::Expired
        } else {
            self.insert(value, due)
        };
        if let EventResult::Scheduled { .. } = result {
            self.parked.fetch_add(1, Ordering::AcqRel);
        }
        self.lock.unlock();
        result
    }

    /// Whether [`drain_all`](Self::drain_all) has closed the wheel.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn insert(&self, value: u32, due: u64) -> EventResult {
        if due <= self.now() {
            return EventResult::Expired;
        }

        let last = self.rings.len() - 1;
        for (index, ring) in self.rings.iter().enumerate() {
            let steps = ring.steps_until(due);
            let relative = if steps <= SECTORS as u64 {
                steps.max(1) as usize - 1
            } else if index == last || self.rings[index + 1].steps_until(due) == 0 {
                SECTORS - 1
            } else {
                continue;
            };

            return match ring.claim(relative, value) {
                Some(sector) => EventResult::Scheduled {
                    ring: index,
                    sector,
                },
                None => EventResult::Full,
            };
        }
        EventResult::Full
    }

    /// Releases every entry whose sector window has closed, coarse rings
    /// included. Released entries may still be due in the future; the caller
    /// re-adds those.
    pub fn rotate(&self) -> Vec<u32> {
        let _guard = self.lock.write();
        let now = self.now();
        let mut released = Vec::new();
        for ring in &self.rings {
            ring.rotate(now, &mut released);
        }
        self.parked.fetch_sub(released.len(), Ordering::AcqRel);
        released
    }

    /// Releases every parked entry regardless of its due time and closes the
    /// wheel to further adds.
    pub fn drain_all(&self) -> Vec<u32> {
        let _guard = self.lock.write();
        self.closed.store(true, Ordering::Release);
        let mut released = Vec::new();
        for ring in &self.rings {
            for sector in 0..SECTORS {
                ring.drain_sector(sector, &mut released);
            }
        }
        self.parked.fetch_sub(released.len(), Ordering::AcqRel);
        released
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("rings", &self.rings.len())
            .field("parked", &self.len())
            .finish()
    }
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::ManualClock;

    const MS: u64 = 1_000_000;

    fn wheel(granularities: &[Duration]) -> (Arc<ManualClock>, EventQueue) {
        let clock = Arc::new(ManualClock::new());
        let queue = EventQueue::with_granularities(clock.clone(), granularities);
        (clock, queue)
    }

    #[test]
    fn test_past_due_is_expired() {
        let (clock, queue) = wheel(&DEFAULT_GRANULARITIES);
        clock.advance(Duration::from_millis(5));
        assert_eq!(queue.add(1, 2 * MS), EventResult::Expired);
        assert_eq!(queue.add(1, 5 * MS), EventResult::Expired);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_picks_finest_ring_that_reaches() {
        let (_clock, queue) = wheel(&[
            Duration::from_millis(1),
            Duration::from_millis(16),
            Duration::from_millis(100),
        ]);

        assert_eq!(
            queue.add(1, 3 * MS),
            EventResult::Scheduled { ring: 0, sector: 2 }
        );
        assert_eq!(
            queue.add(2, 50 * MS),
            EventResult::Scheduled { ring: 1, sector: 2 }
        );
        // Just under one step of the finest ring.
        assert_eq!(
            queue.add(3, MS / 2),
            EventResult::Scheduled { ring: 0, sector: 0 }
        );
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_never_releases_early() {
        let (clock, queue) = wheel(&[Duration::from_millis(1), Duration::from_millis(16)]);
        let due = 50 * MS;
        assert!(matches!(queue.add(7, due), EventResult::Scheduled { ring: 1, .. }));

        let mut released_at = None;
        for step in 1..=60u64 {
            clock.advance(Duration::from_millis(1));
            let released = queue.rotate();
            for value in released {
                assert_eq!(value, 7);
                let now = step * MS;
                if now < due {
                    // Handed back early for re-insertion into a finer ring.
                    assert!(matches!(queue.add(value, due), EventResult::Scheduled { .. }));
                } else {
                    released_at = Some(now);
                }
            }
        }
        assert_eq!(released_at, Some(due));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_beyond_last_ring_parks_at_far_end() {
        let (_clock, queue) = wheel(&[Duration::from_millis(1)]);
        assert_eq!(
            queue.add(1, 100 * MS),
            EventResult::Scheduled { ring: 0, sector: 7 }
        );
    }

    #[test]
    fn test_full_sector_falls_back_then_reports_full() {
        let (_clock, queue) = wheel(&[Duration::from_millis(1)]);
        for value in 0..SECTOR_SLOTS as u32 {
            assert_eq!(
                queue.add(value, MS),
                EventResult::Scheduled { ring: 0, sector: 0 }
            );
        }
        assert_eq!(queue.add(99, MS), EventResult::Full);
        assert_eq!(
            queue.add(100, 2 * MS),
            EventResult::Scheduled { ring: 0, sector: 1 }
        );
    }

    #[test]
    fn test_drain_all() {
        let (_clock, queue) = wheel(&DEFAULT_GRANULARITIES);
        queue.add(1, 10 * MS);
        queue.add(2, 60_000 * MS);
        let mut drained = queue.drain_all();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert!(queue.is_empty());
        assert!(queue.is_closed());

        assert_eq!(queue.add(3, 10 * MS), EventResult::Expired);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_adds_during_rotation() {
        let clock = Arc::new(ManualClock::new());
        let queue = Arc::new(EventQueue::new(clock.clone()));
        let adders: Vec<_> = (0..4u32)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..50u32 {
                        let result = queue.add(t * 100 + i, 10 * MS + u64::from(i) * MS);
                        assert!(matches!(result, EventResult::Scheduled { .. }));
                    }
                })
            })
            .collect();
        for _ in 0..50 {
            queue.rotate();
        }
        for adder in adders {
            adder.join().expect("adder panicked");
        }
        assert_eq!(queue.len(), 200);
        assert_eq!(queue.drain_all().len(), 200);
    }

    #[test]
    fn test_parked_count_stays_bounded_while_rotating() {
        let clock = Arc::new(ManualClock::new());
        let queue = Arc::new(EventQueue::new(clock.clone()));
        let adders: Vec<_> = (0..4u32)
            .map(|t| {
                let queue = Arc::clone(&queue);
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || {
                    let mut scheduled = 0;
                    for i in 0..50u32 {
                        let due = nanos(clock.now()) + MS;
                        if let EventResult::Scheduled { .. } = queue.add(t * 100 + i, due) {
                            scheduled += 1;
                        }
                    }
                    scheduled
                })
            })
            .collect();

        let mut released = 0;
        for _ in 0..200 {
            clock.advance(Duration::from_micros(100));
            released += queue.rotate().len();
            assert!(queue.len() <= 200, "parked count wrapped: {}", queue.len());
        }
        let scheduled: usize = adders
            .into_iter()
            .map(|adder| adder.join().expect("adder panicked"))
            .sum();

        assert_eq!(released + queue.drain_all().len(), scheduled);
    }
}
