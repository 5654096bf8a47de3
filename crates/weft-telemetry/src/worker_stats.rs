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

//! Per-worker phase counters.

use crate::timer::CumulativeTimer;
use serde::Serialize;
use std::fmt;

/// Where a worker thread spent its time.
///
/// `total` spans the whole loop. The phases partition most of it: looking
/// for work, running task bodies, propagating completion to successors,
/// releasing the per-task arena, and yielding after a fruitless fetch.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WorkerTimers {
    /// Whole lifetime of the worker loop.
    pub total: CumulativeTimer,
    /// Time spent scanning the ready ring, successful or not.
    pub fetching: CumulativeTimer,
    /// Time spent inside task bodies.
    pub executing: CumulativeTimer,
    /// Time spent notifying forward tasks.
    pub dependency: CumulativeTimer,
    /// Time spent handing the thread arena's chunks back.
    pub memory: CumulativeTimer,
    /// Time spent yielding with nothing to run.
    pub idle: CumulativeTimer,
    /// Tasks executed.
    pub tasks_executed: u64,
    /// Fetch attempts that found no runnable task.
    pub fetch_misses: u64,
    /// Arena allocations still live when a task finished.
    pub leaked_allocations: u64,
}

impl WorkerTimers {
    /// Time inside the loop not attributed to any phase.
    pub fn unaccounted(&self) -> std::time::Duration {
        let phases = self.fetching.total()
            + self.executing.total()
            + self.dependency.total()
            + self.memory.total()
            + self.idle.total();
        self.total.total().saturating_sub(phases)
    }

    /// Adds another worker's counters to these.
    pub fn merge(&mut self, other: &Self) {
        self.total.merge(&other.total);
        self.fetching.merge(&other.fetching);
        self.executing.merge(&other.executing);
        self.dependency.merge(&other.dependency);
        self.memory.merge(&other.memory);
        self.idle.merge(&other.idle);
        self.tasks_executed += other.tasks_executed;
        self.fetch_misses += other.fetch_misses;
        self.leaked_allocations += other.leaked_allocations;
    }
}

impl fmt::Display for WorkerTimers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total: {}, fetching: {}, executing: {}, dependency: {}, memory: {}, idle: {}, \
             tasks: {}, fetch misses: {}, leaked: {}",
            self.total,
            self.fetching,
            self.executing,
            self.dependency,
            self.memory,
            self.idle,
            self.tasks_executed,
            self.fetch_misses,
            self.leaked_allocations
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_unaccounted_time() {
        let mut timers = WorkerTimers::default();
        timers.total.add(Duration::from_millis(10));
        timers.executing.add(Duration::from_millis(6));
        timers.idle.add(Duration::from_millis(3));
        assert_eq!(timers.unaccounted(), Duration::from_millis(1));
    }

    #[test]
    fn test_merge_sums_counters() {
        let mut a = WorkerTimers {
            tasks_executed: 3,
            ..Default::default()
        };
        let b = WorkerTimers {
            tasks_executed: 4,
            fetch_misses: 2,
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.tasks_executed, 7);
        assert_eq!(a.fetch_misses, 2);
        assert!(a.to_string().contains("tasks: 7"));
    }
}
