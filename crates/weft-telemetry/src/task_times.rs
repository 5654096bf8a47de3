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

//! Execution counts and durations keyed by task function.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Aggregate timings of one task function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskTime {
    /// Number of executions.
    pub count: u64,
    /// Sum of execution times.
    pub total: Duration,
    /// Longest single execution.
    pub max: Duration,
}

impl TaskTime {
    /// Mean execution time.
    pub fn average(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total / count,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }

    fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.total += other.total;
        self.max = self.max.max(other.max);
    }
}

/// A histogram of task executions keyed by the task's label.
///
/// Labels default to the type name of the task's closure, so every distinct
/// task function gets its own bucket.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskTimes {
    entries: HashMap<&'static str, TaskTime>,
}

impl TaskTimes {
    /// Creates an empty histogram.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one execution of `label`.
    pub fn record(&mut self, label: &'static str, elapsed: Duration) {
        let entry = self.entries.entry(label).or_default();
        entry.count += 1;
        entry.total += elapsed;
        entry.max = entry.max.max(elapsed);
    }

    /// Folds another histogram into this one.
    pub fn merge(&mut self, other: &Self) {
        for (label, time) in &other.entries {
            self.entries.entry(*label).or_default().merge(time);
        }
    }

    /// Timings of `label`, if it ever ran.
    pub fn get(&self, label: &str) -> Option<&TaskTime> {
        self.entries.get(label)
    }

    /// Number of distinct task labels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no task has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total executions across all labels.
    pub fn total_count(&self) -> u64 {
        self.entries.values().map(|time| time.count).sum()
    }

    /// Entries sorted by total time, longest first.
    pub fn sorted(&self) -> Vec<(&'static str, TaskTime)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by(|a, b| b.1.total.cmp(&a.1.total).then(a.0.cmp(b.0)));
        entries
    }

    /// Logs one line per label at `info` level.
    pub fn log(&self, prefix: &str) {
        for (label, time) in self.sorted() {
            log::info!(
                "{prefix}{label}: avg: {:?}, count: {}, time: {:?}, max: {:?}",
                time.average(),
                time.count,
                time.total,
                time.max
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_average() {
        let mut times = TaskTimes::new();
        times.record("a", Duration::from_millis(2));
        times.record("a", Duration::from_millis(4));
        times.record("b", Duration::from_millis(1));

        let a = times.get("a").expect("a recorded");
        assert_eq!(a.count, 2);
        assert_eq!(a.average(), Duration::from_millis(3));
        assert_eq!(a.max, Duration::from_millis(4));
        assert_eq!(times.total_count(), 3);
        assert_eq!(times.sorted()[0].0, "a");
    }

    #[test]
    fn test_merge_combines_buckets() {
        let mut left = TaskTimes::new();
        left.record("shared", Duration::from_millis(1));
        let mut right = TaskTimes::new();
        right.record("shared", Duration::from_millis(5));
        right.record("only-right", Duration::from_millis(1));

        left.merge(&right);
        assert_eq!(left.len(), 2);
        let shared = left.get("shared").expect("shared recorded");
        assert_eq!(shared.count, 2);
        assert_eq!(shared.max, Duration::from_millis(5));
    }

    #[test]
    fn test_empty_average_is_zero() {
        assert_eq!(TaskTime::default().average(), Duration::ZERO);
        assert!(TaskTimes::new().is_empty());
    }
}
