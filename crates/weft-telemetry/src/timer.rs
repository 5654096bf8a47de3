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

//! Cumulative timers and an RAII guard to feed them.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Accumulates time across any number of start/stop intervals.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CumulativeTimer {
    total: Duration,
    intervals: u64,
    #[serde(skip)]
    started: Option<Instant>,
}

impl CumulativeTimer {
    /// Creates a stopped timer with nothing accumulated.
    pub const fn new() -> Self {
        Self {
            total: Duration::ZERO,
            intervals: 0,
            started: None,
        }
    }

    /// Starts an interval. Restarting a running timer discards the open
    /// interval.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Ends the open interval and returns its length.
    pub fn stop(&mut self) -> Duration {
        let Some(started) = self.started.take() else {
            return Duration::ZERO;
        };
        let elapsed = started.elapsed();
        self.add(elapsed);
        elapsed
    }

    /// Adds an externally measured interval.
    pub fn add(&mut self, elapsed: Duration) {
        self.total += elapsed;
        self.intervals += 1;
    }

    /// Total accumulated time.
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Number of intervals accumulated.
    pub fn intervals(&self) -> u64 {
        self.intervals
    }

    /// Whether an interval is open.
    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Merges another timer's closed intervals into this one.
    pub fn merge(&mut self, other: &Self) {
        self.total += other.total;
        self.intervals += other.intervals;
    }

    /// Times a scope: the interval closes when the guard drops.
    pub fn scope(&mut self) -> ScopedTimer<'_> {
        ScopedTimer::new(self)
    }
}

impl fmt::Display for CumulativeTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.total.as_secs_f64() * 1000.0)
    }
}

/// Records the duration of a scope into a [`CumulativeTimer`] when dropped.
///
/// The measurement is recorded on every exit path, early returns and
/// unwinding included.
pub struct ScopedTimer<'a> {
    started: Instant,
    timer: &'a mut CumulativeTimer,
}

impl<'a> ScopedTimer<'a> {
    /// Starts timing immediately.
    pub fn new(timer: &'a mut CumulativeTimer) -> Self {
        Self {
            started: Instant::now(),
            timer,
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        self.timer.add(self.started.elapsed());
    }
}
