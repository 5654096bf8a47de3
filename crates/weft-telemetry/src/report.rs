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

//! The summary a worker thread hands back when it exits.

use crate::task_times::TaskTimes;
use crate::worker_stats::WorkerTimers;
use serde::Serialize;

/// Everything a worker measured over its lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerReport {
    /// Index of the worker in its pool.
    pub worker: u32,
    /// Phase timers and counters.
    pub timers: WorkerTimers,
    /// Per-function task timings.
    pub task_times: TaskTimes,
}

impl WorkerReport {
    /// Logs the report at `info` level, the way workers do at exit.
    pub fn log(&self) {
        log::info!("worker {}: {}", self.worker, self.timers);
        self.task_times.log(&format!("worker {}: ", self.worker));
    }

    /// Serializes the report as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Pool-wide totals built from every worker's report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolReport {
    /// Number of worker reports merged.
    pub workers: u32,
    /// Sum of all workers' timers.
    pub timers: WorkerTimers,
    /// Merged task histogram.
    pub task_times: TaskTimes,
}

impl PoolReport {
    /// Folds one worker report into the totals.
    pub fn add(&mut self, report: &WorkerReport) {
        self.workers += 1;
        self.timers.merge(&report.timers);
        self.task_times.merge(&report.task_times);
    }

    /// Logs the totals and the merged histogram at `info` level.
    pub fn log(&self) {
        log::info!("pool ({} workers): {}", self.workers, self.timers);
        self.task_times.log("pool: ");
    }

    /// Serializes the totals as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
