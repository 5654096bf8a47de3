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

//! The per-thread fetch, execute, propagate and release loop.

use crate::context::WorkerContext;
use crate::task::Task;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use weft_telemetry::{TaskTimes, WorkerReport, WorkerTimers};

/// One worker thread's state.
pub(crate) struct Worker {
    ctx: WorkerContext,
    timers: WorkerTimers,
    task_times: TaskTimes,
    reports: Sender<WorkerReport>,
}

impl Worker {
    pub fn new(ctx: WorkerContext, reports: Sender<WorkerReport>) -> Self {
        Self {
            ctx,
            timers: WorkerTimers::default(),
            task_times: TaskTimes::new(),
            reports,
        }
    }

    /// Fetches and runs at most one task. Returns whether one ran.
    pub fn step(&mut self) -> bool {
        let scheduler = Arc::clone(self.ctx.scheduler());
        let worker = self.ctx.worker();

        let fetched = {
            let _fetching = self.timers.fetching.scope();
            scheduler.fetch(worker)
        };
        let Some(index) = fetched else {
            self.timers.fetch_misses += 1;
            let _idle = self.timers.idle.scope();
            thread::yield_now();
            return false;
        };

        let Task {
            body, label, fence, ..
        } = scheduler.take(index);
        let started = Instant::now();
        body(&mut self.ctx);
        let elapsed = started.elapsed();
        self.timers.executing.add(elapsed);
        self.task_times.record(label, elapsed);
        self.timers.tasks_executed += 1;

        {
            let _dependency = self.timers.dependency.scope();
            scheduler.complete(index, &fence);
        }

        let _memory = self.timers.memory.scope();
        let leaked = self.ctx.memory().free_all_chunks();
        if leaked > 0 {
            log::warn!("Worker {worker}: task {label} leaked {leaked} arena allocations");
            self.timers.leaked_allocations += leaked as u64;
        }
        true
    }

    /// Runs until the scheduler tells this worker to leave, then logs and
    /// sends its report.
    pub fn run(mut self) {
        let worker = self.ctx.worker();
        log::info!("Worker {worker} started");

        self.timers.total.start();
        while !self.ctx.scheduler().should_exit(worker) {
            self.step();
        }
        self.timers.total.stop();

        let report = WorkerReport {
            worker,
            timers: self.timers,
            task_times: self.task_times,
        };
        report.log();
        if self.reports.send(report).is_err() {
            log::warn!("Worker {worker}: pool is gone, report dropped");
        }
    }
}
