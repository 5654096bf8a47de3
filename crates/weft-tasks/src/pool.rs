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

//! Worker thread lifecycle: spawning, resizing and the shutdown sequence.

use crate::context::WorkerContext;
use crate::list::TaskList;
use crate::worker::Worker;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread;
use weft_core::config::MAX_THREADS;
use weft_core::{fatal, Fence, MonotonicClock, RuntimeConfig, SchedulerError};
use weft_telemetry::{PoolReport, WorkerReport};

/// The OS threads running a [`TaskList`].
///
/// Shutdown goes in three steps: [`shutdown`](Self::shutdown) stops new
/// submissions, the caller waits on [`exit_fence`](Self::exit_fence) for the
/// remaining tasks, then [`finish_shutdown`](Self::finish_shutdown) joins the
/// threads and gathers their reports.
pub struct WorkerPool {
    scheduler: Arc<TaskList>,
    /// Indexed by worker. Retired workers keep their handle until joined.
    handles: Vec<Option<thread::JoinHandle<()>>>,
    reports_tx: Sender<WorkerReport>,
    reports_rx: Receiver<WorkerReport>,
    finished: bool,
}

impl WorkerPool {
    /// Builds a scheduler from `config` on the monotonic clock and starts
    /// `config.resolved_thread_count()` workers.
    pub fn new(config: &RuntimeConfig) -> Result<Self, SchedulerError> {
        let scheduler = TaskList::new(config, Arc::new(MonotonicClock::new()));
        Self::with_scheduler(scheduler, config.resolved_thread_count())
    }

    /// Starts `thread_count` workers on an existing scheduler.
    pub fn with_scheduler(
        scheduler: Arc<TaskList>,
        thread_count: u32,
    ) -> Result<Self, SchedulerError> {
        let (reports_tx, reports_rx) = crossbeam_channel::unbounded();
        let mut pool = Self {
            scheduler,
            handles: (0..MAX_THREADS).map(|_| None).collect(),
            reports_tx,
            reports_rx,
            finished: false,
        };
        pool.adjust_thread_count(thread_count)?;
        Ok(pool)
    }

    /// Resizes the pool, returning the new size.
    ///
    /// Growing spawns workers right away. Shrinking asks the excess workers
    /// to leave after their current task; they are joined later.
    pub fn adjust_thread_count(&mut self, requested: u32) -> Result<u32, SchedulerError> {
        if requested == 0 {
            log::warn!("Thread count can't be 0");
            return Err(SchedulerError::InvalidThreadCount);
        }
        if self.scheduler.is_exiting() {
            return Err(SchedulerError::ShuttingDown);
        }
        let count = if requested > MAX_THREADS {
            log::warn!(
                "Maximum thread count exceeded: {requested} > {MAX_THREADS}, setting to {MAX_THREADS}"
            );
            MAX_THREADS
        } else {
            requested
        };

        let current = self.scheduler.thread_count();
        if count > current {
            self.scheduler.set_thread_count(count);
            for worker in current..count {
                self.spawn(worker);
            }
        } else if count < current {
            for worker in count..current {
                self.scheduler.set_retiring(worker, true);
            }
            self.scheduler.set_thread_count(count);
        }

        if count != current {
            log::info!("Worker pool resized from {current} to {count} threads");
        }
        Ok(count)
    }

    fn spawn(&mut self, worker: u32) {
        let slot = &mut self.handles[worker as usize];
        // A retired worker may still be finishing its last task.
        if let Some(previous) = slot.take() {
            if previous.join().is_err() {
                log::error!("Worker {worker} panicked");
            }
        }
        self.scheduler.set_retiring(worker, false);

        let ctx = WorkerContext::new(worker, Arc::clone(&self.scheduler));
        let runner = Worker::new(ctx, self.reports_tx.clone());
        let spawned = thread::Builder::new()
            .name(format!("weft-worker-{worker}"))
            .spawn(move || runner.run());
        match spawned {
            Ok(handle) => *slot = Some(handle),
            Err(err) => fatal(format!("Failed to spawn worker {worker}: {err}")),
        }
    }

    /// The scheduler the workers pull from.
    pub fn scheduler(&self) -> &Arc<TaskList> {
        &self.scheduler
    }

    /// Current number of workers.
    pub fn thread_count(&self) -> u32 {
        self.scheduler.thread_count()
    }

    /// Stops accepting new tasks other than shutdown tasks.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// Completes once every outstanding task has run after shutdown.
    pub fn exit_fence(&self) -> Fence {
        self.scheduler.exit_fence()
    }

    /// Joins every worker and merges their reports. Shuts the scheduler down
    /// first if that has not happened yet.
    pub fn finish_shutdown(&mut self) -> PoolReport {
        if !self.scheduler.is_exiting() {
            log::warn!("finish_shutdown called before shutdown");
            self.scheduler.shutdown();
        }

        for (worker, handle) in self.handles.iter_mut().enumerate() {
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    log::error!("Worker {worker} panicked");
                }
            }
        }
        self.scheduler.set_thread_count(0);
        self.finished = true;

        let mut report = PoolReport::default();
        for worker in self.reports_rx.try_iter() {
            report.add(&worker);
        }
        report.log();

        let chunks = weft_core::memory::chunk_stats();
        log::info!(
            "Chunks claimed: {}, released: {}, exhaustion yields: {}",
            chunks.claimed,
            chunks.released,
            chunks.exhaustion_yields
        );
        report
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.finished {
            self.finish_shutdown();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.thread_count())
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
