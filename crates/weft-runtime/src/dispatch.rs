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

//! The periodic dispatch workload: a task that fans out a batch of
//! recording tasks, joins them behind a submit task, then re-enqueues itself
//! through the delay wheel.

use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft_core::SchedulerError;
use weft_data::SharedAllocation;
use weft_tasks::{Task, TaskHandle, WorkerContext};

/// Recording tasks per tick.
const BATCH: usize = 8;
/// Bytes of the shared frame buffer each recording task owns.
const REGION: usize = 64;
const SCRATCH: usize = 256;

/// Counters of the dispatch loop.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Ticks of the dispatch task.
    pub ticks: AtomicU64,
    /// Recording tasks completed.
    pub records: AtomicU64,
    /// Batches joined by a submit task.
    pub submits: AtomicU64,
}

/// Self-rescheduling producer driving the scheduler at a steady rate.
#[derive(Debug)]
pub struct Dispatcher {
    interval: Duration,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Creates a dispatcher ticking every `interval`.
    pub fn new(interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            interval,
            stats: Arc::new(DispatchStats::default()),
        })
    }

    /// Shared counters.
    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// The task running one tick.
    pub fn task(self: &Arc<Self>) -> Task {
        let this = Arc::clone(self);
        Task::new(move |ctx| this.tick(ctx)).labeled("dispatch")
    }

    fn tick(self: &Arc<Self>, ctx: &mut WorkerContext) {
        let tick = self.stats.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = ctx.global().alloc(BATCH * REGION, 64);

        let mut recorded = Vec::with_capacity(BATCH);
        for region in 0..BATCH {
            let frame = frame.clone();
            let stats = Arc::clone(&self.stats);
            let task = Task::new(move |ctx| record(ctx, &frame, region, tick, &stats))
                .labeled("record");
            match ctx.add_task(task, &[]) {
                Ok(handle) => recorded.push(handle),
                Err(SchedulerError::ShuttingDown) => return,
                Err(err) => log::warn!("Dispatch tick {tick}: recording task dropped: {err}"),
            }
        }

        let stats = Arc::clone(&self.stats);
        let submit = Task::new(move |_| {
            log::trace!("Submitting frame {tick} ({} bytes)", frame.len());
            stats.submits.fetch_add(1, Ordering::Relaxed);
        })
        .labeled("submit");
        let dependencies: Vec<&TaskHandle> = recorded.iter().collect();
        if let Err(err) = ctx.add_task(submit, &dependencies) {
            log::debug!("Dispatch tick {tick}: submit task dropped: {err}");
        }

        match ctx.add_task(self.task().delay(self.interval), &[]) {
            Ok(_) => {}
            Err(SchedulerError::ShuttingDown) => {
                log::info!("Dispatch loop stopped after {tick} ticks");
            }
            Err(err) => log::warn!("Dispatch tick {tick}: reschedule failed: {err}"),
        }
    }
}

/// Fills the task's region of the shared frame, staging the bytes in the
/// worker's arena first.
fn record(
    ctx: &mut WorkerContext,
    frame: &SharedAllocation,
    region: usize,
    tick: u64,
    stats: &DispatchStats,
) {
    let scratch = ctx.memory().alloc(SCRATCH, 16);
    let tag = (tick as u8).wrapping_add(region as u8);
    // SAFETY: `scratch` holds SCRATCH bytes and is freed exactly once here.
    // Each recording task writes only its own REGION of the frame, which
    // holds BATCH * REGION bytes.
    unsafe {
        ptr::write_bytes(scratch.as_ptr(), tag, SCRATCH);
        let target = frame.as_ptr().as_ptr().add(region * REGION);
        ptr::copy_nonoverlapping(scratch.as_ptr(), target, REGION);
        ctx.memory().free(scratch);
    }
    stats.records.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use weft_core::RuntimeConfig;
    use weft_tasks::{RotationDriver, WorkerPool};

    #[test]
    fn test_dispatch_loop_runs_until_shutdown() {
        // --- 1. ARRANGE ---
        let config = RuntimeConfig {
            thread_count: 4,
            memory: "16:64".parse().expect("valid chunk config"),
            max_tasks: 512,
            ..RuntimeConfig::default()
        };
        let mut pool = WorkerPool::new(&config).expect("pool starts");
        let mut driver =
            RotationDriver::new(Arc::clone(pool.scheduler()), Duration::from_micros(250));
        driver.start().expect("driver starts");
        let dispatcher = Dispatcher::new(Duration::from_millis(1));

        // --- 2. ACT ---
        pool.scheduler()
            .add_task(dispatcher.task(), &[])
            .expect("first tick accepted");
        thread::sleep(Duration::from_millis(200));
        pool.shutdown();
        assert!(pool.exit_fence().wait_timeout(Duration::from_secs(10)));
        driver.stop();
        pool.finish_shutdown();

        // --- 3. ASSERT ---
        // The tick running at shutdown and the flushed one may be partial.
        let stats = dispatcher.stats();
        let ticks = stats.ticks.load(Ordering::Relaxed);
        assert!(ticks >= 3, "only {ticks} ticks ran");
        assert!(stats.records.load(Ordering::Relaxed) >= (ticks - 2) * BATCH as u64);
        assert!(stats.submits.load(Ordering::Relaxed) >= ticks - 2);
    }
}
