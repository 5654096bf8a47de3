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

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use weft_core::{Barrier, FenceMain, RuntimeConfig, SchedulerError};
use weft_tasks::{Task, TaskHandle, WorkerPool};

const TIMEOUT: Duration = Duration::from_secs(20);

fn config(threads: u32) -> RuntimeConfig {
    RuntimeConfig {
        thread_count: threads,
        memory: "16:256 1024:8".parse().expect("valid chunk config"),
        max_tasks: 4096,
        ..RuntimeConfig::default()
    }
}

fn finish(mut pool: WorkerPool) -> weft_telemetry::PoolReport {
    pool.shutdown();
    assert!(pool.exit_fence().wait_timeout(TIMEOUT), "pool did not drain");
    pool.finish_shutdown()
}

#[test]
fn test_successor_never_starts_before_predecessor() {
    // --- 1. ARRANGE ---
    let pool = WorkerPool::new(&config(16)).expect("pool starts");
    let scheduler = Arc::clone(pool.scheduler());
    let violations = Arc::new(AtomicUsize::new(0));

    // --- 2. ACT ---
    // Submit many A -> B pairs while every worker is competing for them.
    let mut handles = Vec::new();
    for _ in 0..500 {
        let a_done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&a_done);
        let a = scheduler
            .add_task(
                Task::new(move |_| {
                    std::hint::spin_loop();
                    flag.store(true, Ordering::Release);
                })
                .labeled("a"),
                &[],
            )
            .expect("a accepted");

        let violations = Arc::clone(&violations);
        let a_handle = a.clone();
        let b = scheduler
            .add_task(
                Task::new(move |_| {
                    if !a_done.load(Ordering::Acquire) || !a_handle.is_done() {
                        violations.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .labeled("b"),
                &[&a],
            )
            .expect("b accepted");
        handles.push(b);
    }

    // --- 3. ASSERT ---
    for handle in &handles {
        assert!(handle.wait_timeout(TIMEOUT));
    }
    assert_eq!(violations.load(Ordering::Relaxed), 0);
    let report = finish(pool);
    assert_eq!(report.timers.tasks_executed, 1000);
    assert_eq!(report.task_times.get("a").map(|t| t.count), Some(500));
}

#[test]
fn test_every_task_runs_exactly_once() {
    let pool = WorkerPool::new(&config(8)).expect("pool starts");
    let runs: Arc<Vec<AtomicU32>> = Arc::new((0..2000).map(|_| AtomicU32::new(0)).collect());

    let handles: Vec<TaskHandle> = (0..2000)
        .map(|i| {
            let runs = Arc::clone(&runs);
            pool.scheduler()
                .add_task(
                    Task::new(move |_| {
                        runs[i].fetch_add(1, Ordering::Relaxed);
                    }),
                    &[],
                )
                .expect("accepted")
        })
        .collect();
    for handle in &handles {
        assert!(handle.wait_timeout(TIMEOUT));
    }

    finish(pool);
    assert!(runs.iter().all(|count| count.load(Ordering::Relaxed) == 1));
}

#[test]
fn test_fan_in_waits_for_every_predecessor() {
    let pool = WorkerPool::new(&config(4)).expect("pool starts");
    let finished = Arc::new(AtomicU32::new(0));

    let predecessors: Vec<TaskHandle> = (0..12)
        .map(|_| {
            let finished = Arc::clone(&finished);
            pool.scheduler()
                .add_task(
                    Task::new(move |_| {
                        finished.fetch_add(1, Ordering::AcqRel);
                    }),
                    &[],
                )
                .expect("accepted")
        })
        .collect();
    let seen = Arc::new(AtomicU32::new(0));
    let observed = Arc::clone(&seen);
    let observed_by = Arc::clone(&finished);
    let refs: Vec<&TaskHandle> = predecessors.iter().collect();
    let join = pool
        .scheduler()
        .add_task(
            Task::new(move |_| {
                observed.store(observed_by.load(Ordering::Acquire), Ordering::Release);
            }),
            &refs,
        )
        .expect("accepted");

    assert!(join.wait_timeout(TIMEOUT));
    assert_eq!(seen.load(Ordering::Acquire), 12);
    finish(pool);
}

#[test]
fn test_pinned_tasks_run_on_their_worker() {
    let pool = WorkerPool::new(&config(4)).expect("pool starts");
    let workers = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<TaskHandle> = (0..40)
        .map(|_| {
            let workers = Arc::clone(&workers);
            pool.scheduler()
                .add_task(
                    Task::new(move |ctx| workers.lock().expect("poisoned").push(ctx.worker()))
                        .thread_mask(1 << 2),
                    &[],
                )
                .expect("accepted")
        })
        .collect();
    for handle in &handles {
        assert!(handle.wait_timeout(TIMEOUT));
    }

    assert!(workers.lock().expect("poisoned").iter().all(|&w| w == 2));
    finish(pool);
}

#[test]
fn test_barrier_rendezvous_across_pinned_workers() {
    let pool = WorkerPool::new(&config(4)).expect("pool starts");
    let barrier = Arc::new(Barrier::new());
    let leaders = Arc::new(AtomicU32::new(0));
    let batch = Arc::new(FenceMain::new(4));

    for worker in 0..4 {
        let barrier = Arc::clone(&barrier);
        let leaders = Arc::clone(&leaders);
        pool.scheduler()
            .add_task(
                Task::new(move |_| {
                    if barrier.wait(4) {
                        leaders.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .thread_mask(1 << worker)
                .fence(batch.view()),
                &[],
            )
            .expect("accepted");
    }

    assert!(batch.view().wait_timeout(TIMEOUT));
    assert_eq!(leaders.load(Ordering::Relaxed), 1);
    assert_eq!(barrier.generation(), 1);
    finish(pool);
}

#[test]
fn test_all_others_mask_avoids_submitting_worker() {
    let pool = WorkerPool::new(&config(4)).expect("pool starts");
    let parent_worker = Arc::new(AtomicU32::new(u32::MAX));
    let child_worker = Arc::new(AtomicU32::new(u32::MAX));
    let done = Arc::new(FenceMain::new(1));

    let parent = Arc::clone(&parent_worker);
    let child = Arc::clone(&child_worker);
    let fence = done.view();
    pool.scheduler()
        .add_task(
            Task::new(move |ctx| {
                parent.store(ctx.worker(), Ordering::Release);
                let task = Task::new(move |ctx| child.store(ctx.worker(), Ordering::Release))
                    .thread_mask_all_others(ctx)
                    .fence(fence);
                ctx.add_task(task, &[]).expect("child accepted");
            }),
            &[],
        )
        .expect("accepted");

    assert!(done.view().wait_timeout(TIMEOUT));
    assert_ne!(
        parent_worker.load(Ordering::Acquire),
        child_worker.load(Ordering::Acquire)
    );
    finish(pool);
}

#[test]
fn test_shutdown_runs_remaining_work_and_rejects_new() {
    // --- 1. ARRANGE ---
    let pool = WorkerPool::new(&config(2)).expect("pool starts");
    let gate = Arc::new(AtomicBool::new(false));
    let open = Arc::clone(&gate);
    let blocker = pool
        .scheduler()
        .add_task(
            Task::new(move |_| {
                while !open.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
            }),
            &[],
        )
        .expect("accepted");
    let follower = pool
        .scheduler()
        .add_task(Task::new(|_| {}), &[&blocker])
        .expect("accepted");
    let delayed = pool
        .scheduler()
        .add_task(Task::new(|_| {}).delay(Duration::from_secs(3600)), &[])
        .expect("accepted");

    // --- 2. ACT ---
    pool.shutdown();
    let rejected = pool.scheduler().add_task(Task::new(|_| {}), &[]);
    let cleanup = pool
        .scheduler()
        .add_task(Task::new(|_| {}).shutdown_task(), &[])
        .expect("shutdown tasks are accepted");
    assert!(!pool.exit_fence().is_done());
    gate.store(true, Ordering::Release);

    // --- 3. ASSERT ---
    assert_eq!(rejected.map(|_| ()), Err(SchedulerError::ShuttingDown));
    assert!(pool.exit_fence().wait_timeout(TIMEOUT));
    for handle in [&blocker, &follower, &delayed, &cleanup] {
        assert!(handle.is_done());
    }
    let mut pool = pool;
    let report = pool.finish_shutdown();
    assert_eq!(report.workers, 2);
    assert_eq!(report.timers.tasks_executed, 4);
}
