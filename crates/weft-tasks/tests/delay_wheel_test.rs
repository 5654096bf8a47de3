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

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft_core::{Clock, ManualClock, RuntimeConfig};
use weft_tasks::{Task, TaskList, WorkerPool};

const TIMEOUT: Duration = Duration::from_secs(20);
const MS: Duration = Duration::from_millis(1);

fn wheel_scheduler() -> (Arc<ManualClock>, Arc<TaskList>) {
    let clock = Arc::new(ManualClock::new());
    let config = RuntimeConfig {
        memory: "16:64".parse().expect("valid chunk config"),
        max_tasks: 256,
        ..RuntimeConfig::default()
    };
    let granularities = [
        Duration::from_millis(1),
        Duration::from_millis(16),
        Duration::from_millis(100),
        Duration::from_secs(5),
        Duration::from_secs(60),
    ];
    let list = TaskList::with_granularities(&config, clock.clone(), &granularities);
    (clock, list)
}

fn drain(mut pool: WorkerPool) {
    pool.shutdown();
    assert!(pool.exit_fence().wait_timeout(TIMEOUT));
    pool.finish_shutdown();
}

#[test]
fn test_fifty_ms_delay_runs_once_after_rotations() {
    // --- 1. ARRANGE ---
    let (clock, list) = wheel_scheduler();
    let pool = WorkerPool::with_scheduler(Arc::clone(&list), 4).expect("pool starts");
    let runs = Arc::new(AtomicU32::new(0));
    let ran_at = Arc::new(AtomicU64::new(0));

    let counter = Arc::clone(&runs);
    let stamp = Arc::clone(&ran_at);
    let task_clock = Arc::clone(&clock);
    let handle = list
        .add_task(
            Task::new(move |_| {
                counter.fetch_add(1, Ordering::AcqRel);
                stamp.store(task_clock.now().as_millis() as u64, Ordering::Release);
            })
            .delay(Duration::from_millis(50)),
            &[],
        )
        .expect("accepted");

    // --- 2. ACT ---
    for step in 1..=60 {
        clock.advance(MS);
        list.rotate_events();
        if step < 50 {
            assert_eq!(list.ready_len(), 0, "released early at {step} ms");
            assert_eq!(runs.load(Ordering::Acquire), 0);
        }
    }

    // --- 3. ASSERT ---
    assert!(handle.wait_timeout(TIMEOUT));
    assert_eq!(runs.load(Ordering::Acquire), 1);
    assert!(ran_at.load(Ordering::Acquire) >= 50);
    assert_eq!(list.delayed_len(), 0);
    drain(pool);
    assert_eq!(runs.load(Ordering::Acquire), 1);
}

#[test]
fn test_delayed_predecessor_holds_back_successor() {
    let (clock, list) = wheel_scheduler();
    let pool = WorkerPool::with_scheduler(Arc::clone(&list), 2).expect("pool starts");

    let first = list
        .add_task(Task::new(|_| {}).delay(Duration::from_millis(10)), &[])
        .expect("accepted");
    let second = list
        .add_task(Task::new(|_| {}), &[&first])
        .expect("accepted");
    assert_eq!(list.blocked_len(), 1);

    for _ in 0..9 {
        clock.advance(MS);
        list.rotate_events();
    }
    assert!(!second.is_done());

    clock.advance(MS);
    list.rotate_events();
    assert!(second.wait_timeout(TIMEOUT));
    drain(pool);
}

fn ticker(count: Arc<AtomicU32>, limit: u32) -> Task {
    Task::new(move |ctx| {
        if count.fetch_add(1, Ordering::AcqRel) + 1 < limit {
            let next = ticker(Arc::clone(&count), limit).delay(MS);
            if ctx.add_task(next, &[]).is_err() {
                log::debug!("ticker stopped by shutdown");
            }
        }
    })
    .labeled("ticker")
}

#[test]
fn test_self_rescheduling_task_ticks_with_the_wheel() {
    let (clock, list) = wheel_scheduler();
    let pool = WorkerPool::with_scheduler(Arc::clone(&list), 2).expect("pool starts");
    let count = Arc::new(AtomicU32::new(0));

    list.add_task(ticker(Arc::clone(&count), 5), &[])
        .expect("accepted");

    let deadline = Instant::now() + TIMEOUT;
    while count.load(Ordering::Acquire) < 5 && Instant::now() < deadline {
        clock.advance(MS);
        list.rotate_events();
        std::thread::sleep(Duration::from_micros(200));
    }

    assert_eq!(count.load(Ordering::Acquire), 5);
    drain(pool);
    assert_eq!(count.load(Ordering::Acquire), 5);
}
