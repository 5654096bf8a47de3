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

//! Background service that keeps the delay wheel turning.

use crate::list::TaskList;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Calls [`TaskList::rotate_events`] at a fixed period on its own thread.
///
/// Delayed tasks are released no later than one period after they fall due,
/// so the period bounds their lateness.
pub struct RotationDriver {
    scheduler: Arc<TaskList>,
    interval: Duration,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RotationDriver {
    /// Creates a stopped driver.
    pub fn new(scheduler: Arc<TaskList>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Starts the rotation thread. Does nothing if it is already running.
    pub fn start(&mut self) -> std::io::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let running = Arc::clone(&self.running);
        let scheduler = Arc::clone(&self.scheduler);
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name("weft-rotation".to_owned())
            .spawn(move || {
                log::info!("Rotation driver started ({interval:?} period)");
                let mut released = 0usize;
                while running.load(Ordering::Relaxed) {
                    let tick = Instant::now();
                    released += scheduler.rotate_events();

                    let elapsed = tick.elapsed();
                    if elapsed < interval {
                        thread::sleep(interval - elapsed);
                    }
                }
                log::info!("Rotation driver stopped after releasing {released} delayed tasks");
            });

        match spawned {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Stops the rotation thread and waits for it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Rotation driver thread panicked");
            }
        }
    }

    /// Whether the rotation thread is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for RotationDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
