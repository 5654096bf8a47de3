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

//! Per-worker state handed to every task body.

use crate::list::TaskList;
use crate::task::{Task, TaskHandle};
use std::sync::Arc;
use weft_core::SchedulerError;
use weft_data::{GlobalMemory, ThreadMemory};

/// The worker a task runs on: its index, its private arena and the
/// scheduler it belongs to.
///
/// Passed by `&mut` into task bodies, so the arena needs no synchronization.
/// Chunks the arena claims during a task are handed back when the task
/// returns; nothing allocated from it may outlive the task.
pub struct WorkerContext {
    worker: u32,
    memory: ThreadMemory,
    scheduler: Arc<TaskList>,
}

impl WorkerContext {
    /// Builds the context of worker `worker` of `scheduler`.
    pub fn new(worker: u32, scheduler: Arc<TaskList>) -> Self {
        let memory = ThreadMemory::new(
            Arc::clone(scheduler.chunk_system()),
            format!("worker {worker}"),
        );
        Self {
            worker,
            memory,
            scheduler,
        }
    }

    /// Index of the worker, also its bit in thread masks.
    pub fn worker(&self) -> u32 {
        self.worker
    }

    /// The worker's private arena.
    pub fn memory(&mut self) -> &mut ThreadMemory {
        &mut self.memory
    }

    /// The process-wide shared arena.
    pub fn global(&self) -> &Arc<GlobalMemory> {
        self.scheduler.global_memory()
    }

    /// The scheduler running this worker.
    pub fn scheduler(&self) -> &Arc<TaskList> {
        &self.scheduler
    }

    /// Current size of the pool.
    pub fn thread_count(&self) -> u32 {
        self.scheduler.thread_count()
    }

    /// Submits a task from inside another task.
    pub fn add_task(
        &self,
        task: Task,
        dependencies: &[&TaskHandle],
    ) -> Result<TaskHandle, SchedulerError> {
        self.scheduler.add_task(task, dependencies)
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("worker", &self.worker)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}
