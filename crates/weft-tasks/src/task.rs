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

//! The schedulable unit and the handle producers keep after submitting it.

use crate::context::WorkerContext;
use std::fmt;
use std::time::Duration;
use weft_core::bits::low_mask;
use weft_core::Fence;

/// Capacity of a task's successor list.
pub const MAX_FORWARD_TASKS: usize = 18;

pub(crate) type TaskBody = Box<dyn FnOnce(&mut WorkerContext) + Send + 'static>;

/// A unit of work for the scheduler.
///
/// The body runs exactly once, on whichever eligible worker fetches the task,
/// and receives that worker's [`WorkerContext`]. Scheduling hints are chained
/// on before submission:
///
/// ```rust,ignore
/// let handle = scheduler.add_task(
///     Task::new(|ctx| upload(ctx)).labeled("upload").delay(Duration::from_millis(5)),
///     &[&previous],
/// )?;
/// handle.wait();
/// ```
pub struct Task {
    pub(crate) body: TaskBody,
    pub(crate) label: &'static str,
    pub(crate) fence: Fence,
    pub(crate) thread_mask: u64,
    pub(crate) delay: Option<Duration>,
    pub(crate) shutdown: bool,
}

impl Task {
    /// Wraps `body` in a task with its own single-count completion fence.
    /// The label defaults to the closure's type name.
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&mut WorkerContext) + Send + 'static,
    {
        Self {
            body: Box::new(body),
            label: std::any::type_name::<F>(),
            fence: Fence::single(),
            thread_mask: 0,
            delay: None,
            shutdown: false,
        }
    }

    /// Names the task in diagnostics and the task time table.
    pub fn labeled(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    /// Signals `fence` on completion instead of the task's own fence.
    ///
    /// Several tasks sharing views of one [`weft_core::FenceMain`] let a
    /// producer wait for the whole batch at once.
    pub fn fence(mut self, fence: Fence) -> Self {
        self.fence = fence;
        self
    }

    /// Holds the task back until `delay` has elapsed from submission.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Restricts the task to the workers whose bit is set in `mask`.
    /// 0 means any worker.
    pub fn thread_mask(mut self, mask: u64) -> Self {
        self.thread_mask = mask;
        self
    }

    /// Pins the task to the worker running `ctx`.
    pub fn thread_mask_current(self, ctx: &WorkerContext) -> Self {
        self.thread_mask(1 << ctx.worker())
    }

    /// Lets every worker but the one running `ctx` take the task. With a
    /// single worker this leaves the task unrestricted.
    pub fn thread_mask_all_others(self, ctx: &WorkerContext) -> Self {
        let all = low_mask(ctx.thread_count());
        self.thread_mask(all & !(1 << ctx.worker()))
    }

    /// Marks the task as part of shutdown, so it is accepted after
    /// [`TaskList::shutdown`](crate::TaskList::shutdown).
    pub fn shutdown_task(mut self) -> Self {
        self.shutdown = true;
        self
    }

    /// The fence signaled once the body has returned.
    pub fn completion(&self) -> &Fence {
        &self.fence
    }

    /// The task's label.
    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("thread_mask", &format_args!("{:#x}", self.thread_mask))
            .field("delay", &self.delay)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

/// What a producer keeps of a submitted task: something to wait on, and a
/// reference later submissions can depend on.
///
/// The default handle refers to no task; passing it as a dependency is a
/// usage error.
#[derive(Clone, Default)]
pub struct TaskHandle {
    pub(crate) index: u16,
    pub(crate) generation: u32,
    pub(crate) fence: Fence,
    pub(crate) label: &'static str,
}

impl TaskHandle {
    /// Blocks until the task has run.
    pub fn wait(&self) {
        self.fence.wait();
    }

    /// Blocks for at most `timeout`. Returns whether the task has run.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.fence.wait_timeout(timeout)
    }

    /// Whether the task has run.
    pub fn is_done(&self) -> bool {
        self.fence.is_done()
    }

    /// Whether the handle came from a submission.
    pub fn is_submitted(&self) -> bool {
        self.generation != 0
    }

    /// The task's completion fence.
    pub fn completion(&self) -> &Fence {
        &self.fence
    }

    /// Label of the task.
    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_submitted() {
            return f.write_str("TaskHandle(unsubmitted)");
        }
        write!(
            f,
            "TaskHandle({} @ {}#{})",
            self.label, self.index, self.generation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use weft_core::FenceMain;

    #[test]
    fn test_builder_sets_hints() {
        let task = Task::new(|_| {})
            .labeled("hinted")
            .delay(Duration::from_millis(3))
            .thread_mask(0b101)
            .shutdown_task();

        assert_eq!(task.label(), "hinted");
        assert_eq!(task.delay, Some(Duration::from_millis(3)));
        assert_eq!(task.thread_mask, 0b101);
        assert!(task.shutdown);
        assert!(!task.completion().is_done());
    }

    #[test]
    fn test_default_label_names_the_closure() {
        let task = Task::new(|_| {});
        assert!(task.label().contains("test_default_label_names_the_closure"));
    }

    #[test]
    fn test_shared_fence() {
        let main = Arc::new(FenceMain::new(2));
        let a = Task::new(|_| {}).fence(main.view());
        let b = Task::new(|_| {}).fence(main.view());

        a.completion().signal();
        assert!(!b.completion().is_done());
        b.completion().signal();
        assert!(a.completion().is_done());
    }

    #[test]
    fn test_default_handle_is_unsubmitted() {
        let handle = TaskHandle::default();
        assert!(!handle.is_submitted());
        assert!(handle.is_done());
        assert_eq!(format!("{handle:?}"), "TaskHandle(unsubmitted)");
    }
}
