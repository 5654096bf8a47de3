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

//! The scheduler: task submission, dependency resolution and the hand-off
//! between the forward ring, the delay wheel and the ready ring.

use crate::event_queue::{EventQueue, EventResult, DEFAULT_GRANULARITIES};
use crate::ring::{RingKind, TaskRing};
use crate::slots::{state, TaskSlots};
use crate::task::{Task, TaskHandle, MAX_FORWARD_TASKS};
use crate::task_id::TaskId;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft_core::bits::low_mask;
use weft_core::config::{MAX_TASKS, MAX_THREADS, MIN_TASKS};
use weft_core::{fatal, Clock, Fence, FenceMain, RuntimeConfig, SchedulerError};
use weft_data::{GlobalMemory, MemoryChunkSystem};

/// Owns every task from submission to completion.
///
/// A submitted task is in exactly one place at a time:
/// - the forward ring, while predecessors are outstanding; it is reachable
///   only through their forward lists,
/// - the delay wheel, while its due time is in the future,
/// - the ready ring, until a worker fetches it,
/// - a worker, while it runs.
///
/// There is no dispatcher thread. Whoever drops a task's dependency counter
/// to zero (the submitter, or the worker completing its last predecessor)
/// moves it on.
pub struct TaskList {
    slots: TaskSlots,
    ready: TaskRing,
    forward: TaskRing,
    events: EventQueue,
    chunks: Arc<MemoryChunkSystem>,
    global: Arc<GlobalMemory>,
    prefer_longest: bool,
    thread_count: AtomicU32,
    /// Tasks submitted and not yet completed.
    outstanding: AtomicUsize,
    exiting: AtomicBool,
    exit_signaled: AtomicBool,
    exit: Arc<FenceMain>,
    /// Workers asked to leave after their current task.
    retiring: [AtomicBool; MAX_THREADS as usize],
}

impl TaskList {
    /// Builds a scheduler, its chunk system and its shared arena from
    /// `config`, with the default delay wheel.
    pub fn new(config: &RuntimeConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_granularities(config, clock, &DEFAULT_GRANULARITIES)
    }

    /// Same as [`new`](Self::new) with custom delay wheel granularities,
    /// finest first.
    pub fn with_granularities(
        config: &RuntimeConfig,
        clock: Arc<dyn Clock>,
        granularities: &[Duration],
    ) -> Arc<Self> {
        let capacity = config
            .max_tasks
            .clamp(MIN_TASKS, MAX_TASKS)
            .next_power_of_two();
        let chunks = Arc::new(MemoryChunkSystem::new(&config.memory));
        let global = GlobalMemory::new(Arc::clone(&chunks));
        log::debug!(
            "Task list: {capacity} slots, chunk classes {}, {} delay rings",
            config.memory,
            granularities.len()
        );

        Arc::new(Self {
            slots: TaskSlots::new(capacity),
            ready: TaskRing::new(RingKind::Ready),
            forward: TaskRing::new(RingKind::Forward),
            events: EventQueue::with_granularities(clock, granularities),
            chunks,
            global,
            prefer_longest: config.prefer_longest_queue,
            thread_count: AtomicU32::new(0),
            outstanding: AtomicUsize::new(0),
            exiting: AtomicBool::new(false),
            exit_signaled: AtomicBool::new(false),
            exit: Arc::new(FenceMain::new(1)),
            retiring: std::array::from_fn(|_| AtomicBool::new(false)),
        })
    }

    /// Submits `task`, to run once every task in `dependencies` has run.
    ///
    /// Each dependency that has not run yet gets the task registered in its
    /// forward list. A dependency that has already started completing (its
    /// forward list is closed), or whose slot has since been reused, counts
    /// as satisfied.
    ///
    /// Returns [`SchedulerError::ShuttingDown`] after [`shutdown`](Self::shutdown)
    /// unless the task is a shutdown task submitted before the exit fence
    /// completed, and
    /// [`SchedulerError::TaskBufferExhausted`] when no slot is free. Passing
    /// a handle that never came from a submission, or registering more than
    /// [`MAX_FORWARD_TASKS`] successors on one task, is fatal.
    pub fn add_task(
        &self,
        task: Task,
        dependencies: &[&TaskHandle],
    ) -> Result<TaskHandle, SchedulerError> {
        if let Some(dependency) = dependencies.iter().find(|dep| !dep.is_submitted()) {
            let label = match dependency.label() {
                "" => "unnamed".to_owned(),
                label => label.to_owned(),
            };
            fatal(SchedulerError::UnsubmittedDependency { label });
        }

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.exiting.load(Ordering::SeqCst)
            && (!task.shutdown || self.exit_signaled.load(Ordering::SeqCst))
        {
            log::debug!("Dropping task {} submitted during shutdown", task.label);
            self.retire_outstanding();
            return Err(SchedulerError::ShuttingDown);
        }

        let (index, generation) = match self.slots.reserve() {
            Ok(reserved) => reserved,
            Err(err) => {
                log::warn!("Rejecting task {}: {err}", task.label);
                self.retire_outstanding();
                return Err(err);
            }
        };

        let slot = self.slots.get(index);
        slot.thread_mask
            .store(self.effective_mask(task.thread_mask, task.label), Ordering::Relaxed);
        if let Some(delay) = task.delay {
            let due = self.events.now().saturating_add(duration_nanos(delay));
            slot.due.store(due, Ordering::Relaxed);
        }

        let handle = TaskHandle {
            index,
            generation,
            fence: task.fence.clone(),
            label: task.label,
        };
        // SAFETY: the slot was just reserved and is not in any ring yet.
        unsafe { slot.put(task) };

        let linked = dependencies
            .iter()
            .filter(|dependency| self.link(dependency, &handle))
            .count();
        if linked > 0 {
            slot.set_state(state::PENDING);
            let id = self
                .forward
                .push(index)
                .unwrap_or_else(|| fatal(format!("Forward ring full while parking {handle:?}")));
            slot.location.store(id.bits(), Ordering::Release);
        }

        // Removing the submission bias.
        if slot.dependencies.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.make_runnable(index);
        }
        Ok(handle)
    }

    /// Submits `groups` as a chain of stages: every task of a group depends
    /// on every task of the group before it. Returns the handles per group.
    ///
    /// Each task of a group becomes a forward task of every task in the
    /// previous group, so a group may hold at most [`MAX_FORWARD_TASKS`]
    /// tasks when another group follows it. On error the tasks already
    /// submitted still run.
    pub fn add_tasks<G>(&self, groups: G) -> Result<Vec<Vec<TaskHandle>>, SchedulerError>
    where
        G: IntoIterator,
        G::Item: IntoIterator<Item = Task>,
    {
        let mut stages: Vec<Vec<TaskHandle>> = Vec::new();
        for group in groups {
            let handles = {
                let previous: Vec<&TaskHandle> =
                    stages.last().map(|stage| stage.iter().collect()).unwrap_or_default();
                group
                    .into_iter()
                    .map(|task| self.add_task(task, &previous))
                    .collect::<Result<Vec<_>, _>>()?
            };
            stages.push(handles);
        }
        Ok(stages)
    }

    /// Registers `successor` in the forward list of `dependency`. Returns
    /// whether the successor now waits on it.
    fn link(&self, dependency: &TaskHandle, successor: &TaskHandle) -> bool {
        let slot = self.slots.get(dependency.index);
        if slot.generation.load(Ordering::Acquire) != dependency.generation {
            return false;
        }
        if !slot.forward_lock.lock() {
            return false;
        }
        // The slot may have been recycled between the check and the lock.
        if slot.generation.load(Ordering::Acquire) != dependency.generation {
            slot.forward_lock.unlock();
            return false;
        }

        let position = slot.forward_count.fetch_add(1, Ordering::AcqRel) as usize;
        if position >= MAX_FORWARD_TASKS {
            slot.forward_lock.unlock();
            fatal(SchedulerError::ForwardTasksFull {
                label: dependency.label,
                capacity: MAX_FORWARD_TASKS,
            });
        }

        // Counted before it becomes visible to the completing worker.
        self.slots
            .get(successor.index)
            .dependencies
            .fetch_add(1, Ordering::AcqRel);
        slot.forward[position].store(successor.index, Ordering::Release);
        slot.forward_lock.unlock();
        log::trace!("Linked {successor:?} behind {dependency:?}");
        true
    }

    fn effective_mask(&self, mask: u64, label: &str) -> u64 {
        if mask == 0 {
            return 0;
        }
        let active = low_mask(self.thread_count());
        if active != 0 && mask & active == 0 {
            log::warn!(
                "Task {label} thread mask {mask:#x} matches no running worker, any worker may run it"
            );
            return 0;
        }
        mask
    }

    /// Called once per completed predecessor of the task in `index`.
    fn finish_dependency(&self, index: u16) {
        if self.slots.get(index).dependencies.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.make_runnable(index);
        }
    }

    /// Moves a task whose dependencies are all met to the delay wheel or the
    /// ready ring.
    fn make_runnable(&self, index: u16) {
        let slot = self.slots.get(index);
        let location = TaskId::from_bits(
            slot.location
                .swap(TaskId::UNALLOCATED.bits(), Ordering::AcqRel),
        );
        if location.is_allocated() {
            self.forward.remove(location);
        }

        if !self.park(index, slot.due.load(Ordering::Acquire)) {
            self.push_ready(index);
        }
    }

    /// Parks a task in the delay wheel until `due`. Returns `false` when it
    /// should run now instead: not delayed, shutting down, or no room left.
    fn park(&self, index: u16, due: u64) -> bool {
        if due <= self.events.now() || self.exiting.load(Ordering::Acquire) {
            return false;
        }
        let slot = self.slots.get(index);
        slot.set_state(state::DELAYED);
        match self.events.add(u32::from(index), due) {
            EventResult::Scheduled { .. } => return true,
            EventResult::Expired if self.events.is_closed() => {
                log::debug!("Delay wheel closed, running task in slot {index} now");
            }
            EventResult::Expired => {
                log::warn!("Delayed task in slot {index} expired before it was parked");
            }
            EventResult::Full => {
                log::warn!("Delay wheel full, running task in slot {index} now");
                return false;
            }
        }
        slot.expired.store(true, Ordering::Release);
        false
    }

    fn push_ready(&self, index: u16) {
        self.slots.get(index).set_state(state::READY);
        if self.ready.push(index).is_none() {
            fatal(format!("Ready ring full while pushing slot {index}"));
        }
    }

    /// Releases delayed tasks whose time has come into the ready ring, and
    /// re-parks those handed back early by a coarse ring. Returns how many
    /// tasks became ready.
    pub fn rotate_events(&self) -> usize {
        let released = self.events.rotate();
        let mut promoted = 0;
        for value in released {
            let index = value as u16;
            if self.park(index, self.slots.get(index).due.load(Ordering::Acquire)) {
                continue;
            }
            self.push_ready(index);
            promoted += 1;
        }
        if promoted > 0 {
            log::trace!("Rotation released {promoted} delayed tasks");
        }
        promoted
    }

    /// Takes a ready task `worker` may run.
    pub(crate) fn fetch(&self, worker: u32) -> Option<u16> {
        let bit = 1u64 << worker;
        let active = low_mask(self.thread_count());
        self.ready.fetch(self.prefer_longest, |index| {
            let mask = self.slots.get(index).thread_mask.load(Ordering::Relaxed);
            // A mask naming no live worker would strand the task.
            mask == 0 || mask & bit != 0 || mask & active == 0
        })
    }

    /// Takes the body of a fetched task.
    pub(crate) fn take(&self, index: u16) -> Task {
        let slot = self.slots.get(index);
        slot.set_state(state::RUNNING);
        // SAFETY: `index` was fetched from the ready ring by the caller,
        // which is the only one to hold it.
        let task = unsafe { slot.take() };
        let Some(task) = task else {
            fatal(format!("Fetched task slot {index} holds no task"));
        };
        if slot.expired.load(Ordering::Acquire) {
            log::debug!("Running expired task {}", task.label);
        }
        task
    }

    /// Signals `fence`, closes the task's forward list, promotes its
    /// successors and frees the slot.
    pub(crate) fn complete(&self, index: u16, fence: &Fence) {
        fence.signal();

        let slot = self.slots.get(index);
        slot.forward_lock.finish();
        let count = (slot.forward_count.load(Ordering::Acquire) as usize).min(MAX_FORWARD_TASKS);
        for position in 0..count {
            let successor = slot.forward[position].load(Ordering::Acquire);
            self.finish_dependency(successor);
        }

        self.slots.release(index);
        self.retire_outstanding();
    }

    fn retire_outstanding(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.maybe_finish();
    }

    fn maybe_finish(&self) {
        if self.exiting.load(Ordering::SeqCst)
            && self.outstanding.load(Ordering::SeqCst) == 0
            && !self.exit_signaled.swap(true, Ordering::SeqCst)
        {
            log::info!("All tasks finished, signaling exit");
            self.exit.signal();
        }
    }

    /// Stops accepting new work other than shutdown tasks.
    ///
    /// Tasks already submitted still run, delayed ones immediately. The
    /// exit fence completes once none is left.
    pub fn shutdown(&self) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            log::warn!("Shutdown has already been called");
            return;
        }
        log::info!(
            "Scheduler shutting down with {} outstanding tasks",
            self.outstanding()
        );

        let flushed = self.events.drain_all();
        if !flushed.is_empty() {
            log::warn!("Running {} delayed tasks early for shutdown", flushed.len());
        }
        for value in flushed {
            let index = value as u16;
            self.slots.get(index).expired.store(true, Ordering::Release);
            self.push_ready(index);
        }
        self.maybe_finish();
    }

    /// Completes once [`shutdown`](Self::shutdown) has been called and every
    /// outstanding task has run.
    pub fn exit_fence(&self) -> Fence {
        self.exit.view()
    }

    /// Whether `worker` should leave its loop.
    pub fn should_exit(&self, worker: u32) -> bool {
        self.retiring[worker as usize].load(Ordering::Acquire)
            || (self.exiting.load(Ordering::Acquire) && self.outstanding() == 0)
    }

    pub(crate) fn set_retiring(&self, worker: u32, retiring: bool) {
        self.retiring[worker as usize].store(retiring, Ordering::Release);
    }

    pub(crate) fn set_thread_count(&self, count: u32) {
        self.thread_count.store(count, Ordering::Release);
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    /// Workers currently in the pool.
    pub fn thread_count(&self) -> u32 {
        self.thread_count.load(Ordering::Acquire)
    }

    /// Tasks submitted and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Capacity of the task buffer.
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Tasks waiting for a worker.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Tasks waiting for predecessors.
    pub fn blocked_len(&self) -> usize {
        self.forward.len()
    }

    /// Tasks parked in the delay wheel.
    pub fn delayed_len(&self) -> usize {
        self.events.len()
    }

    /// The delay wheel.
    pub fn event_queue(&self) -> &EventQueue {
        &self.events
    }

    /// The chunk system behind every arena.
    pub fn chunk_system(&self) -> &Arc<MemoryChunkSystem> {
        &self.chunks
    }

    /// The shared arena.
    pub fn global_memory(&self) -> &Arc<GlobalMemory> {
        &self.global
    }
}

impl fmt::Debug for TaskList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskList")
            .field("capacity", &self.capacity())
            .field("outstanding", &self.outstanding())
            .field("ready", &self.ready_len())
            .field("blocked", &self.blocked_len())
            .field("delayed", &self.delayed_len())
            .field("exiting", &self.is_exiting())
            .finish()
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
