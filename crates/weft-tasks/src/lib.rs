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

//! # Weft Tasks
//!
//! The cooperative scheduler. Producers build [`Task`]s and submit them to a
//! [`TaskList`], optionally behind other tasks or after a delay. A
//! [`WorkerPool`] runs one OS thread per worker, each pulling ready tasks
//! from a sharded [`TaskRing`] and promoting successors as tasks complete.
//! Delayed tasks wait in the [`EventQueue`] until a rotation releases them.

#![warn(missing_docs)]

pub mod context;
pub mod driver;
pub mod event_queue;
pub mod list;
pub mod pool;
pub mod ring;
mod slots;
pub mod task;
pub mod task_id;
mod worker;

pub use context::WorkerContext;
pub use driver::RotationDriver;
pub use event_queue::{EventQueue, EventResult, DEFAULT_GRANULARITIES};
pub use list::TaskList;
pub use pool::WorkerPool;
pub use ring::{RingKind, TaskQueue, TaskRing};
pub use task::{Task, TaskHandle, MAX_FORWARD_TASKS};
pub use task_id::TaskId;
