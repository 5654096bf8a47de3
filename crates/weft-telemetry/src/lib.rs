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

//! # Weft Telemetry
//!
//! Diagnostics collected by worker threads: cumulative phase timers, a
//! per-task-function time histogram and the report each worker hands back
//! when it exits.

#![warn(missing_docs)]

pub mod report;
pub mod task_times;
pub mod timer;
pub mod worker_stats;

pub use report::{PoolReport, WorkerReport};
pub use task_times::{TaskTime, TaskTimes};
pub use timer::{CumulativeTimer, ScopedTimer};
pub use worker_stats::WorkerTimers;
