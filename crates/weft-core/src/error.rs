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

//! Error taxonomy of the runtime.
//!
//! Recoverable conditions are returned as one of the enums below. Conditions
//! that mean memory corruption or scheduler misuse go through [`fatal`]
//! instead: the runtime cannot keep its invariants after them.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the chunk allocator and the arenas.
#[derive(Debug, Error)]
pub enum AllocError {
    /// A zero-byte allocation was requested.
    #[error("Allocation of zero bytes requested")]
    ZeroSize,
    /// The requested alignment is not a power of two.
    #[error("Alignment {alignment} is not a power of two")]
    InvalidAlignment {
        /// The rejected alignment.
        alignment: usize,
    },
    /// No size class has chunks large enough. Spanning several chunks is not
    /// supported.
    #[error("Requested {size} bytes but the largest chunk class holds {largest} bytes")]
    SizeTooLarge {
        /// Bytes requested, including the allocation header.
        size: usize,
        /// Chunk size of the largest class.
        largest: usize,
    },
    /// An allocation header failed validation on free.
    #[error("Allocation record corrupted: {record}")]
    CorruptedRecord {
        /// Formatted contents of the damaged header.
        record: String,
    },
}

/// Errors raised by task submission and pool management.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The scheduler is shutting down and the task is not a shutdown task.
    #[error("Scheduler is shutting down")]
    ShuttingDown,
    /// Every task slot is in use.
    #[error("Task buffer exhausted: all {capacity} slots are in use")]
    TaskBufferExhausted {
        /// Number of slots in the buffer.
        capacity: usize,
    },
    /// A dependency handle refers to a task that was never submitted.
    #[error("Dependency {label} has not been submitted")]
    UnsubmittedDependency {
        /// Label of the offending dependency, if it is still known.
        label: String,
    },
    /// A task already has the maximum number of successors registered.
    #[error("Task {label} already has {capacity} forward tasks")]
    ForwardTasksFull {
        /// Label of the predecessor task.
        label: &'static str,
        /// Capacity of the forward list.
        capacity: usize,
    },
    /// The worker pool cannot be sized to zero threads.
    #[error("Thread count can't be 0")]
    InvalidThreadCount,
}

/// Errors raised while building a runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A `size:count` entry of the chunk configuration could not be parsed.
    #[error("Invalid chunk size class '{entry}': {reason}")]
    InvalidSizeClass {
        /// The raw entry.
        entry: String,
        /// What is wrong with it.
        reason: String,
    },
    /// The chunk configuration has no size classes.
    #[error("Chunk configuration has no size classes")]
    EmptyChunkConfig,
    /// The task buffer capacity is outside the supported range.
    #[error("max_tasks must be a power of two in {min}..={max}, got {value}")]
    InvalidMaxTasks {
        /// The rejected value.
        value: usize,
        /// Smallest supported capacity.
        min: usize,
        /// Largest supported capacity.
        max: usize,
    },
    /// The configuration file could not be read.
    #[error("Failed to read config file '{}': {source}", path.display())]
    Io {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML for [`crate::RuntimeConfig`].
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Logs `reason` and aborts the current unit of work.
///
/// Workspace profiles build with `panic = "abort"`, so this terminates the
/// process. Test builds unwind instead, which keeps fatal paths testable.
#[cold]
#[track_caller]
pub fn fatal(reason: impl fmt::Display) -> ! {
    let location = std::panic::Location::caller();
    log::error!("Fatal: {reason} (at {location})");
    panic!("{reason}");
}
