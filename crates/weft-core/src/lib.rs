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

//! # Weft Core
//!
//! Foundational crate of the Weft task runtime: bit-scan primitives, the
//! spin-based synchronization types shared by every scheduler structure, the
//! clock seam used by the delay wheel, runtime configuration and the error
//! taxonomy.

#![warn(missing_docs)]

pub mod bits;
pub mod clock;
pub mod config;
pub mod error;
pub mod memory;
pub mod sync;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{MemoryChunkConfig, RuntimeConfig, SizeClass};
pub use error::{fatal, AllocError, ConfigError, SchedulerError};
pub use sync::{AccessLock, Barrier, Fence, FenceMain};
