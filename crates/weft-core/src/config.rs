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

//! Runtime configuration.
//!
//! Every field has a default, so an empty TOML file or no file at all yields
//! a working runtime sized to the machine.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Upper bound on worker threads. Thread masks carry one bit per worker.
pub const MAX_THREADS: u32 = u64::BITS;

/// Upper bound on chunk size classes.
pub const MAX_SIZE_CLASSES: usize = 8;

/// Smallest supported task buffer capacity.
pub const MIN_TASKS: usize = 64;

/// Largest supported task buffer capacity: one full task ring.
pub const MAX_TASKS: usize = 64 * 64;

/// Chunk configuration used when none is given, as `KiB:count` pairs.
pub const DEFAULT_CHUNK_CONFIG: &str = "16:640 1024:640 65536:16";

/// One pool of equally sized chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SizeClass {
    /// Size of every chunk in bytes.
    pub chunk_size: usize,
    /// Number of chunks in the pool.
    pub chunk_count: usize,
}

impl SizeClass {
    /// Builds a size class from a chunk size in KiB.
    pub const fn kib(chunk_kib: usize, chunk_count: usize) -> Self {
        Self {
            chunk_size: chunk_kib * 1024,
            chunk_count,
        }
    }
}

/// The chunk allocator's size classes, smallest first.
///
/// The text form is a whitespace-separated list of `size:count` pairs with
/// the size in KiB, e.g. `"16:640 1024:640 65536:16"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemoryChunkConfig {
    classes: Vec<SizeClass>,
}

impl MemoryChunkConfig {
    /// Validates and sorts `classes`.
    pub fn new(mut classes: Vec<SizeClass>) -> Result<Self, ConfigError> {
        if classes.is_empty() {
            return Err(ConfigError::EmptyChunkConfig);
        }
        if classes.len() > MAX_SIZE_CLASSES {
            return Err(ConfigError::InvalidSizeClass {
                entry: format!("{} classes", classes.len()),
                reason: format!("at most {MAX_SIZE_CLASSES} size classes are supported"),
            });
        }

        classes.sort();
        for class in &classes {
            if class.chunk_size == 0 || class.chunk_count == 0 {
                return Err(ConfigError::InvalidSizeClass {
                    entry: format_class(class),
                    reason: "size and count must be non-zero".to_owned(),
                });
            }
        }
        if let Some(pair) = classes
            .windows(2)
            .find(|pair| pair[0].chunk_size == pair[1].chunk_size)
        {
            return Err(ConfigError::InvalidSizeClass {
                entry: format_class(&pair[1]),
                reason: "duplicate chunk size".to_owned(),
            });
        }

        Ok(Self { classes })
    }

    /// Size classes, smallest chunk size first.
    pub fn classes(&self) -> &[SizeClass] {
        &self.classes
    }
}

impl Default for MemoryChunkConfig {
    fn default() -> Self {
        Self {
            classes: vec![
                SizeClass::kib(16, 640),
                SizeClass::kib(1024, 640),
                SizeClass::kib(65536, 16),
            ],
        }
    }
}

impl FromStr for MemoryChunkConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let classes = s
            .split_whitespace()
            .map(parse_class)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(classes)
    }
}

impl TryFrom<String> for MemoryChunkConfig {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MemoryChunkConfig> for String {
    fn from(config: MemoryChunkConfig) -> Self {
        config.to_string()
    }
}

impl fmt::Display for MemoryChunkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, class) in self.classes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&format_class(class))?;
        }
        Ok(())
    }
}

fn parse_class(entry: &str) -> Result<SizeClass, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidSizeClass {
        entry: entry.to_owned(),
        reason: reason.to_owned(),
    };

    let (size, count) = entry
        .split_once(':')
        .ok_or_else(|| invalid("expected <size KiB>:<count>"))?;
    let size: usize = size.parse().map_err(|_| invalid("size is not a number"))?;
    let count: usize = count.parse().map_err(|_| invalid("count is not a number"))?;
    let chunk_size = size
        .checked_mul(1024)
        .ok_or_else(|| invalid("size overflows"))?;

    Ok(SizeClass {
        chunk_size,
        chunk_count: count,
    })
}

fn format_class(class: &SizeClass) -> String {
    format!("{}:{}", class.chunk_size / 1024, class.chunk_count)
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker thread count. 0 selects the number of logical CPUs.
    pub thread_count: u32,
    /// Chunk allocator size classes.
    pub memory: MemoryChunkConfig,
    /// Capacity of the task slot buffer. Must be a power of two.
    pub max_tasks: usize,
    /// Period of the delay-wheel rotation driver, in microseconds.
    pub rotate_interval_us: u64,
    /// Period of the periodic re-dispatch task, in microseconds.
    pub dispatch_interval_us: u64,
    /// Whether fetching scans the fullest ready queue first.
    pub prefer_longest_queue: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_count: 0,
            memory: MemoryChunkConfig::default(),
            max_tasks: 2048,
            rotate_interval_us: 250,
            dispatch_interval_us: 1000,
            prefer_longest_queue: false,
        }
    }
}

impl RuntimeConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Checks the values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_tasks = self.max_tasks;
        if !max_tasks.is_power_of_two() || !(MIN_TASKS..=MAX_TASKS).contains(&max_tasks) {
            return Err(ConfigError::InvalidMaxTasks {
                value: max_tasks,
                min: MIN_TASKS,
                max: MAX_TASKS,
            });
        }
        Ok(())
    }

    /// The worker count to start with: `thread_count`, or the logical CPU
    /// count when it is 0, clamped to [`MAX_THREADS`].
    pub fn resolved_thread_count(&self) -> u32 {
        let requested = match self.thread_count {
            0 => std::thread::available_parallelism()
                .map(|n| u32::try_from(n.get()).unwrap_or(MAX_THREADS))
                .unwrap_or(1),
            n => n,
        };
        if requested > MAX_THREADS {
            log::warn!(
                "Maximum thread count exceeded: {requested} > {MAX_THREADS}, setting to {MAX_THREADS}"
            );
            return MAX_THREADS;
        }
        requested
    }
}
