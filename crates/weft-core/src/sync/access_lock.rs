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

//! A shared/exclusive spin lock that can be closed for good.

use crossbeam_utils::Backoff;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

const WRITER: u32 = 1 << 31;
const READERS: u32 = WRITER - 1;

/// A spin lock with any number of shared holders and at most one writer.
///
/// Shared access never waits: [`lock`](Self::lock) fails as soon as a writer
/// has announced itself, and the caller decides whether to retry or to treat
/// the lock as closed. The writer announces itself first and then waits for
/// the shared holders already inside to leave, so critical sections on both
/// sides must stay short and bounded.
///
/// [`finish`](Self::finish) takes the write side and never gives it back.
/// A task's forward list uses this to stop accepting successors once the
/// task has run; the holder of a failed `lock` then knows completion
/// notification has already happened.
pub struct AccessLock {
    state: AtomicU32,
}

impl AccessLock {
    /// Creates an open lock.
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Tries to take shared access. Returns `false` if a writer holds or has
    /// closed the lock.
    pub fn lock(&self) -> bool {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            if current & WRITER != 0 {
                return false;
            }
            debug_assert!(current & READERS != READERS, "AccessLock reader overflow");
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases shared access taken with [`lock`](Self::lock).
    pub fn unlock(&self) {
        let previous = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(previous & READERS != 0, "AccessLock::unlock without lock");
    }

    /// Tries to take exclusive access.
    ///
    /// Returns `false` immediately if another writer holds or has closed the
    /// lock. Otherwise blocks new shared holders and spins until the current
    /// ones have left.
    pub fn lock_write(&self) -> bool {
        let previous = self.state.fetch_or(WRITER, Ordering::Acquire);
        if previous & WRITER != 0 {
            return false;
        }

        let backoff = Backoff::new();
        while self.state.load(Ordering::Acquire) & READERS != 0 {
            backoff.snooze();
        }
        true
    }

    /// Releases exclusive access taken with [`lock_write`](Self::lock_write).
    pub fn unlock_write(&self) {
        self.state.fetch_and(!WRITER, Ordering::Release);
    }

    /// Spins until exclusive access is acquired and returns a guard for it.
    pub fn write(&self) -> AccessWriteGuard<'_> {
        let backoff = Backoff::new();
        while !self.lock_write() {
            backoff.snooze();
        }
        AccessWriteGuard { lock: self }
    }

    /// Shared access as a guard, or `None` if the lock is held for writing.
    pub fn read(&self) -> Option<AccessReadGuard<'_>> {
        self.lock().then(|| AccessReadGuard { lock: self })
    }

    /// Closes the lock permanently, waiting for current shared holders.
    ///
    /// Returns `true` for the caller that closed it and `false` if it was
    /// already closed or write-locked.
    pub fn finish(&self) -> bool {
        self.lock_write()
    }

    /// Whether a writer currently holds or has closed the lock.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) & WRITER != 0
    }

    /// Reopens the lock. Only valid once no thread can still observe it.
    pub fn reset(&self) {
        self.state.store(0, Ordering::Release);
    }
}

impl Default for AccessLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AccessLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Ordering::Relaxed);
        f.debug_struct("AccessLock")
            .field("readers", &(state & READERS))
            .field("closed", &(state & WRITER != 0))
            .finish()
    }
}

/// Shared access held on an [`AccessLock`], released on drop.
#[must_use]
pub struct AccessReadGuard<'a> {
    lock: &'a AccessLock,
}

impl Drop for AccessReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Exclusive access held on an [`AccessLock`], released on drop.
#[must_use]
pub struct AccessWriteGuard<'a> {
    lock: &'a AccessLock,
}

impl Drop for AccessWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_write();
    }
}
