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

//! Counting completion signals.

use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A shared completion counter that any number of contributors signal.
///
/// The fence is done once the counter reaches its target. Callers that need
/// to wait for a different count take a [`Fence`] view with
/// [`FenceMain::target`]; views share the counter but carry their own target.
#[derive(Debug)]
pub struct FenceMain {
    value: AtomicU64,
    target: u64,
}

impl FenceMain {
    /// Creates a fence that completes after `target` signals.
    pub fn new(target: u64) -> Self {
        Self {
            value: AtomicU64::new(0),
            target,
        }
    }

    /// Adds one to the counter.
    pub fn signal(&self) {
        self.value.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of signals received so far.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Whether the counter has reached this fence's own target.
    pub fn is_done(&self) -> bool {
        self.value() >= self.target
    }

    /// Spins, then yields, until the counter reaches the target.
    pub fn wait(&self) {
        spin_until(|| self.is_done());
    }

    /// A view of this fence that completes at `target` signals.
    pub fn target(self: &Arc<Self>, target: u64) -> Fence {
        Fence {
            main: Some(Arc::clone(self)),
            target,
        }
    }

    /// A view of this fence with its own target.
    pub fn view(self: &Arc<Self>) -> Fence {
        self.target(self.target)
    }
}

/// A cheap, cloneable handle onto a [`FenceMain`] counter.
///
/// A default `Fence` is detached: signaling it does nothing and waiting on it
/// returns immediately.
#[derive(Debug, Clone, Default)]
pub struct Fence {
    main: Option<Arc<FenceMain>>,
    target: u64,
}

impl Fence {
    /// A fresh fence that completes after a single signal, as used for task
    /// completion.
    pub fn single() -> Self {
        Arc::new(FenceMain::new(1)).view()
    }

    /// A fence that is already complete and ignores signals.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Signals the underlying counter.
    pub fn signal(&self) {
        if let Some(main) = &self.main {
            main.signal();
        }
    }

    /// The count at which this view completes.
    pub fn target_value(&self) -> u64 {
        self.target
    }

    /// Whether the shared counter has reached this view's target.
    pub fn is_done(&self) -> bool {
        self.main
            .as_ref()
            .map_or(true, |main| main.value() >= self.target)
    }

    /// Spins, then yields, until done.
    pub fn wait(&self) {
        spin_until(|| self.is_done());
    }

    /// Waits at most `timeout`. Returns whether the fence completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        while !self.is_done() {
            if Instant::now() >= deadline {
                return false;
            }
            backoff.snooze();
        }
        true
    }
}

fn spin_until(mut done: impl FnMut() -> bool) {
    let backoff = Backoff::new();
    while !done() {
        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_fence_completes_after_one_signal() {
        let fence = Fence::single();
        assert!(!fence.is_done());
        fence.clone().signal();
        assert!(fence.is_done());
        fence.wait();
    }

    #[test]
    fn test_detached_fence_is_always_done() {
        let fence = Fence::detached();
        fence.signal();
        assert!(fence.is_done());
        assert!(fence.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_views_complete_at_their_own_targets() {
        let main = Arc::new(FenceMain::new(4));
        let half = main.target(2);
        let full = main.view();

        main.signal();
        assert!(!half.is_done());
        main.signal();
        assert!(half.is_done());
        assert!(!full.is_done());
        assert!(!full.wait_timeout(Duration::from_millis(5)));

        main.signal();
        main.signal();
        assert!(full.is_done());
        assert!(main.is_done());
        assert_eq!(main.value(), 4);
    }

    #[test]
    fn test_parallel_contributors() {
        let main = Arc::new(FenceMain::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fence = main.view();
                thread::spawn(move || fence.signal())
            })
            .collect();

        main.wait();
        for handle in handles {
            handle.join().expect("signal thread panicked");
        }
        assert_eq!(main.value(), 8);
    }
}
