// Copyright 2023 Greptime Team
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

//! Action blockers.
//!
//! A blocker is a counter of outstanding cancellations: while it is above
//! zero, new merges do not start and in-flight ones observe the
//! cancellation at their next check. Partition operations hold a blocker
//! (global or scoped to one partition) for their whole critical section.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};

/// Counter-based blocker for one scope.
#[derive(Debug, Default)]
struct Counter {
    cancels: AtomicIsize,
    forever: AtomicBool,
}

impl Counter {
    fn is_cancelled(&self) -> bool {
        self.forever.load(Ordering::Relaxed) || self.cancels.load(Ordering::Relaxed) > 0
    }
}

/// Blocks merges globally or for a single partition.
#[derive(Debug, Default)]
pub struct PartitionBlocker {
    global: Arc<Counter>,
    partitions: Mutex<HashMap<String, Arc<Counter>>>,
}

impl PartitionBlocker {
    pub fn new() -> PartitionBlocker {
        PartitionBlocker::default()
    }

    /// Cancels all merges until the returned lock drops.
    pub fn cancel(&self) -> BlockerLock {
        self.global.cancels.fetch_add(1, Ordering::Relaxed);
        BlockerLock {
            counter: self.global.clone(),
        }
    }

    /// Cancels merges touching `partition_id` until the returned lock drops.
    pub fn cancel_for_partition(&self, partition_id: &str) -> BlockerLock {
        let counter = {
            let mut partitions = self.partitions.lock().unwrap();
            partitions
                .entry(partition_id.to_string())
                .or_default()
                .clone()
        };
        counter.cancels.fetch_add(1, Ordering::Relaxed);
        BlockerLock { counter }
    }

    /// Cancels all merges permanently. Used on shutdown; there is no undo.
    pub fn cancel_forever(&self) {
        self.global.forever.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.global.is_cancelled()
    }

    /// Whether merges over `partition_id` are cancelled, either by a global
    /// or by a matching per-partition blocker. An empty partition id asks
    /// about the global scope only.
    pub fn is_cancelled_for_partition(&self, partition_id: &str) -> bool {
        if self.global.is_cancelled() {
            return true;
        }
        if partition_id.is_empty() {
            return false;
        }
        let partitions = self.partitions.lock().unwrap();
        partitions
            .get(partition_id)
            .map(|counter| counter.is_cancelled())
            .unwrap_or(false)
    }
}

/// RAII lock of one blocker scope.
#[derive(Debug)]
pub struct BlockerLock {
    counter: Arc<Counter>,
}

impl Drop for BlockerLock {
    fn drop(&mut self) {
        self.counter.cancels.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_cancel() {
        let blocker = PartitionBlocker::new();
        assert!(!blocker.is_cancelled());
        {
            let _lock = blocker.cancel();
            assert!(blocker.is_cancelled());
            assert!(blocker.is_cancelled_for_partition("p"));
        }
        assert!(!blocker.is_cancelled());
    }

    #[test]
    fn test_partition_scoped_cancel() {
        let blocker = PartitionBlocker::new();
        let lock = blocker.cancel_for_partition("p");
        assert!(blocker.is_cancelled_for_partition("p"));
        assert!(!blocker.is_cancelled_for_partition("q"));
        assert!(!blocker.is_cancelled());
        drop(lock);
        assert!(!blocker.is_cancelled_for_partition("p"));
    }

    #[test]
    fn test_nested_locks() {
        let blocker = PartitionBlocker::new();
        let a = blocker.cancel();
        let b = blocker.cancel();
        drop(a);
        assert!(blocker.is_cancelled());
        drop(b);
        assert!(!blocker.is_cancelled());
    }

    #[test]
    fn test_cancel_forever() {
        let blocker = PartitionBlocker::new();
        blocker.cancel_forever();
        assert!(blocker.is_cancelled());
        assert!(blocker.is_cancelled_for_partition("p"));
    }
}
