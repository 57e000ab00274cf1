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

//! Memory accounting for background operations.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tracks memory used by background merges and mutations and decides
/// whether the engine may enqueue more of them.
pub trait BackgroundMemoryManager: Send + Sync + fmt::Debug {
    /// Returns whether a new background task may start.
    fn can_enqueue_background_task(&self) -> bool;

    /// Reserves `bytes` for a starting task.
    fn reserve(&self, bytes: u64);

    /// Releases `bytes` of a finished task.
    fn free(&self, bytes: u64);

    /// Memory currently booked by background tasks.
    fn usage(&self) -> u64;

    /// Soft limit above which selection stops producing work.
    fn soft_limit(&self) -> u64;
}

pub type BackgroundMemoryManagerRef = Arc<dyn BackgroundMemoryManager>;

/// Counter-based manager with a fixed soft limit.
#[derive(Debug)]
pub struct BackgroundMemoryManagerImpl {
    used: AtomicU64,
    soft_limit: u64,
}

impl BackgroundMemoryManagerImpl {
    pub fn new(soft_limit: u64) -> BackgroundMemoryManagerImpl {
        BackgroundMemoryManagerImpl {
            used: AtomicU64::new(0),
            soft_limit,
        }
    }
}

impl BackgroundMemoryManager for BackgroundMemoryManagerImpl {
    fn can_enqueue_background_task(&self) -> bool {
        self.used.load(Ordering::Relaxed) < self.soft_limit
    }

    fn reserve(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    fn free(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn usage(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    fn soft_limit(&self) -> u64 {
        self.soft_limit
    }
}
