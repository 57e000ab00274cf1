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

//! Table event listener for tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::info;

/// Table background event listener.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Notifies the listener that a merge committed its result part.
    fn on_merge_committed(&self, result_name: &str);

    /// Called after the cleanup task grabbed a set of old parts and before
    /// it removes them from the filesystem. Awaiting here holds the grabbed
    /// parts in limbo, which tests use to keep parts alive across
    /// concurrent operations.
    async fn on_old_parts_grabbed(&self, part_names: &[String]);
}

pub type EventListenerRef = Arc<dyn EventListener>;

/// Listener to watch merge commits.
pub struct MergeListener {
    notify: Notify,
}

impl MergeListener {
    pub fn new() -> MergeListener {
        MergeListener {
            notify: Notify::new(),
        }
    }

    /// Wait until one merge commits.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

impl Default for MergeListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventListener for MergeListener {
    fn on_merge_committed(&self, result_name: &str) {
        info!("Merge committed part {}", result_name);

        self.notify.notify_one()
    }

    async fn on_old_parts_grabbed(&self, _part_names: &[String]) {}
}

/// Listener pausing old-parts cleanup after it grabs its victims.
pub struct CleanupPauseListener {
    paused: std::sync::atomic::AtomicBool,
    resume: Notify,
    grabbed: Notify,
}

impl CleanupPauseListener {
    pub fn new() -> CleanupPauseListener {
        CleanupPauseListener {
            paused: std::sync::atomic::AtomicBool::new(false),
            resume: Notify::new(),
            grabbed: Notify::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, std::sync::atomic::Ordering::Relaxed);
        self.resume.notify_waiters();
    }

    /// Wait until cleanup holds a grabbed set.
    pub async fn wait_grabbed(&self) {
        self.grabbed.notified().await;
    }
}

impl Default for CleanupPauseListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventListener for CleanupPauseListener {
    fn on_merge_committed(&self, _result_name: &str) {}

    async fn on_old_parts_grabbed(&self, part_names: &[String]) {
        if !self.paused.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }
        info!(
            "Cleanup paused with {} grabbed parts: {:?}",
            part_names.len(),
            part_names
        );
        self.grabbed.notify_waiters();
        loop {
            let notified = self.resume.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.paused.load(std::sync::atomic::Ordering::Relaxed) {
                return;
            }
            notified.await;
        }
    }
}
