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

//! The per-table background assignee.
//!
//! A cooperative loop that periodically offers work (a merge, a mutation or
//! a cleanup pass) to the shared worker pool. `trigger()` wakes it early,
//! e.g. right after a new mutation was started.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Drives one table's background processing.
#[derive(Debug, Default)]
pub struct BackgroundAssignee {
    trigger: Arc<Notify>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundAssignee {
    pub fn new() -> BackgroundAssignee {
        BackgroundAssignee::default()
    }

    /// Starts the loop. `tick` is called once per period or trigger and
    /// returns whether it scheduled any work.
    pub(crate) fn start<F, Fut>(&self, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        self.running.store(true, Ordering::Relaxed);

        let running = self.running.clone();
        let trigger = self.trigger.clone();
        *handle = Some(tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = trigger.notified() => {}
                }
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                let scheduled = tick().await;
                if scheduled {
                    debug!("Background assignee scheduled a task");
                }
            }
            info!("Background assignee loop exited");
        }));
    }

    /// Wakes the loop before its period elapses.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops the loop and waits for it to exit.
    pub async fn finish(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.trigger.notify_waiters();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_loop_early() {
        let assignee = Arc::new(BackgroundAssignee::new());
        let ticks = Arc::new(AtomicUsize::new(0));
        {
            let ticks = ticks.clone();
            assignee.start(Duration::from_secs(3600), move || {
                let ticks = ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::Relaxed);
                    true
                }
            });
        }
        assert!(assignee.is_running());

        assignee.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::Relaxed), 1);

        assignee.finish().await;
        assert!(!assignee.is_running());
        // Triggering a finished assignee is a no-op.
        assignee.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_periodic_ticks() {
        let assignee = BackgroundAssignee::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        {
            let ticks = ticks.clone();
            assignee.start(Duration::from_millis(10), move || {
                let ticks = ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::Relaxed);
                    false
                }
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assignee.finish().await;
        assert!(ticks.load(Ordering::Relaxed) >= 2);
    }
}
