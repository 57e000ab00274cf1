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

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SchedulerFullSnafu, SchedulerStoppedSnafu};

/// A unit of background work: one merge, mutation or cleanup run.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

const STATE_RUNNING: u8 = 0;
const STATE_STOP: u8 = 1;
const STATE_AWAIT_TERMINATION: u8 = 2;

/// [Scheduler] defines a set of API to schedule Jobs.
pub trait Scheduler: Send + Sync {
    /// Schedules a job. Fails when the queue is full or the pool stopped;
    /// the job is returned untouched inside the error in neither case, so
    /// callers must treat a failure as "not scheduled".
    fn schedule(&self, job: Job) -> Result<()>;

    /// Number of jobs currently queued.
    fn queued(&self) -> usize;
}

pub type SchedulerRef = Arc<LocalScheduler>;

/// Worker pool executing jobs from a bounded queue.
pub struct LocalScheduler {
    sender: Mutex<Option<flume::Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Token used to halt the workers.
    cancel_token: CancellationToken,
    /// State of scheduler.
    state: Arc<AtomicU8>,
}

impl std::fmt::Debug for LocalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

impl LocalScheduler {
    /// Creates a pool of `num_workers` workers sharing a queue of `cap`
    /// pending jobs.
    pub fn new(cap: usize, num_workers: usize) -> LocalScheduler {
        let (tx, rx) = flume::bounded(cap);
        let token = CancellationToken::new();
        let state = Arc::new(AtomicU8::new(STATE_RUNNING));

        let mut handles = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let child = token.child_token();
            let receiver: flume::Receiver<Job> = rx.clone();
            let state = Arc::clone(&state);
            let handle = tokio::spawn(async move {
                while state.load(Ordering::Relaxed) == STATE_RUNNING {
                    tokio::select! {
                        _ = child.cancelled() => {
                            break;
                        }
                        job = receiver.recv_async() => {
                            let Ok(job) = job else {
                                break;
                            };
                            debug!("Background worker {} picked up a job", id);
                            job.await;
                        }
                    }
                }
                // Drain remaining jobs when asked to terminate gracefully.
                if state.load(Ordering::Relaxed) == STATE_AWAIT_TERMINATION {
                    while let Ok(job) = receiver.try_recv() {
                        job.await;
                    }
                }
            });
            handles.push(handle);
        }

        LocalScheduler {
            sender: Mutex::new(Some(tx)),
            cancel_token: token,
            handles: Mutex::new(handles),
            state,
        }
    }

    #[inline]
    fn running(&self) -> bool {
        self.state.load(Ordering::Relaxed) == STATE_RUNNING
    }

    /// Stops the pool. With `await_termination`, already queued jobs finish
    /// first; otherwise they are discarded.
    pub async fn stop(&self, await_termination: bool) -> Result<()> {
        let state = if await_termination {
            STATE_AWAIT_TERMINATION
        } else {
            STATE_STOP
        };
        self.state.store(state, Ordering::Relaxed);
        self.cancel_token.cancel();
        let _ = self.sender.lock().unwrap().take();

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            // A worker that panicked has already lost its job; ignore.
            let _ = handle.await;
        }
        Ok(())
    }
}

impl Scheduler for LocalScheduler {
    fn schedule(&self, job: Job) -> Result<()> {
        if !self.running() {
            return SchedulerStoppedSnafu.fail();
        }
        let sender = self.sender.lock().unwrap();
        let Some(sender) = sender.as_ref() else {
            return SchedulerStoppedSnafu.fail();
        };
        match sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => SchedulerFullSnafu.fail(),
            Err(flume::TrySendError::Disconnected(_)) => SchedulerStoppedSnafu.fail(),
        }
    }

    fn queued(&self) -> usize {
        self.sender
            .lock()
            .unwrap()
            .as_ref()
            .map(|sender| sender.len())
            .unwrap_or(0)
    }
}

impl Drop for LocalScheduler {
    fn drop(&mut self) {
        self.state.store(STATE_STOP, Ordering::Relaxed);
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI32;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_all_jobs_run_before_termination() {
        let task_size = 100;
        let sum = Arc::new(AtomicI32::new(0));
        let scheduler = LocalScheduler::new(task_size, 3);

        for _ in 0..task_size {
            let sum = Arc::clone(&sum);
            scheduler
                .schedule(Box::pin(async move {
                    sum.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
        }
        scheduler.stop(true).await.unwrap();

        assert_eq!(sum.load(Ordering::Relaxed), task_size as i32);
    }

    #[tokio::test]
    async fn test_schedule_fails_when_stopped() {
        let scheduler = LocalScheduler::new(4, 1);
        scheduler.stop(false).await.unwrap();
        let err = scheduler.schedule(Box::pin(async {})).unwrap_err();
        assert!(matches!(err, crate::error::Error::SchedulerStopped { .. }));
    }

    #[tokio::test]
    async fn test_schedule_fails_when_full() {
        // A single worker blocked forever keeps the queue occupied.
        let scheduler = Arc::new(LocalScheduler::new(1, 1));
        let blocker = Arc::new(tokio::sync::Notify::new());
        {
            let blocker = blocker.clone();
            scheduler
                .schedule(Box::pin(async move {
                    blocker.notified().await;
                }))
                .unwrap();
        }
        // Wait for the worker to pick up the blocking job.
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.schedule(Box::pin(async {})).unwrap();

        let err = scheduler.schedule(Box::pin(async {})).unwrap_err();
        assert!(matches!(err, crate::error::Error::SchedulerFull { .. }));

        blocker.notify_waiters();
        scheduler.stop(true).await.unwrap();
    }
}
