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

//! The (predicate, notification, timeout) wait used by every suspension
//! point of the table. Callers fold the shutdown flag into the predicate so
//! shutdown uniformly unblocks all waiters.

use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Waits until `predicate` returns true, re-checking after every
/// notification on `notify`. Returns false when `timeout` elapses first.
///
/// The predicate must do its own locking; it is evaluated outside of any
/// lock held by this function.
pub(crate) async fn wait_until(
    notify: &Notify,
    timeout: Duration,
    mut predicate: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        // Register for a wakeup before checking the predicate, otherwise a
        // notification between the check and the await is lost.
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if predicate() {
            return true;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        if tokio::time::timeout(remaining, notified).await.is_err() {
            return predicate();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_wait_until_notified() {
        let notify = Arc::new(Notify::new());
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let notify = notify.clone();
            let flag = flag.clone();
            tokio::spawn(async move {
                wait_until(&notify, Duration::from_secs(5), || flag.load(Ordering::Relaxed)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.store(true, Ordering::Relaxed);
        notify.notify_waiters();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let notify = Notify::new();
        let ok = wait_until(&notify, Duration::from_millis(20), || false).await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_predicate_checked_before_waiting() {
        let notify = Notify::new();
        let ok = wait_until(&notify, Duration::ZERO, || true).await;
        assert!(ok);
    }
}
