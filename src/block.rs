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

//! Block-number allocation.
//!
//! Every allocation event on the table (insert, mutation, lightweight
//! update) gets the next value of a table-wide increment. The block stays
//! in the *committing* set from allocation until the corresponding registry
//! swap, so other operations can wait for everything below a given number
//! to land.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::ensure;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Result, TimeoutExceededSnafu};
use crate::wait::wait_until;

/// Kind of the operation a block number was allocated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockOp {
    NewPart,
    Mutation,
    Update,
}

/// A block number that has been allocated but whose result is not yet
/// installed in the part registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommittingBlock {
    pub op: BlockOp,
    pub number: i64,
}

impl PartialOrd for CommittingBlock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CommittingBlock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.number.cmp(&other.number).then(self.op.cmp(&other.op))
    }
}

/// Allocates block numbers and tracks the committing set.
#[derive(Debug, Default)]
pub struct BlockAllocator {
    inner: Mutex<AllocatorInner>,
    /// Notified whenever a committing block is released.
    committed: Notify,
}

#[derive(Debug, Default)]
struct AllocatorInner {
    increment: i64,
    committing: BTreeSet<CommittingBlock>,
}

pub type BlockAllocatorRef = Arc<BlockAllocator>;

impl BlockAllocator {
    pub fn new() -> BlockAllocator {
        BlockAllocator::default()
    }

    /// Raises the increment to at least `observed`. Called while loading
    /// parts and mutations from disk.
    pub fn observe(&self, observed: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.increment = inner.increment.max(observed);
    }

    /// Current high-water mark; every allocated number is `<= current`.
    pub fn current(&self) -> i64 {
        self.inner.lock().unwrap().increment
    }

    /// Allocates the next block number for `op` and inserts it into the
    /// committing set. The returned guard releases the block on drop.
    pub fn allocate(self: &Arc<Self>, op: BlockOp) -> CommittingBlockGuard {
        let block = {
            let mut inner = self.inner.lock().unwrap();
            inner.increment += 1;
            let block = CommittingBlock {
                op,
                number: inner.increment,
            };
            inner.committing.insert(block);
            block
        };
        debug!("Allocated block number {}", block.number);
        CommittingBlockGuard {
            allocator: self.clone(),
            block: Some(block),
        }
    }

    fn release(&self, block: CommittingBlock) {
        let mut inner = self.inner.lock().unwrap();
        inner.committing.remove(&block);
        drop(inner);
        self.committed.notify_waiters();
    }

    /// Snapshot of the committing set.
    pub fn committing_blocks(&self) -> BTreeSet<CommittingBlock> {
        self.inner.lock().unwrap().committing.clone()
    }

    /// Blocks until every committing insert and mutation with a number
    /// below `max_block` has been released. Committing updates are skipped:
    /// they synchronize among themselves through the update locks.
    pub async fn wait_for_committed(&self, max_block: i64, timeout: Duration) -> Result<()> {
        let all_committed = || {
            let inner = self.inner.lock().unwrap();
            inner
                .committing
                .iter()
                .take_while(|block| block.number < max_block)
                .all(|block| block.op == BlockOp::Update)
        };

        let ok = wait_until(&self.committed, timeout, all_committed).await;
        ensure!(
            ok,
            TimeoutExceededSnafu {
                reason: format!(
                    "waiting for inserts and mutations to commit up to block number {max_block}"
                ),
                timeout_ms: timeout.as_millis() as u64,
            }
        );
        Ok(())
    }
}

/// Holder of an allocated block number. Dropping it releases the block and
/// wakes up commit waiters.
#[derive(Debug)]
pub struct CommittingBlockGuard {
    allocator: BlockAllocatorRef,
    block: Option<CommittingBlock>,
}

impl CommittingBlockGuard {
    pub fn number(&self) -> i64 {
        // Safety: `block` is only taken in drop/release.
        self.block.unwrap().number
    }

    pub fn op(&self) -> BlockOp {
        self.block.unwrap().op
    }

    /// Releases the block explicitly, right after the registry swap.
    pub fn release(mut self) {
        if let Some(block) = self.block.take() {
            self.allocator.release(block);
        }
    }
}

impl Drop for CommittingBlockGuard {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.allocator.release(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strictly_increasing() {
        let allocator = Arc::new(BlockAllocator::new());
        let a = allocator.allocate(BlockOp::NewPart);
        let b = allocator.allocate(BlockOp::Mutation);
        let c = allocator.allocate(BlockOp::Update);
        assert_eq!(a.number() + 1, b.number());
        assert_eq!(b.number() + 1, c.number());
        assert_eq!(allocator.committing_blocks().len(), 3);
        drop(b);
        assert_eq!(allocator.committing_blocks().len(), 2);
    }

    #[test]
    fn test_observe_raises_increment() {
        let allocator = Arc::new(BlockAllocator::new());
        allocator.observe(41);
        allocator.observe(7);
        let block = allocator.allocate(BlockOp::NewPart);
        assert_eq!(block.number(), 42);
    }

    #[tokio::test]
    async fn test_wait_for_committed() {
        let allocator = Arc::new(BlockAllocator::new());
        let insert = allocator.allocate(BlockOp::NewPart);
        // A pending update below the barrier does not block the wait.
        let _pending_update = allocator.allocate(BlockOp::Update);
        let update = allocator.allocate(BlockOp::Update);
        let barrier = update.number();

        let waiter = {
            let allocator = allocator.clone();
            tokio::spawn(async move {
                allocator
                    .wait_for_committed(barrier, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        insert.release();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_committed_times_out() {
        let allocator = Arc::new(BlockAllocator::new());
        let _insert = allocator.allocate(BlockOp::NewPart);
        let barrier = allocator.current() + 1;
        let err = allocator
            .wait_for_committed(barrier, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::TimeoutExceeded { .. }));
    }
}
