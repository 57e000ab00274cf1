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

//! Lightweight updates.
//!
//! An update allocates an `Update` block number B, waits for every insert
//! and mutation below B to commit, and writes its changes as *patch parts*
//! under a reserved partition-id prefix that regular merges never touch.
//! Concurrent updates serialize through one lock (`sync` mode) or through
//! a column-scoped lock table (`auto` mode).

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::ensure;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::block::{BlockOp, CommittingBlockGuard};
use crate::config::UpdateParallelMode;
use crate::error::{Result, TimeoutExceededSnafu};
use crate::mutation::MutationCommand;
use crate::part::info::PATCH_PART_PREFIX;
use crate::part::PartHandle;
use crate::table::{MergeTreeTable, MergeTreeTableRef};
use crate::wait::wait_until;

/// Column-scoped writer locks for updates.
#[derive(Debug, Default)]
pub(crate) struct UpdateLockTable {
    inner: Arc<LockTableInner>,
}

#[derive(Debug, Default)]
struct LockTableInner {
    sync_lock: Arc<tokio::sync::Mutex<()>>,
    /// Columns currently owned by a running update.
    locked_columns: Mutex<HashSet<String>>,
    released: Notify,
}

impl UpdateLockTable {
    pub(crate) fn new() -> UpdateLockTable {
        UpdateLockTable::default()
    }

    /// Acquires write access for `columns` according to `mode`.
    pub(crate) async fn acquire(
        &self,
        mode: UpdateParallelMode,
        columns: BTreeSet<String>,
        timeout: Duration,
    ) -> Result<UpdateLock> {
        match mode {
            UpdateParallelMode::Sync => {
                let guard =
                    tokio::time::timeout(timeout, self.inner.sync_lock.clone().lock_owned())
                        .await
                        .map_err(|_| {
                            TimeoutExceededSnafu {
                                reason: "failed to get lock for lightweight update in sync mode"
                                    .to_string(),
                                timeout_ms: timeout.as_millis() as u64,
                            }
                            .build()
                        })?;
                debug!("Got lock for lightweight update in sync mode");
                Ok(UpdateLock {
                    inner: self.inner.clone(),
                    _sync_guard: Some(guard),
                    columns: Vec::new(),
                })
            }
            UpdateParallelMode::Auto => {
                let inner = self.inner.clone();
                let wanted: Vec<String> = columns.into_iter().collect();
                let acquired = {
                    let inner = inner.clone();
                    let wanted = wanted.clone();
                    wait_until(&self.inner.released, timeout, move || {
                        let mut locked = inner.locked_columns.lock().unwrap();
                        if wanted.iter().any(|column| locked.contains(column)) {
                            return false;
                        }
                        locked.extend(wanted.iter().cloned());
                        true
                    })
                    .await
                };
                ensure!(
                    acquired,
                    TimeoutExceededSnafu {
                        reason: "failed to lock columns for lightweight update".to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }
                );
                debug!("Got lock for lightweight update in auto mode");
                Ok(UpdateLock {
                    inner: self.inner.clone(),
                    _sync_guard: None,
                    columns: wanted,
                })
            }
        }
    }
}

/// Held for the whole lifetime of one lightweight update.
#[derive(Debug)]
pub struct UpdateLock {
    inner: Arc<LockTableInner>,
    _sync_guard: Option<tokio::sync::OwnedMutexGuard<()>>,
    columns: Vec<String>,
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        if !self.columns.is_empty() {
            let mut locked = self.inner.locked_columns.lock().unwrap();
            for column in &self.columns {
                locked.remove(column);
            }
        }
        self.inner.released.notify_waiters();
    }
}

/// A running lightweight update: its lock, its block number and the
/// per-partition read barrier. Dropping it releases everything.
#[derive(Debug)]
pub struct LightweightUpdate {
    table: MergeTreeTableRef,
    _lock: UpdateLock,
    block: CommittingBlockGuard,
    partition_id_to_max_block: BTreeMap<String, i64>,
}

impl LightweightUpdate {
    /// Block number of the update.
    pub fn block_number(&self) -> i64 {
        self.block.number()
    }

    /// Readers producing the patch see each partition up to this block.
    pub fn max_block_for(&self, partition_id: &str) -> Option<i64> {
        self.partition_id_to_max_block.get(partition_id).copied()
    }

    pub fn partition_id_to_max_block(&self) -> &BTreeMap<String, i64> {
        &self.partition_id_to_max_block
    }

    /// Writes one patch part for `partition_id`. The part lands in the
    /// patch partition, outside the regular merge domain.
    pub async fn commit_patch(
        &self,
        partition_id: &str,
        rows: u64,
        bytes: u64,
    ) -> Result<PartHandle> {
        let patch_partition = format!("{PATCH_PART_PREFIX}{partition_id}");
        let guard = self
            .table
            .begin_insert(&patch_partition, rows, bytes, None, None)
            .await?;
        guard.commit().await
    }
}

impl MergeTreeTable {
    /// Starts a lightweight update over `commands`.
    ///
    /// Serializes against concurrent updates via the column lock table,
    /// then waits until every insert and mutation with a smaller block
    /// number has committed, so the patch observes all of them.
    pub async fn update_lightweight(
        self: &Arc<Self>,
        commands: &[MutationCommand],
    ) -> Result<LightweightUpdate> {
        self.assert_not_readonly()?;

        let mut columns = BTreeSet::new();
        for command in commands {
            columns.extend(command.affected_columns());
        }

        let lock = self
            .update_locks
            .acquire(
                self.config.update_parallel_mode,
                columns,
                self.config.lock_acquire_timeout,
            )
            .await?;

        let block = self.allocator.allocate(BlockOp::Update);
        let block_number = block.number();
        self.allocator
            .wait_for_committed(block_number, self.config.lock_acquire_timeout)
            .await?;

        let partition_id_to_max_block = self
            .registry
            .active_partition_ids()
            .into_iter()
            .filter(|partition| !partition.starts_with(PATCH_PART_PREFIX))
            .map(|partition| (partition, block_number))
            .collect();

        info!("Started lightweight update at block {}", block_number);
        Ok(LightweightUpdate {
            table: self.clone(),
            _lock: lock,
            block,
            partition_id_to_max_block,
        })
    }
}
