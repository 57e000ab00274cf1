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

//! The merge-tree table: part lifecycle, mutations and the background
//! scheduling tick.

pub(crate) mod cleanup;
pub(crate) mod partition;
#[cfg(test)]
mod tests;
pub(crate) mod update;

pub use partition::AttachedPart;
pub use update::{LightweightUpdate, UpdateLock};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use snafu::{ensure, ResultExt};
use tracing::{debug, info, trace, warn};

use crate::access::{AccessLayer, AccessLayerRef};
use crate::backoff::MutationBackoffPolicy;
use crate::block::{BlockAllocator, BlockAllocatorRef, BlockOp, CommittingBlockGuard};
use crate::blocker::PartitionBlocker;
use crate::config::MergeTreeConfig;
use crate::error::{
    AbortedSnafu, BadArgumentsSnafu, CannotAssignOptimizeSnafu, IncorrectDataSnafu, Result,
    SerdeJsonSnafu, TableIsReadOnlySnafu, TimeoutExceededSnafu, UnfinishedMutationSnafu,
};
use crate::listener::EventListenerRef;
use crate::memory::{BackgroundMemoryManagerImpl, BackgroundMemoryManagerRef};
use crate::merge::picker::MergePicker;
use crate::merge::task::{MergeMutateTask, TaskContext};
use crate::merge::{SelectFailure, SelectFailureReason, SelectedEntry};
use crate::mutation::registry::{MutationCounters, MutationRegistry, MutationRegistryRef};
use crate::mutation::{self, MutationCommand, MutationStatus};
use crate::part::info::PartInfo;
use crate::part::purger::{LocalPartPurger, PartPurgerRef};
use crate::part::registry::{PartRegistry, PartRegistryRef};
use crate::part::{PartHandle, PartMeta, PartState};
use crate::schedule::assignee::BackgroundAssignee;
use crate::schedule::scheduler::{LocalScheduler, Scheduler, SchedulerRef};
use crate::storage::{LocalStoragePolicy, StoragePolicyRef};
use crate::table::update::UpdateLockTable;
use crate::txn::{InMemoryTransactionLog, TransactionId, TransactionLogRef, TransactionRef};
use crate::wait::wait_until;

const INSERT_TMP_PREFIX: &str = "tmp_insert_";

/// Options to open a table.
pub struct OpenOptions {
    pub name: String,
    pub path: PathBuf,
    pub config: MergeTreeConfig,
    /// Attach an existing data directory instead of creating a fresh one.
    pub attach: bool,
    /// Static storage: every mutating entry point fails.
    pub readonly: bool,
    pub transactions_enabled: bool,
    pub txn_log: Option<TransactionLogRef>,
    pub policy: Option<StoragePolicyRef>,
    pub memory: Option<BackgroundMemoryManagerRef>,
    pub scheduler: Option<SchedulerRef>,
    pub listener: Option<EventListenerRef>,
}

impl OpenOptions {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> OpenOptions {
        OpenOptions {
            name: name.into(),
            path: path.into(),
            config: MergeTreeConfig::default(),
            attach: false,
            readonly: false,
            transactions_enabled: false,
            txn_log: None,
            policy: None,
            memory: None,
            scheduler: None,
            listener: None,
        }
    }
}

struct CleanupTimers {
    last_parts_cleanup: Instant,
    last_tmp_cleanup: Instant,
}

/// A single-node merge-tree table.
pub struct MergeTreeTable {
    name: String,
    config: Arc<MergeTreeConfig>,
    access: AccessLayerRef,
    policy: StoragePolicyRef,
    txn_log: TransactionLogRef,
    registry: PartRegistryRef,
    mutations: MutationRegistryRef,
    allocator: BlockAllocatorRef,
    backoff: Arc<MutationBackoffPolicy>,
    merges_blocker: Arc<PartitionBlocker>,
    memory: BackgroundMemoryManagerRef,
    scheduler: SchedulerRef,
    owns_scheduler: bool,
    assignee: BackgroundAssignee,
    purger: PartPurgerRef,
    task_ctx: Arc<TaskContext>,
    picker: MergePicker,
    /// Serializes multi-step partition operations (ATTACH, REPLACE, MOVE,
    /// TRUNCATE).
    operations_lock: tokio::sync::Mutex<()>,
    /// Serializes merge/mutation selection between the background loop and
    /// OPTIMIZE, so two selections never tag the same part.
    background_mutex: tokio::sync::Mutex<()>,
    /// Serializes ALTER-like metadata changes with mutations.
    alter_lock: tokio::sync::Mutex<()>,
    update_locks: UpdateLockTable,
    ttl_merges_in_pool: Arc<AtomicUsize>,
    cleanup_timers: Mutex<CleanupTimers>,
    shutdown_called: AtomicBool,
    transactions_enabled: bool,
    readonly: bool,
    listener: Option<EventListenerRef>,
}

pub type MergeTreeTableRef = Arc<MergeTreeTable>;

impl std::fmt::Debug for MergeTreeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeTreeTable")
            .field("name", &self.name)
            .field("root", &self.access.root())
            .finish()
    }
}

impl MergeTreeTable {
    /// Opens a table, loading parts and mutations from its data root.
    pub async fn open(options: OpenOptions) -> Result<MergeTreeTableRef> {
        let mut config = options.config;
        config.sanitize();
        let config = Arc::new(config);

        let access: AccessLayerRef = Arc::new(AccessLayer::new(options.path));
        access.ensure_layout().await?;

        let part_dirs = access.list_part_dirs().await?;
        ensure!(
            options.attach || part_dirs.is_empty(),
            IncorrectDataSnafu {
                dir: access.root().display().to_string(),
            }
        );

        let policy = options.policy.unwrap_or_else(|| {
            Arc::new(LocalStoragePolicy::new("default", access.root(), u64::MAX))
        });
        let txn_log = options
            .txn_log
            .unwrap_or_else(|| Arc::new(InMemoryTransactionLog::new()));
        let memory = options
            .memory
            .unwrap_or_else(|| Arc::new(BackgroundMemoryManagerImpl::new(u64::MAX)));
        let owns_scheduler = options.scheduler.is_none();
        let scheduler = options.scheduler.unwrap_or_else(|| {
            Arc::new(LocalScheduler::new(
                config.max_background_jobs,
                config.num_workers,
            ))
        });

        let registry: PartRegistryRef = Arc::new(PartRegistry::new());
        let purger: PartPurgerRef =
            Arc::new(LocalPartPurger::new(scheduler.clone(), access.clone()));

        for (_, dir) in &part_dirs {
            let meta = access.read_part_meta(dir).await?;
            registry.load_part(PartHandle::new(meta, PartState::Active, purger.clone()));
        }
        registry.outdate_covered_on_load();

        let allocator: BlockAllocatorRef = Arc::new(BlockAllocator::new());
        allocator.observe(registry.max_block_number());

        let mutations: MutationRegistryRef = Arc::new(MutationRegistry::new(access.root()));
        let max_mutation = mutations.load(txn_log.as_ref()).await?;
        allocator.observe(max_mutation);

        let backoff = Arc::new(MutationBackoffPolicy::new());
        let merges_blocker = Arc::new(PartitionBlocker::new());
        let ttl_merges_in_pool = Arc::new(AtomicUsize::new(0));

        let task_ctx = Arc::new(TaskContext {
            access: access.clone(),
            registry: registry.clone(),
            mutations: mutations.clone(),
            merges_blocker: merges_blocker.clone(),
            backoff: backoff.clone(),
            config: config.clone(),
            memory: memory.clone(),
            listener: options.listener.clone(),
        });
        let picker = MergePicker {
            registry: registry.clone(),
            mutations: mutations.clone(),
            allocator: allocator.clone(),
            backoff: backoff.clone(),
            config: config.clone(),
            memory: memory.clone(),
            policy: policy.clone(),
            txn_log: txn_log.clone(),
            ttl_merges_in_pool: ttl_merges_in_pool.clone(),
        };

        info!(
            "Opened table {} with {} parts, {} pending mutations",
            options.name,
            part_dirs.len(),
            mutations.entries().len()
        );

        Ok(Arc::new(MergeTreeTable {
            name: options.name,
            config,
            access,
            policy,
            txn_log,
            registry,
            mutations,
            allocator,
            backoff,
            merges_blocker,
            memory,
            scheduler,
            owns_scheduler,
            assignee: BackgroundAssignee::new(),
            purger,
            task_ctx,
            picker,
            operations_lock: tokio::sync::Mutex::new(()),
            background_mutex: tokio::sync::Mutex::new(()),
            alter_lock: tokio::sync::Mutex::new(()),
            update_locks: UpdateLockTable::new(),
            ttl_merges_in_pool,
            cleanup_timers: Mutex::new(CleanupTimers {
                last_parts_cleanup: Instant::now(),
                last_tmp_cleanup: Instant::now(),
            }),
            shutdown_called: AtomicBool::new(false),
            transactions_enabled: options.transactions_enabled,
            readonly: options.readonly,
            listener: options.listener,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MergeTreeConfig {
        &self.config
    }

    pub fn registry(&self) -> &PartRegistryRef {
        &self.registry
    }

    pub fn transaction_log(&self) -> &TransactionLogRef {
        &self.txn_log
    }

    pub fn current_block_number(&self) -> i64 {
        self.allocator.current()
    }

    pub fn total_rows(&self) -> u64 {
        self.registry.total_active_rows()
    }

    pub fn total_bytes(&self) -> u64 {
        self.registry.total_active_bytes()
    }

    pub fn mutation_counters(&self) -> MutationCounters {
        self.mutations.counters()
    }

    fn assert_not_readonly(&self) -> Result<()> {
        ensure!(!self.readonly, TableIsReadOnlySnafu);
        Ok(())
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown_called.load(Ordering::Relaxed)
    }

    /// Starts background processing. A failed startup shuts the table down
    /// before returning, so no background work leaks.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        let result = self.startup_inner().await;
        if let Err(e) = &result {
            warn!("Startup of table {} failed: {}, shutting down", self.name, e);
            self.shutdown().await?;
        }
        result
    }

    async fn startup_inner(self: &Arc<Self>) -> Result<()> {
        self.clear_empty_parts()?;
        // Temporary directories hold incomplete results of merges from
        // before a restart and cannot be reinitialized.
        self.access
            .clear_stale_tmp_dirs(std::time::Duration::ZERO)
            .await?;

        {
            let mut timers = self.cleanup_timers.lock().unwrap();
            timers.last_parts_cleanup = Instant::now();
            timers.last_tmp_cleanup = Instant::now();
        }

        if self.readonly {
            return Ok(());
        }

        let weak = Arc::downgrade(self);
        self.assignee
            .start(self.config.background_schedule_interval, move || {
                tick(weak.clone())
            });
        Ok(())
    }

    /// Stops background processing. Idempotent; every waiter unblocks.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down table {}", self.name);

        self.mutations.notify_waiters();
        self.merges_blocker.cancel_forever();
        self.assignee.finish().await;
        if self.owns_scheduler {
            self.scheduler.stop(true).await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Inserts

    /// Stages a new part and allocates its block number. The part becomes
    /// visible when the guard is committed; dropping the guard abandons the
    /// insert (the staging directory is swept by cleanup).
    pub async fn begin_insert(
        &self,
        partition_id: &str,
        rows: u64,
        bytes: u64,
        ttl_max: Option<i64>,
        txn: Option<&TransactionRef>,
    ) -> Result<InsertGuard> {
        self.assert_not_readonly()?;
        PartInfo::check_partition_id(
            partition_id
                .strip_prefix(crate::part::info::PATCH_PART_PREFIX)
                .unwrap_or(partition_id),
        )?;

        let block = self.allocator.allocate(BlockOp::NewPart);
        let meta = PartMeta {
            info: PartInfo::new_single_block(partition_id, block.number()),
            uuid: self.config.assign_part_uuids.then(uuid::Uuid::new_v4),
            rows,
            bytes_on_disk: bytes,
            ttl_max,
            creation_tid: txn.map(|t| t.tid()).unwrap_or(TransactionId::PREHISTORIC),
            creation_csn: None,
        };
        let staged = self.access.stage_part(INSERT_TMP_PREFIX, &meta).await?;

        Ok(InsertGuard {
            access: self.access.clone(),
            registry: self.registry.clone(),
            purger: self.purger.clone(),
            staged,
            meta,
            block,
        })
    }

    /// Inserts one block of data split over partitions, committing every
    /// part. The number of distinct partitions is bounded by
    /// `max_partitions_per_insert_block`.
    pub async fn write_block(
        &self,
        parts: &[(&str, u64, u64)],
        txn: Option<&TransactionRef>,
    ) -> Result<Vec<PartHandle>> {
        let partitions: std::collections::BTreeSet<&str> =
            parts.iter().map(|(partition, _, _)| *partition).collect();
        ensure!(
            partitions.len() <= self.config.max_partitions_per_insert_block,
            BadArgumentsSnafu {
                reason: format!(
                    "too many partitions for single insert block ({} > {}). Setting \
                     'max_partitions_per_insert_block' limits it",
                    partitions.len(),
                    self.config.max_partitions_per_insert_block
                ),
            }
        );

        let mut committed = Vec::with_capacity(parts.len());
        for (partition_id, rows, bytes) in parts {
            let guard = self.begin_insert(partition_id, *rows, *bytes, None, txn).await?;
            committed.push(guard.commit().await?);
        }
        self.assignee.trigger();
        Ok(committed)
    }

    // ---------------------------------------------------------------------
    // Mutations

    /// Starts a mutation: allocates its version, persists the entry and
    /// wakes the background loop. With `mutations_sync` above zero or a
    /// transaction, waits until the mutation finishes.
    pub async fn mutate(
        &self,
        commands: Vec<MutationCommand>,
        txn: Option<&TransactionRef>,
    ) -> Result<i64> {
        self.assert_not_readonly()?;

        // Mutations and metadata-changing alters serialize through the
        // alter lock because they can depend on each other.
        let alter_lock = tokio::time::timeout(
            self.config.lock_acquire_timeout,
            self.alter_lock.lock(),
        )
        .await
        .map_err(|_| {
            TimeoutExceededSnafu {
                reason: "cannot start mutation because a metadata-changing ALTER \
                         is currently executing"
                    .to_string(),
                timeout_ms: self.config.lock_acquire_timeout.as_millis() as u64,
            }
            .build()
        })?;
        let version = self.start_mutation(commands, txn).await?;
        drop(alter_lock);

        if self.config.mutations_sync > 0 || txn.is_some() {
            self.wait_for_mutation(version).await?;
        }
        Ok(version)
    }

    async fn start_mutation(
        &self,
        commands: Vec<MutationCommand>,
        txn: Option<&TransactionRef>,
    ) -> Result<i64> {
        let tid = txn.map(|t| t.tid()).unwrap_or(TransactionId::PREHISTORIC);

        // The committing block is held until the entry is installed, so a
        // concurrent update barrier waits for this mutation.
        let block = self.allocator.allocate(BlockOp::Mutation);
        let version = block.number();
        let entry = mutation::MutationEntry::new(version, commands, tid);
        let file_name = entry.file_name();
        self.mutations.add(entry).await?;
        block.release();

        info!("Added mutation: {} (tid: {})", file_name, tid);
        self.assignee.trigger();
        Ok(version)
    }

    /// ALTER that may rewrite data. The metadata swap itself happens in the
    /// catalog layer; this entry point serializes with mutations through
    /// the alter lock and starts the data-rewriting mutation the commands
    /// imply. Returns the mutation version, when one was started.
    pub async fn alter(&self, mutation_commands: Vec<MutationCommand>) -> Result<Option<i64>> {
        self.assert_not_readonly()?;

        let _alter_lock = tokio::time::timeout(
            self.config.lock_acquire_timeout,
            self.alter_lock.lock(),
        )
        .await
        .map_err(|_| {
            TimeoutExceededSnafu {
                reason: "cannot start ALTER because another metadata-changing ALTER \
                         is currently executing"
                    .to_string(),
                timeout_ms: self.config.lock_acquire_timeout.as_millis() as u64,
            }
            .build()
        })?;

        let commands: Vec<MutationCommand> = if self.config.materialize_ttl_after_modify {
            mutation_commands
        } else {
            // TTL rewrites wait for the user to run MATERIALIZE TTL.
            mutation_commands
                .into_iter()
                .filter(|command| !matches!(command, MutationCommand::MaterializeTtl))
                .collect()
        };
        if commands.is_empty() {
            return Ok(None);
        }

        let version = self.start_mutation(commands, None).await?;
        if self.config.alter_sync > 0 {
            self.wait_for_mutation(version).await?;
        }
        Ok(Some(version))
    }

    /// DROP TABLE: shuts the table down and removes every part and
    /// mutation file from disk.
    pub async fn drop_all_data(&self) -> Result<()> {
        self.check_table_can_be_dropped()?;
        self.shutdown().await?;

        let parts = self.registry.get_in_states(&[
            PartState::Active,
            PartState::Outdated,
            PartState::Deleting,
        ]);
        for part in &parts {
            part.set_state(PartState::DeleteOnDestroy);
        }
        self.registry.finalize_removed(&parts);
        for part in parts {
            self.access.remove_part_dir(&part.name()).await?;
        }

        for entry in self.mutations.entries() {
            self.mutations.remove(entry.version);
            self.mutations.remove_file(entry.version).await?;
        }
        info!("Dropped all data of table {}", self.name);
        Ok(())
    }

    /// Guard of DROP TABLE: refuses when the active size exceeds
    /// `max_table_size_to_drop`.
    pub fn check_table_can_be_dropped(&self) -> Result<()> {
        let limit = self.config.max_table_size_to_drop;
        let bytes = self.total_bytes();
        ensure!(
            limit == 0 || bytes <= limit,
            BadArgumentsSnafu {
                reason: format!(
                    "table {} has {bytes} active bytes, above max_table_size_to_drop \
                     ({limit}). Raise the setting to drop it",
                    self.name
                ),
            }
        );
        Ok(())
    }

    /// Active parts visible to the transaction, or every active part.
    pub fn visible_parts(&self, txn: Option<&TransactionRef>) -> Vec<PartHandle> {
        self.registry.get_visible(txn.map(|txn| txn.snapshot()))
    }

    /// Records the CSN of a committed transactional mutation.
    pub async fn set_mutation_csn(&self, mutation_id: &str, csn: crate::txn::Csn) -> Result<()> {
        let version = mutation::parse_file_name(mutation_id).ok_or_else(|| {
            BadArgumentsSnafu {
                reason: format!("invalid mutation id {mutation_id:?}"),
            }
            .build()
        })?;
        info!("Writing CSN {} for mutation {}", csn, mutation_id);
        self.mutations.set_csn(version, csn).await
    }

    /// Blocks until the mutation finishes, is killed, or fails. Shutdown
    /// unblocks the wait.
    pub async fn wait_for_mutation(&self, version: i64) -> Result<()> {
        info!("Waiting mutation: {}", mutation::file_name(version));
        loop {
            let notified = self.mutations.wait_notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_shutdown() {
                return AbortedSnafu.fail();
            }
            let visible = self.registry.get_visible(None);
            match self.mutations.incomplete_status(version, &visible) {
                None => {
                    return UnfinishedMutationSnafu {
                        mutation: version,
                        reason: "mutation was killed",
                    }
                    .fail()
                }
                Some(status) if status.is_done => {
                    info!("Mutation {} done", mutation::file_name(version));
                    return Ok(());
                }
                Some(status) => {
                    if let Some(fail) = status.latest_fail {
                        return UnfinishedMutationSnafu {
                            mutation: version,
                            reason: format!(
                                "mutation failed on part {}: {}",
                                fail.part_name, fail.reason
                            ),
                        }
                        .fail();
                    }
                }
            }
            notified.await;
        }
    }

    /// Kills a mutation. Returns false when no such mutation exists.
    pub async fn kill_mutation(&self, mutation_id: &str) -> Result<bool> {
        self.assert_not_readonly()?;
        trace!("Killing mutation {}", mutation_id);
        let Some(version) = mutation::parse_file_name(mutation_id) else {
            return Ok(false);
        };

        let Some(entry) = self.mutations.remove(version) else {
            return Ok(false);
        };
        // Unrelated parts must not stay postponed because of the removed
        // entry.
        self.backoff.reset();

        if !entry.tid.is_prehistoric() {
            if let Some(txn) = self.txn_log.try_get_running(entry.tid.hash()) {
                trace!(
                    "Cancelling transaction {} which had started mutation {}",
                    entry.tid,
                    mutation_id
                );
                self.txn_log.rollback(&txn);
            }
        }

        self.mutations.remove_file(version).await?;
        trace!("Cancelled part mutations and removed mutation file {}", mutation_id);
        self.mutations.notify_waiters();

        // Maybe another mutation was blocked by the killed one.
        self.assignee.trigger();
        Ok(true)
    }

    pub fn get_mutations_status(&self) -> Vec<MutationStatus> {
        let visible = self.registry.get_visible(None);
        self.mutations.statuses(&visible)
    }

    /// Commands of unfinished mutations, applied on the fly by readers.
    pub fn unfinished_mutation_commands(
        &self,
    ) -> BTreeMap<String, Arc<Vec<MutationCommand>>> {
        let visible = self.registry.get_visible(None);
        self.mutations.unfinished_commands(&visible)
    }

    /// Mutation entries a backup of the current visible state must carry:
    /// everything a restored part may still need to apply.
    pub fn backup_mutations(&self) -> Result<Vec<(String, String)>> {
        let min_version = self
            .registry
            .get_visible(None)
            .iter()
            .map(|part| part.data_version() + 1)
            .min()
            .unwrap_or(i64::MAX);
        self.mutations.backup_entries(min_version)
    }

    /// Serialized metadata of every visible part, for backup enumeration.
    /// The bytes are cached on the handles; outdated parts shed the cache
    /// through the cleanup task.
    pub fn backup_parts(&self) -> Result<Vec<(String, Arc<Vec<u8>>)>> {
        self.registry
            .get_visible(None)
            .into_iter()
            .map(|part| {
                let bytes = match part.cached_meta_bytes() {
                    Some(bytes) => bytes,
                    None => {
                        let bytes =
                            Arc::new(serde_json::to_vec(part.meta()).context(SerdeJsonSnafu)?);
                        part.cache_meta_bytes(bytes.clone());
                        bytes
                    }
                };
                Ok((part.name(), bytes))
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // OPTIMIZE and the background tick

    /// OPTIMIZE [PARTITION] [FINAL]. Returns false when nothing could be
    /// merged (or raises with `optimize_throw_if_noop`).
    pub async fn optimize(&self, partition_id: Option<&str>, is_final: bool) -> Result<bool> {
        self.assert_not_readonly()?;
        let txn = self
            .transactions_enabled
            .then(|| self.txn_log.begin());

        if partition_id.is_none() && is_final {
            let partitions = self.registry.active_partition_ids();
            for partition in partitions {
                if partition.starts_with(crate::part::info::PATCH_PART_PREFIX) {
                    continue;
                }
                if !self
                    .merge_now(Some(&partition), true, txn.as_ref())
                    .await?
                {
                    return self.optimize_noop(&partition);
                }
            }
            Ok(true)
        } else {
            let done = self.merge_now(partition_id, is_final, txn.as_ref()).await?;
            if !done {
                return self.optimize_noop(partition_id.unwrap_or("<all>"));
            }
            Ok(true)
        }
    }

    fn optimize_noop(&self, partition: &str) -> Result<bool> {
        let reason = format!("cannot select parts in partition {partition}");
        info!("Cannot OPTIMIZE table: {}", reason);
        ensure!(
            !self.config.optimize_throw_if_noop,
            CannotAssignOptimizeSnafu { reason }
        );
        Ok(false)
    }

    /// Selects and executes one merge synchronously. Nothing-to-merge is a
    /// success.
    async fn merge_now(
        &self,
        partition_id: Option<&str>,
        is_final: bool,
        txn: Option<&TransactionRef>,
    ) -> Result<bool> {
        ensure!(
            !self
                .merges_blocker
                .is_cancelled_for_partition(partition_id.unwrap_or("")),
            AbortedSnafu
        );

        let selection = {
            let _background = self.background_mutex.lock().await;
            self.picker
                .select_merge(
                    partition_id,
                    is_final,
                    true,
                    self.config.optimize_skip_merged_partitions,
                    txn,
                )
                .await?
        };

        match selection {
            Ok(entry) => {
                MergeMutateTask::new(self.task_ctx.clone(), entry).run().await?;
                Ok(true)
            }
            Err(SelectFailure {
                reason: SelectFailureReason::NothingToMerge,
                explanation,
            }) => {
                debug!("Nothing to merge: {}", explanation);
                Ok(true)
            }
            Err(failure) => {
                info!("Didn't start merge: {}", failure.explanation);
                Ok(false)
            }
        }
    }

    /// One background tick: offer a merge or a mutation to the worker pool,
    /// otherwise run due cleanup tasks. Returns whether anything was
    /// scheduled.
    pub async fn schedule_background_job(self: &Arc<Self>) -> bool {
        if self.is_shutdown() || self.readonly {
            return false;
        }
        if self.merges_blocker.is_cancelled() {
            return false;
        }

        let txn = self
            .transactions_enabled
            .then(|| self.txn_log.begin());

        let mut entry: Option<SelectedEntry> = None;
        let has_mutations;
        {
            let _background = self.background_mutex.lock().await;
            match self
                .picker
                .select_merge(None, false, false, false, txn.as_ref())
                .await
            {
                Ok(Ok(selected)) => entry = Some(selected),
                Ok(Err(failure)) => trace!("Didn't start merge: {}", failure.explanation),
                Err(e) => debug!("Merge selection failed: {}", e),
            }

            has_mutations = !self.mutations.is_empty();
            if entry.is_none() && has_mutations {
                match self.picker.select_mutate() {
                    Ok(Some(selected)) => entry = Some(selected),
                    Ok(None) => trace!("Didn't start mutation"),
                    Err(e) => debug!("Mutation selection failed: {}", e),
                }
            }
        }

        if let Some(selected) = entry {
            if self
                .merges_blocker
                .is_cancelled_for_partition(selected.future_part.partition_id())
            {
                return false;
            }
            let task = MergeMutateTask::new(self.task_ctx.clone(), selected);
            let job = Box::pin(async move {
                let _ = task.run().await;
            });
            // A rejected job is dropped whole, which releases its busy
            // markers, reservation and TTL booking.
            match self.scheduler.schedule(job) {
                Ok(()) => return true,
                Err(e) => {
                    debug!("Failed to schedule background task: {}", e);
                    return false;
                }
            }
        }

        if has_mutations {
            // No mutation was selected: make errors observable to waiters.
            self.mutations.notify_waiters();
        }

        self.schedule_due_cleanups()
    }

    /// Schedules cleanup jobs whose interval timers elapsed.
    fn schedule_due_cleanups(self: &Arc<Self>) -> bool {
        let (tmp_due, parts_due) = {
            let mut timers = self.cleanup_timers.lock().unwrap();
            let tmp_due = timers.last_tmp_cleanup.elapsed()
                >= self.config.merge_tree_clear_old_temporary_directories_interval;
            if tmp_due {
                timers.last_tmp_cleanup = Instant::now();
            }
            let parts_due =
                timers.last_parts_cleanup.elapsed() >= self.config.merge_tree_clear_old_parts_interval;
            if parts_due {
                timers.last_parts_cleanup = Instant::now();
            }
            (tmp_due, parts_due)
        };

        let mut scheduled = false;
        if tmp_due {
            let table = self.clone();
            scheduled |= self
                .scheduler
                .schedule(Box::pin(async move {
                    if let Err(e) = table.clear_old_temporary_directories().await {
                        warn!("Failed to clear old temporary directories: {}", e);
                    }
                }))
                .is_ok();
        }
        if parts_due {
            let table = self.clone();
            scheduled |= self
                .scheduler
                .schedule(Box::pin(async move {
                    let mut cleared = 0usize;
                    match table.clear_old_parts_from_filesystem(false).await {
                        Ok(count) => cleared += count,
                        Err(e) => warn!("Failed to clear old parts: {}", e),
                    }
                    match table.clear_old_mutations(false).await {
                        Ok(count) => cleared += count,
                        Err(e) => warn!("Failed to clear old mutations: {}", e),
                    }
                    match table.clear_empty_parts() {
                        Ok(count) => cleared += count,
                        Err(e) => warn!("Failed to clear empty parts: {}", e),
                    }
                    cleared += table.clear_unused_patch_parts();
                    cleared += table.unload_meta_caches_of_outdated_parts();
                    if cleared > 0 {
                        debug!("Cleanup pass cleared {} objects", cleared);
                    }
                }))
                .is_ok();
        }
        scheduled
    }

    // ---------------------------------------------------------------------
    // Merge draining, used by partition operations

    /// Blocks new merges and waits for in-flight ones over the whole table.
    pub(crate) async fn stop_merges_and_wait(&self) -> Result<crate::blocker::BlockerLock> {
        let lock = self.merges_blocker.cancel();
        let registry = self.registry.clone();
        let ok = wait_until(
            self.registry.drain_notify(),
            crate::config::DEFAULT_LOCK_ACQUIRE_TIMEOUT,
            || registry.busy_parts().is_empty(),
        )
        .await;
        ensure!(
            ok,
            TimeoutExceededSnafu {
                reason: "waiting for already running merges".to_string(),
                timeout_ms: crate::config::DEFAULT_LOCK_ACQUIRE_TIMEOUT.as_millis() as u64,
            }
        );
        Ok(lock)
    }

    /// Same, scoped to one partition.
    pub(crate) async fn stop_merges_and_wait_for_partition(
        &self,
        partition_id: &str,
    ) -> Result<crate::blocker::BlockerLock> {
        let lock = self.merges_blocker.cancel_for_partition(partition_id);
        let registry = self.registry.clone();
        let partition = partition_id.to_string();
        let ok = wait_until(
            self.registry.drain_notify(),
            crate::config::DEFAULT_LOCK_ACQUIRE_TIMEOUT,
            move || {
                registry
                    .busy_parts()
                    .iter()
                    .all(|info| info.partition_id != partition)
            },
        )
        .await;
        ensure!(
            ok,
            TimeoutExceededSnafu {
                reason: format!("waiting for already running merges in partition {partition_id}"),
                timeout_ms: crate::config::DEFAULT_LOCK_ACQUIRE_TIMEOUT.as_millis() as u64,
            }
        );
        Ok(lock)
    }
}

/// In-flight insert: staged part directory plus its committing block.
///
/// Dropping the guard without committing abandons the insert; the staging
/// directory is swept by temporary-directory cleanup and the committing
/// block releases itself.
#[derive(Debug)]
pub struct InsertGuard {
    access: AccessLayerRef,
    registry: PartRegistryRef,
    purger: PartPurgerRef,
    staged: PathBuf,
    meta: PartMeta,
    block: CommittingBlockGuard,
}

impl InsertGuard {
    pub fn block_number(&self) -> i64 {
        self.block.number()
    }

    pub fn part_info(&self) -> &PartInfo {
        &self.meta.info
    }

    /// Installs the part: rename into place, insert into the registry,
    /// release the committing block.
    pub async fn commit(self) -> Result<PartHandle> {
        self.access.commit_staged(&self.staged, &self.meta.info).await?;
        let part = PartHandle::new(self.meta, PartState::PreCommitted, self.purger);
        self.registry.commit_part(&part)?;
        self.block.release();
        Ok(part)
    }
}

async fn tick(weak: Weak<MergeTreeTable>) -> bool {
    match weak.upgrade() {
        Some(table) => table.schedule_background_job().await,
        None => false,
    }
}
