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

//! Execution of selected merges and mutations.
//!
//! All I/O runs without any registry lock: the task stages the result
//! directory, then commits by swapping sources for the result under the
//! parts-lock. Dropping the selected entry at the end returns the busy
//! markers, disk reservation and TTL booking in every path.

use std::sync::Arc;

use tracing::{error, info};

use crate::access::AccessLayerRef;
use crate::backoff::MutationBackoffPolicy;
use crate::blocker::PartitionBlocker;
use crate::config::MergeTreeConfig;
use crate::error::{AbortedSnafu, Result};
use crate::listener::EventListenerRef;
use crate::memory::BackgroundMemoryManagerRef;
use crate::merge::SelectedEntry;
use crate::mutation::registry::MutationRegistryRef;
use crate::part::registry::PartRegistryRef;
use crate::part::{PartHandle, PartMeta, PartState};
use crate::txn::TransactionId;

const MERGE_TMP_PREFIX: &str = "tmp_merge_";
const MUTATION_TMP_PREFIX: &str = "tmp_mut_";

/// Shared environment of merge/mutate tasks of one table.
pub(crate) struct TaskContext {
    pub(crate) access: AccessLayerRef,
    pub(crate) registry: PartRegistryRef,
    pub(crate) mutations: MutationRegistryRef,
    pub(crate) merges_blocker: Arc<PartitionBlocker>,
    pub(crate) backoff: Arc<MutationBackoffPolicy>,
    pub(crate) config: Arc<MergeTreeConfig>,
    pub(crate) memory: BackgroundMemoryManagerRef,
    pub(crate) listener: Option<EventListenerRef>,
}

/// One merge or mutation execution.
pub(crate) struct MergeMutateTask {
    ctx: Arc<TaskContext>,
    entry: SelectedEntry,
}

impl MergeMutateTask {
    pub(crate) fn new(ctx: Arc<TaskContext>, entry: SelectedEntry) -> MergeMutateTask {
        MergeMutateTask { ctx, entry }
    }

    /// Runs the task to completion, recording the outcome on the affected
    /// mutation entries. The returned result is for synchronous callers
    /// (OPTIMIZE); the background path drops it, since a failed background
    /// task must not take the scheduler down with it.
    pub(crate) async fn run(self) -> Result<String> {
        let is_mutation = self.entry.is_mutation();
        let result_info = self.entry.future_part.info.clone();
        let sources_data_version = self.entry.future_part.sources_data_version();
        let failed_part = self.entry.future_part.source_parts[0].clone();

        let reserved = self.entry.future_part.total_bytes;
        self.ctx.memory.reserve(reserved);
        let ctx = self.ctx.clone();
        let result = self.execute().await;
        ctx.memory.free(reserved);

        match &result {
            Ok(result_name) => {
                ctx.mutations.record_result(
                    sources_data_version,
                    &result_info,
                    &failed_part.name(),
                    failed_part.info(),
                    true,
                    None,
                    &ctx.backoff,
                    std::time::Duration::from_millis(
                        ctx.config.max_postpone_time_for_failed_mutations_ms,
                    ),
                );
                if let Some(listener) = &ctx.listener {
                    listener.on_merge_committed(result_name);
                }
            }
            Err(e) => {
                if is_mutation && e.records_mutation_failure() {
                    error!(
                        "Failed to mutate part {} up to version {}: {}",
                        failed_part.name(),
                        result_info.mutation,
                        e
                    );
                    ctx.mutations.record_result(
                        sources_data_version,
                        &result_info,
                        &failed_part.name(),
                        failed_part.info(),
                        false,
                        Some((e.to_string(), format!("{:?}", e.status_code()))),
                        &ctx.backoff,
                        std::time::Duration::from_millis(
                            ctx.config.max_postpone_time_for_failed_mutations_ms,
                        ),
                    );
                } else {
                    // Abandoned merges (cancellation, reservation failures)
                    // leave no trace besides the log; the sources return to
                    // Active untouched.
                    info!("Merge of {} abandoned: {}", result_info, e);
                    ctx.mutations.notify_waiters();
                }
            }
        }
        result
    }

    /// The fallible body: stage, re-check cancellation, commit.
    async fn execute(self) -> Result<String> {
        let ctx = self.ctx;
        let entry = self.entry;
        let future = &entry.future_part;
        let partition_id = future.partition_id();

        if ctx.merges_blocker.is_cancelled_for_partition(partition_id) {
            return AbortedSnafu.fail();
        }

        let meta = PartMeta {
            info: future.info.clone(),
            uuid: future.uuid,
            rows: future.total_rows,
            bytes_on_disk: future.total_bytes,
            ttl_max: future.ttl_max,
            creation_tid: entry
                .txn
                .as_ref()
                .map(|txn| txn.tid())
                .unwrap_or(TransactionId::PREHISTORIC),
            creation_csn: None,
        };

        let tmp_prefix = if entry.is_mutation() {
            MUTATION_TMP_PREFIX
        } else {
            MERGE_TMP_PREFIX
        };
        // I/O happens here, with no lock held.
        let staged = ctx.access.stage_part(tmp_prefix, &meta).await?;

        let commit = Self::commit(&ctx, &entry, &meta, &staged).await;
        match commit {
            Ok(part) => {
                info!(
                    "{} {} parts into {}, {} rows",
                    if entry.is_mutation() { "Mutated" } else { "Merged" },
                    future.source_parts.len(),
                    part.name(),
                    part.rows(),
                );
                Ok(part.name())
            }
            Err(e) => {
                ctx.access.remove_staged(&staged).await;
                Err(e)
            }
        }
    }

    async fn commit(
        ctx: &TaskContext,
        entry: &SelectedEntry,
        meta: &PartMeta,
        staged: &std::path::Path,
    ) -> Result<PartHandle> {
        // Cancellation check at the last moment: a partition operation may
        // have started while the result was being written.
        if ctx
            .merges_blocker
            .is_cancelled_for_partition(&meta.info.partition_id)
        {
            return AbortedSnafu.fail();
        }
        for source in &entry.future_part.source_parts {
            if source.state() != PartState::Active {
                return AbortedSnafu.fail();
            }
        }

        ctx.access.commit_staged(staged, &meta.info).await?;

        let purger = source_purger(&entry.future_part.source_parts)?;
        let part = PartHandle::new(meta.clone(), PartState::PreCommitted, purger);
        ctx.registry.commit_part(&part)?;
        Ok(part)
    }
}

/// The result part reuses the purger of its sources.
fn source_purger(sources: &[PartHandle]) -> Result<crate::part::purger::PartPurgerRef> {
    sources
        .first()
        .map(|part| part.purger())
        .ok_or_else(|| {
            crate::error::LogicalSnafu {
                reason: "future part without sources",
            }
            .build()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessLayer;
    use crate::block::BlockAllocator;
    use crate::memory::BackgroundMemoryManagerImpl;
    use crate::merge::picker::MergePicker;
    use crate::mutation::registry::MutationRegistry;
    use crate::mutation::{MutationCommand, MutationEntry};
    use crate::part::info::PartInfo;
    use crate::part::purger::NoopPartPurger;
    use crate::part::registry::PartRegistry;
    use crate::storage::LocalStoragePolicy;
    use crate::txn::{InMemoryTransactionLog, TransactionId};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        ctx: Arc<TaskContext>,
        picker: MergePicker,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let access = Arc::new(AccessLayer::new(dir.path()));
        access.ensure_layout().await.unwrap();
        let registry = Arc::new(PartRegistry::new());
        let mutations = Arc::new(MutationRegistry::new(dir.path()));
        let config = Arc::new(crate::config::MergeTreeConfig::default());
        let memory: BackgroundMemoryManagerRef =
            Arc::new(BackgroundMemoryManagerImpl::new(u64::MAX));
        let backoff = Arc::new(MutationBackoffPolicy::new());

        let ctx = Arc::new(TaskContext {
            access,
            registry: registry.clone(),
            mutations: mutations.clone(),
            merges_blocker: Arc::new(PartitionBlocker::new()),
            backoff: backoff.clone(),
            config: config.clone(),
            memory: memory.clone(),
            listener: None,
        });
        let picker = MergePicker {
            registry,
            mutations,
            allocator: Arc::new(BlockAllocator::new()),
            backoff,
            config,
            memory,
            policy: Arc::new(LocalStoragePolicy::new("default", dir.path(), u64::MAX)),
            txn_log: Arc::new(InMemoryTransactionLog::new()),
            ttl_merges_in_pool: Arc::new(AtomicUsize::new(0)),
        };
        Fixture {
            ctx,
            picker,
            _dir: dir,
        }
    }

    async fn add_part_on_disk(f: &Fixture, block: i64) -> PartHandle {
        let meta = PartMeta {
            info: PartInfo::new_single_block("p", block),
            rows: 10,
            bytes_on_disk: 100,
            ..Default::default()
        };
        let staged = f.ctx.access.stage_part("tmp_insert_", &meta).await.unwrap();
        f.ctx.access.commit_staged(&staged, &meta.info).await.unwrap();
        let handle = PartHandle::new(meta, PartState::Active, Arc::new(NoopPartPurger));
        f.ctx.registry.load_part(handle.clone());
        f.picker.allocator.observe(block);
        handle
    }

    #[tokio::test]
    async fn test_merge_commits_result_and_outdates_sources() {
        let f = fixture().await;
        for block in 1..=3 {
            add_part_on_disk(&f, block).await;
        }

        let entry = f
            .picker
            .select_merge(None, false, false, false, None)
            .await
            .unwrap()
            .unwrap();
        MergeMutateTask::new(f.ctx.clone(), entry).run().await.unwrap();

        let visible = f.ctx.registry.get_visible(None);
        assert_eq!(visible.len(), 1);
        let result = visible[0].info();
        assert_eq!((result.min_block, result.max_block, result.level), (1, 3, 1));
        assert!(f.ctx.access.part_path(&result.dir_name()).exists());
        assert_eq!(
            f.ctx.registry.get_in_states(&[PartState::Outdated]).len(),
            3
        );
        assert!(f.ctx.registry.busy_parts().is_empty());
        assert_eq!(f.ctx.memory.usage(), 0);
    }

    #[tokio::test]
    async fn test_mutation_advances_data_version() {
        let f = fixture().await;
        add_part_on_disk(&f, 1).await;
        f.picker.allocator.observe(10);
        f.picker
            .mutations
            .add(MutationEntry::new(
                11,
                vec![MutationCommand::Update {
                    column: "a".to_string(),
                    expression: "1".to_string(),
                    predicate: None,
                }],
                TransactionId::PREHISTORIC,
            ))
            .await
            .unwrap();

        let entry = f.picker.select_mutate().unwrap().unwrap();
        MergeMutateTask::new(f.ctx.clone(), entry).run().await.unwrap();

        let visible = f.ctx.registry.get_visible(None);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].info().mutation, 11);
        assert_eq!(visible[0].data_version(), 11);

        // The mutation is now complete for every visible part.
        let status = f.ctx.mutations.incomplete_status(11, &visible).unwrap();
        assert!(status.is_done);
    }

    #[tokio::test]
    async fn test_cancelled_merge_leaves_sources_active() {
        let f = fixture().await;
        for block in 1..=2 {
            add_part_on_disk(&f, block).await;
        }
        let entry = f
            .picker
            .select_merge(None, false, false, false, None)
            .await
            .unwrap()
            .unwrap();

        let _blocker = f.ctx.merges_blocker.cancel_for_partition("p");
        let err = MergeMutateTask::new(f.ctx.clone(), entry).run().await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Aborted { .. }));

        assert_eq!(f.ctx.registry.get_visible(None).len(), 2);
        assert!(f.ctx.registry.busy_parts().is_empty());
        // No stray result directory remains.
        let dirs = f.ctx.access.list_part_dirs().await.unwrap();
        assert_eq!(dirs.len(), 2);
    }
}
