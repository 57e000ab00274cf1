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

//! Selection of parts to merge or mutate.
//!
//! Merge selection runs in two modes. Without a partition hint it applies a
//! write-amplification heuristic over contiguous runs of active parts and
//! fails fast under memory pressure. With a hint (OPTIMIZE, possibly FINAL)
//! it selects the whole partition, waiting for busy parts to drain.
//!
//! Mutation selection walks active parts in part-info order and squashes
//! consecutive mutation entries of one transaction into a single batch,
//! bounded by the expanded command weight and flushed at barrier commands.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::backoff::MutationBackoffPolicy;
use crate::block::{BlockAllocatorRef, BlockOp};
use crate::config::MergeTreeConfig;
use crate::error::{LogicalSnafu, NotEnoughSpaceSnafu, Result};
use crate::memory::BackgroundMemoryManagerRef;
use crate::merge::{
    FuturePart, MergeType, PartsTagger, SelectFailure, SelectResult, SelectedEntry,
    TtlMergeBooking,
};
use crate::mutation::registry::MutationRegistryRef;
use crate::mutation::{contain_barrier_command, MutationCommand, MutationFailure};
use crate::part::info::PartInfo;
use crate::part::registry::PartRegistryRef;
use crate::part::{unix_now, PartHandle, PartState};
use crate::storage::StoragePolicyRef;
use crate::txn::{TransactionLogRef, TransactionRef};
use crate::wait::wait_until;

/// Extra disk space reserved on top of the summed source size, to cover
/// temporary duplication while the result is being written.
const RESERVATION_HEADROOM_PERCENT: u64 = 10;

/// How often hinted selection re-checks memory pressure while polling.
const MEMORY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Picks parts to merge or mutate. One picker per table.
pub(crate) struct MergePicker {
    pub(crate) registry: PartRegistryRef,
    pub(crate) mutations: MutationRegistryRef,
    pub(crate) allocator: BlockAllocatorRef,
    pub(crate) backoff: Arc<MutationBackoffPolicy>,
    pub(crate) config: Arc<MergeTreeConfig>,
    pub(crate) memory: BackgroundMemoryManagerRef,
    pub(crate) policy: StoragePolicyRef,
    pub(crate) txn_log: TransactionLogRef,
    pub(crate) ttl_merges_in_pool: Arc<AtomicUsize>,
}

impl MergePicker {
    fn memory_ok(&self) -> std::result::Result<(), String> {
        if self.memory.can_enqueue_background_task() {
            return Ok(());
        }
        Err(format!(
            "Current background tasks memory usage ({}) is more than the limit ({})",
            self.memory.usage(),
            self.memory.soft_limit()
        ))
    }

    /// Selects parts to merge. `partition_hint` switches between the
    /// heuristic and the whole-partition mode.
    pub(crate) async fn select_merge(
        &self,
        partition_hint: Option<&str>,
        is_final: bool,
        aggressive: bool,
        optimize_skip_merged_partitions: bool,
        txn: Option<&TransactionRef>,
    ) -> Result<SelectResult> {
        match partition_hint {
            None => self.select_without_hint(aggressive, txn),
            Some(partition_id) => {
                self.select_in_partition(partition_id, is_final, optimize_skip_merged_partitions, txn)
                    .await
            }
        }
    }

    fn select_without_hint(
        &self,
        aggressive: bool,
        txn: Option<&TransactionRef>,
    ) -> Result<SelectResult> {
        if let Err(explanation) = self.memory_ok() {
            return Ok(Err(SelectFailure::cannot_select(explanation)));
        }

        let max_source_parts_size = self.config.max_source_parts_size;
        if max_source_parts_size == 0 {
            return Ok(Err(SelectFailure::cannot_select(
                "Current value of max_source_parts_size is zero",
            )));
        }

        let ttl_allowed = self.config.max_number_of_merges_with_ttl_in_pool > 0;
        let Some((parts, merge_type)) =
            self.pick_without_hint(aggressive, max_source_parts_size, ttl_allowed, txn)
        else {
            return Ok(Err(SelectFailure::nothing_to_merge(
                "There is nothing to merge",
            )));
        };

        self.construct_entry(parts, merge_type, false, txn).map(Ok)
    }

    async fn select_in_partition(
        &self,
        partition_id: &str,
        is_final: bool,
        optimize_skip_merged_partitions: bool,
        txn: Option<&TransactionRef>,
    ) -> Result<SelectResult> {
        let timeout = self.config.lock_acquire_timeout_for_background_operations;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Under memory pressure a hinted selection polls instead of
            // failing: the user asked for this merge explicitly.
            while let Err(explanation) = self.memory_ok() {
                if tokio::time::Instant::now() + MEMORY_POLL_INTERVAL > deadline {
                    return Ok(Err(SelectFailure::cannot_select(explanation)));
                }
                tokio::time::sleep(MEMORY_POLL_INTERVAL).await;
            }

            let parts = self.eligible_parts_in_partition(partition_id, txn);
            if parts.is_empty() {
                return Ok(Err(SelectFailure::nothing_to_merge(format!(
                    "There are no parts inside partition {partition_id}"
                ))));
            }

            if parts.len() == 1 && optimize_skip_merged_partitions {
                let part = &parts[0];
                let pending_mutation =
                    self.mutations.first_version_above(part.data_version()).is_some();
                if part.info().level > 0 && !pending_mutation {
                    return Ok(Err(SelectFailure::nothing_to_merge(format!(
                        "Partition {partition_id} is already merged into a single part"
                    ))));
                }
            }

            let infos: Vec<PartInfo> = parts.iter().map(|p| p.info().clone()).collect();
            let busy = self.registry.busy_count_among(&infos);
            if busy > 0 {
                if !is_final {
                    return Ok(Err(SelectFailure::cannot_select(format!(
                        "{busy} parts of partition {partition_id} are busy with background operations"
                    ))));
                }
                debug!(
                    "Waiting for currently running merges ({} parts are merging right now) \
                     to perform OPTIMIZE FINAL",
                    busy
                );
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let registry = self.registry.clone();
                let drained = wait_until(self.registry.drain_notify(), remaining, || {
                    registry.busy_count_among(&infos) == 0
                })
                .await;
                if !drained {
                    return Ok(Err(SelectFailure::cannot_select(format!(
                        "Timeout ({} ms) while waiting for already running merges before \
                         running OPTIMIZE with FINAL",
                        timeout.as_millis()
                    ))));
                }
                // Parts may have been swapped while waiting; reselect.
                continue;
            }

            if let Some(gap) = self.committing_gap(&parts) {
                return Ok(Err(SelectFailure::cannot_select(format!(
                    "Block number {gap} in partition {partition_id} is still committing"
                ))));
            }

            return self.construct_entry(parts, MergeType::Regular, is_final, txn).map(Ok);
        }
    }

    /// Active, visible, non-busy, non-patch parts of one partition.
    fn eligible_parts_in_partition(
        &self,
        partition_id: &str,
        txn: Option<&TransactionRef>,
    ) -> Vec<PartHandle> {
        self.registry
            .get_in_partition(partition_id, &[PartState::Active])
            .into_iter()
            .filter(|part| !part.info().is_patch())
            .filter(|part| match txn {
                Some(txn) => part.is_visible_to(txn.start_csn(), txn.tid()),
                None => true,
            })
            .collect()
    }

    /// First committing (non-update) block number falling strictly between
    /// two consecutive chosen parts, if any. Such a gap means an insert or
    /// mutation is still forming a part inside the range.
    fn committing_gap(&self, parts: &[PartHandle]) -> Option<i64> {
        let committing: Vec<i64> = self
            .allocator
            .committing_blocks()
            .into_iter()
            .filter(|block| block.op != BlockOp::Update)
            .map(|block| block.number)
            .collect();
        for pair in parts.windows(2) {
            let left = pair[0].info().max_block;
            let right = pair[1].info().min_block;
            if let Some(number) = committing.iter().find(|n| left < **n && **n < right) {
                return Some(*number);
            }
        }
        None
    }

    /// The write-amplification heuristic.
    ///
    /// Fully TTL-expired runs take priority and produce TTL merges. For
    /// regular work every contiguous window of at least two parts is
    /// scored by `total_size / (len - 1)` (bytes rewritten per part
    /// retired); the lowest score wins, older and lower-level windows break
    /// ties. Without `aggressive` a window dominated by one large part is
    /// skipped to avoid re-rewriting it for crumbs.
    fn pick_without_hint(
        &self,
        aggressive: bool,
        max_source_parts_size: u64,
        ttl_allowed: bool,
        txn: Option<&TransactionRef>,
    ) -> Option<(Vec<PartHandle>, MergeType)> {
        let mut by_partition: BTreeMap<String, Vec<PartHandle>> = BTreeMap::new();
        for part in self.registry.get_in_states(&[PartState::Active]) {
            if part.info().is_patch() || self.registry.is_busy(part.info()) {
                continue;
            }
            if let Some(txn) = txn {
                if !part.is_visible_to(txn.start_csn(), txn.tid()) {
                    continue;
                }
            }
            by_partition
                .entry(part.info().partition_id.clone())
                .or_default()
                .push(part);
        }

        let now = unix_now();
        if ttl_allowed {
            for parts in by_partition.values() {
                let expired: Vec<PartHandle> = longest_contiguous_run(parts, |part| {
                    part.meta().ttl_max.map(|ttl| ttl < now).unwrap_or(false)
                });
                if !expired.is_empty() {
                    return Some((expired, MergeType::Ttl));
                }
            }
        }

        let mut best: Option<(f64, Vec<PartHandle>)> = None;
        for parts in by_partition.values() {
            for run in self.mergeable_runs(parts) {
                for start in 0..run.len() {
                    let mut total = 0u64;
                    let mut largest = 0u64;
                    for end in start..run.len() {
                        total += run[end].bytes_on_disk();
                        largest = largest.max(run[end].bytes_on_disk());
                        let len = end - start + 1;
                        if len < 2 {
                            continue;
                        }
                        if total > max_source_parts_size {
                            break;
                        }
                        // One dominant part absorbing crumbs is write
                        // amplification without consolidation benefit.
                        if !aggressive && largest * 2 > total && len == 2 {
                            continue;
                        }
                        let score = (total + 1) as f64 / (len - 1) as f64;
                        let better = match &best {
                            Some((best_score, _)) => score < *best_score,
                            None => true,
                        };
                        if better {
                            best = Some((score, run[start..=end].to_vec()));
                        }
                    }
                }
            }
        }

        best.map(|(_, parts)| (parts, MergeType::Regular))
    }

    /// Splits the sorted parts of a partition into runs of mergeable
    /// neighbors: no committing block between them, and the same current
    /// mutation version (merging across a pending mutation would mark it
    /// applied without running it).
    fn mergeable_runs(&self, parts: &[PartHandle]) -> Vec<Vec<PartHandle>> {
        let committing: Vec<i64> = self
            .allocator
            .committing_blocks()
            .into_iter()
            .filter(|block| block.op != BlockOp::Update)
            .map(|block| block.number)
            .collect();

        let mut runs = Vec::new();
        let mut current: Vec<PartHandle> = Vec::new();
        for part in parts {
            let splits = current.last().map(|prev| {
                let left = prev.info().max_block;
                let right = part.info().min_block;
                committing.iter().any(|n| left < *n && *n < right)
                    || self.mutations.current_version_at(prev.data_version())
                        != self.mutations.current_version_at(part.data_version())
            });
            if splits == Some(true) {
                runs.push(std::mem::take(&mut current));
            }
            current.push(part.clone());
        }
        if !current.is_empty() {
            runs.push(current);
        }
        runs
    }

    /// Builds the selected entry: result info, disk reservation, busy
    /// markers, TTL booking.
    fn construct_entry(
        &self,
        parts: Vec<PartHandle>,
        merge_type: MergeType,
        is_final: bool,
        txn: Option<&TransactionRef>,
    ) -> Result<SelectedEntry> {
        let first = parts.first().expect("merge choice cannot be empty");
        let last = parts.last().unwrap();

        let level = self
            .registry
            .max_level_in_between(first.info(), last.info())?
            + 1;
        let info = PartInfo {
            partition_id: first.info().partition_id.clone(),
            min_block: first.info().min_block,
            max_block: last.info().max_block,
            level,
            mutation: parts.iter().map(|p| p.info().mutation).max().unwrap_or(0),
        };

        let total_bytes: u64 = parts.iter().map(|p| p.bytes_on_disk()).sum();
        let total_rows: u64 = parts.iter().map(|p| p.rows()).sum();
        let ttl_max = parts.iter().filter_map(|p| p.meta().ttl_max).max();

        let ttl_booking = match merge_type {
            MergeType::Ttl => {
                // Booked at selection time so the pool limit is respected
                // before the task is even scheduled. Failure to book
                // downgrades to a regular merge.
                TtlMergeBooking::try_book(
                    &self.ttl_merges_in_pool,
                    self.config.max_number_of_merges_with_ttl_in_pool,
                )
            }
            MergeType::Regular => None,
        };
        let merge_type = if ttl_booking.is_some() {
            MergeType::Ttl
        } else {
            MergeType::Regular
        };

        let needed = total_bytes + total_bytes * RESERVATION_HEADROOM_PERCENT / 100;
        let reservation = self.policy.reserve(needed, None).ok_or_else(|| {
            NotEnoughSpaceSnafu {
                bytes: needed,
                policy: self.policy.name().to_string(),
            }
            .build()
        })?;

        let infos: Vec<PartInfo> = parts.iter().map(|p| p.info().clone()).collect();
        let tagger = PartsTagger::new(self.registry.clone(), infos, Some(reservation))?;

        let future_part = FuturePart {
            info,
            source_parts: parts,
            total_bytes,
            total_rows,
            merge_type,
            uuid: self.config.assign_part_uuids.then(Uuid::new_v4),
            ttl_max,
            is_final,
        };
        debug!("Selected {:?} for merge", future_part);

        Ok(SelectedEntry {
            future_part,
            tagger,
            commands: Arc::new(Vec::new()),
            txn: txn.cloned(),
            ttl_booking,
        })
    }

    /// Selects one part to mutate together with its squashed command batch.
    pub(crate) fn select_mutate(&self) -> Result<Option<SelectedEntry>> {
        if self.mutations.is_empty() {
            return Ok(None);
        }

        let max_source_part_size = self.config.max_source_part_size_for_mutation;
        if max_source_part_size == 0 {
            debug!("Mutation source part size budget is zero, not mutating");
            return Ok(None);
        }
        let max_ast_elements = self.config.max_expanded_ast_elements;

        for part in self.registry.get_in_states(&[PartState::Active]) {
            if self.registry.is_busy(part.info()) || part.info().is_patch() {
                continue;
            }

            let data_version = part.data_version();
            let Some(first_version) = self.mutations.first_version_above(data_version) else {
                continue;
            };

            if part.bytes_on_disk() > max_source_part_size {
                trace!(
                    "Max source part size for mutation is {} but part size is {}. \
                     Will not mutate part {} yet",
                    max_source_part_size,
                    part.bytes_on_disk(),
                    part.name()
                );
                continue;
            }

            if !self.backoff.part_can_be_mutated(&part.name()) {
                trace!(
                    "According to exponential backoff policy, do not perform mutations \
                     for the part {} yet. Put it aside",
                    part.name()
                );
                continue;
            }

            let pending: Vec<_> = self
                .mutations
                .entries()
                .into_iter()
                .filter(|entry| entry.version >= first_version)
                .collect();
            let Some(first_entry) = pending.first() else {
                continue;
            };

            let first_tid = first_entry.tid;
            let mut txn = None;
            if !first_tid.is_prehistoric() {
                // Mutate visible parts only: an invisible part would fail
                // with a serialization error anyway.
                let Some(running) = self.txn_log.try_get_running(first_tid.hash()) else {
                    return LogicalSnafu {
                        reason: format!(
                            "cannot find transaction {first_tid} that has started mutation {}",
                            first_entry.version
                        ),
                    }
                    .fail();
                };
                if !part.is_visible_to(running.start_csn(), first_tid) {
                    continue;
                }
                txn = Some(running);
            }

            let mut commands: Vec<MutationCommand> = Vec::new();
            let mut current_elements = 0usize;
            let mut last_version = None;
            for entry in &pending {
                // Entries of different transactions never squash, so they
                // can commit and roll back independently.
                if entry.tid != first_tid {
                    break;
                }

                let entry_weight: usize =
                    entry.commands.iter().map(MutationCommand::weight).sum();
                if current_elements + entry_weight >= max_ast_elements {
                    if commands.is_empty() {
                        // A single oversized entry can never be applied;
                        // surface it instead of silently spinning.
                        self.mutations.set_fail(
                            entry.version,
                            MutationFailure {
                                part_name: part.name(),
                                part_info: part.info().clone(),
                                reason: format!(
                                    "mutation commands weight {entry_weight} exceeds \
                                     max_expanded_ast_elements {max_ast_elements}"
                                ),
                                error_code: "BAD_ARGUMENTS".to_string(),
                                time: unix_now(),
                            },
                        );
                    }
                    break;
                }

                if contain_barrier_command(&entry.commands) {
                    if commands.is_empty() {
                        commands.extend(entry.commands.iter().cloned());
                        last_version = Some(entry.version);
                    }
                    break;
                }

                current_elements += entry_weight;
                commands.extend(entry.commands.iter().cloned());
                last_version = Some(entry.version);
            }

            let Some(last_version) = last_version else {
                continue;
            };

            let info = PartInfo {
                mutation: last_version,
                ..part.info().clone()
            };
            let total_bytes = part.bytes_on_disk();
            let needed = total_bytes + total_bytes * RESERVATION_HEADROOM_PERCENT / 100;
            let reservation = self.policy.reserve(needed, None).ok_or_else(|| {
                NotEnoughSpaceSnafu {
                    bytes: needed,
                    policy: self.policy.name().to_string(),
                }
                .build()
            })?;
            let tagger = PartsTagger::new(
                self.registry.clone(),
                vec![part.info().clone()],
                Some(reservation),
            )?;

            let future_part = FuturePart {
                info,
                total_rows: part.rows(),
                total_bytes,
                source_parts: vec![part],
                merge_type: MergeType::Regular,
                uuid: self.config.assign_part_uuids.then(Uuid::new_v4),
                ttl_max: None,
                is_final: false,
            };

            return Ok(Some(SelectedEntry {
                future_part,
                tagger,
                commands: Arc::new(commands),
                txn,
                ttl_booking: None,
            }));
        }

        Ok(None)
    }
}

/// Longest contiguous run of parts satisfying `pred`, anywhere in the
/// sorted slice.
fn longest_contiguous_run(
    parts: &[PartHandle],
    pred: impl Fn(&PartHandle) -> bool,
) -> Vec<PartHandle> {
    let mut best: Vec<PartHandle> = Vec::new();
    let mut current: Vec<PartHandle> = Vec::new();
    for part in parts {
        if pred(part) {
            current.push(part.clone());
        } else {
            if current.len() > best.len() {
                best = std::mem::take(&mut current);
            }
            current.clear();
        }
    }
    if current.len() > best.len() {
        best = current;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BackgroundMemoryManagerImpl;
    use crate::mutation::registry::MutationRegistry;
    use crate::mutation::MutationEntry;
    use crate::part::purger::NoopPartPurger;
    use crate::part::registry::PartRegistry;
    use crate::part::PartMeta;
    use crate::storage::LocalStoragePolicy;
    use crate::txn::{InMemoryTransactionLog, TransactionId};

    struct Fixture {
        picker: MergePicker,
        _dir: tempfile::TempDir,
    }

    fn fixture(config: MergeTreeConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let picker = MergePicker {
            registry: Arc::new(PartRegistry::new()),
            mutations: Arc::new(MutationRegistry::new(dir.path())),
            allocator: Arc::new(crate::block::BlockAllocator::new()),
            backoff: Arc::new(MutationBackoffPolicy::new()),
            config: Arc::new(config),
            memory: Arc::new(BackgroundMemoryManagerImpl::new(u64::MAX)),
            policy: Arc::new(LocalStoragePolicy::new("default", "/tmp/data", u64::MAX)),
            txn_log: Arc::new(InMemoryTransactionLog::new()),
            ttl_merges_in_pool: Arc::new(AtomicUsize::new(0)),
        };
        Fixture { picker, _dir: dir }
    }

    fn add_part(picker: &MergePicker, partition: &str, block: i64, bytes: u64) -> PartHandle {
        let handle = PartHandle::new(
            PartMeta {
                info: PartInfo::new_single_block(partition, block),
                rows: 10,
                bytes_on_disk: bytes,
                ..Default::default()
            },
            PartState::Active,
            Arc::new(NoopPartPurger),
        );
        picker.registry.load_part(handle.clone());
        picker.allocator.observe(block);
        handle
    }

    #[tokio::test]
    async fn test_hintless_merges_contiguous_parts() {
        let f = fixture(MergeTreeConfig::default());
        for block in 1..=3 {
            add_part(&f.picker, "p", block, 100);
        }

        let entry = f
            .picker
            .select_merge(None, false, false, false, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.future_part.source_parts.len(), 3);
        assert_eq!(entry.future_part.info.min_block, 1);
        assert_eq!(entry.future_part.info.max_block, 3);
        assert_eq!(entry.future_part.info.level, 1);
        // Sources are busy while the entry is alive.
        assert_eq!(f.picker.registry.busy_parts().len(), 3);
        drop(entry);
        assert!(f.picker.registry.busy_parts().is_empty());
    }

    #[tokio::test]
    async fn test_hintless_nothing_to_merge_for_single_part() {
        let f = fixture(MergeTreeConfig::default());
        add_part(&f.picker, "p", 1, 100);
        let failure = f
            .picker
            .select_merge(None, false, false, false, None)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(failure.reason, crate::merge::SelectFailureReason::NothingToMerge);
    }

    #[tokio::test]
    async fn test_memory_pressure_fails_hintless_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let picker = MergePicker {
            memory: Arc::new(BackgroundMemoryManagerImpl::new(0)),
            registry: Arc::new(PartRegistry::new()),
            mutations: Arc::new(MutationRegistry::new(dir.path())),
            allocator: Arc::new(crate::block::BlockAllocator::new()),
            backoff: Arc::new(MutationBackoffPolicy::new()),
            config: Arc::new(MergeTreeConfig::default()),
            policy: Arc::new(LocalStoragePolicy::new("default", "/tmp/data", u64::MAX)),
            txn_log: Arc::new(InMemoryTransactionLog::new()),
            ttl_merges_in_pool: Arc::new(AtomicUsize::new(0)),
        };
        add_part(&picker, "p", 1, 100);
        add_part(&picker, "p", 2, 100);

        let failure = picker
            .select_merge(None, false, false, false, None)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(failure.reason, crate::merge::SelectFailureReason::CannotSelect);
        assert!(failure.explanation.contains("memory"));
    }

    #[tokio::test]
    async fn test_committing_block_splits_runs() {
        let f = fixture(MergeTreeConfig::default());
        add_part(&f.picker, "p", 1, 100);
        add_part(&f.picker, "p", 2, 100);
        // An insert in flight between blocks 2 and 5.
        let _committing = f.picker.allocator.allocate(BlockOp::NewPart);
        add_part(&f.picker, "p", 5, 100);
        add_part(&f.picker, "p", 6, 100);

        let entry = f
            .picker
            .select_merge(None, false, false, false, None)
            .await
            .unwrap()
            .unwrap();
        // Only one side of the gap is picked, never across it.
        let blocks: Vec<i64> = entry
            .future_part
            .source_parts
            .iter()
            .map(|p| p.info().min_block)
            .collect();
        assert!(blocks == vec![1, 2] || blocks == vec![5, 6]);
    }

    #[tokio::test]
    async fn test_final_selects_whole_partition_and_waits_for_busy() {
        let f = fixture(MergeTreeConfig::default());
        for block in 1..=3 {
            add_part(&f.picker, "p", block, 100);
        }
        let tagged = PartInfo::new_single_block("p", 1);
        f.picker.registry.mark_busy(std::slice::from_ref(&tagged)).unwrap();

        let registry = f.picker.registry.clone();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            registry.unmark_busy(&[tagged]);
        });

        let entry = f
            .picker
            .select_merge(Some("p"), true, true, false, None)
            .await
            .unwrap()
            .unwrap();
        release.await.unwrap();
        assert_eq!(entry.future_part.source_parts.len(), 3);
        assert!(entry.future_part.is_final);
    }

    #[tokio::test]
    async fn test_skip_merged_partitions() {
        let f = fixture(MergeTreeConfig::default());
        let merged = PartHandle::new(
            PartMeta {
                info: PartInfo {
                    partition_id: "p".to_string(),
                    min_block: 1,
                    max_block: 5,
                    level: 1,
                    mutation: 0,
                },
                rows: 10,
                bytes_on_disk: 100,
                ..Default::default()
            },
            PartState::Active,
            Arc::new(NoopPartPurger),
        );
        f.picker.registry.load_part(merged);

        let failure = f
            .picker
            .select_merge(Some("p"), true, true, true, None)
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(failure.reason, crate::merge::SelectFailureReason::NothingToMerge);
    }

    #[tokio::test]
    async fn test_ttl_merge_books_pool_slot() {
        let f = fixture(MergeTreeConfig::default());
        let expired = PartHandle::new(
            PartMeta {
                info: PartInfo::new_single_block("p", 1),
                rows: 10,
                bytes_on_disk: 100,
                ttl_max: Some(1),
                ..Default::default()
            },
            PartState::Active,
            Arc::new(NoopPartPurger),
        );
        f.picker.registry.load_part(expired);

        let entry = f
            .picker
            .select_merge(None, false, false, false, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.future_part.merge_type, MergeType::Ttl);
        assert!(entry.ttl_booking.is_some());
        assert_eq!(
            f.picker
                .ttl_merges_in_pool
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        drop(entry);
        assert_eq!(
            f.picker
                .ttl_merges_in_pool
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    fn update(column: &str) -> MutationCommand {
        MutationCommand::Update {
            column: column.to_string(),
            expression: "1".to_string(),
            predicate: None,
        }
    }

    #[tokio::test]
    async fn test_mutation_squash_stops_at_barrier() {
        let f = fixture(MergeTreeConfig::default());
        add_part(&f.picker, "p", 1, 100);
        f.picker.allocator.observe(10);

        for (version, command) in [
            (11, update("a")),
            (12, update("a")),
            (
                13,
                MutationCommand::DropColumn {
                    column: "other".to_string(),
                },
            ),
        ] {
            f.picker
                .mutations
                .add(MutationEntry::new(version, vec![command], TransactionId::PREHISTORIC))
                .await
                .unwrap();
        }

        let entry = f.picker.select_mutate().unwrap().unwrap();
        // The two updates squash; the barrier stays behind.
        assert_eq!(entry.commands.len(), 2);
        assert_eq!(entry.future_part.info.mutation, 12);
        drop(entry);

        // Once the part reaches version 12, the barrier applies alone.
        let mutated = PartHandle::new(
            PartMeta {
                info: PartInfo {
                    partition_id: "p".to_string(),
                    min_block: 1,
                    max_block: 1,
                    level: 0,
                    mutation: 12,
                },
                rows: 10,
                bytes_on_disk: 100,
                ..Default::default()
            },
            PartState::Active,
            Arc::new(NoopPartPurger),
        );
        let registry = Arc::new(PartRegistry::new());
        registry.load_part(mutated);
        let mut picker = f.picker;
        picker.registry = registry;

        let entry = picker.select_mutate().unwrap().unwrap();
        assert_eq!(entry.commands.len(), 1);
        assert!(entry.commands[0].is_barrier());
        assert_eq!(entry.future_part.info.mutation, 13);
    }

    #[tokio::test]
    async fn test_mutation_respects_backoff() {
        let f = fixture(MergeTreeConfig::default());
        let part = add_part(&f.picker, "p", 1, 100);
        f.picker.allocator.observe(10);
        f.picker
            .mutations
            .add(MutationEntry::new(11, vec![update("a")], TransactionId::PREHISTORIC))
            .await
            .unwrap();

        f.picker
            .backoff
            .add_part_failure(&part.name(), Duration::from_secs(300));
        assert!(f.picker.select_mutate().unwrap().is_none());

        f.picker.backoff.remove_part(&part.name());
        assert!(f.picker.select_mutate().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mutations_of_different_transactions_never_squash() {
        let f = fixture(MergeTreeConfig::default());
        add_part(&f.picker, "p", 1, 100);
        f.picker.allocator.observe(10);

        let log = f.picker.txn_log.clone();
        let txn_a = log.begin();
        let txn_b = log.begin();
        f.picker
            .mutations
            .add(MutationEntry::new(11, vec![update("a")], txn_a.tid()))
            .await
            .unwrap();
        f.picker
            .mutations
            .add(MutationEntry::new(12, vec![update("b")], txn_b.tid()))
            .await
            .unwrap();

        let entry = f.picker.select_mutate().unwrap().unwrap();
        assert_eq!(entry.commands.len(), 1);
        assert_eq!(entry.future_part.info.mutation, 11);
        assert_eq!(entry.txn.as_ref().unwrap().tid(), txn_a.tid());
    }
}
