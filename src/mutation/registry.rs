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

//! The ordered map of pending and finished mutations.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use snafu::{ensure, ResultExt};
use tokio::fs;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::backoff::MutationBackoffPolicy;
use crate::error::{IoSnafu, LogicalSnafu, Result};
use crate::mutation::{
    self, IncompleteMutationStatus, MutationEntry, MutationFailure, MutationStatus,
};
use crate::part::info::PartInfo;
use crate::part::PartHandle;
use crate::txn::{Csn, TransactionLog};

/// Numbers of unfinished mutations per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationCounters {
    /// Mutations rewriting row data.
    pub num_data: usize,
    /// Metadata-only mutations (drops, renames).
    pub num_metadata: usize,
}

impl MutationCounters {
    fn apply(&mut self, entry: &MutationEntry, delta: isize) {
        let slot = if entry.mutates_data() {
            &mut self.num_data
        } else {
            &mut self.num_metadata
        };
        *slot = slot.checked_add_signed(delta).unwrap_or_default();
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    by_version: BTreeMap<i64, MutationEntry>,
    counters: MutationCounters,
}

/// Registry of mutation entries, keyed by version.
#[derive(Debug)]
pub struct MutationRegistry {
    /// Directory holding the `mutation_*.txt` files (the table data root).
    dir: PathBuf,
    state: Mutex<RegistryState>,
    /// Notified whenever the done/failed state of any mutation may have
    /// changed. `wait_for_mutation` sleeps on this.
    waiters: Notify,
}

pub type MutationRegistryRef = Arc<MutationRegistry>;

impl MutationRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> MutationRegistry {
        MutationRegistry {
            dir: dir.into(),
            state: Mutex::default(),
            waiters: Notify::new(),
        }
    }

    pub(crate) fn wait_notify(&self) -> &Notify {
        &self.waiters
    }

    pub(crate) fn notify_waiters(&self) {
        self.waiters.notify_waiters();
    }

    /// Persists the entry and inserts it into the version map.
    pub(crate) async fn add(&self, entry: MutationEntry) -> Result<()> {
        mutation::write_entry(&self.dir, &entry).await?;
        let mut state = self.state.lock().unwrap();
        ensure!(
            !state.by_version.contains_key(&entry.version),
            LogicalSnafu {
                reason: format!("mutation {} already exists", entry.version),
            }
        );
        state.counters.apply(&entry, 1);
        state.by_version.insert(entry.version, entry);
        Ok(())
    }

    /// Removes an entry from the map. The caller deletes the file.
    pub(crate) fn remove(&self, version: i64) -> Option<MutationEntry> {
        let mut state = self.state.lock().unwrap();
        let entry = state.by_version.remove(&version)?;
        if !entry.is_done {
            state.counters.apply(&entry, -1);
        }
        Some(entry)
    }

    /// Loads mutation files from the data root. Staged `tmp_mutation_*`
    /// files are discarded. Entries of transactions the log no longer
    /// considers committed are discarded as well. Returns the max loaded
    /// version.
    pub(crate) async fn load(&self, txn_log: &dyn TransactionLog) -> Result<i64> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await.context(IoSnafu {
            path: self.dir.display().to_string(),
        })?;
        while let Some(entry) = entries.next_entry().await.context(IoSnafu {
            path: self.dir.display().to_string(),
        })? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if mutation::is_tmp_mutation_file(&name) {
                fs::remove_file(entry.path()).await.context(IoSnafu {
                    path: entry.path().display().to_string(),
                })?;
            } else if mutation::is_mutation_file(&name) {
                names.push(name);
            }
        }

        let mut max_version = 0;
        for name in names {
            let mut entry = mutation::load_entry(&self.dir, &name).await?;
            debug!(
                "Loading mutation: {} entry, commands size: {}",
                name,
                entry.commands.len()
            );

            if !entry.tid.is_prehistoric() && entry.csn.is_none() {
                if let Some(csn) = txn_log.csn(entry.tid) {
                    // Transaction is committed, record its CSN in the file.
                    mutation::append_csn(&self.dir, entry.version, csn).await?;
                    entry.csn = Some(csn);
                } else {
                    txn_log.assert_tid_is_not_outdated(entry.tid)?;
                    info!(
                        "Mutation entry {} was created by transaction {} which did not \
                         commit. Removing mutation entry",
                        name, entry.tid
                    );
                    mutation::remove_file(&self.dir, entry.version).await?;
                    continue;
                }
            }

            max_version = max_version.max(entry.version);
            let mut state = self.state.lock().unwrap();
            ensure!(
                !state.by_version.contains_key(&entry.version),
                LogicalSnafu {
                    reason: format!("mutation {} already exists", entry.version),
                }
            );
            state.counters.apply(&entry, 1);
            state.by_version.insert(entry.version, entry);
        }
        Ok(max_version)
    }

    /// Records the transaction CSN on the entry and appends it to the file.
    pub(crate) async fn set_csn(&self, version: i64, csn: Csn) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let entry = state.by_version.get_mut(&version).ok_or_else(|| {
                LogicalSnafu {
                    reason: format!("cannot find mutation {version}"),
                }
                .build()
            })?;
            entry.csn = Some(csn);
        }
        mutation::append_csn(&self.dir, version, csn).await
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().by_version.is_empty()
    }

    pub fn counters(&self) -> MutationCounters {
        self.state.lock().unwrap().counters
    }

    /// Snapshot of all entries in version order. Command lists are shared,
    /// the copy is cheap.
    pub fn entries(&self) -> Vec<MutationEntry> {
        self.state.lock().unwrap().by_version.values().cloned().collect()
    }

    pub fn get(&self, version: i64) -> Option<MutationEntry> {
        self.state.lock().unwrap().by_version.get(&version).cloned()
    }

    /// Smallest version strictly above `data_version`, i.e. the next
    /// mutation a part at that version still has to apply.
    pub fn first_version_above(&self, data_version: i64) -> Option<i64> {
        let state = self.state.lock().unwrap();
        state
            .by_version
            .range((Bound::Excluded(data_version), Bound::Unbounded))
            .next()
            .map(|(version, _)| *version)
    }

    /// Largest version at or below `data_version`: the mutation a part at
    /// that version is currently on. Zero when none applies. Two parts can
    /// merge only when these are equal, otherwise the result would skip a
    /// pending mutation for the older part.
    pub fn current_version_at(&self, data_version: i64) -> i64 {
        let state = self.state.lock().unwrap();
        state
            .by_version
            .range((Bound::Unbounded, Bound::Included(data_version)))
            .next_back()
            .map(|(version, _)| *version)
            .unwrap_or(0)
    }

    /// Entries with versions in `(from, to]`, the range affected by a
    /// mutation whose sources were at data version `from` and whose result
    /// is at `to`.
    pub fn entries_between(&self, from: i64, to: i64) -> Vec<MutationEntry> {
        let state = self.state.lock().unwrap();
        state
            .by_version
            .range((Bound::Excluded(from), Bound::Included(to)))
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    /// Records the outcome of a merge/mutate task on every entry between
    /// the sources' data version and the result's. On success, failure
    /// marks of parts now covered by the result are cleared; on failure the
    /// failing part enters its backoff window at the batch's final version.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record_result(
        &self,
        sources_data_version: i64,
        result_info: &PartInfo,
        failed_part_name: &str,
        failed_part_info: &PartInfo,
        is_successful: bool,
        fail_reason: Option<(String, String)>,
        backoff: &MutationBackoffPolicy,
        max_postpone: std::time::Duration,
    ) {
        let result_data_version = result_info.data_version();
        if sources_data_version != result_data_version {
            let mut state = self.state.lock().unwrap();
            let range = (
                Bound::Excluded(sources_data_version),
                Bound::Included(result_data_version),
            );
            for (version, entry) in state.by_version.range_mut(range) {
                if is_successful {
                    let clears = entry
                        .latest_fail
                        .as_ref()
                        .map(|fail| result_info.covers(&fail.part_info))
                        .unwrap_or(false);
                    if clears {
                        entry.latest_fail = None;
                        if *version == result_info.mutation {
                            backoff.remove_part(failed_part_name);
                        }
                    }
                } else {
                    let (reason, error_code) = fail_reason.clone().unwrap_or_default();
                    entry.latest_fail = Some(MutationFailure {
                        part_name: failed_part_name.to_string(),
                        part_info: failed_part_info.clone(),
                        reason,
                        error_code,
                        time: crate::part::unix_now(),
                    });
                    if *version == result_info.mutation {
                        backoff.add_part_failure(failed_part_name, max_postpone);
                    }
                }
            }
        }

        self.notify_waiters();
    }

    /// Marks a selection-time failure (e.g. command size validation) on one
    /// entry without entering backoff: the failure may be transient and the
    /// entry is retried on the next tick, but the reason stays observable.
    pub(crate) fn set_fail(&self, version: i64, failure: MutationFailure) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.by_version.get_mut(&version) {
            entry.latest_fail = Some(failure);
        }
    }

    /// Status of a possibly-running mutation, `None` when the entry was
    /// killed. `visible_parts` is the caller's visibility snapshot.
    pub fn incomplete_status(
        &self,
        version: i64,
        visible_parts: &[PartHandle],
    ) -> Option<IncompleteMutationStatus> {
        let state = self.state.lock().unwrap();
        let entry = state.by_version.get(&version)?;

        for part in visible_parts {
            if part.data_version() >= version {
                continue;
            }
            if let Some(fail) = &entry.latest_fail {
                return Some(IncompleteMutationStatus {
                    is_done: false,
                    latest_fail: Some(fail.clone()),
                });
            }
            // A part held for removal by a different transaction will most
            // likely never be mutated by this entry.
            let locked_by = part.removal_tid_hash();
            if locked_by != 0 && locked_by != entry.tid.hash() {
                return Some(IncompleteMutationStatus {
                    is_done: false,
                    latest_fail: Some(MutationFailure {
                        part_name: part.name(),
                        part_info: part.info().clone(),
                        reason: format!(
                            "Serialization error: part {} is locked by transaction {}",
                            part.name(),
                            locked_by
                        ),
                        error_code: "PART_IS_LOCKED".to_string(),
                        time: crate::part::unix_now(),
                    }),
                });
            }
            return Some(IncompleteMutationStatus {
                is_done: false,
                latest_fail: None,
            });
        }

        Some(IncompleteMutationStatus {
            is_done: true,
            latest_fail: None,
        })
    }

    /// Status rows for every entry, with the names of parts still to do.
    pub fn statuses(&self, visible_parts: &[PartHandle]) -> Vec<MutationStatus> {
        let mut versions: Vec<(i64, String)> = visible_parts
            .iter()
            .map(|part| (part.data_version(), part.name()))
            .collect();
        versions.sort();

        let state = self.state.lock().unwrap();
        state
            .by_version
            .iter()
            .map(|(version, entry)| {
                let split = versions.partition_point(|(data_version, _)| data_version < version);
                let parts_to_do = versions[..split]
                    .iter()
                    .map(|(_, name)| name.clone())
                    .collect::<Vec<_>>();
                MutationStatus {
                    name: entry.file_name(),
                    commands: entry.commands.clone(),
                    create_time: entry.create_time,
                    block_number: entry.version,
                    is_done: parts_to_do.is_empty(),
                    parts_to_do,
                    latest_fail: entry.latest_fail.clone(),
                }
            })
            .collect()
    }

    /// Commands of entries that still have parts to catch up, keyed by
    /// entry file name. Readers apply these on the fly.
    pub fn unfinished_commands(
        &self,
        visible_parts: &[PartHandle],
    ) -> BTreeMap<String, Arc<Vec<crate::mutation::MutationCommand>>> {
        let min_data_version = visible_parts.iter().map(|p| p.data_version()).min();
        let state = self.state.lock().unwrap();
        state
            .by_version
            .iter()
            .filter(|(version, _)| match min_data_version {
                Some(min) => min < **version,
                None => false,
            })
            .map(|(_, entry)| (entry.file_name(), entry.commands.clone()))
            .collect()
    }

    /// Serialized entries with `version >= min_version`, for backup
    /// enumeration.
    pub fn backup_entries(&self, min_version: i64) -> Result<Vec<(String, String)>> {
        let state = self.state.lock().unwrap();
        state
            .by_version
            .range(min_version..)
            .map(|(_, entry)| {
                let body = serde_json::json!({
                    "commands": entry.commands.as_ref(),
                    "create_time": entry.create_time,
                    "tid": entry.tid,
                });
                Ok((entry.file_name(), body.to_string()))
            })
            .collect()
    }

    /// Reclaims entries below the min part data version, keeping the
    /// configured tail of finished ones. Returns the removed entries; the
    /// caller deletes their files.
    pub(crate) fn clear_finished(
        &self,
        min_part_data_version: Option<i64>,
        finished_mutations_to_keep: usize,
        txn_log: &dyn TransactionLog,
    ) -> Result<Vec<MutationEntry>> {
        let mut state = self.state.lock().unwrap();

        let end = match min_part_data_version {
            // Everything at or below the min data version is finished.
            Some(min) => Bound::Included(min),
            None => Bound::Unbounded,
        };

        let mut done_versions = Vec::new();
        for (version, entry) in state.by_version.range_mut((Bound::Unbounded, end)) {
            // Entries of running transactions must stay; everything after
            // them stays too, so removal order follows version order.
            if !entry.tid.is_prehistoric() && txn_log.csn(entry.tid).is_none() {
                break;
            }
            if !entry.is_done {
                entry.is_done = true;
            }
            done_versions.push(*version);
        }
        // Re-count unfinished entries; done ones left the counters.
        let mut counters = MutationCounters::default();
        for entry in state.by_version.values() {
            if !entry.is_done {
                counters.apply(entry, 1);
            }
        }
        state.counters = counters;

        if done_versions.len() <= finished_mutations_to_keep {
            return Ok(Vec::new());
        }
        let to_delete_count = done_versions.len() - finished_mutations_to_keep;

        let mut removed = Vec::with_capacity(to_delete_count);
        for version in done_versions.into_iter().take(to_delete_count) {
            let entry = state.by_version.remove(&version).unwrap();
            ensure!(
                entry.tid.is_prehistoric() || txn_log.csn(entry.tid).is_some(),
                LogicalSnafu {
                    reason: format!(
                        "cannot remove mutation {version}: transaction {} is not committed",
                        entry.tid
                    ),
                }
            );
            removed.push(entry);
        }
        Ok(removed)
    }

    /// Deletes the files of reclaimed entries.
    pub(crate) async fn remove_files(&self, entries: &[MutationEntry]) -> Result<()> {
        for entry in entries {
            debug!("Removing mutation: {}", entry.file_name());
            mutation::remove_file(&self.dir, entry.version).await?;
        }
        Ok(())
    }

    /// Deletes the file of one entry, after a kill.
    pub(crate) async fn remove_file(&self, version: i64) -> Result<()> {
        mutation::remove_file(&self.dir, version).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationCommand;
    use crate::part::info::PartInfo;
    use crate::part::purger::NoopPartPurger;
    use crate::part::{PartMeta, PartState};
    use crate::txn::{InMemoryTransactionLog, TransactionId};

    fn update(column: &str) -> MutationCommand {
        MutationCommand::Update {
            column: column.to_string(),
            expression: "1".to_string(),
            predicate: None,
        }
    }

    fn part(block: i64, mutation: i64) -> PartHandle {
        PartHandle::new(
            PartMeta {
                info: PartInfo {
                    partition_id: "p".to_string(),
                    min_block: block,
                    max_block: block,
                    level: 0,
                    mutation,
                },
                rows: 1,
                bytes_on_disk: 1,
                ..Default::default()
            },
            PartState::Active,
            Arc::new(NoopPartPurger),
        )
    }

    #[tokio::test]
    async fn test_add_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MutationRegistry::new(dir.path());
        let entry = MutationEntry::new(5, vec![update("a")], TransactionId::PREHISTORIC);
        registry.add(entry.clone()).await.unwrap();
        assert_eq!(registry.counters().num_data, 1);

        // Duplicate versions are a bug.
        let dup = MutationEntry::new(5, vec![update("b")], TransactionId::PREHISTORIC);
        assert!(registry.add(dup).await.is_err());

        let log = InMemoryTransactionLog::new();
        let fresh = MutationRegistry::new(dir.path());
        let max_version = fresh.load(&log).await.unwrap();
        assert_eq!(max_version, 5);
        let loaded = fresh.get(5).unwrap();
        assert_eq!(loaded.commands, entry.commands);
        assert_eq!(loaded.create_time, entry.create_time);
        assert_eq!(loaded.tid, entry.tid);
    }

    #[tokio::test]
    async fn test_load_discards_uncommitted_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let log = InMemoryTransactionLog::new();
        let committed = log.begin();
        let running = log.begin();

        let registry = MutationRegistry::new(dir.path());
        registry
            .add(MutationEntry::new(1, vec![update("a")], committed.tid()))
            .await
            .unwrap();
        registry
            .add(MutationEntry::new(2, vec![update("b")], running.tid()))
            .await
            .unwrap();
        log.commit(&committed);

        let fresh = MutationRegistry::new(dir.path());
        fresh.load(&log).await.unwrap();
        // Committed transaction's entry got its CSN recorded; the running
        // one was discarded together with its file.
        assert!(fresh.get(1).unwrap().csn.is_some());
        assert!(fresh.get(2).is_none());
        assert!(!dir.path().join(crate::mutation::file_name(2)).exists());
    }

    #[tokio::test]
    async fn test_version_queries() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MutationRegistry::new(dir.path());
        for version in [3, 5, 9] {
            registry
                .add(MutationEntry::new(version, vec![update("a")], TransactionId::PREHISTORIC))
                .await
                .unwrap();
        }
        assert_eq!(registry.first_version_above(0), Some(3));
        assert_eq!(registry.first_version_above(3), Some(5));
        assert_eq!(registry.first_version_above(9), None);
        let between: Vec<i64> = registry.entries_between(3, 9).iter().map(|e| e.version).collect();
        assert_eq!(between, vec![5, 9]);
    }

    #[tokio::test]
    async fn test_record_result_failure_and_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MutationRegistry::new(dir.path());
        registry
            .add(MutationEntry::new(5, vec![update("a")], TransactionId::PREHISTORIC))
            .await
            .unwrap();
        let backoff = MutationBackoffPolicy::new();
        let max_postpone = std::time::Duration::from_secs(300);

        let source = part(1, 0);
        let result_info = PartInfo {
            partition_id: "p".to_string(),
            min_block: 1,
            max_block: 1,
            level: 0,
            mutation: 5,
        };

        registry.record_result(
            source.data_version(),
            &result_info,
            &source.name(),
            source.info(),
            false,
            Some(("boom".to_string(), "LOGICAL_ERROR".to_string())),
            &backoff,
            max_postpone,
        );
        let entry = registry.get(5).unwrap();
        assert_eq!(entry.latest_fail.as_ref().unwrap().reason, "boom");
        assert!(!backoff.part_can_be_mutated(&source.name()));

        registry.record_result(
            source.data_version(),
            &result_info,
            &source.name(),
            source.info(),
            true,
            None,
            &backoff,
            max_postpone,
        );
        assert!(registry.get(5).unwrap().latest_fail.is_none());
        assert!(backoff.part_can_be_mutated(&source.name()));
    }

    #[tokio::test]
    async fn test_incomplete_status_and_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MutationRegistry::new(dir.path());
        registry
            .add(MutationEntry::new(5, vec![update("a")], TransactionId::PREHISTORIC))
            .await
            .unwrap();

        let behind = part(1, 0);
        let done = part(2, 5);

        let status = registry.incomplete_status(5, &[behind.clone(), done.clone()]).unwrap();
        assert!(!status.is_done);

        let status = registry.incomplete_status(5, &[done]).unwrap();
        assert!(status.is_done);

        assert!(registry.incomplete_status(6, &[behind.clone()]).is_none());

        // A part held for removal by another transaction reports the
        // conflict as a failure.
        behind.set_removal_tid_hash(9);
        let status = registry.incomplete_status(5, &[behind.clone()]).unwrap();
        let fail = status.latest_fail.unwrap();
        assert_eq!(fail.error_code, "PART_IS_LOCKED");
        behind.set_removal_tid_hash(0);

        let statuses = registry.statuses(&[behind]);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].block_number, 5);
        assert_eq!(statuses[0].parts_to_do, vec!["p_1_1_0".to_string()]);
        assert!(!statuses[0].is_done);
    }

    #[tokio::test]
    async fn test_clear_finished_keeps_tail() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MutationRegistry::new(dir.path());
        let log = InMemoryTransactionLog::new();
        for version in 1..=4 {
            registry
                .add(MutationEntry::new(version, vec![update("a")], TransactionId::PREHISTORIC))
                .await
                .unwrap();
        }

        // All parts are at data version 3: mutations 1..=3 are finished.
        let removed = registry.clear_finished(Some(3), 1, &log).unwrap();
        let versions: Vec<i64> = removed.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2]);
        registry.remove_files(&removed).await.unwrap();
        assert!(registry.get(3).unwrap().is_done);
        assert!(registry.get(4).is_some());
        assert_eq!(registry.counters().num_data, 1);

        // Truncate keeps nothing.
        let removed = registry.clear_finished(None, 0, &log).unwrap();
        let versions: Vec<i64> = removed.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![3, 4]);
    }
}
