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

//! In-memory index of all known parts.
//!
//! One mutex (the parts-lock) guards the primary index and the
//! currently-merging-mutating marker set. State transitions of parts only
//! happen under it. The active set is kept an antichain under the cover
//! relation within every partition.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use snafu::ensure;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::{LogicalSnafu, PartsIntersectSnafu, Result};
use crate::part::info::{Level, PartInfo};
use crate::part::{unix_now, PartHandle, PartState};
use crate::txn::TxnSnapshot;

#[derive(Debug, Default)]
struct RegistryInner {
    parts: BTreeMap<PartInfo, PartHandle>,
    /// Parts owned by a running merge or mutation.
    busy: BTreeSet<PartInfo>,
}

/// The part index of one table.
#[derive(Debug, Default)]
pub struct PartRegistry {
    inner: Mutex<RegistryInner>,
    /// Notified whenever a busy marker is cleared, so partition operations
    /// and FINAL merges can wait for in-flight work to drain.
    busy_drained: Notify,
}

pub type PartRegistryRef = Arc<PartRegistry>;

impl PartRegistry {
    pub fn new() -> PartRegistry {
        PartRegistry::default()
    }

    /// Notify handle for busy-drain waiters.
    pub(crate) fn drain_notify(&self) -> &Notify {
        &self.busy_drained
    }

    /// Installs a part loaded from disk as Active.
    pub(crate) fn load_part(&self, part: PartHandle) {
        part.set_state(PartState::Active);
        let mut inner = self.inner.lock().unwrap();
        inner.parts.insert(part.info().clone(), part);
    }

    /// Resolves coverage between loaded parts: a part covered by another
    /// loaded part was superseded before the restart and goes straight to
    /// Outdated. Keeps the active set an antichain after loading.
    pub(crate) fn outdate_covered_on_load(&self) {
        let inner = self.inner.lock().unwrap();
        let now = unix_now();
        let infos: Vec<PartInfo> = inner.parts.keys().cloned().collect();
        for (info, part) in inner.parts.iter() {
            let is_covered = infos
                .iter()
                .any(|other| other != info && other.covers(info));
            if is_covered {
                info!("Loaded part {} is covered by a newer part, outdating", info);
                part.set_state(PartState::Outdated);
                part.set_remove_time(now);
            }
        }
    }

    /// Commits a PreCommitted part: every Active part it covers becomes
    /// Outdated and the part becomes Active. Rejects the commit when an
    /// Active part already covers the new one, and fails on partial block
    /// range intersections, which indicate corruption.
    ///
    /// Returns the covered parts.
    pub(crate) fn commit_part(&self, part: &PartHandle) -> Result<Vec<PartHandle>> {
        let mut inner = self.inner.lock().unwrap();
        let info = part.info();

        let mut covered = Vec::new();
        for (existing_info, existing) in inner.parts.iter() {
            if existing.state() != PartState::Active {
                continue;
            }
            if existing_info.covers(info) {
                ensure!(
                    existing_info == info,
                    LogicalSnafu {
                        reason: format!(
                            "tried to commit part {info} covered by active part {existing_info}"
                        ),
                    }
                );
                // Re-committing the very same info is also a bug.
                return LogicalSnafu {
                    reason: format!("part {info} already exists"),
                }
                .fail();
            }
            if info.covers(existing_info) {
                covered.push(existing.clone());
                continue;
            }
            ensure!(
                !info.intersects(existing_info),
                PartsIntersectSnafu {
                    part: info.clone(),
                    next_part: existing_info.clone(),
                }
            );
        }

        let now = unix_now();
        for outdated in &covered {
            outdated.set_state(PartState::Outdated);
            outdated.set_remove_time(now);
        }
        part.set_state(PartState::Active);
        inner.parts.insert(info.clone(), part.clone());
        Ok(covered)
    }

    /// Active parts visible to `snapshot`, in part-info order. Without a
    /// snapshot every Active part is visible.
    pub fn get_visible(&self, snapshot: Option<TxnSnapshot>) -> Vec<PartHandle> {
        let inner = self.inner.lock().unwrap();
        inner
            .parts
            .values()
            .filter(|part| part.state() == PartState::Active)
            .filter(|part| match snapshot {
                Some(snapshot) => part.is_visible_to(snapshot.csn, snapshot.tid),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Parts in the given states, in part-info order.
    pub fn get_in_states(&self, states: &[PartState]) -> Vec<PartHandle> {
        let inner = self.inner.lock().unwrap();
        inner
            .parts
            .values()
            .filter(|part| states.contains(&part.state()))
            .cloned()
            .collect()
    }

    /// Parts of one partition in the given states.
    pub fn get_in_partition(&self, partition_id: &str, states: &[PartState]) -> Vec<PartHandle> {
        let inner = self.inner.lock().unwrap();
        inner
            .parts
            .values()
            .filter(|part| part.info().partition_id == partition_id)
            .filter(|part| states.contains(&part.state()))
            .cloned()
            .collect()
    }

    /// Looks a part up by its directory name.
    pub fn get_by_name(&self, name: &str, states: &[PartState]) -> Option<PartHandle> {
        let info = PartInfo::parse_dir_name(name).ok()?;
        let inner = self.inner.lock().unwrap();
        inner
            .parts
            .get(&info)
            .filter(|part| states.contains(&part.state()))
            .cloned()
    }

    /// Ids of partitions holding at least one Active part.
    pub fn active_partition_ids(&self) -> BTreeSet<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .parts
            .values()
            .filter(|part| part.state() == PartState::Active)
            .map(|part| part.info().partition_id.clone())
            .collect()
    }

    /// Marks parts as owned by a merge or mutation. Double-marking any of
    /// them is a programming error.
    pub(crate) fn mark_busy(&self, infos: &[PartInfo]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for info in infos {
            ensure!(
                !inner.busy.contains(info),
                LogicalSnafu {
                    reason: format!("part {info} is already tagged for a background operation"),
                }
            );
            ensure!(
                inner
                    .parts
                    .get(info)
                    .map(|part| part.state() == PartState::Active)
                    .unwrap_or(false),
                LogicalSnafu {
                    reason: format!("cannot tag non-active part {info}"),
                }
            );
        }
        for info in infos {
            inner.busy.insert(info.clone());
        }
        Ok(())
    }

    /// Clears busy markers and wakes up drain waiters.
    ///
    /// # Panics
    /// Panics when any marker is missing. The tagger owns the markers
    /// exclusively; losing one means the registry state can no longer be
    /// trusted.
    pub(crate) fn unmark_busy(&self, infos: &[PartInfo]) {
        let mut inner = self.inner.lock().unwrap();
        for info in infos {
            assert!(
                inner.busy.remove(info),
                "part {info} has no busy marker to clear"
            );
        }
        drop(inner);
        self.busy_drained.notify_waiters();
    }

    pub fn is_busy(&self, info: &PartInfo) -> bool {
        self.inner.lock().unwrap().busy.contains(info)
    }

    /// Snapshot of the busy set.
    pub fn busy_parts(&self) -> BTreeSet<PartInfo> {
        self.inner.lock().unwrap().busy.clone()
    }

    /// How many of `infos` are currently busy.
    pub fn busy_count_among(&self, infos: &[PartInfo]) -> usize {
        let inner = self.inner.lock().unwrap();
        infos.iter().filter(|info| inner.busy.contains(info)).count()
    }

    /// Active → Outdated. Rejects when any part is busy; partition
    /// operations drain merges first (see the table's stop-merges helpers).
    pub(crate) fn outdate_parts(&self, infos: &[PartInfo], remove_now: bool) -> Result<Vec<PartHandle>> {
        let mut inner = self.inner.lock().unwrap();
        for info in infos {
            ensure!(
                !inner.busy.contains(info),
                LogicalSnafu {
                    reason: format!("cannot outdate part {info}: a background operation owns it"),
                }
            );
        }
        let now = if remove_now { 0 } else { unix_now() };
        let mut outdated = Vec::with_capacity(infos.len());
        for info in infos {
            if let Some(part) = inner.parts.get(info) {
                if part.state() == PartState::Active {
                    part.set_state(PartState::Outdated);
                    part.set_remove_time(now);
                    outdated.push(part.clone());
                }
            }
        }
        Ok(outdated)
    }

    /// Outdates every Active part fully covered by `drop_range`.
    pub(crate) fn remove_covered_by_range(
        &self,
        drop_range: &PartInfo,
        remove_now: bool,
    ) -> Vec<PartHandle> {
        let mut inner = self.inner.lock().unwrap();
        let now = if remove_now { 0 } else { unix_now() };
        let mut removed = Vec::new();
        for (info, part) in inner.parts.iter() {
            if part.state() == PartState::Active && drop_range.covers(info) {
                part.set_state(PartState::Outdated);
                part.set_remove_time(now);
                removed.push(part.clone());
            }
        }
        if !removed.is_empty() {
            info!(
                "Removed {} parts covered by drop range {}",
                removed.len(),
                drop_range
            );
        }
        drop(inner);
        removed
    }

    /// Minimum data version over Active parts. `None` when the table has no
    /// active parts.
    pub fn min_data_version(&self) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner
            .parts
            .values()
            .filter(|part| part.state() == PartState::Active)
            .map(|part| part.data_version())
            .min()
    }

    /// Max block number over all known parts, used to seed the allocator.
    pub fn max_block_number(&self) -> i64 {
        let inner = self.inner.lock().unwrap();
        inner
            .parts
            .keys()
            .map(|info| info.max_block)
            .max()
            .unwrap_or(0)
    }

    /// Max level over the closed part-info interval `[left, right]`.
    ///
    /// The scan is inclusive on both ends: the result of merging that
    /// interval gets `max_level_in_between + 1`, so both boundary parts
    /// must contribute their levels.
    pub(crate) fn max_level_in_between(&self, left: &PartInfo, right: &PartInfo) -> Result<Level> {
        let inner = self.inner.lock().unwrap();
        ensure!(
            inner.parts.contains_key(left) && inner.parts.contains_key(right),
            LogicalSnafu {
                reason: format!("parts {left} and {right} must both be in the index"),
            }
        );
        let level = inner
            .parts
            .range(left.clone()..=right.clone())
            .map(|(info, _)| info.level)
            .max()
            .unwrap_or(0);
        Ok(level)
    }

    /// Grabs Outdated parts eligible for removal from the filesystem and
    /// moves them to Deleting. A part is eligible when its lifetime expired
    /// (or was zeroed, or `force` is set) and nothing else references it.
    pub(crate) fn grab_old_parts(&self, lifetime_secs: u64, force: bool) -> Vec<PartHandle> {
        let now = unix_now();
        let mut inner = self.inner.lock().unwrap();
        let mut grabbed = Vec::new();
        for part in inner.parts.values() {
            if part.state() != PartState::Outdated {
                continue;
            }
            if !part.is_uniquely_held() {
                continue;
            }
            let remove_time = part.remove_time();
            let expired = force || remove_time == 0 || now - remove_time >= lifetime_secs as i64;
            if expired {
                part.set_state(PartState::Deleting);
                grabbed.push(part.clone());
            }
        }
        grabbed
    }

    /// Returns grabbed parts to Outdated after a failed removal.
    pub(crate) fn rollback_deleting(&self, parts: &[PartHandle]) {
        let _inner = self.inner.lock().unwrap();
        for part in parts {
            warn!("Rolling back deletion of part {}", part.name());
            part.set_state(PartState::Outdated);
        }
    }

    /// Drops parts whose directories are gone from the index.
    pub(crate) fn finalize_removed(&self, parts: &[PartHandle]) {
        let mut inner = self.inner.lock().unwrap();
        for part in parts {
            inner.parts.remove(part.info());
        }
    }

    /// Sum of rows of Active parts.
    pub fn total_active_rows(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .parts
            .values()
            .filter(|part| part.state() == PartState::Active)
            .map(|part| part.rows())
            .sum()
    }

    /// Sum of bytes of Active parts.
    pub fn total_active_bytes(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .parts
            .values()
            .filter(|part| part.state() == PartState::Active)
            .map(|part| part.bytes_on_disk())
            .sum()
    }
}
