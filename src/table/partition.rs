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

//! Partition-level operations.
//!
//! Every operation follows the same shape: take the operations lock,
//! install a merges blocker (global or scoped), wait for busy parts to
//! drain, then swap parts under the registry lock. The blocker releases on
//! scope exit, which protects against "revival" of removed data by a merge
//! finishing afterwards.

use snafu::ensure;
use tracing::info;

use crate::block::BlockOp;
use crate::error::{NoSuchDataPartSnafu, Result, TooManyPartsSnafu, UnknownPolicySnafu};
use crate::part::info::{PartInfo, PATCH_PART_PREFIX};
use crate::part::{PartHandle, PartMeta, PartState};
use crate::table::MergeTreeTable;
use crate::txn::{TransactionId, TransactionRef};

const REPLACE_TMP_PREFIX: &str = "tmp_replace_from_";
const MOVE_TMP_PREFIX: &str = "tmp_move_from_";
const ATTACH_TMP_PREFIX: &str = "tmp_attach_";
const COVER_TMP_PREFIX: &str = "tmp_cover_";

/// Result row of an ATTACH operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedPart {
    pub partition_id: String,
    pub part_name: String,
    pub old_part_name: String,
}

impl MergeTreeTable {
    /// DROP PART / DETACH PART: replaces one part with an empty cover part.
    pub async fn drop_part(&self, part_name: &str, detach: bool) -> Result<()> {
        self.assert_not_readonly()?;
        {
            let _operations = self.operations_lock.lock().await;
            let _merge_blocker = self.stop_merges_and_wait().await?;

            let part = self
                .registry
                .get_by_name(part_name, &[PartState::Active])
                .ok_or_else(|| {
                    NoSuchDataPartSnafu {
                        part_name: part_name.to_string(),
                    }
                    .build()
                })?;

            if detach {
                self.access.detach_part(&part.name()).await?;
            }

            // One empty part per dropped part: same block range, one level
            // up, so it covers exactly its victim.
            let cover_info = PartInfo {
                level: part.info().level + 1,
                ..part.info().clone()
            };
            self.install_empty_cover(cover_info).await?;

            let op = if detach { "Detached" } else { "Dropped" };
            info!("{} {} part by replacing it with a new empty part", op, part_name);
        }

        self.clear_old_parts_from_filesystem(false).await?;
        self.clear_empty_parts()?;
        Ok(())
    }

    /// Non-throwing drop used by internal retention: silently skips a part
    /// that is missing or owned by a background operation.
    pub async fn drop_part_no_wait_no_throw(&self, part_name: &str) -> Result<bool> {
        self.assert_not_readonly()?;
        let outdated = {
            let Some(part) = self.registry.get_by_name(part_name, &[PartState::Active]) else {
                return Ok(false);
            };
            if self.registry.is_busy(part.info()) {
                // The part will be "removed" by the merge or mutation that
                // owns it.
                return Ok(false);
            }
            self.registry
                .outdate_parts(&[part.info().clone()], true)
                .map(|parts| !parts.is_empty())
        }?;
        if outdated {
            self.clear_old_parts_from_filesystem(false).await?;
        }
        Ok(outdated)
    }

    /// DROP PARTITION / DETACH PARTITION. `partition_id: None` applies to
    /// every partition (`DROP PARTITION ALL`).
    pub async fn drop_partition(&self, partition_id: Option<&str>, detach: bool) -> Result<()> {
        self.assert_not_readonly()?;
        {
            let _operations = self.operations_lock.lock().await;
            let _merge_blocker = self.stop_merges_and_wait().await?;

            let parts: Vec<PartHandle> = match partition_id {
                Some(partition_id) => self
                    .registry
                    .get_in_partition(partition_id, &[PartState::Active]),
                None => self.registry.get_visible(None),
            };
            if parts.is_empty() {
                return Ok(());
            }

            if detach {
                for part in &parts {
                    self.access.detach_part(&part.name()).await?;
                }
            }

            self.drop_parts_with_cover(&parts, detach).await?;
        }

        self.clear_old_parts_from_filesystem(false).await?;
        self.clear_empty_parts()?;
        Ok(())
    }

    /// Installs, per affected partition, one empty cover part under a
    /// freshly allocated block number, so the dropped range reads as a
    /// single hole.
    async fn drop_parts_with_cover(&self, parts: &[PartHandle], detach: bool) -> Result<()> {
        let mut by_partition: std::collections::BTreeMap<String, Vec<&PartHandle>> =
            std::collections::BTreeMap::new();
        for part in parts {
            by_partition
                .entry(part.info().partition_id.clone())
                .or_default()
                .push(part);
        }

        for (partition_id, partition_parts) in by_partition {
            let block = self.allocator.allocate(BlockOp::NewPart);
            let cover_info = PartInfo {
                partition_id: partition_id.clone(),
                min_block: 0,
                max_block: block.number(),
                level: partition_parts
                    .iter()
                    .map(|part| part.info().level)
                    .max()
                    .unwrap_or(0)
                    + 1,
                mutation: partition_parts
                    .iter()
                    .map(|part| part.info().mutation)
                    .max()
                    .unwrap_or(0),
            };
            self.install_empty_cover(cover_info).await?;
            block.release();

            let op = if detach { "Detached" } else { "Dropped" };
            info!(
                "{} partition {} with {} parts by covering them with a new empty part",
                op,
                partition_id,
                partition_parts.len()
            );
        }
        Ok(())
    }

    /// Stages an empty part and commits it; covered parts become Outdated
    /// and are removed from disk without waiting for their lifetime.
    async fn install_empty_cover(&self, cover_info: PartInfo) -> Result<PartHandle> {
        let meta = PartMeta {
            info: cover_info,
            rows: 0,
            bytes_on_disk: 0,
            ..Default::default()
        };
        let staged = self.access.stage_part(COVER_TMP_PREFIX, &meta).await?;
        match self.access.commit_staged(&staged, &meta.info).await {
            Ok(_) => {}
            Err(e) => {
                self.access.remove_staged(&staged).await;
                return Err(e);
            }
        }
        let part = PartHandle::new(meta, PartState::PreCommitted, self.purger.clone());
        let covered = self.registry.commit_part(&part)?;
        for old in covered {
            old.set_remove_time(0);
        }
        Ok(part)
    }

    /// TRUNCATE: drop-partition applied to every partition. Afterwards the
    /// active set is empty and the allocator is above every pre-truncate
    /// block number.
    pub async fn truncate(&self) -> Result<()> {
        self.assert_not_readonly()?;
        {
            let _operations = self.operations_lock.lock().await;
            let _merge_blocker = self.stop_merges_and_wait().await?;

            let parts = self.registry.get_visible(None);
            if !parts.is_empty() {
                self.drop_parts_with_cover(&parts, false).await?;
                info!("Truncated table with {} parts", parts.len());
            }
        }

        // Old parts are destroyed before clearing them from the filesystem.
        self.clear_old_mutations(true).await?;
        self.clear_old_parts_from_filesystem(false).await?;
        self.clear_empty_parts()?;
        Ok(())
    }

    /// REPLACE PARTITION FROM / ATTACH PARTITION FROM. Clones the visible
    /// parts of `source` in `partition_id` into this table under fresh
    /// block numbers; with `replace` the previous content of the partition
    /// is removed atomically through a drop range.
    pub async fn replace_partition_from(
        &self,
        source: &MergeTreeTable,
        partition_id: &str,
        replace: bool,
        txn: Option<&TransactionRef>,
    ) -> Result<()> {
        self.assert_not_readonly()?;
        let _operations = self.operations_lock.lock().await;
        let _merge_blocker = self.stop_merges_and_wait_for_partition(partition_id).await?;

        let compatible = self
            .policy
            .is_compatible_for_partition_ops(source.policy.as_ref());
        let copy = self.config.always_use_copy_instead_of_hardlinks || !compatible;

        let src_parts = source
            .registry
            .get_in_partition(partition_id, &[PartState::Active]);
        if !replace && src_parts.is_empty() {
            return Ok(());
        }

        // Stage every clone first; I/O happens before any registry change.
        let mut staged = Vec::with_capacity(src_parts.len());
        for src_part in &src_parts {
            let meta = PartMeta {
                // Block numbers are assigned at commit; the source info is
                // a placeholder for the staging directory name.
                info: src_part.info().clone(),
                rows: src_part.rows(),
                bytes_on_disk: src_part.bytes_on_disk(),
                ttl_max: src_part.meta().ttl_max,
                uuid: self.config.assign_part_uuids.then(uuid::Uuid::new_v4),
                creation_tid: txn.map(|t| t.tid()).unwrap_or(TransactionId::PREHISTORIC),
                creation_csn: None,
            };
            let dir = self
                .access
                .clone_part_from(&source.access, &src_part.name(), REPLACE_TMP_PREFIX, &meta, copy)
                .await?;
            staged.push((dir, meta));
        }

        // The drop range is allocated before the new parts, so it covers
        // only the old content.
        let drop_range = if replace {
            let block = self.allocator.allocate(BlockOp::NewPart);
            let range = PartInfo::new_drop_range(partition_id, block.number());
            block.release();
            Some(range)
        } else {
            None
        };

        // Obtaining a block number and installing the part happen together
        // per part, so no merge can slip into the gap.
        let mut block_holders = Vec::with_capacity(staged.len());
        for (dir, mut meta) in staged {
            let block = self.allocator.allocate(BlockOp::NewPart);
            meta.info.min_block = block.number();
            meta.info.max_block = block.number();
            meta.info.mutation = 0;
            self.access.write_part_meta(&dir, &meta).await?;
            self.access.commit_staged(&dir, &meta.info).await?;
            let part = PartHandle::new(meta, PartState::PreCommitted, self.purger.clone());
            self.registry.commit_part(&part)?;
            block_holders.push(block);
        }

        if let Some(drop_range) = &drop_range {
            self.registry.remove_covered_by_range(drop_range, true);
        }
        drop(block_holders);

        info!(
            "{} partition {} from table {} ({} parts)",
            if replace { "Replaced" } else { "Attached" },
            partition_id,
            source.name(),
            src_parts.len()
        );
        Ok(())
    }

    /// MOVE PARTITION TO TABLE: clones the partition into `dest` and
    /// removes it here. Bounded by `max_parts_to_move` so a huge partition
    /// cannot starve the merge loop while merges are blocked.
    pub async fn move_partition_to(
        &self,
        dest: &MergeTreeTable,
        partition_id: &str,
        txn: Option<&TransactionRef>,
    ) -> Result<()> {
        self.assert_not_readonly()?;
        dest.assert_not_readonly()?;

        ensure!(
            self.policy.is_compatible_for_partition_ops(dest.policy.as_ref()),
            UnknownPolicySnafu {
                source_policy: self.policy.name().to_string(),
                dest_policy: dest.policy.name().to_string(),
            }
        );

        let _operations = self.operations_lock.lock().await;
        let _merge_blocker = self.stop_merges_and_wait().await?;

        let src_parts = self
            .registry
            .get_in_partition(partition_id, &[PartState::Active]);
        ensure!(
            src_parts.len() <= self.config.max_parts_to_move,
            TooManyPartsSnafu {
                parts: src_parts.len(),
                limit: self.config.max_parts_to_move,
            }
        );
        if src_parts.is_empty() {
            return Ok(());
        }

        let copy = self.config.always_use_copy_instead_of_hardlinks;
        let mut staged = Vec::with_capacity(src_parts.len());
        for src_part in &src_parts {
            let meta = PartMeta {
                info: src_part.info().clone(),
                rows: src_part.rows(),
                bytes_on_disk: src_part.bytes_on_disk(),
                ttl_max: src_part.meta().ttl_max,
                uuid: dest.config.assign_part_uuids.then(uuid::Uuid::new_v4),
                creation_tid: txn.map(|t| t.tid()).unwrap_or(TransactionId::PREHISTORIC),
                creation_csn: None,
            };
            let dir = dest
                .access
                .clone_part_from(&self.access, &src_part.name(), MOVE_TMP_PREFIX, &meta, copy)
                .await?;
            staged.push((dir, meta));
        }

        // Install at the destination, then retire the sources; both sides
        // under their own parts-locks.
        for (dir, mut meta) in staged {
            let block = dest.allocator.allocate(BlockOp::NewPart);
            meta.info.min_block = block.number();
            meta.info.max_block = block.number();
            meta.info.mutation = 0;
            dest.access.write_part_meta(&dir, &meta).await?;
            dest.access.commit_staged(&dir, &meta.info).await?;
            let part = PartHandle::new(meta, PartState::PreCommitted, dest.purger.clone());
            dest.registry.commit_part(&part)?;
            block.release();
        }

        let infos: Vec<PartInfo> = src_parts.iter().map(|p| p.info().clone()).collect();
        if let Some(txn) = txn {
            // Mark removal ownership so mutations of other transactions
            // report the conflict instead of waiting forever.
            for part in &src_parts {
                part.set_removal_tid_hash(txn.tid().hash());
            }
        }
        self.registry.outdate_parts(&infos, true)?;
        drop(src_parts);
        self.clear_old_parts_from_filesystem(false).await?;

        info!(
            "Moved partition {} to table {} ({} parts)",
            partition_id,
            dest.name(),
            infos.len()
        );
        Ok(())
    }

    /// ATTACH PARTITION / ATTACH PART from `detached/`. Restored parts get
    /// fresh block numbers and reset levels.
    pub async fn attach_partition(
        &self,
        partition_id: Option<&str>,
        part_name: Option<&str>,
    ) -> Result<Vec<AttachedPart>> {
        self.assert_not_readonly()?;
        let _operations = self.operations_lock.lock().await;

        let detached = self.access.list_detached().await?;
        let to_attach: Vec<PartInfo> = detached
            .into_iter()
            .filter(|info| match (partition_id, part_name) {
                (Some(partition), _) => info.partition_id == partition,
                (_, Some(name)) => info.dir_name() == name,
                (None, None) => true,
            })
            .collect();

        let mut results = Vec::with_capacity(to_attach.len());
        for old_info in to_attach {
            let old_name = old_info.dir_name();
            let block = self.allocator.allocate(BlockOp::NewPart);
            let old_meta = self
                .access
                .read_part_meta(&self.access.detached_path(&old_name))
                .await;
            let (rows, bytes, ttl_max) = match old_meta {
                Ok(meta) => (meta.rows, meta.bytes_on_disk, meta.ttl_max),
                Err(_) => (0, 0, None),
            };
            let meta = PartMeta {
                info: PartInfo {
                    partition_id: old_info.partition_id.clone(),
                    min_block: block.number(),
                    max_block: block.number(),
                    // Only a merge may raise levels again.
                    level: 0,
                    mutation: 0,
                },
                rows,
                bytes_on_disk: bytes,
                ttl_max,
                ..Default::default()
            };
            info!("Attaching part {} as {}", old_name, meta.name());

            let dir = self
                .access
                .clone_detached(&old_name, ATTACH_TMP_PREFIX, &meta)
                .await?;
            self.access.commit_staged(&dir, &meta.info).await?;
            let part = PartHandle::new(meta, PartState::PreCommitted, self.purger.clone());
            self.registry.commit_part(&part)?;
            block.release();

            results.push(AttachedPart {
                partition_id: part.info().partition_id.clone(),
                part_name: part.name(),
                old_part_name: old_name,
            });
        }
        Ok(results)
    }

    /// Ids of partitions that currently hold data, patch partitions
    /// excluded.
    pub fn all_partition_ids(&self) -> Vec<String> {
        self.registry
            .active_partition_ids()
            .into_iter()
            .filter(|id| !id.starts_with(PATCH_PART_PREFIX))
            .collect()
    }
}
