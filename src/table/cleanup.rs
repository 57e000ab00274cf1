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

//! Background cleanup passes: old parts, finished mutations, empty parts,
//! applied patch parts, stale temporary directories.

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::part::PartState;
use crate::table::MergeTreeTable;

impl MergeTreeTable {
    /// Removes expired Outdated parts from the filesystem. Returns how many
    /// were removed. With `force`, lifetimes are ignored.
    pub async fn clear_old_parts_from_filesystem(&self, force: bool) -> Result<usize> {
        let grabbed = self
            .registry
            .grab_old_parts(self.config.old_parts_lifetime.as_secs(), force);
        if grabbed.is_empty() {
            return Ok(0);
        }

        // The pause hook fires after the set is grabbed, so tests can hold
        // exactly these parts in limbo while other operations proceed.
        if let Some(listener) = &self.listener {
            let names: Vec<String> = grabbed.iter().map(|part| part.name()).collect();
            listener.on_old_parts_grabbed(&names).await;
        }

        let mut removed = Vec::with_capacity(grabbed.len());
        let mut failed = Vec::new();
        for part in grabbed {
            match self.access.remove_part_dir(&part.name()).await {
                Ok(()) => removed.push(part),
                Err(e) => {
                    warn!("Failed to remove old part {}: {}", part.name(), e);
                    failed.push(part);
                }
            }
        }
        if !failed.is_empty() {
            self.registry.rollback_deleting(&failed);
        }
        let count = removed.len();
        self.registry.finalize_removed(&removed);
        if count > 0 {
            info!("Removed {} old parts from filesystem", count);
        }
        Ok(count)
    }

    /// Reclaims finished mutation entries, keeping the configured tail.
    /// `truncate` keeps nothing.
    pub async fn clear_old_mutations(&self, truncate: bool) -> Result<usize> {
        let keep = if truncate {
            0
        } else {
            self.config.finished_mutations_to_keep
        };
        if !truncate && keep == 0 {
            return Ok(0);
        }

        let min_data_version = self.registry.min_data_version();
        let removed =
            self.mutations
                .clear_finished(min_data_version, keep, self.txn_log.as_ref())?;
        if removed.is_empty() {
            return Ok(0);
        }
        self.mutations.remove_files(&removed).await?;
        Ok(removed.len())
    }

    /// Outdates active parts without rows, e.g. covers left behind by drop
    /// operations. Busy parts are skipped.
    pub fn clear_empty_parts(&self) -> Result<usize> {
        let mut cleared = 0;
        for part in self.registry.get_in_states(&[PartState::Active]) {
            if part.rows() > 0 || self.registry.is_busy(part.info()) {
                continue;
            }
            let outdated = self.registry.outdate_parts(&[part.info().clone()], true)?;
            cleared += outdated.len();
        }
        if cleared > 0 {
            debug!("Cleared {} empty parts", cleared);
        }
        Ok(cleared)
    }

    /// Outdates patch parts whose updates every regular active part has
    /// already absorbed.
    pub fn clear_unused_patch_parts(&self) -> usize {
        let parts = self.registry.get_in_states(&[PartState::Active]);
        let min_regular_version = parts
            .iter()
            .filter(|part| !part.info().is_patch())
            .map(|part| part.data_version())
            .min();
        let Some(min_regular_version) = min_regular_version else {
            return 0;
        };

        let mut cleared = 0;
        for part in parts {
            if !part.info().is_patch() || self.registry.is_busy(part.info()) {
                continue;
            }
            if part.info().max_block <= min_regular_version {
                match self.registry.outdate_parts(&[part.info().clone()], true) {
                    Ok(outdated) => cleared += outdated.len(),
                    Err(e) => warn!("Failed to outdate patch part {}: {}", part.name(), e),
                }
            }
        }
        if cleared > 0 {
            debug!("Cleared {} unused patch parts", cleared);
        }
        cleared
    }

    /// Drops cached metadata of Outdated parts. Readers re-load it on
    /// demand; outdated parts rarely see another reader.
    pub fn unload_meta_caches_of_outdated_parts(&self) -> usize {
        self.registry
            .get_in_states(&[PartState::Outdated])
            .iter()
            .filter(|part| part.unload_meta_cache())
            .count()
    }

    /// Removes staging directories past their lifetime.
    pub async fn clear_old_temporary_directories(&self) -> Result<usize> {
        self.access
            .clear_stale_tmp_dirs(self.config.temporary_directories_lifetime)
            .await
    }
}
