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

//! Configurations.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default max running background job.
const DEFAULT_MAX_BG_JOB: usize = 4;

/// Default lock acquisition timeout, also used for merge-drain waits.
pub const DEFAULT_LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(120);

/// How an UPDATE serializes against concurrent updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateParallelMode {
    /// One exclusive lock for all updates.
    Sync,
    /// Column-scoped locks; updates touching disjoint columns run in parallel.
    Auto,
}

/// Configuration for a [MergeTreeTable](crate::table::MergeTreeTable).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MergeTreeConfig {
    // Worker configs:
    /// Number of background worker tasks (default: 1/2 of cpu cores).
    /// Sets to 0 to use the default value.
    pub num_workers: usize,
    /// Max number of queued background jobs (default 4).
    pub max_background_jobs: usize,
    /// Period of the background scheduling loop.
    #[serde(with = "humantime_serde")]
    pub background_schedule_interval: Duration,

    // Lock timeouts:
    /// Timeout for foreground lock acquisition (alter lock, update locks,
    /// commit-wait barrier).
    #[serde(with = "humantime_serde")]
    pub lock_acquire_timeout: Duration,
    /// Timeout for lock acquisition inside background operations.
    #[serde(with = "humantime_serde")]
    pub lock_acquire_timeout_for_background_operations: Duration,

    // Merge configs:
    /// Max total size of source parts of one merge (default 150GB).
    /// Zero disables background merges.
    pub max_source_parts_size: u64,
    /// Max size of a single part eligible for mutation (default 100GB).
    pub max_source_part_size_for_mutation: u64,
    /// Max number of TTL merges running in the shared pool.
    pub max_number_of_merges_with_ttl_in_pool: usize,
    /// Assign a uuid to every future part.
    pub assign_part_uuids: bool,
    /// Skip already-merged partitions (single part, level > 0) on
    /// OPTIMIZE FINAL.
    pub optimize_skip_merged_partitions: bool,
    /// OPTIMIZE raises `CannotAssignOptimize` instead of returning false
    /// when there is nothing to merge.
    pub optimize_throw_if_noop: bool,

    // Mutation configs:
    /// Total command weight allowed in one squashed mutation batch.
    pub max_expanded_ast_elements: usize,
    /// 0 - mutate asynchronously, >0 - wait for the mutation to finish.
    pub mutations_sync: u8,
    /// Finished mutation entries kept for introspection.
    pub finished_mutations_to_keep: usize,
    /// Upper bound of the exponential backoff for failed part mutations.
    pub max_postpone_time_for_failed_mutations_ms: u64,

    // Cleanup configs:
    /// Outdated parts stay on disk at least this long.
    #[serde(with = "humantime_serde")]
    pub old_parts_lifetime: Duration,
    /// Interval between clear-old-parts cleanup runs.
    #[serde(with = "humantime_serde")]
    pub merge_tree_clear_old_parts_interval: Duration,
    /// Interval between temporary-directory cleanup runs.
    #[serde(with = "humantime_serde")]
    pub merge_tree_clear_old_temporary_directories_interval: Duration,
    /// Staging directories older than this are removed by cleanup.
    #[serde(with = "humantime_serde")]
    pub temporary_directories_lifetime: Duration,

    // Partition operation configs:
    /// Max number of parts MOVE PARTITION may relocate at once.
    pub max_parts_to_move: usize,
    /// Max number of partitions a single insert may touch.
    pub max_partitions_per_insert_block: usize,
    /// Refuse DROP TABLE when active bytes exceed this limit (0 - no limit).
    pub max_table_size_to_drop: u64,
    /// Clone parts with copies even when hardlinks would work.
    pub always_use_copy_instead_of_hardlinks: bool,

    // Update configs:
    /// Lightweight update serialization mode.
    pub update_parallel_mode: UpdateParallelMode,

    // Misc:
    /// Sliding dedup window for non-replicated tables (0 - disabled).
    pub non_replicated_deduplication_window: usize,
    /// Rewrite data with new TTL rules right after ALTER MODIFY TTL.
    pub materialize_ttl_after_modify: bool,
    /// 0 - alter asynchronously, >0 - wait for the metadata change to apply.
    pub alter_sync: u8,
    /// Allow primary keys that are suspiciously expensive to compare.
    pub allow_suspicious_primary_key: bool,
}

impl Default for MergeTreeConfig {
    fn default() -> Self {
        MergeTreeConfig {
            num_workers: divide_num_cpus(2),
            max_background_jobs: DEFAULT_MAX_BG_JOB,
            background_schedule_interval: Duration::from_millis(100),
            lock_acquire_timeout: DEFAULT_LOCK_ACQUIRE_TIMEOUT,
            lock_acquire_timeout_for_background_operations: DEFAULT_LOCK_ACQUIRE_TIMEOUT,
            max_source_parts_size: 150 * 1024 * 1024 * 1024,
            max_source_part_size_for_mutation: 100 * 1024 * 1024 * 1024,
            max_number_of_merges_with_ttl_in_pool: 2,
            assign_part_uuids: false,
            optimize_skip_merged_partitions: false,
            optimize_throw_if_noop: false,
            max_expanded_ast_elements: 500_000,
            mutations_sync: 0,
            finished_mutations_to_keep: 100,
            max_postpone_time_for_failed_mutations_ms: 5 * 60 * 1000,
            old_parts_lifetime: Duration::from_secs(8 * 60),
            merge_tree_clear_old_parts_interval: Duration::from_secs(1),
            merge_tree_clear_old_temporary_directories_interval: Duration::from_secs(60),
            temporary_directories_lifetime: Duration::from_secs(86_400),
            max_parts_to_move: 1000,
            max_partitions_per_insert_block: 100,
            max_table_size_to_drop: 0,
            always_use_copy_instead_of_hardlinks: false,
            update_parallel_mode: UpdateParallelMode::Auto,
            non_replicated_deduplication_window: 0,
            materialize_ttl_after_modify: true,
            alter_sync: 1,
            allow_suspicious_primary_key: false,
        }
    }
}

impl MergeTreeConfig {
    /// Sanitize incorrect configurations.
    pub fn sanitize(&mut self) {
        if self.num_workers == 0 {
            self.num_workers = divide_num_cpus(2);
        }

        if self.max_background_jobs == 0 {
            warn!("Sanitize max background jobs 0 to {}", DEFAULT_MAX_BG_JOB);
            self.max_background_jobs = DEFAULT_MAX_BG_JOB;
        }

        if self.max_expanded_ast_elements == 0 {
            warn!("Sanitize max expanded ast elements 0 to 1");
            self.max_expanded_ast_elements = 1;
        }

        if self.max_parts_to_move == 0 {
            warn!("Sanitize max parts to move 0 to 1");
            self.max_parts_to_move = 1;
        }
    }
}

/// Divide cpu num by a non-zero `divisor` and returns at least 1.
fn divide_num_cpus(divisor: usize) -> usize {
    debug_assert!(divisor > 0);
    let cores = num_cpus::get();
    debug_assert!(cores > 0);

    (cores + divisor - 1) / divisor
}
