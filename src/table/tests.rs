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

//! Table-level tests.

use std::sync::Arc;
use std::time::Duration;

use crate::config::MergeTreeConfig;
use crate::error::Error;
use crate::listener::{CleanupPauseListener, MergeListener};
use crate::mutation::MutationCommand;
use crate::part::info::PartInfo;
use crate::part::PartState;
use crate::table::{MergeTreeTable, MergeTreeTableRef, OpenOptions};

fn test_config() -> MergeTreeConfig {
    MergeTreeConfig {
        background_schedule_interval: Duration::from_millis(10),
        old_parts_lifetime: Duration::ZERO,
        ..Default::default()
    }
}

async fn open_table(dir: &std::path::Path, config: MergeTreeConfig) -> MergeTreeTableRef {
    MergeTreeTable::open(OpenOptions {
        config,
        ..OpenOptions::new("test", dir)
    })
    .await
    .unwrap()
}

fn update(column: &str) -> MutationCommand {
    MutationCommand::Update {
        column: column.to_string(),
        expression: "1".to_string(),
        predicate: None,
    }
}

#[tokio::test]
async fn test_block_numbers_strictly_increase_per_op_kind() {
    let dir = tempfile::tempdir().unwrap();
    let table = open_table(dir.path(), test_config()).await;

    // NewPart, Mutation, Update draw from one increment.
    let insert = table.begin_insert("p", 1, 10, None, None).await.unwrap();
    let first = insert.block_number();
    insert.commit().await.unwrap();

    let version = table.mutate(vec![update("a")], None).await.unwrap();
    assert_eq!(version, first + 1);

    let upd = table.update_lightweight(&[update("a")]).await.unwrap();
    assert_eq!(upd.block_number(), first + 2);
    drop(upd);

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_basic_merge_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let listener = Arc::new(MergeListener::new());
    let table = MergeTreeTable::open(OpenOptions {
        config: test_config(),
        listener: Some(listener.clone()),
        ..OpenOptions::new("test", dir.path())
    })
    .await
    .unwrap();

    table
        .write_block(&[("p", 10, 100), ("p", 10, 100), ("p", 10, 100)], None)
        .await
        .unwrap();

    // First scheduler pass merges all three parts.
    assert!(table.schedule_background_job().await);
    listener.wait().await;

    let visible = table.registry().get_visible(None);
    assert_eq!(visible.len(), 1);
    let info = visible[0].info();
    assert_eq!((info.min_block, info.max_block, info.level), (1, 3, 1));
    assert_eq!(visible[0].rows(), 30);
    assert_eq!(
        table.registry().get_in_states(&[PartState::Outdated]).len(),
        3
    );

    // Second pass finds nothing new to merge.
    table.schedule_background_job().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(table.registry().get_visible(None).len(), 1);

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mutation_squash_with_barrier_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let table = open_table(dir.path(), test_config()).await;
    table.startup().await.unwrap();

    table.write_block(&[("p", 10, 100)], None).await.unwrap();

    table.mutate(vec![update("col")], None).await.unwrap();
    table.mutate(vec![update("col")], None).await.unwrap();
    let barrier_version = table
        .mutate(
            vec![MutationCommand::DropColumn {
                column: "other".to_string(),
            }],
            None,
        )
        .await
        .unwrap();

    table.wait_for_mutation(barrier_version).await.unwrap();
    let visible = table.registry().get_visible(None);
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].info().mutation, barrier_version);

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_kill_mutation_unblocks_waiters_and_removes_file() {
    let dir = tempfile::tempdir().unwrap();
    let table = open_table(dir.path(), test_config()).await;
    table.startup().await.unwrap();

    let parts = table.write_block(&[("p", 10, 100)], None).await.unwrap();
    // The sole candidate part is owned by a background operation, so the
    // mutation can never finish.
    table
        .registry()
        .mark_busy(&[parts[0].info().clone()])
        .unwrap();

    let version = table.mutate(vec![update("a")], None).await.unwrap();
    let mutation_id = crate::mutation::file_name(version);
    assert!(dir.path().join(&mutation_id).exists());

    let waiter = {
        let table = table.clone();
        tokio::spawn(async move { table.wait_for_mutation(version).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    assert!(table.kill_mutation(&mutation_id).await.unwrap());
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::UnfinishedMutation { .. }));

    assert!(table.get_mutations_status().is_empty());
    assert!(!dir.path().join(&mutation_id).exists());
    // Killing again reports not-found.
    assert!(!table.kill_mutation(&mutation_id).await.unwrap());

    table.registry().unmark_busy(&[parts[0].info().clone()]);
    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_drop_partition_waits_for_running_merge() {
    let dir = tempfile::tempdir().unwrap();
    let table = open_table(dir.path(), test_config()).await;

    let parts = table
        .write_block(&[("p", 10, 100), ("p", 10, 100)], None)
        .await
        .unwrap();
    let pre_drop_block = table.current_block_number();

    // Simulate a merge owning one part.
    let busy = parts[0].info().clone();
    table.registry().mark_busy(std::slice::from_ref(&busy)).unwrap();

    let dropper = {
        let table = table.clone();
        tokio::spawn(async move { table.drop_partition(Some("p"), false).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    // DROP waits for the merge to finish.
    assert!(!dropper.is_finished());

    table.registry().unmark_busy(&[busy]);
    dropper.await.unwrap().unwrap();

    // Every part of p is gone from the active set and a cover part was
    // installed under a freshly allocated block number.
    assert!(table
        .registry()
        .get_visible(None)
        .iter()
        .all(|part| part.info().partition_id != "p" || part.rows() > 0));
    assert!(table
        .registry()
        .get_in_partition("p", &[PartState::Active])
        .is_empty());
    assert!(table.current_block_number() > pre_drop_block);

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_update_barrier_observes_smaller_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let table = open_table(dir.path(), test_config()).await;

    // An insert allocated its block but has not committed yet.
    let insert = table.begin_insert("p", 10, 100, None, None).await.unwrap();
    let insert_block = insert.block_number();

    let updater = {
        let table = table.clone();
        tokio::spawn(async move { table.update_lightweight(&[update("a")]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The update allocated the next block and waits for the insert.
    assert!(!updater.is_finished());

    insert.commit().await.unwrap();
    let upd = updater.await.unwrap().unwrap();
    assert_eq!(upd.block_number(), insert_block + 1);
    assert_eq!(upd.max_block_for("p"), Some(insert_block + 1));

    // Patch parts land outside the regular merge domain.
    let patch = upd.commit_patch("p", 1, 10).await.unwrap();
    assert!(patch.info().is_patch());
    drop(upd);

    assert!(!table.schedule_background_job().await);

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_update_times_out_on_abandoned_insert() {
    let dir = tempfile::tempdir().unwrap();
    let config = MergeTreeConfig {
        lock_acquire_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let table = open_table(dir.path(), config).await;

    let _insert = table.begin_insert("p", 10, 100, None, None).await.unwrap();
    let err = table.update_lightweight(&[update("a")]).await.unwrap_err();
    assert!(matches!(err, Error::TimeoutExceeded { .. }));

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_truncate_empties_table_and_advances_allocator() {
    let dir = tempfile::tempdir().unwrap();
    let table = open_table(dir.path(), test_config()).await;

    table
        .write_block(&[("a", 10, 100), ("b", 10, 100)], None)
        .await
        .unwrap();
    let pre_truncate_block = table.current_block_number();

    table.truncate().await.unwrap();

    assert!(table.registry().get_visible(None).is_empty());
    assert!(table.current_block_number() > pre_truncate_block);
    assert_eq!(table.total_rows(), 0);

    // New inserts keep working with strictly larger block numbers.
    let parts = table.write_block(&[("a", 5, 50)], None).await.unwrap();
    assert!(parts[0].info().min_block > pre_truncate_block);

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_drop_part_and_detach() {
    let dir = tempfile::tempdir().unwrap();
    let table = open_table(dir.path(), test_config()).await;

    let parts = table
        .write_block(&[("p", 10, 100), ("p", 20, 200)], None)
        .await
        .unwrap();
    let detached_name = parts[0].name();
    drop(parts);

    table.drop_part(&detached_name, true).await.unwrap();
    assert_eq!(table.registry().get_in_partition("p", &[PartState::Active]).len(), 1);

    // The detached copy can be attached back under a fresh block number.
    let attached = table.attach_partition(None, Some(&detached_name)).await.unwrap();
    assert_eq!(attached.len(), 1);
    assert_eq!(attached[0].old_part_name, detached_name);
    let restored = table
        .registry()
        .get_by_name(&attached[0].part_name, &[PartState::Active])
        .unwrap();
    assert_eq!(restored.info().level, 0);
    assert_eq!(restored.rows(), 10);

    let missing = table.drop_part("p_999_999_0", false).await.unwrap_err();
    assert!(matches!(missing, Error::NoSuchDataPart { .. }));

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_replace_partition_from() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let source = open_table(dir_a.path(), test_config()).await;
    let dest = open_table(dir_b.path(), test_config()).await;

    source
        .write_block(&[("p", 10, 100), ("p", 20, 200)], None)
        .await
        .unwrap();
    dest.write_block(&[("p", 99, 999)], None).await.unwrap();

    dest.replace_partition_from(&source, "p", true, None).await.unwrap();

    // The destination now holds clones of the source's parts and nothing
    // of its previous content.
    let visible = dest.registry().get_in_partition("p", &[PartState::Active]);
    assert_eq!(visible.len(), 2);
    assert_eq!(visible.iter().map(|p| p.rows()).sum::<u64>(), 30);
    // The source is untouched.
    assert_eq!(source.registry().get_visible(None).len(), 2);

    dest.shutdown().await.unwrap();
    source.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_move_partition_to_respects_limit() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let source = open_table(
        dir_a.path(),
        MergeTreeConfig {
            max_parts_to_move: 1,
            ..test_config()
        },
    )
    .await;
    let dest = open_table(dir_b.path(), test_config()).await;

    source
        .write_block(&[("p", 10, 100), ("p", 20, 200)], None)
        .await
        .unwrap();
    source.write_block(&[("q", 5, 50)], None).await.unwrap();

    // Moving two parts with a limit of one fails and leaves both tables
    // unchanged.
    let err = source
        .move_partition_to(&dest, "p", None)
        .await
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, Error::TooManyParts { .. }));
    assert_eq!(
        source.registry().get_in_partition("p", &[PartState::Active]).len(),
        2
    );
    assert!(dest.registry().get_visible(None).is_empty());

    // A single-part partition fits the limit.
    source.move_partition_to(&dest, "q", None).await.unwrap();
    assert!(source
        .registry()
        .get_in_partition("q", &[PartState::Active])
        .is_empty());
    assert_eq!(
        dest.registry().get_in_partition("q", &[PartState::Active]).len(),
        1
    );

    dest.shutdown().await.unwrap();
    source.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reopen_restores_state() {
    let dir = tempfile::tempdir().unwrap();
    let barrier_version;
    let pre_shutdown_block;
    {
        let table = open_table(dir.path(), test_config()).await;
        table.startup().await.unwrap();
        table.write_block(&[("p", 10, 100)], None).await.unwrap();
        let version = table.mutate(vec![update("a")], None).await.unwrap();
        table.wait_for_mutation(version).await.unwrap();
        barrier_version = version;
        pre_shutdown_block = table.current_block_number();
        table.shutdown().await.unwrap();
    }

    let table = MergeTreeTable::open(OpenOptions {
        config: test_config(),
        attach: true,
        ..OpenOptions::new("test", dir.path())
    })
    .await
    .unwrap();

    let visible = table.registry().get_visible(None);
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].info().mutation, barrier_version);
    // The increment is at or above everything observed on disk.
    assert!(table.current_block_number() >= pre_shutdown_block);

    // The mutation map equals the set of on-disk mutation files.
    let statuses = table.get_mutations_status();
    assert_eq!(statuses.len(), 1);
    assert!(dir.path().join(&statuses[0].name).exists());
    assert!(statuses[0].is_done);

    // Backup enumeration: one visible part, and no unfinished mutation the
    // restored part would still need.
    let parts_backup = table.backup_parts().unwrap();
    assert_eq!(parts_backup.len(), 1);
    assert!(table.backup_mutations().unwrap().is_empty());

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_create_over_existing_parts_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    {
        let table = open_table(dir.path(), test_config()).await;
        table.write_block(&[("p", 10, 100)], None).await.unwrap();
        table.shutdown().await.unwrap();
    }

    let err = MergeTreeTable::open(OpenOptions {
        config: test_config(),
        attach: false,
        ..OpenOptions::new("test", dir.path())
    })
    .await
    .map(|_| ())
    .unwrap_err();
    assert!(matches!(err, Error::IncorrectData { .. }));
}

#[tokio::test]
async fn test_readonly_table_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let table = MergeTreeTable::open(OpenOptions {
        config: test_config(),
        readonly: true,
        ..OpenOptions::new("test", dir.path())
    })
    .await
    .unwrap();
    table.startup().await.unwrap();

    let err = table.begin_insert("p", 1, 1, None, None).await.unwrap_err();
    assert!(matches!(err, Error::TableIsReadOnly { .. }));
    let err = table.mutate(vec![update("a")], None).await.unwrap_err();
    assert!(matches!(err, Error::TableIsReadOnly { .. }));
    let err = table.truncate().await.unwrap_err();
    assert!(matches!(err, Error::TableIsReadOnly { .. }));

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_optimize_final_idempotent_with_skip_merged_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let config = MergeTreeConfig {
        optimize_skip_merged_partitions: true,
        ..test_config()
    };
    let table = open_table(dir.path(), config).await;

    table
        .write_block(&[("p", 10, 100), ("p", 10, 100)], None)
        .await
        .unwrap();

    assert!(table.optimize(None, true).await.unwrap());
    let after_first: Vec<PartInfo> = table
        .registry()
        .get_visible(None)
        .iter()
        .map(|part| part.info().clone())
        .collect();
    assert_eq!(after_first.len(), 1);
    assert!(after_first[0].level > 0);

    // A second OPTIMIZE FINAL is a no-op and produces no new parts.
    assert!(table.optimize(None, true).await.unwrap());
    let after_second: Vec<PartInfo> = table
        .registry()
        .get_visible(None)
        .iter()
        .map(|part| part.info().clone())
        .collect();
    assert_eq!(after_first, after_second);

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cleanup_pause_holds_grabbed_parts_in_limbo() {
    let dir = tempfile::tempdir().unwrap();
    let listener = Arc::new(CleanupPauseListener::new());
    let table = MergeTreeTable::open(OpenOptions {
        config: test_config(),
        listener: Some(listener.clone()),
        ..OpenOptions::new("test", dir.path())
    })
    .await
    .unwrap();

    table
        .write_block(&[("p", 10, 100), ("p", 10, 100)], None)
        .await
        .unwrap();
    assert!(table.optimize(None, false).await.unwrap());

    listener.pause();
    let cleaner = {
        let table = table.clone();
        tokio::spawn(async move { table.clear_old_parts_from_filesystem(true).await })
    };
    listener.wait_grabbed().await;
    // Grabbed parts sit in Deleting, still on disk.
    assert!(!cleaner.is_finished());
    assert!(!table.registry().get_in_states(&[PartState::Deleting]).is_empty());

    listener.resume();
    let removed = cleaner.await.unwrap().unwrap();
    assert_eq!(removed, 2);
    assert!(table.registry().get_in_states(&[PartState::Deleting]).is_empty());

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_alter_serializes_and_respects_materialize_ttl_setting() {
    let dir = tempfile::tempdir().unwrap();
    let config = MergeTreeConfig {
        alter_sync: 1,
        materialize_ttl_after_modify: false,
        ..test_config()
    };
    let table = open_table(dir.path(), config).await;
    table.startup().await.unwrap();
    table.write_block(&[("p", 10, 100)], None).await.unwrap();

    // A TTL-only alter starts no mutation when materialization is deferred.
    let version = table.alter(vec![MutationCommand::MaterializeTtl]).await.unwrap();
    assert!(version.is_none());

    // A data-rewriting alter runs to completion under alter_sync.
    let version = table
        .alter(vec![MutationCommand::DropColumn { column: "a".to_string() }])
        .await
        .unwrap()
        .unwrap();
    let visible = table.registry().get_visible(None);
    assert_eq!(visible[0].info().mutation, version);

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_drop_table_size_guard() {
    let dir = tempfile::tempdir().unwrap();
    let config = MergeTreeConfig {
        max_table_size_to_drop: 150,
        ..test_config()
    };
    let table = open_table(dir.path(), config).await;

    table.write_block(&[("p", 10, 100)], None).await.unwrap();
    table.check_table_can_be_dropped().unwrap();

    table.write_block(&[("p", 10, 100)], None).await.unwrap();
    let err = table.check_table_can_be_dropped().unwrap_err();
    assert!(matches!(err, Error::BadArguments { .. }));
    let err = table.drop_all_data().await.unwrap_err();
    assert!(matches!(err, Error::BadArguments { .. }));

    table.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_drop_all_data_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    let table = open_table(dir.path(), test_config()).await;

    table.write_block(&[("p", 10, 100)], None).await.unwrap();
    table.mutate(vec![update("a")], None).await.unwrap();

    table.drop_all_data().await.unwrap();

    assert!(table.registry().get_visible(None).is_empty());
    // Only service directories remain in the data root.
    let layer = crate::access::AccessLayer::new(dir.path());
    assert!(layer.list_part_dirs().await.unwrap().is_empty());
    let mutation_files: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("mutation_")
        })
        .collect();
    assert!(mutation_files.is_empty());
}

#[tokio::test]
async fn test_finished_mutations_are_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let config = MergeTreeConfig {
        finished_mutations_to_keep: 1,
        ..test_config()
    };
    let table = open_table(dir.path(), config).await;
    table.startup().await.unwrap();

    table.write_block(&[("p", 10, 100)], None).await.unwrap();
    let mut last_version = 0;
    for _ in 0..3 {
        last_version = table.mutate(vec![update("a")], None).await.unwrap();
        table.wait_for_mutation(last_version).await.unwrap();
    }

    let cleared = table.clear_old_mutations(false).await.unwrap();
    assert_eq!(cleared, 2);
    let statuses = table.get_mutations_status();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].block_number, last_version);

    table.shutdown().await.unwrap();
}
