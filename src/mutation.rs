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

//! Mutation commands and durable mutation entries.
//!
//! A mutation is identified by the block number allocated for it (its
//! *version*) and persisted as one `mutation_<version>.txt` file in the data
//! root. The file is written to a `tmp_mutation_*` name first and renamed
//! into place, so loading never observes a torn entry.

pub mod registry;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::fs;

use crate::error::{IoSnafu, Result, SerdeJsonSnafu};
use crate::part::info::PartInfo;
use crate::part::unix_now;
use crate::txn::{Csn, TransactionId};

const MUTATION_FILE_PREFIX: &str = "mutation_";
const TMP_MUTATION_FILE_PREFIX: &str = "tmp_mutation_";
const CSN_LINE_PREFIX: &str = "csn ";

/// One durable data or metadata modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationCommand {
    /// Rewrite `column` with `expression` where `predicate` holds.
    Update {
        column: String,
        expression: String,
        #[serde(default)]
        predicate: Option<String>,
    },
    /// Delete rows where `predicate` holds.
    Delete { predicate: String },
    /// Re-evaluate TTL rules over all rows.
    MaterializeTtl,
    DropColumn { column: String },
    DropIndex { name: String },
    DropProjection { name: String },
    DropStatistics { name: String },
    RenameColumn { from: String, to: String },
}

impl MutationCommand {
    /// Barrier commands never squash with neighbors: everything before them
    /// must be applied first, and nothing after them joins their batch.
    pub fn is_barrier(&self) -> bool {
        matches!(
            self,
            MutationCommand::DropColumn { .. }
                | MutationCommand::DropIndex { .. }
                | MutationCommand::DropProjection { .. }
                | MutationCommand::DropStatistics { .. }
                | MutationCommand::RenameColumn { .. }
        )
    }

    /// Whether the command rewrites row data (as opposed to metadata).
    pub fn mutates_data(&self) -> bool {
        matches!(
            self,
            MutationCommand::Update { .. }
                | MutationCommand::Delete { .. }
                | MutationCommand::MaterializeTtl
        )
    }

    /// Rough cost of the expanded command, bounded by
    /// `max_expanded_ast_elements` when squashing.
    pub fn weight(&self) -> usize {
        match self {
            MutationCommand::Update {
                expression,
                predicate,
                ..
            } => {
                1 + expression.split_whitespace().count()
                    + predicate
                        .as_deref()
                        .map(|p| p.split_whitespace().count())
                        .unwrap_or(0)
            }
            MutationCommand::Delete { predicate } => 1 + predicate.split_whitespace().count(),
            _ => 1,
        }
    }

    /// Columns the command writes. Used by the lightweight-update lock
    /// table.
    pub fn affected_columns(&self) -> BTreeSet<String> {
        match self {
            MutationCommand::Update { column, .. } => BTreeSet::from([column.clone()]),
            MutationCommand::DropColumn { column } => BTreeSet::from([column.clone()]),
            MutationCommand::RenameColumn { from, to } => {
                BTreeSet::from([from.clone(), to.clone()])
            }
            _ => BTreeSet::new(),
        }
    }
}

/// Whether a command list contains a barrier.
pub fn contain_barrier_command(commands: &[MutationCommand]) -> bool {
    commands.iter().any(MutationCommand::is_barrier)
}

/// Record of the latest failure of a mutation on some part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationFailure {
    pub part_name: String,
    pub part_info: PartInfo,
    pub reason: String,
    pub error_code: String,
    pub time: i64,
}

/// An entry of the mutation registry.
#[derive(Debug, Clone)]
pub struct MutationEntry {
    /// Block number the mutation committed at.
    pub version: i64,
    pub commands: Arc<Vec<MutationCommand>>,
    /// Unix seconds.
    pub create_time: i64,
    /// Transaction that started the mutation.
    pub tid: TransactionId,
    /// CSN of the transaction, appended to the file after commit.
    pub csn: Option<Csn>,
    /// Set by clear_finished once every part reached this version.
    pub is_done: bool,
    pub latest_fail: Option<MutationFailure>,
}

impl MutationEntry {
    pub fn new(version: i64, commands: Vec<MutationCommand>, tid: TransactionId) -> MutationEntry {
        MutationEntry {
            version,
            commands: Arc::new(commands),
            create_time: unix_now(),
            tid,
            csn: None,
            is_done: false,
            latest_fail: None,
        }
    }

    pub fn file_name(&self) -> String {
        file_name(self.version)
    }

    pub fn mutates_data(&self) -> bool {
        self.commands.iter().any(MutationCommand::mutates_data)
    }
}

/// Serialized shape of an entry. The version lives in the file name; the
/// CSN is a separate appended line so commit does not rewrite the body.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct MutationEntryBody {
    commands: Vec<MutationCommand>,
    create_time: i64,
    tid: TransactionId,
}

pub fn file_name(version: i64) -> String {
    format!("{MUTATION_FILE_PREFIX}{version}.txt")
}

fn tmp_file_name(version: i64) -> String {
    format!("{TMP_MUTATION_FILE_PREFIX}{version}.txt")
}

/// Parses a version out of `mutation_<version>.txt`.
pub fn parse_file_name(name: &str) -> Option<i64> {
    name.strip_prefix(MUTATION_FILE_PREFIX)?
        .strip_suffix(".txt")?
        .parse()
        .ok()
}

pub(crate) fn is_mutation_file(name: &str) -> bool {
    parse_file_name(name).is_some()
}

pub(crate) fn is_tmp_mutation_file(name: &str) -> bool {
    name.starts_with(TMP_MUTATION_FILE_PREFIX)
}

/// Writes the entry to `dir` via tmp-file rename.
pub(crate) async fn write_entry(dir: &Path, entry: &MutationEntry) -> Result<PathBuf> {
    let body = MutationEntryBody {
        commands: entry.commands.as_ref().clone(),
        create_time: entry.create_time,
        tid: entry.tid,
    };
    let mut text = serde_json::to_string(&body).context(SerdeJsonSnafu)?;
    text.push('\n');

    let tmp = dir.join(tmp_file_name(entry.version));
    let dst = dir.join(file_name(entry.version));
    fs::write(&tmp, text).await.context(IoSnafu {
        path: tmp.display().to_string(),
    })?;
    fs::rename(&tmp, &dst).await.context(IoSnafu {
        path: dst.display().to_string(),
    })?;
    Ok(dst)
}

/// Appends the CSN line to a committed entry file.
pub(crate) async fn append_csn(dir: &Path, version: i64, csn: Csn) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let path = dir.join(file_name(version));
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .await
        .context(IoSnafu {
            path: path.display().to_string(),
        })?;
    file.write_all(format!("{CSN_LINE_PREFIX}{csn}\n").as_bytes())
        .await
        .context(IoSnafu {
            path: path.display().to_string(),
        })?;
    Ok(())
}

/// Loads an entry from a `mutation_<version>.txt` file.
pub(crate) async fn load_entry(dir: &Path, name: &str) -> Result<MutationEntry> {
    let version = parse_file_name(name).ok_or_else(|| {
        crate::error::BadArgumentsSnafu {
            reason: format!("{name:?} is not a mutation file name"),
        }
        .build()
    })?;
    let path = dir.join(name);
    let text = fs::read_to_string(&path).await.context(IoSnafu {
        path: path.display().to_string(),
    })?;

    let mut lines = text.lines();
    let body_line = lines.next().unwrap_or_default();
    let body: MutationEntryBody = serde_json::from_str(body_line).context(SerdeJsonSnafu)?;
    let csn = lines
        .find_map(|line| line.strip_prefix(CSN_LINE_PREFIX))
        .and_then(|raw| raw.trim().parse().ok());

    Ok(MutationEntry {
        version,
        commands: Arc::new(body.commands),
        create_time: body.create_time,
        tid: body.tid,
        csn,
        is_done: false,
        latest_fail: None,
    })
}

/// Removes the entry file; missing files are fine (e.g. kill racing with
/// cleanup).
pub(crate) async fn remove_file(dir: &Path, version: i64) -> Result<()> {
    let path = dir.join(file_name(version));
    match fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(IoSnafu {
            path: path.display().to_string(),
        }),
    }
}

/// Externally visible status of one mutation.
#[derive(Debug, Clone)]
pub struct MutationStatus {
    pub name: String,
    pub commands: Arc<Vec<MutationCommand>>,
    pub create_time: i64,
    pub block_number: i64,
    /// Active parts still below the mutation version.
    pub parts_to_do: Vec<String>,
    pub is_done: bool,
    pub latest_fail: Option<MutationFailure>,
}

/// Status of a mutation that may still be running, as seen by waiters.
#[derive(Debug, Clone)]
pub struct IncompleteMutationStatus {
    pub is_done: bool,
    pub latest_fail: Option<MutationFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands() -> Vec<MutationCommand> {
        vec![
            MutationCommand::Update {
                column: "col".to_string(),
                expression: "col + 1".to_string(),
                predicate: Some("col > 0".to_string()),
            },
            MutationCommand::Delete {
                predicate: "ts < now()".to_string(),
            },
        ]
    }

    #[test]
    fn test_barrier_classification() {
        assert!(MutationCommand::DropColumn { column: "c".into() }.is_barrier());
        assert!(MutationCommand::RenameColumn { from: "a".into(), to: "b".into() }.is_barrier());
        assert!(!MutationCommand::MaterializeTtl.is_barrier());
        assert!(!contain_barrier_command(&commands()));

        let mut with_barrier = commands();
        with_barrier.push(MutationCommand::DropIndex { name: "idx".into() });
        assert!(contain_barrier_command(&with_barrier));
    }

    #[test]
    fn test_file_name_roundtrip() {
        assert_eq!(file_name(42), "mutation_42.txt");
        assert_eq!(parse_file_name("mutation_42.txt"), Some(42));
        assert_eq!(parse_file_name("mutation_.txt"), None);
        assert_eq!(parse_file_name("tmp_mutation_42.txt"), None);
        assert!(is_tmp_mutation_file("tmp_mutation_42.txt"));
    }

    #[tokio::test]
    async fn test_entry_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let entry = MutationEntry::new(7, commands(), TransactionId::new(3));
        write_entry(dir.path(), &entry).await.unwrap();

        let loaded = load_entry(dir.path(), &file_name(7)).await.unwrap();
        assert_eq!(loaded.version, entry.version);
        assert_eq!(loaded.commands, entry.commands);
        assert_eq!(loaded.create_time, entry.create_time);
        assert_eq!(loaded.tid, entry.tid);
        assert_eq!(loaded.csn, None);

        append_csn(dir.path(), 7, 55).await.unwrap();
        let loaded = load_entry(dir.path(), &file_name(7)).await.unwrap();
        assert_eq!(loaded.csn, Some(55));
        // The body survives the append untouched.
        assert_eq!(loaded.commands, entry.commands);

        remove_file(dir.path(), 7).await.unwrap();
        remove_file(dir.path(), 7).await.unwrap();
        assert!(load_entry(dir.path(), &file_name(7)).await.is_err());
    }

    #[test]
    fn test_affected_columns_and_weight() {
        let update = MutationCommand::Update {
            column: "a".to_string(),
            expression: "a * 2".to_string(),
            predicate: None,
        };
        assert_eq!(update.affected_columns(), BTreeSet::from(["a".to_string()]));
        assert_eq!(update.weight(), 4);

        let rename = MutationCommand::RenameColumn { from: "a".into(), to: "b".into() };
        assert_eq!(
            rename.affected_columns(),
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
    }
}
