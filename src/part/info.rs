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

//! Part identity: partition id, block range, level and mutation version.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{BadArgumentsSnafu, InvalidPartNameSnafu, Result};

/// Type to store part level. A part of level `n + 1` is a merge result of
/// parts whose max level is `n`.
pub type Level = u32;

/// Level assigned to drop-range cover parts so they dominate any real part.
pub const MAX_LEVEL: Level = Level::MAX;

/// Partition-id prefix of patch parts produced by lightweight updates.
/// Patch partitions never participate in regular merges.
pub const PATCH_PART_PREFIX: &str = "patch-";

/// Identity of a data part.
///
/// Ordering is lexicographic by `(partition_id, min_block, max_block, level,
/// mutation)`, which is also the on-disk directory-name order within a
/// partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct PartInfo {
    pub partition_id: String,
    pub min_block: i64,
    pub max_block: i64,
    pub level: Level,
    pub mutation: i64,
}

impl PartInfo {
    /// Returns the info of a freshly inserted part holding a single block.
    pub fn new_single_block(partition_id: impl Into<String>, block: i64) -> PartInfo {
        PartInfo {
            partition_id: partition_id.into(),
            min_block: block,
            max_block: block,
            level: 0,
            mutation: 0,
        }
    }

    /// Returns a drop range that covers every part of the partition whose
    /// max block is below `max_block`, regardless of mutation version.
    pub fn new_drop_range(partition_id: impl Into<String>, max_block: i64) -> PartInfo {
        PartInfo {
            partition_id: partition_id.into(),
            min_block: 0,
            max_block,
            level: MAX_LEVEL,
            mutation: i64::MAX,
        }
    }

    /// Validates that the partition id can round-trip through a directory
    /// name. Underscores are the field separator and cannot appear in ids.
    pub fn check_partition_id(partition_id: &str) -> Result<()> {
        ensure!(
            !partition_id.is_empty() && !partition_id.contains('_'),
            BadArgumentsSnafu {
                reason: format!("invalid partition id: {partition_id:?}"),
            }
        );
        Ok(())
    }

    /// Version of the data in this part: the last mutation applied to it,
    /// or the max block if the part was never mutated.
    pub fn data_version(&self) -> i64 {
        self.max_block.max(self.mutation)
    }

    /// Whether this part belongs to a patch partition.
    pub fn is_patch(&self) -> bool {
        self.partition_id.starts_with(PATCH_PART_PREFIX)
    }

    /// Whether this info is a synthetic drop range rather than a real part.
    pub fn is_drop_range(&self) -> bool {
        self.level == MAX_LEVEL
    }

    /// The cover relation: `self` covers `other` iff they share a partition
    /// and `self`'s block range, level and mutation dominate `other`'s.
    ///
    /// Level participates so that an empty cover part (same block range,
    /// one level up) strictly dominates its victim instead of forming a
    /// cycle with it.
    pub fn covers(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.min_block
            && self.max_block >= other.max_block
            && self.level >= other.level
            && self.mutation >= other.mutation
    }

    /// Whether the block ranges of two infos in the same partition overlap.
    pub fn intersects(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.max_block
            && other.min_block <= self.max_block
    }

    /// Directory name of the part: `<partition>_<min>_<max>_<level>`, with a
    /// trailing `_<mutation>` when the part has been mutated.
    pub fn dir_name(&self) -> String {
        if self.mutation != 0 {
            format!(
                "{}_{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level, self.mutation
            )
        } else {
            format!(
                "{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level
            )
        }
    }

    /// Parses a part directory name produced by [PartInfo::dir_name].
    pub fn parse_dir_name(name: &str) -> Result<PartInfo> {
        let fields: Vec<&str> = name.split('_').collect();
        ensure!(
            fields.len() == 4 || fields.len() == 5,
            InvalidPartNameSnafu {
                name,
                reason: "expected 4 or 5 underscore-separated fields",
            }
        );

        fn num<T: FromStr>(name: &str, field: &str) -> Result<T> {
            field.parse().ok().ok_or_else(|| {
                InvalidPartNameSnafu {
                    name,
                    reason: format!("cannot parse numeric field {field:?}"),
                }
                .build()
            })
        }

        let info = PartInfo {
            partition_id: fields[0].to_string(),
            min_block: num(name, fields[1])?,
            max_block: num(name, fields[2])?,
            level: num(name, fields[3])?,
            mutation: if fields.len() == 5 { num(name, fields[4])? } else { 0 },
        };
        ensure!(
            info.min_block <= info.max_block,
            InvalidPartNameSnafu { name, reason: "min block is above max block" }
        );
        Ok(info)
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}
