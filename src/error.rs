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

use snafu::{Location, Snafu};

use crate::part::info::PartInfo;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Operation is not implemented: {}, location: {}", reason, location))]
    NotImplemented { reason: String, location: Location },

    #[snafu(display("Invariant violation: {}, location: {}", reason, location))]
    LogicalError { reason: String, location: Location },

    #[snafu(display(
        "Cannot reserve {} bytes on any disk of policy {}, location: {}",
        bytes,
        policy,
        location
    ))]
    NotEnoughSpace {
        bytes: u64,
        policy: String,
        location: Location,
    },

    #[snafu(display("Bad arguments: {}, location: {}", reason, location))]
    BadArguments { reason: String, location: Location },

    #[snafu(display(
        "Data directory {} already contains data parts. Either clear the directory \
         by hand or open the table with attach instead of create",
        dir
    ))]
    IncorrectData { dir: String, location: Location },

    #[snafu(display("Cannot assign OPTIMIZE: {}", reason))]
    CannotAssignOptimize { reason: String, location: Location },

    #[snafu(display("Timeout ({} ms) exceeded: {}, location: {}", timeout_ms, reason, location))]
    TimeoutExceeded {
        reason: String,
        timeout_ms: u64,
        location: Location,
    },

    #[snafu(display(
        "Destination table has storage policy {} which is incompatible with {}, location: {}",
        dest_policy,
        source_policy,
        location
    ))]
    UnknownPolicy {
        source_policy: String,
        dest_policy: String,
        location: Location,
    },

    #[snafu(display("No such data part {}, location: {}", part_name, location))]
    NoSuchDataPart {
        part_name: String,
        location: Location,
    },

    #[snafu(display("Cancelled merging parts, location: {}", location))]
    Aborted { location: Location },

    #[snafu(display("Mutation {} is not finished: {}", mutation, reason))]
    UnfinishedMutation {
        mutation: i64,
        reason: String,
        location: Location,
    },

    #[snafu(display("Support for the feature is disabled: {}, location: {}", reason, location))]
    SupportIsDisabled { reason: String, location: Location },

    #[snafu(display("Table is in readonly mode due to static storage, location: {}", location))]
    TableIsReadOnly { location: Location },

    #[snafu(display(
        "Cannot move {} parts at once, the limit is {}. Wait until some parts are merged \
         and retry, move smaller partitions, or increase the setting 'max_parts_to_move'",
        parts,
        limit
    ))]
    TooManyParts {
        parts: usize,
        limit: usize,
        location: Location,
    },

    #[snafu(display(
        "Serialization error: part {} is locked by transaction {}, location: {}",
        part_name,
        tid_hash,
        location
    ))]
    PartIsLocked {
        part_name: String,
        tid_hash: u64,
        location: Location,
    },

    #[snafu(display(
        "Part {} intersects next part {}. It is a bug or a result of manual intervention",
        part,
        next_part
    ))]
    PartsIntersect {
        part: PartInfo,
        next_part: PartInfo,
        location: Location,
    },

    #[snafu(display("Failed to ser/de mutation entry, location: {}, source: {}", location, source))]
    SerdeJson {
        location: Location,
        source: serde_json::Error,
    },

    #[snafu(display("I/O failure on {}, location: {}, source: {}", path, location, source))]
    Io {
        path: String,
        location: Location,
        source: std::io::Error,
    },

    #[snafu(display("Failed to join background task, location: {}, source: {}", location, source))]
    Join {
        location: Location,
        source: tokio::task::JoinError,
    },

    #[snafu(display("Background worker pool is stopped, location: {}", location))]
    SchedulerStopped { location: Location },

    #[snafu(display("Background job queue is full, location: {}", location))]
    SchedulerFull { location: Location },

    #[snafu(display(
        "Invalid part directory name {}, location: {}, reason: {}",
        name,
        location,
        reason
    ))]
    InvalidPartName {
        name: String,
        reason: String,
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of errors, used by callers that do not want to
/// match on concrete variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Invariant violation. The process state can no longer be trusted.
    Internal,
    /// The request itself is invalid.
    InvalidArguments,
    /// The operation is valid but cannot run right now.
    Unavailable,
    /// The operation was cancelled by a blocker or shutdown.
    Cancelled,
    /// A caller-supplied timeout elapsed.
    TimedOut,
    /// The operation is not supported by this table.
    Unsupported,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        use Error::*;

        match self {
            LogicalError { .. }
            | PartsIntersect { .. }
            | SerdeJson { .. }
            | Io { .. }
            | Join { .. } => StatusCode::Internal,
            BadArguments { .. }
            | IncorrectData { .. }
            | UnknownPolicy { .. }
            | NoSuchDataPart { .. }
            | TooManyParts { .. }
            | InvalidPartName { .. } => StatusCode::InvalidArguments,
            NotEnoughSpace { .. }
            | CannotAssignOptimize { .. }
            | PartIsLocked { .. }
            | UnfinishedMutation { .. }
            | SchedulerStopped { .. }
            | SchedulerFull { .. } => StatusCode::Unavailable,
            Aborted { .. } => StatusCode::Cancelled,
            TimeoutExceeded { .. } => StatusCode::TimedOut,
            NotImplemented { .. } | SupportIsDisabled { .. } | TableIsReadOnly { .. } => {
                StatusCode::Unsupported
            }
        }
    }

    /// Whether a background task failure with this error should be recorded
    /// on the mutation entry. Reservation failures are abandoned instead.
    pub(crate) fn records_mutation_failure(&self) -> bool {
        !matches!(self, Error::NotEnoughSpace { .. } | Error::Aborted { .. })
    }
}
