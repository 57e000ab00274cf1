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

//! Descriptors of planned merges and mutations.

pub mod picker;
pub mod task;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::mutation::MutationCommand;
use crate::part::info::PartInfo;
use crate::part::registry::PartRegistryRef;
use crate::part::PartHandle;
use crate::storage::Reservation;
use crate::txn::TransactionRef;

/// Kind of a merge. TTL merges are booked against a pool-wide limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeType {
    Regular,
    Ttl,
}

/// Planned output of a merge or mutation, not yet committed.
#[derive(Clone)]
pub struct FuturePart {
    pub info: PartInfo,
    pub source_parts: Vec<PartHandle>,
    pub total_bytes: u64,
    pub total_rows: u64,
    pub merge_type: MergeType,
    pub uuid: Option<Uuid>,
    /// Max TTL timestamp inherited from the sources.
    pub ttl_max: Option<i64>,
    /// Set for OPTIMIZE FINAL results.
    pub is_final: bool,
}

impl fmt::Debug for FuturePart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuturePart")
            .field("name", &self.info.dir_name())
            .field("sources", &self.source_parts.len())
            .field("bytes", &self.total_bytes)
            .field("merge_type", &self.merge_type)
            .finish()
    }
}

impl FuturePart {
    pub fn name(&self) -> String {
        self.info.dir_name()
    }

    pub fn partition_id(&self) -> &str {
        &self.info.partition_id
    }

    /// Data version shared by the sources before the operation.
    pub fn sources_data_version(&self) -> i64 {
        self.source_parts
            .first()
            .map(|part| part.data_version())
            .unwrap_or(0)
    }
}

/// Scoped guard marking the source parts busy.
///
/// Acquisition tags the parts in the registry and takes ownership of the
/// disk reservation; drop clears the markers, wakes drain waiters and
/// returns the space. Losing a marker in between aborts the process.
pub struct PartsTagger {
    registry: PartRegistryRef,
    infos: Vec<PartInfo>,
    reservation: Option<Reservation>,
}

impl fmt::Debug for PartsTagger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartsTagger").field("parts", &self.infos).finish()
    }
}

impl PartsTagger {
    pub(crate) fn new(
        registry: PartRegistryRef,
        infos: Vec<PartInfo>,
        reservation: Option<Reservation>,
    ) -> Result<PartsTagger> {
        registry.mark_busy(&infos)?;
        Ok(PartsTagger {
            registry,
            infos,
            reservation,
        })
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        self.reservation.as_ref()
    }
}

impl Drop for PartsTagger {
    fn drop(&mut self) {
        // unmark_busy aborts when a marker is missing: the tagger is the
        // exclusive owner of these markers.
        self.registry.unmark_busy(&self.infos);
        self.reservation.take();
    }
}

/// Booking of one slot in the TTL-merge pool, released on drop.
pub struct TtlMergeBooking {
    counter: Arc<AtomicUsize>,
}

impl fmt::Debug for TtlMergeBooking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlMergeBooking").finish()
    }
}

impl TtlMergeBooking {
    /// Books a slot unless the pool already runs `limit` TTL merges.
    pub(crate) fn try_book(counter: &Arc<AtomicUsize>, limit: usize) -> Option<TtlMergeBooking> {
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            if current >= limit {
                return None;
            }
            match counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(TtlMergeBooking {
                        counter: counter.clone(),
                    })
                }
                Err(now) => current = now,
            }
        }
    }
}

impl Drop for TtlMergeBooking {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A selected merge or mutation, ready to run on a worker.
///
/// Dropping the entry without committing returns the sources to Active
/// untouched: the tagger clears the busy markers and the reservation and
/// TTL booking release themselves.
#[derive(Debug)]
pub struct SelectedEntry {
    pub future_part: FuturePart,
    pub tagger: PartsTagger,
    /// Squashed mutation commands; empty for merges.
    pub commands: Arc<Vec<MutationCommand>>,
    /// Transaction of the first squashed mutation, when transactional.
    pub txn: Option<TransactionRef>,
    pub ttl_booking: Option<TtlMergeBooking>,
}

impl SelectedEntry {
    pub fn is_mutation(&self) -> bool {
        !self.commands.is_empty()
    }
}

/// Why the selector produced no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectFailureReason {
    /// Every part is already fully merged; a success for OPTIMIZE.
    NothingToMerge,
    /// Selection is currently impossible (busy parts, memory pressure,
    /// zero size budget).
    CannotSelect,
}

/// Structured selection failure. Selection failures are values, not
/// errors: only invariant violations and reservation failures surface as
/// [Error](crate::error::Error).
#[derive(Debug, Clone)]
pub struct SelectFailure {
    pub reason: SelectFailureReason,
    pub explanation: String,
}

impl SelectFailure {
    pub fn nothing_to_merge(explanation: impl Into<String>) -> SelectFailure {
        SelectFailure {
            reason: SelectFailureReason::NothingToMerge,
            explanation: explanation.into(),
        }
    }

    pub fn cannot_select(explanation: impl Into<String>) -> SelectFailure {
        SelectFailure {
            reason: SelectFailureReason::CannotSelect,
            explanation: explanation.into(),
        }
    }
}

/// Result of a selection attempt.
pub type SelectResult = std::result::Result<SelectedEntry, SelectFailure>;
