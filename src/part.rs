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

//! Structures to describe metadata and lifecycle state of data parts.

pub mod info;
pub mod purger;
pub mod registry;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::part::info::PartInfo;
use crate::part::purger::{PartPurgerRef, PurgeRequest};
use crate::txn::{Csn, TransactionId};

/// Lifecycle state of a part. A part is in exactly one state; transitions
/// are guarded by the registry lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PartState {
    /// Staged under a `tmp_*` directory, invisible to everyone.
    Temporary = 0,
    /// Renamed into place inside a commit, not yet visible.
    PreCommitted = 1,
    /// Visible to new readers.
    Active = 2,
    /// Superseded by a merge, mutation or drop; kept while readers may
    /// still hold it.
    Outdated = 3,
    /// Scheduled for removal from the filesystem.
    Deleting = 4,
    /// Removed from the filesystem when the last handle drops.
    DeleteOnDestroy = 5,
}

impl PartState {
    fn from_u8(value: u8) -> PartState {
        match value {
            0 => PartState::Temporary,
            1 => PartState::PreCommitted,
            2 => PartState::Active,
            3 => PartState::Outdated,
            4 => PartState::Deleting,
            _ => PartState::DeleteOnDestroy,
        }
    }
}

/// Persisted metadata of a part, stored as `meta.json` inside the part
/// directory. Payload files (columns, indexes, checksums) are outside the
/// scope of this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PartMeta {
    pub info: PartInfo,
    /// Optional part uuid, assigned when `assign_part_uuids` is set.
    pub uuid: Option<Uuid>,
    pub rows: u64,
    pub bytes_on_disk: u64,
    /// Max TTL expiration timestamp of rows in the part, unix seconds.
    /// The part is fully expired once this is in the past.
    pub ttl_max: Option<i64>,
    /// Transaction that created the part.
    pub creation_tid: TransactionId,
    /// CSN of the creating transaction, filled on commit.
    pub creation_csn: Option<Csn>,
}

impl PartMeta {
    pub fn name(&self) -> String {
        self.info.dir_name()
    }
}

/// Shared handle to a part.
///
/// Cloning is cheap. When the last handle of a part marked deleted drops,
/// the part directory is sent to the purger.
#[derive(Clone)]
pub struct PartHandle {
    inner: Arc<PartHandleInner>,
}

impl fmt::Debug for PartHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartHandle")
            .field("name", &self.inner.meta.name())
            .field("rows", &self.inner.meta.rows)
            .field("state", &self.state())
            .field("deleted", &self.inner.deleted)
            .finish()
    }
}

impl PartHandle {
    pub fn new(meta: PartMeta, state: PartState, purger: PartPurgerRef) -> PartHandle {
        PartHandle {
            inner: Arc::new(PartHandleInner::new(meta, state, purger)),
        }
    }

    pub fn info(&self) -> &PartInfo {
        &self.inner.meta.info
    }

    pub fn name(&self) -> String {
        self.inner.meta.name()
    }

    pub fn meta(&self) -> &PartMeta {
        &self.inner.meta
    }

    pub fn rows(&self) -> u64 {
        self.inner.meta.rows
    }

    pub fn bytes_on_disk(&self) -> u64 {
        self.inner.meta.bytes_on_disk
    }

    pub fn data_version(&self) -> i64 {
        self.inner.meta.info.data_version()
    }

    pub fn state(&self) -> PartState {
        PartState::from_u8(self.inner.state.load(Ordering::Relaxed))
    }

    /// Only the registry changes states, under its lock.
    pub(crate) fn set_state(&self, state: PartState) {
        self.inner.state.store(state as u8, Ordering::Relaxed);
    }

    /// Unix time after which the outdated part may be removed from disk.
    /// Zero means "remove as soon as possible".
    pub fn remove_time(&self) -> i64 {
        self.inner.remove_time.load(Ordering::Relaxed)
    }

    pub(crate) fn set_remove_time(&self, unix_secs: i64) {
        self.inner.remove_time.store(unix_secs, Ordering::Relaxed);
    }

    /// Mark the part as deleted; its directory is purged once the last
    /// handle drops.
    pub(crate) fn mark_deleted(&self) {
        self.inner.deleted.store(true, Ordering::Relaxed);
    }

    /// Whether the part is visible to a reader at `snapshot_csn` within
    /// transaction `tid`. Parts created by prehistoric transactions are
    /// visible to everyone.
    pub fn is_visible_to(&self, snapshot_csn: Csn, tid: TransactionId) -> bool {
        if self.inner.meta.creation_tid.is_prehistoric() || self.inner.meta.creation_tid == tid {
            return true;
        }
        match self.inner.meta.creation_csn {
            Some(csn) => csn <= snapshot_csn,
            // Creating transaction has not committed yet.
            None => false,
        }
    }

    /// Hash of the transaction currently holding the part for removal, if
    /// any. A part locked by another transaction cannot be mutated.
    pub fn removal_tid_hash(&self) -> u64 {
        self.inner.removal_tid_hash.load(Ordering::Relaxed) as u64
    }

    pub(crate) fn set_removal_tid_hash(&self, hash: u64) {
        self.inner.removal_tid_hash.store(hash as i64, Ordering::Relaxed);
    }

    /// Lazily cached serialized meta, used by backup enumeration. Cleared
    /// for outdated parts by the cleanup task.
    pub(crate) fn cached_meta_bytes(&self) -> Option<Arc<Vec<u8>>> {
        self.inner.meta_cache.lock().unwrap().clone()
    }

    pub(crate) fn cache_meta_bytes(&self, bytes: Arc<Vec<u8>>) {
        *self.inner.meta_cache.lock().unwrap() = Some(bytes);
    }

    pub(crate) fn unload_meta_cache(&self) -> bool {
        self.inner.meta_cache.lock().unwrap().take().is_some()
    }

    /// Whether this handle is the only one alive, i.e. no reader or
    /// background task still references the part.
    pub(crate) fn is_uniquely_held(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    pub(crate) fn purger(&self) -> PartPurgerRef {
        self.inner.purger.clone()
    }
}

struct PartHandleInner {
    meta: PartMeta,
    state: AtomicU8,
    deleted: AtomicBool,
    remove_time: AtomicI64,
    removal_tid_hash: AtomicI64,
    meta_cache: std::sync::Mutex<Option<Arc<Vec<u8>>>>,
    purger: PartPurgerRef,
}

impl PartHandleInner {
    fn new(meta: PartMeta, state: PartState, purger: PartPurgerRef) -> PartHandleInner {
        PartHandleInner {
            meta,
            state: AtomicU8::new(state as u8),
            deleted: AtomicBool::new(false),
            remove_time: AtomicI64::new(i64::MAX),
            removal_tid_hash: AtomicI64::new(0),
            meta_cache: std::sync::Mutex::new(None),
            purger,
        }
    }
}

impl Drop for PartHandleInner {
    fn drop(&mut self) {
        if self.deleted.load(Ordering::Relaxed) {
            self.purger.send_request(PurgeRequest {
                dir_name: self.meta.name(),
            });
        }
    }
}

/// Current unix time in seconds.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
