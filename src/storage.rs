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

//! Contract with the external storage policy.
//!
//! The policy decides which disk and volume hold new parts and hands out
//! space reservations. Reservations are tokens: dropping one returns the
//! space. A single-disk implementation backs tests and standalone use.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

/// One disk of a storage policy.
#[derive(Debug, Clone)]
pub struct Disk {
    pub name: String,
    pub path: PathBuf,
}

pub type DiskRef = Arc<Disk>;

/// Decides placement of new parts and accounts for disk space.
pub trait StoragePolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Reserves `bytes`, preferring `preferred_volume` when given (TTL
    /// rules of source parts pick the volume). `None` when no volume has
    /// enough space.
    fn reserve(&self, bytes: u64, preferred_volume: Option<usize>) -> Option<Reservation>;

    /// Any disk of the policy; used for files that may live anywhere, like
    /// mutation entries.
    fn any_disk(&self) -> DiskRef;

    /// All disks of the policy, scanned when loading state from disk.
    fn disks(&self) -> Vec<DiskRef>;

    fn volume_index_by_disk_name(&self, name: &str) -> Option<usize>;

    /// Whether parts can be attached between tables of the two policies
    /// with hardlinks instead of copies.
    fn is_compatible_for_partition_ops(&self, other: &dyn StoragePolicy) -> bool;
}

pub type StoragePolicyRef = Arc<dyn StoragePolicy>;

/// A booked amount of disk space. Returned to the policy on drop.
pub struct Reservation {
    bytes: u64,
    used: Arc<AtomicU64>,
    disk: DiskRef,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("bytes", &self.bytes)
            .field("disk", &self.disk.name)
            .finish()
    }
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn disk(&self) -> &DiskRef {
        &self.disk
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.used.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}

/// Policy with a single local disk of fixed capacity.
#[derive(Debug)]
pub struct LocalStoragePolicy {
    name: String,
    disk: DiskRef,
    capacity: u64,
    used: Arc<AtomicU64>,
}

impl LocalStoragePolicy {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, capacity: u64) -> Self {
        let name = name.into();
        LocalStoragePolicy {
            disk: Arc::new(Disk {
                name: format!("{name}-disk"),
                path: path.into(),
            }),
            name,
            capacity,
            used: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl StoragePolicy for LocalStoragePolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn reserve(&self, bytes: u64, _preferred_volume: Option<usize>) -> Option<Reservation> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            if used + bytes > self.capacity {
                debug!(
                    "Cannot reserve {} bytes on policy {}: {} of {} used",
                    bytes, self.name, used, self.capacity
                );
                return None;
            }
            match self.used.compare_exchange_weak(
                used,
                used + bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(Reservation {
                        bytes,
                        used: self.used.clone(),
                        disk: self.disk.clone(),
                    })
                }
                Err(current) => used = current,
            }
        }
    }

    fn any_disk(&self) -> DiskRef {
        self.disk.clone()
    }

    fn disks(&self) -> Vec<DiskRef> {
        vec![self.disk.clone()]
    }

    fn volume_index_by_disk_name(&self, name: &str) -> Option<usize> {
        (name == self.disk.name).then_some(0)
    }

    fn is_compatible_for_partition_ops(&self, other: &dyn StoragePolicy) -> bool {
        self.name() == other.name()
    }
}
