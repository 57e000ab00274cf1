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

use std::fmt;
use std::sync::Arc;

use tracing::{error, info};

use crate::access::AccessLayerRef;
use crate::schedule::scheduler::{Scheduler, SchedulerRef};

/// Request to remove a part directory.
#[derive(Debug)]
pub struct PurgeRequest {
    /// Directory name of the part.
    pub dir_name: String,
}

/// A worker to delete part directories in background.
pub trait PartPurger: Send + Sync + fmt::Debug {
    /// Send a purge request to the background worker.
    fn send_request(&self, request: PurgeRequest);
}

pub type PartPurgerRef = Arc<dyn PartPurger>;

/// Purger that removes directories of the local table.
pub struct LocalPartPurger {
    scheduler: SchedulerRef,
    access: AccessLayerRef,
}

impl fmt::Debug for LocalPartPurger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPartPurger")
            .field("root", &self.access.root())
            .finish()
    }
}

impl LocalPartPurger {
    pub fn new(scheduler: SchedulerRef, access: AccessLayerRef) -> LocalPartPurger {
        LocalPartPurger { scheduler, access }
    }
}

impl PartPurger for LocalPartPurger {
    fn send_request(&self, request: PurgeRequest) {
        let dir_name = request.dir_name;
        let access = self.access.clone();

        if let Err(e) = self.scheduler.schedule(Box::pin(async move {
            if let Err(e) = access.remove_part_dir(&dir_name).await {
                error!("Failed to delete part directory {}: {}", dir_name, e);
            } else {
                info!("Deleted part directory {}", dir_name);
            }
        })) {
            error!("Failed to schedule the part purge request: {}", e);
        }
    }
}

/// Purger that leaves directories on disk. Used while loading state and in
/// tests that manage the filesystem themselves.
#[derive(Debug, Default)]
pub struct NoopPartPurger;

impl PartPurger for NoopPartPurger {
    fn send_request(&self, _request: PurgeRequest) {}
}
