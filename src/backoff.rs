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

//! Exponential backoff for parts whose mutation keeps failing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// First postpone interval after a failure.
const BASE_POSTPONE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    fail_count: u32,
    next_allowed: Instant,
}

/// Per-part mutation failure records.
///
/// A part with a pending failure is not reselected for mutation until its
/// backoff window elapses; the window doubles with every consecutive
/// failure up to `max_postpone`.
#[derive(Debug, Default)]
pub struct MutationBackoffPolicy {
    failures: Mutex<HashMap<String, FailureRecord>>,
}

impl MutationBackoffPolicy {
    pub fn new() -> MutationBackoffPolicy {
        MutationBackoffPolicy::default()
    }

    /// Records a mutation failure of `part_name`.
    pub fn add_part_failure(&self, part_name: &str, max_postpone: Duration) {
        let mut failures = self.failures.lock().unwrap();
        let record = failures.entry(part_name.to_string()).or_insert(FailureRecord {
            fail_count: 0,
            next_allowed: Instant::now(),
        });
        record.fail_count += 1;
        let exponent = record.fail_count.saturating_sub(1).min(16);
        let postpone = BASE_POSTPONE
            .saturating_mul(1 << exponent)
            .min(max_postpone);
        record.next_allowed = Instant::now() + postpone;
        debug!(
            "Postponing mutations of part {} for {:?} after {} failures",
            part_name, postpone, record.fail_count
        );
    }

    /// Whether the part may be selected for mutation now.
    pub fn part_can_be_mutated(&self, part_name: &str) -> bool {
        let failures = self.failures.lock().unwrap();
        failures
            .get(part_name)
            .map(|record| record.next_allowed <= Instant::now())
            .unwrap_or(true)
    }

    /// Clears the record of one part, after its mutation finally succeeded.
    pub fn remove_part(&self, part_name: &str) {
        self.failures.lock().unwrap().remove(part_name);
    }

    /// Clears every record. Called when a mutation is killed so unrelated
    /// parts are not kept in their windows by the removed entry.
    pub fn reset(&self) {
        self.failures.lock().unwrap().clear();
    }
}
