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

//! Part lifecycle and background scheduler of a single-node merge-tree table.
//!
//! A table is an append-only collection of immutable data parts. Writers
//! install new parts under monotonically increasing block numbers, a
//! background worker merges and mutates them into larger parts, and
//! partition-level operations (DROP/TRUNCATE/REPLACE/MOVE) serialize against
//! the background work through blockers and busy markers.

pub mod access;
pub mod backoff;
pub mod block;
pub mod blocker;
pub mod config;
pub mod error;
pub mod listener;
pub mod memory;
pub mod merge;
pub mod mutation;
pub mod part;
pub mod schedule;
pub mod storage;
pub mod table;
pub mod txn;
pub(crate) mod wait;

pub use crate::config::MergeTreeConfig;
pub use crate::error::{Error, Result};
pub use crate::table::{MergeTreeTable, MergeTreeTableRef, OpenOptions};
