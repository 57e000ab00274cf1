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

//! Contract with the external transaction log.
//!
//! The log itself (CSN assignment, visibility resolution) lives outside this
//! crate; the table only needs the operations below. An in-memory
//! implementation is provided for tables without transactions and for tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{LogicalSnafu, Result};

/// Commit sequence number assigned by the transaction log.
pub type Csn = i64;

/// Identifier of a transaction. The zero tid is the *prehistoric*
/// transaction: the sentinel owner of everything created before
/// transactions existed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TransactionId(u64);

impl TransactionId {
    pub const PREHISTORIC: TransactionId = TransactionId(0);

    pub fn new(id: u64) -> TransactionId {
        TransactionId(id)
    }

    pub fn is_prehistoric(&self) -> bool {
        self.0 == 0
    }

    /// Stable hash used for ownership markers on parts.
    pub fn hash(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid{}", self.0)
    }
}

const TXN_RUNNING: u8 = 0;
const TXN_COMMITTED: u8 = 1;
const TXN_ROLLED_BACK: u8 = 2;

/// A running transaction handle.
#[derive(Debug)]
pub struct Transaction {
    tid: TransactionId,
    start_csn: Csn,
    state: AtomicU8,
}

pub type TransactionRef = Arc<Transaction>;

impl Transaction {
    pub fn tid(&self) -> TransactionId {
        self.tid
    }

    pub fn start_csn(&self) -> Csn {
        self.start_csn
    }

    pub fn is_rolled_back(&self) -> bool {
        self.state.load(Ordering::Relaxed) == TXN_ROLLED_BACK
    }

    /// Snapshot used for visibility checks of this transaction.
    pub fn snapshot(&self) -> TxnSnapshot {
        TxnSnapshot {
            csn: self.start_csn,
            tid: self.tid,
        }
    }
}

/// A read snapshot: everything committed at or before `csn` is visible,
/// plus the transaction's own writes.
#[derive(Debug, Clone, Copy)]
pub struct TxnSnapshot {
    pub csn: Csn,
    pub tid: TransactionId,
}

/// Operations this crate requires from the transaction log.
pub trait TransactionLog: Send + Sync + fmt::Debug {
    /// Begins a new transaction.
    fn begin(&self) -> TransactionRef;

    /// Returns the running transaction with the given tid hash, if any.
    fn try_get_running(&self, tid_hash: u64) -> Option<TransactionRef>;

    /// CSN of a committed transaction, `None` while it is running.
    fn csn(&self, tid: TransactionId) -> Option<Csn>;

    /// Fails with a logical error when the tid is unknown to the log, which
    /// means the on-disk state references a transaction the log has already
    /// forgotten about.
    fn assert_tid_is_not_outdated(&self, tid: TransactionId) -> Result<()>;

    /// Rolls a running transaction back.
    fn rollback(&self, txn: &TransactionRef);
}

pub type TransactionLogRef = Arc<dyn TransactionLog>;

/// In-memory transaction log. Commit order defines CSNs.
#[derive(Debug, Default)]
pub struct InMemoryTransactionLog {
    next_tid: AtomicI64,
    next_csn: AtomicI64,
    state: Mutex<LogState>,
}

#[derive(Debug, Default)]
struct LogState {
    running: HashMap<u64, TransactionRef>,
    committed: HashMap<TransactionId, Csn>,
}

impl InMemoryTransactionLog {
    pub fn new() -> InMemoryTransactionLog {
        InMemoryTransactionLog {
            next_tid: AtomicI64::new(1),
            next_csn: AtomicI64::new(1),
            state: Mutex::default(),
        }
    }

    /// Commits a running transaction and returns its CSN.
    pub fn commit(&self, txn: &TransactionRef) -> Csn {
        let csn = self.next_csn.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        state.running.remove(&txn.tid().hash());
        state.committed.insert(txn.tid(), csn);
        txn.state.store(TXN_COMMITTED, Ordering::Relaxed);
        csn
    }
}

impl TransactionLog for InMemoryTransactionLog {
    fn begin(&self) -> TransactionRef {
        let tid = TransactionId::new(self.next_tid.fetch_add(1, Ordering::Relaxed) as u64);
        let txn = Arc::new(Transaction {
            tid,
            start_csn: self.next_csn.load(Ordering::Relaxed) - 1,
            state: AtomicU8::new(TXN_RUNNING),
        });
        let mut state = self.state.lock().unwrap();
        state.running.insert(tid.hash(), txn.clone());
        txn
    }

    fn try_get_running(&self, tid_hash: u64) -> Option<TransactionRef> {
        self.state.lock().unwrap().running.get(&tid_hash).cloned()
    }

    fn csn(&self, tid: TransactionId) -> Option<Csn> {
        self.state.lock().unwrap().committed.get(&tid).copied()
    }

    fn assert_tid_is_not_outdated(&self, tid: TransactionId) -> Result<()> {
        let state = self.state.lock().unwrap();
        ensure!(
            tid.is_prehistoric()
                || state.running.contains_key(&tid.hash())
                || state.committed.contains_key(&tid),
            LogicalSnafu {
                reason: format!("transaction {tid} is outdated"),
            }
        );
        Ok(())
    }

    fn rollback(&self, txn: &TransactionRef) {
        let mut state = self.state.lock().unwrap();
        state.running.remove(&txn.tid().hash());
        txn.state.store(TXN_ROLLED_BACK, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_assigns_increasing_csn() {
        let log = InMemoryTransactionLog::new();
        let a = log.begin();
        let b = log.begin();
        assert!(log.csn(a.tid()).is_none());
        let csn_a = log.commit(&a);
        let csn_b = log.commit(&b);
        assert!(csn_a < csn_b);
        assert_eq!(log.csn(a.tid()), Some(csn_a));
        assert!(log.try_get_running(a.tid().hash()).is_none());
    }

    #[test]
    fn test_rollback() {
        let log = InMemoryTransactionLog::new();
        let txn = log.begin();
        log.rollback(&txn);
        assert!(txn.is_rolled_back());
        assert!(log.csn(txn.tid()).is_none());
        assert!(log.assert_tid_is_not_outdated(txn.tid()).is_err());
        assert!(log.assert_tid_is_not_outdated(TransactionId::PREHISTORIC).is_ok());
    }
}
