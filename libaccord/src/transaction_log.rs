// Copyright 2021-2022 Cargill Incorporated
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

//! The durable record of transaction creation and state transitions.
//!
//! Every creation and every state transition is appended to the log before it becomes visible
//! to a participant. On start-up the log is replayed so that ids are never reused and so that
//! transactions which were in flight when the previous incarnation stopped are resolved.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::InternalError;
use crate::participant::CrashCount;
use crate::transaction::{TransactionId, TransactionState};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEntry {
    /// A manager incarnation started. Used as the manager's crash count when it joins a parent
    /// transaction owned by another manager.
    Incarnation(CrashCount),
    Created {
        id: TransactionId,
        parent: Option<TransactionId>,
    },
    StateChanged {
        id: TransactionId,
        state: TransactionState,
    },
}

/// An append-only log of transaction transitions.
pub trait TransactionLog: Send + Sync {
    /// Durably appends an entry.
    ///
    /// # Errors
    ///
    /// Returns an [`InternalError`] if the entry could not be made durable. The caller must not
    /// act on a transition whose entry failed to append.
    fn append(&self, entry: LogEntry) -> Result<(), InternalError>;

    /// Returns every entry in append order.
    fn entries(&self) -> Result<Vec<LogEntry>, InternalError>;
}

/// A log kept in memory. Clones share the same entries, which lets a test stop a manager and
/// build a new one over the same log.
#[derive(Clone, Default)]
pub struct InMemoryTransactionLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl InMemoryTransactionLog {
    pub fn new() -> Self {
        InMemoryTransactionLog::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl TransactionLog for InMemoryTransactionLog {
    fn append(&self, entry: LogEntry) -> Result<(), InternalError> {
        self.entries.lock().push(entry);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<LogEntry>, InternalError> {
        Ok(self.entries.lock().clone())
    }
}

/// What was found when a log was replayed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryReport {
    incarnation: CrashCount,
    next_id: TransactionId,
    presumed_aborted: Vec<TransactionId>,
    committed: usize,
    aborted: usize,
}

impl RecoveryReport {
    /// The incarnation of the manager built from this log.
    pub fn incarnation(&self) -> CrashCount {
        self.incarnation
    }

    /// The first id the recovered manager will assign.
    pub fn next_id(&self) -> TransactionId {
        self.next_id
    }

    /// Transactions which had not been decided when the previous incarnation stopped. They are
    /// recorded as aborted.
    pub fn presumed_aborted(&self) -> &[TransactionId] {
        &self.presumed_aborted
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn aborted(&self) -> usize {
        self.aborted
    }
}

/// Replays `log`, appends the entries which resolve in-flight transactions and start a new
/// incarnation, and reports the result.
pub(crate) fn recover(log: &dyn TransactionLog) -> Result<RecoveryReport, InternalError> {
    let mut states = BTreeMap::new();
    let mut incarnation = 0;

    for entry in log.entries()? {
        match entry {
            LogEntry::Incarnation(count) => incarnation = incarnation.max(count),
            LogEntry::Created { id, .. } => {
                states.insert(id, TransactionState::Active);
            }
            LogEntry::StateChanged { id, state } => {
                states.insert(id, state);
            }
        }
    }

    let next_id = states
        .keys()
        .next_back()
        .map(TransactionId::next)
        .unwrap_or_else(|| TransactionId::from(1));

    let presumed_aborted: Vec<TransactionId> = states
        .iter()
        .filter(|(_, state)| !state.is_terminal())
        .map(|(id, _)| *id)
        .collect();

    for id in &presumed_aborted {
        log.append(LogEntry::StateChanged {
            id: *id,
            state: TransactionState::Aborted,
        })?;
    }

    let incarnation = incarnation + 1;
    log.append(LogEntry::Incarnation(incarnation))?;

    let committed = states
        .values()
        .filter(|state| **state == TransactionState::Committed)
        .count();

    let report = RecoveryReport {
        incarnation,
        next_id,
        aborted: states.len() - committed,
        committed,
        presumed_aborted,
    };

    if !states.is_empty() {
        info!(
            "Recovered {} transactions ({} committed, {} aborted, {} presumed aborted); \
             starting incarnation {}",
            states.len(),
            report.committed,
            report.aborted,
            report.presumed_aborted.len(),
            incarnation
        );
    }

    Ok(report)
}
