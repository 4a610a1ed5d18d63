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

//! Transaction identity, state and leases.

mod handle;
mod record;

use std::fmt;

pub(crate) use handle::TransactionHandle;
pub(crate) use record::{ParticipantEntry, PendingNotification, TransactionRecord};

/// Identifies a transaction within one manager. Ids are assigned in increasing order and are
/// never reused, including across restarts of a manager with a durable log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn value(&self) -> u64 {
        self.0
    }

    pub(crate) fn next(&self) -> TransactionId {
        TransactionId(self.0 + 1)
    }
}

impl From<u64> for TransactionId {
    fn from(id: u64) -> Self {
        TransactionId(id)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransactionState {
    Active = 0,
    Voting = 1,
    Committed = 2,
    Aborted = 3,
}

impl TransactionState {
    /// Committed and aborted transactions never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TransactionState::Active),
            1 => Some(TransactionState::Voting),
            2 => Some(TransactionState::Committed),
            3 => Some(TransactionState::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            TransactionState::Active => "ACTIVE",
            TransactionState::Voting => "VOTING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::Aborted => "ABORTED",
        })
    }
}

/// The lease held on a transaction. The transaction is aborted once `expiration` passes unless
/// it has been decided or the lease has been renewed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lease<T> {
    id: TransactionId,
    expiration: T,
}

impl<T: Copy> Lease<T> {
    pub(crate) fn new(id: TransactionId, expiration: T) -> Self {
        Lease { id, expiration }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.id
    }

    pub fn expiration(&self) -> T {
        self.expiration
    }
}

/// The result of creating a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Created<T> {
    pub id: TransactionId,
    pub lease: Lease<T>,
}
