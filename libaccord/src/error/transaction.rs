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

//! Contains TransactionError

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FormatResult};
use std::time::Duration;

use crate::participant::{CrashCount, ParticipantId};
use crate::transaction::{TransactionId, TransactionState};

use super::InternalError;

/// An error returned to the caller of a transaction manager operation.
///
/// Errors about the validity of the transaction itself are always surfaced to the caller of the
/// offending operation; the manager never retries on the caller's behalf.
#[derive(Debug)]
pub enum TransactionError {
    /// The id never named a transaction, or the transaction has already been discarded.
    UnknownTransaction(TransactionId),

    /// The transaction exists but is no longer accepting participants.
    CannotJoin {
        id: TransactionId,
        state: TransactionState,
    },

    /// The participant previously joined this transaction with a different crash count.
    CrashCount {
        id: TransactionId,
        participant: ParticipantId,
        recorded: CrashCount,
        presented: CrashCount,
    },

    /// The transaction can not be committed in its current state.
    CannotCommit { id: TransactionId, reason: String },

    /// The transaction can not be aborted in its current state.
    CannotAbort { id: TransactionId, reason: String },

    /// A bounded wait ran out before the operation completed. The outcome of the transaction is
    /// decided independently and may be queried afterwards.
    TimeoutExpired {
        id: TransactionId,
        wait_for: Duration,
    },

    /// The requested lease could not be granted or renewed.
    LeaseDenied {
        id: Option<TransactionId>,
        reason: String,
    },

    /// The operation could not be completed due to an unexpected internal error.
    Internal(InternalError),
}

impl TransactionError {
    /// Returns the transaction the error refers to, if any.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            TransactionError::UnknownTransaction(id)
            | TransactionError::CannotJoin { id, .. }
            | TransactionError::CrashCount { id, .. }
            | TransactionError::CannotCommit { id, .. }
            | TransactionError::CannotAbort { id, .. }
            | TransactionError::TimeoutExpired { id, .. } => Some(*id),
            TransactionError::LeaseDenied { id, .. } => *id,
            TransactionError::Internal(_) => None,
        }
    }
}

impl Error for TransactionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransactionError::Internal(e) => Some(e),
            _ => None,
        }
    }
}

impl Display for TransactionError {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        match self {
            TransactionError::UnknownTransaction(id) => write!(f, "unknown transaction {}", id),
            TransactionError::CannotJoin { id, state } => {
                write!(f, "cannot join transaction {} in state {}", id, state)
            }
            TransactionError::CrashCount {
                id,
                participant,
                recorded,
                presented,
            } => write!(
                f,
                "participant {} joined transaction {} with crash count {} but previously \
                 joined with {}",
                participant, id, presented, recorded
            ),
            TransactionError::CannotCommit { id, reason } => {
                write!(f, "cannot commit transaction {}: {}", id, reason)
            }
            TransactionError::CannotAbort { id, reason } => {
                write!(f, "cannot abort transaction {}: {}", id, reason)
            }
            TransactionError::TimeoutExpired { id, wait_for } => write!(
                f,
                "transaction {} did not complete within {:?}",
                id, wait_for
            ),
            TransactionError::LeaseDenied {
                id: Some(id),
                reason,
            } => write!(f, "lease denied for transaction {}: {}", id, reason),
            TransactionError::LeaseDenied { id: None, reason } => {
                write!(f, "lease denied: {}", reason)
            }
            TransactionError::Internal(e) => write!(f, "{}", e),
        }
    }
}

impl From<InternalError> for TransactionError {
    fn from(err: InternalError) -> Self {
        TransactionError::Internal(err)
    }
}
