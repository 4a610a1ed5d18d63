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

//! The call contract between the manager and the participants of a transaction.
//!
//! A [`Participant`] is whatever transport adapter carries calls to the entity which joined the
//! transaction; the manager never needs to know its concrete type. Failures of these calls are
//! communication failures only. Business outcomes are expressed through [`Vote`] and
//! [`PrepareAndCommitOutcome`].

use std::fmt;

use crate::error::CommunicationError;
use crate::transaction::TransactionId;

/// A counter supplied by a participant which changes whenever the participant's durable state is
/// destroyed and recreated.
pub type CrashCount = u64;

/// The identity of a participant. Two joins with the same id are the same participant.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        ParticipantId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        ParticipantId::new(id)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        ParticipantId(id)
    }
}

/// A participant's answer to `prepare`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vote {
    /// The participant can commit and will wait for the decision.
    Prepared,
    /// The participant did nothing under this transaction and needs no further calls.
    NotChanged,
    /// The participant can not commit.
    Abort,
}

/// A participant's answer to `prepare_and_commit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepareAndCommitOutcome {
    Committed,
    NotChanged,
    Abort,
}

/// A handle through which the manager drives a participant.
pub trait Participant: Send + Sync {
    fn id(&self) -> &ParticipantId;

    /// Asks the participant to vote on the outcome of the transaction.
    ///
    /// # Errors
    ///
    /// Returns a [`CommunicationError`] if the call could not be completed. The manager counts
    /// this as an abort vote.
    fn prepare(&self, transaction: TransactionId) -> Result<Vote, CommunicationError>;

    fn commit(&self, transaction: TransactionId) -> Result<(), CommunicationError>;

    fn abort(&self, transaction: TransactionId) -> Result<(), CommunicationError>;

    /// Prepares and, if prepared, commits in a single round trip.
    ///
    /// The manager only uses this for the last participant of a transaction when every other
    /// participant voted [`Vote::NotChanged`]. The default implementation is equivalent to
    /// calling `prepare` followed by `commit`.
    fn prepare_and_commit(
        &self,
        transaction: TransactionId,
    ) -> Result<PrepareAndCommitOutcome, CommunicationError> {
        match self.prepare(transaction)? {
            Vote::Prepared => {
                self.commit(transaction)?;
                Ok(PrepareAndCommitOutcome::Committed)
            }
            Vote::NotChanged => Ok(PrepareAndCommitOutcome::NotChanged),
            Vote::Abort => Ok(PrepareAndCommitOutcome::Abort),
        }
    }
}
