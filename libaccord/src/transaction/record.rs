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

use std::sync::Arc;

use crate::error::TransactionError;
use crate::nesting::ParentLink;
use crate::participant::{CrashCount, Participant, ParticipantId};
use crate::time::Time;

use super::{TransactionId, TransactionState};

/// A participant which has joined a transaction, with the crash count it joined with.
#[derive(Clone)]
pub(crate) struct ParticipantEntry {
    pub participant: Arc<dyn Participant>,
    pub crash_count: CrashCount,
}

impl ParticipantEntry {
    pub fn new(participant: Arc<dyn Participant>, crash_count: CrashCount) -> Self {
        ParticipantEntry {
            participant,
            crash_count,
        }
    }

    pub fn id(&self) -> &ParticipantId {
        self.participant.id()
    }
}

/// A phase-two call which failed and must be sent again.
#[derive(Clone)]
pub(crate) struct PendingNotification {
    pub participant: Arc<dyn Participant>,
    pub attempts: u32,
}

pub(crate) struct TransactionRecord<T>
where
    T: Time,
{
    id: TransactionId,
    state: TransactionState,
    parent: Option<ParentLink>,
    participants: Vec<ParticipantEntry>,
    children: Vec<TransactionId>,
    expiration: T,
    terminated_at: Option<T>,
    unsettled: Vec<PendingNotification>,
}

impl<T> TransactionRecord<T>
where
    T: Time,
{
    pub fn new(id: TransactionId, parent: Option<ParentLink>, expiration: T) -> Self {
        TransactionRecord {
            id,
            state: TransactionState::Active,
            parent,
            participants: Vec::new(),
            children: Vec::new(),
            expiration,
            terminated_at: None,
            unsettled: Vec::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Only called through `TransactionHandle::transition` so the published snapshot stays in
    /// step with the record.
    pub(super) fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    pub fn participants(&self) -> &[ParticipantEntry] {
        &self.participants
    }

    pub fn children(&self) -> &[TransactionId] {
        &self.children
    }

    pub fn add_child(&mut self, child: TransactionId) {
        self.children.push(child);
    }

    pub fn expiration(&self) -> T {
        self.expiration
    }

    pub fn set_expiration(&mut self, expiration: T) {
        self.expiration = expiration;
    }

    pub fn terminated_at(&self) -> Option<T> {
        self.terminated_at
    }

    pub fn set_terminated_at(&mut self, at: T) {
        self.terminated_at = Some(at);
    }

    pub fn unsettled(&self) -> &[PendingNotification] {
        &self.unsettled
    }

    pub fn set_unsettled(&mut self, unsettled: Vec<PendingNotification>) {
        self.unsettled = unsettled;
    }

    pub fn take_unsettled(&mut self) -> Vec<PendingNotification> {
        std::mem::take(&mut self.unsettled)
    }

    /// Checks that `participant` may join with `crash_count`, returning the index of its existing
    /// entry if it has joined before.
    pub fn check_join(
        &self,
        participant: &ParticipantId,
        crash_count: CrashCount,
    ) -> Result<Option<usize>, TransactionError> {
        if self.state != TransactionState::Active {
            return Err(TransactionError::CannotJoin {
                id: self.id,
                state: self.state,
            });
        }

        match self
            .participants
            .iter()
            .position(|entry| entry.id() == participant)
        {
            Some(index) if self.participants[index].crash_count != crash_count => {
                Err(TransactionError::CrashCount {
                    id: self.id,
                    participant: participant.clone(),
                    recorded: self.participants[index].crash_count,
                    presented: crash_count,
                })
            }
            found => Ok(found),
        }
    }

    /// Adds the participant, or refreshes its handle if it has already joined with the same
    /// crash count.
    pub fn join(
        &mut self,
        participant: Arc<dyn Participant>,
        crash_count: CrashCount,
    ) -> Result<(), TransactionError> {
        match self.check_join(participant.id(), crash_count)? {
            Some(index) => self.participants[index].participant = participant,
            None => self
                .participants
                .push(ParticipantEntry::new(participant, crash_count)),
        }
        Ok(())
    }

    pub fn remove_participant(&mut self, participant: &ParticipantId) -> bool {
        let before = self.participants.len();
        self.participants.retain(|entry| entry.id() != participant);
        before != self.participants.len()
    }
}
