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

//! The two-phase commit engine.
//!
//! A protocol run (commit, abort, or a lease-expiry abort) holds the transaction's round lock
//! from start to finish, so exactly one run decides each transaction. The decision is logged and
//! published before any participant hears about it.

mod expiry;
mod settlement;
mod voting;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;

use crate::error::TransactionError;
use crate::nesting::ManagerId;
use crate::participant::{CrashCount, Participant};
use crate::registry::{Handle, TransactionRegistry};
use crate::time::{Time, TimeSource};
use crate::transaction::{
    Created, ParticipantEntry, PendingNotification, TransactionHandle, TransactionId,
    TransactionState,
};

pub use expiry::SweepReport;

use settlement::wait_until_settled;
use voting::collect_votes;

/// Settings which shape how the coordinator runs the protocol.
pub(crate) struct CoordinatorSettings {
    pub manager_id: ManagerId,
    /// This manager's crash count, presented when it joins a parent owned by another manager.
    pub incarnation: CrashCount,
    pub prepare_and_commit: bool,
    pub max_settle_attempts: u32,
    pub terminal_retention: Duration,
}

pub(crate) struct Coordinator<TS>
where
    TS: TimeSource,
{
    pub(crate) registry: Arc<TransactionRegistry<TS>>,
    pub(crate) settings: Arc<CoordinatorSettings>,
}

impl<TS> Clone for Coordinator<TS>
where
    TS: TimeSource,
{
    fn clone(&self) -> Self {
        Coordinator {
            registry: self.registry.clone(),
            settings: self.settings.clone(),
        }
    }
}

/// How a run ended, before it is turned into the caller's result.
pub(crate) enum Outcome {
    Committed,
    Aborted(String),
}

impl<TS> Coordinator<TS>
where
    TS: TimeSource,
{
    pub fn new(registry: Arc<TransactionRegistry<TS>>, settings: CoordinatorSettings) -> Self {
        Coordinator {
            registry,
            settings: Arc::new(settings),
        }
    }

    pub fn create(&self, lease: Duration) -> Result<Created<TS::Time>, TransactionError> {
        let (handle, lease) = self.registry.create(None, lease)?;
        Ok(Created {
            id: handle.id(),
            lease,
        })
    }

    pub fn join(
        &self,
        id: TransactionId,
        participant: Arc<dyn Participant>,
        crash_count: CrashCount,
    ) -> Result<(), TransactionError> {
        let handle = self.registry.lookup(id)?;

        // A voting transaction rejects joins without waiting for the round to finish.
        let state = handle.state();
        if state != TransactionState::Active {
            return Err(TransactionError::CannotJoin { id, state });
        }

        let participant_id = participant.id().clone();
        handle.record().join(participant, crash_count)?;

        debug!(
            "Participant {} joined {} with crash count {}",
            participant_id, id, crash_count
        );

        Ok(())
    }

    pub fn state(&self, id: TransactionId) -> Result<TransactionState, TransactionError> {
        Ok(self.registry.lookup(id)?.state())
    }

    /// Commits the transaction and notifies every prepared participant before returning.
    pub fn commit(&self, id: TransactionId) -> Result<(), TransactionError> {
        let handle = self.registry.lookup(id)?;
        let _round = handle.round();

        let outcome = self.decide_commit(&handle)?;
        self.settle_locked(&handle);

        outcome.into_commit_result(id)
    }

    /// Commits the transaction, waiting at most `wait_for` for the decision to reach the
    /// participants.
    ///
    /// If the wait runs out the decision still stands and notifications carry on in the
    /// background.
    pub fn commit_with_timeout(
        &self,
        id: TransactionId,
        wait_for: Duration,
    ) -> Result<(), TransactionError> {
        // A wait too long to represent has no deadline.
        let deadline = Instant::now().checked_add(wait_for);
        let handle = self.registry.lookup(id)?;

        let outcome = {
            let _round = bounded_round(&handle, deadline, wait_for)?;
            self.decide_commit(&handle)?
        };

        let settled = self.spawn_settlement(handle)?;
        match outcome {
            Outcome::Committed => wait_until_settled(id, settled, deadline, wait_for),
            // Abort notifications carry on without holding up the caller.
            Outcome::Aborted(reason) => Err(TransactionError::CannotCommit { id, reason }),
        }
    }

    /// Aborts an active transaction and notifies its participants before returning.
    ///
    /// If a commit is in progress this waits for it to finish, after which the transaction has
    /// been decided and the abort fails.
    pub fn abort(&self, id: TransactionId) -> Result<(), TransactionError> {
        let handle = self.registry.lookup(id)?;
        let _round = handle.round();

        self.abort_locked(&handle, "abort requested")?;
        self.settle_locked(&handle);

        Ok(())
    }

    pub fn abort_with_timeout(
        &self,
        id: TransactionId,
        wait_for: Duration,
    ) -> Result<(), TransactionError> {
        let deadline = Instant::now().checked_add(wait_for);
        let handle = self.registry.lookup(id)?;

        {
            let _round = bounded_round(&handle, deadline, wait_for)?;
            self.abort_locked(&handle, "abort requested")?;
        }

        let settled = self.spawn_settlement(handle)?;
        wait_until_settled(id, settled, deadline, wait_for)
    }

    /// Runs phase one and records the decision. The caller must hold the round lock.
    fn decide_commit(
        &self,
        handle: &TransactionHandle<TS::Time>,
    ) -> Result<Outcome, TransactionError> {
        let id = handle.id();

        let (participants, children) = {
            let mut record = handle.record();

            match record.state() {
                TransactionState::Active => (),
                state => {
                    return Err(TransactionError::CannotCommit {
                        id,
                        reason: format!("transaction is {}", state),
                    })
                }
            }

            if self.registry.is_expired(record.expiration()) {
                drop(record);
                info!("Lease on transaction {} expired before commit", id);
                self.abort_locked(handle, "lease expired")?;
                return Ok(Outcome::Aborted("lease expired".into()));
            }

            if record.parent().is_some() {
                drop(record);
                return self.commit_nested(handle);
            }

            self.registry
                .transition(handle, &mut record, TransactionState::Voting)?;
            (record.participants().to_vec(), record.children().to_vec())
        };

        self.abort_children(&children);

        let ballot = collect_votes(id, participants, self.settings.prepare_and_commit);
        let mut decision = ballot.decision();

        let mut record = handle.record();
        if let Err(err) = self.registry.transition(handle, &mut record, decision) {
            if decision != TransactionState::Committed {
                return Err(err.into());
            }
            if ballot.has_committed() {
                // A participant has already committed; the decision can not be taken back.
                error!(
                    "Unable to log commit decision for {}, which a participant has already \
                     committed: {}",
                    id, err
                );
                self.registry.publish(handle, &mut record, decision);
            } else {
                warn!(
                    "Unable to log commit decision for {}, aborting instead: {}",
                    id, err
                );
                decision = TransactionState::Aborted;
                self.registry.transition(handle, &mut record, decision)?;
            }
        }
        record.set_unsettled(pending(ballot.to_notify(decision)));

        if decision == TransactionState::Committed {
            info!("Transaction {} committed", id);
            Ok(Outcome::Committed)
        } else {
            info!("Transaction {} aborted by vote", id);
            Ok(Outcome::Aborted("a participant voted to abort".into()))
        }
    }

    /// Records an abort decision and queues an abort for every participant. Active children are
    /// aborted too. The caller must hold the round lock.
    pub(crate) fn abort_locked(
        &self,
        handle: &TransactionHandle<TS::Time>,
        reason: &str,
    ) -> Result<(), TransactionError> {
        let id = handle.id();

        let children = {
            let mut record = handle.record();
            if record.state().is_terminal() {
                return Err(TransactionError::CannotAbort {
                    id,
                    reason: format!("transaction is {}", record.state()),
                });
            }

            // The decision is recorded before any participant is told.
            self.registry
                .transition(handle, &mut record, TransactionState::Aborted)?;
            let notify = pending(record.participants().to_vec());
            record.set_unsettled(notify);
            record.children().to_vec()
        };

        info!("Transaction {} aborted: {}", id, reason);

        self.abort_children(&children);

        Ok(())
    }

    /// Aborts every child which has not been decided yet.
    pub(crate) fn abort_children(&self, children: &[TransactionId]) {
        for child in children {
            if let Ok(handle) = self.registry.lookup(*child) {
                self.abort_descendant(&handle);
            }
        }
    }

    /// Takes the round lock of a descendant and aborts it if it is still undecided.
    pub(crate) fn abort_descendant(&self, handle: &Handle<TS>) {
        let _round = handle.round();
        if handle.state().is_terminal() {
            return;
        }
        match self.abort_locked(handle, "enclosing transaction completed") {
            Ok(()) => {
                self.settle_locked(handle);
            }
            Err(err) => debug!("Unable to abort descendant {}: {}", handle.id(), err),
        }
    }
}

impl Outcome {
    fn into_commit_result(self, id: TransactionId) -> Result<(), TransactionError> {
        match self {
            Outcome::Committed => Ok(()),
            Outcome::Aborted(reason) => Err(TransactionError::CannotCommit { id, reason }),
        }
    }
}

/// Takes the round lock, giving up once `deadline` passes.
fn bounded_round<'a, T: Time>(
    handle: &'a TransactionHandle<T>,
    deadline: Option<Instant>,
    wait_for: Duration,
) -> Result<MutexGuard<'a, ()>, TransactionError> {
    match deadline {
        Some(_) => handle
            .try_round_for(wait_for)
            .ok_or(TransactionError::TimeoutExpired {
                id: handle.id(),
                wait_for,
            }),
        None => Ok(handle.round()),
    }
}

pub(crate) fn pending(entries: Vec<ParticipantEntry>) -> Vec<PendingNotification> {
    entries
        .into_iter()
        .map(|entry| PendingNotification {
            participant: entry.participant,
            attempts: 0,
        })
        .collect()
}
