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

//! Nested transactions.
//!
//! A nested transaction records a link to its parent. Committing it does not run the protocol;
//! its participants are promoted into the parent, which decides for all of them when it
//! completes. A parent may live in this manager or in another one reached through
//! [`EnclosingManager`]. In the second case this manager joins the parent as a participant, so
//! that the parent's coordinator can reach the children it still has open.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::coordinator::{pending, Coordinator, CoordinatorSettings, Outcome};
use crate::error::{CommunicationError, TransactionError};
use crate::participant::{CrashCount, Participant, ParticipantId, PrepareAndCommitOutcome, Vote};
use crate::registry::TransactionRegistry;
use crate::time::TimeSource;
use crate::transaction::{Created, TransactionHandle, TransactionId, TransactionState};

/// The identity of a transaction manager. Must be unique among managers which nest
/// transactions under each other.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ManagerId(String);

impl ManagerId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        ManagerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The surface a child's manager needs from the manager which owns the parent transaction.
pub trait EnclosingManager: Send + Sync {
    fn manager_id(&self) -> &ManagerId;

    fn join(
        &self,
        id: TransactionId,
        participant: Arc<dyn Participant>,
        crash_count: CrashCount,
    ) -> Result<(), TransactionError>;

    /// Adds `participants` to the parent transaction and removes `drop` from it, unless `drop`
    /// is itself one of the participants being promoted.
    fn promote(
        &self,
        parent: TransactionId,
        participants: &[(Arc<dyn Participant>, CrashCount)],
        drop: Option<&ParticipantId>,
    ) -> Result<(), TransactionError>;

    fn get_state(&self, id: TransactionId) -> Result<TransactionState, TransactionError>;
}

/// Where a nested transaction's parent lives.
#[derive(Clone)]
pub(crate) enum ParentLink {
    Local(TransactionId),
    Remote {
        manager: Arc<dyn EnclosingManager>,
        id: TransactionId,
    },
}

impl ParentLink {
    pub fn local_id(&self) -> Option<TransactionId> {
        match self {
            ParentLink::Local(id) => Some(*id),
            ParentLink::Remote { .. } => None,
        }
    }

    fn is_remote(&self, manager_id: &ManagerId, parent: TransactionId) -> bool {
        match self {
            ParentLink::Remote { manager, id } => {
                *id == parent && manager.manager_id() == manager_id
            }
            ParentLink::Local(_) => false,
        }
    }
}

impl<TS> Coordinator<TS>
where
    TS: TimeSource,
{
    /// Creates a transaction nested under `parent` in this manager.
    pub fn create_child(
        &self,
        parent: TransactionId,
        lease: Duration,
    ) -> Result<Created<TS::Time>, TransactionError> {
        let parent_handle = self.registry.lookup(parent)?;
        let mut parent_record = parent_handle.record();
        if parent_record.state() != TransactionState::Active {
            return Err(TransactionError::CannotJoin {
                id: parent,
                state: parent_record.state(),
            });
        }

        let (handle, lease) = self
            .registry
            .create(Some(ParentLink::Local(parent)), lease)?;
        parent_record.add_child(handle.id());

        debug!("Created {} nested under {}", handle.id(), parent);

        Ok(Created {
            id: handle.id(),
            lease,
        })
    }

    /// Creates a transaction nested under `parent`, owned by `parent_manager`.
    pub fn create_nested(
        &self,
        parent_manager: Arc<dyn EnclosingManager>,
        parent: TransactionId,
        lease: Duration,
    ) -> Result<Created<TS::Time>, TransactionError> {
        if parent_manager.manager_id() == &self.settings.manager_id {
            return self.create_child(parent, lease);
        }

        // A lease which would be denied must not leave this manager joined to the parent.
        self.registry.grant(None, lease)?;

        let participant: Arc<dyn Participant> = Arc::new(ManagerParticipant::new(
            &self.registry,
            self.settings.clone(),
            parent_manager.manager_id().clone(),
        ));
        parent_manager.join(parent, participant, self.settings.incarnation)?;

        let created = self.registry.create(
            Some(ParentLink::Remote {
                manager: parent_manager.clone(),
                id: parent,
            }),
            lease,
        );
        let (handle, lease) = match created {
            Ok(created) => created,
            Err(err) => {
                self.leave_remote_parent(parent_manager.as_ref(), parent);
                return Err(err);
            }
        };

        debug!(
            "Created {} nested under {} of manager {}",
            handle.id(),
            parent,
            parent_manager.manager_id()
        );

        Ok(Created {
            id: handle.id(),
            lease,
        })
    }

    /// Adds participants to an active transaction, validating crash counts as a join would.
    ///
    /// Nothing is changed unless every participant can be added.
    pub fn promote(
        &self,
        parent: TransactionId,
        participants: &[(Arc<dyn Participant>, CrashCount)],
        drop: Option<&ParticipantId>,
    ) -> Result<(), TransactionError> {
        let handle = self.registry.lookup(parent)?;
        let mut record = handle.record();

        if record.state() != TransactionState::Active {
            return Err(TransactionError::CannotJoin {
                id: parent,
                state: record.state(),
            });
        }

        for (index, (participant, crash_count)) in participants.iter().enumerate() {
            record.check_join(participant.id(), *crash_count)?;

            // The same participant listed twice must agree with itself.
            if let Some((_, earlier)) = participants[..index]
                .iter()
                .find(|(other, _)| other.id() == participant.id())
            {
                if earlier != crash_count {
                    return Err(TransactionError::CrashCount {
                        id: parent,
                        participant: participant.id().clone(),
                        recorded: *earlier,
                        presented: *crash_count,
                    });
                }
            }
        }

        for (participant, crash_count) in participants {
            record.join(participant.clone(), *crash_count)?;
        }

        if let Some(drop) = drop {
            let promoted = participants
                .iter()
                .any(|(participant, _)| participant.id() == drop);
            if !promoted && record.remove_participant(drop) {
                debug!("Dropped participant {} from {}", drop, parent);
            }
        }

        debug!("Promoted {} participants into {}", participants.len(), parent);

        Ok(())
    }

    /// Returns true if `ancestor` appears in the parent chain of `id`.
    ///
    /// Only the part of the chain owned by this manager is walked.
    pub fn enclosed_by(
        &self,
        id: TransactionId,
        ancestor: TransactionId,
    ) -> Result<bool, TransactionError> {
        let mut current = self.registry.lookup(id)?;

        loop {
            let parent = current.record().parent().cloned();
            match parent {
                Some(ParentLink::Local(parent)) if parent == ancestor => return Ok(true),
                Some(ParentLink::Local(parent)) => match self.registry.lookup(parent) {
                    Ok(handle) => current = handle,
                    Err(_) => return Ok(false),
                },
                Some(ParentLink::Remote { .. }) | None => return Ok(false),
            }
        }
    }

    /// Commits a nested transaction by promoting its participants into its parent. The caller
    /// must hold the round lock.
    pub(crate) fn commit_nested(
        &self,
        handle: &TransactionHandle<TS::Time>,
    ) -> Result<Outcome, TransactionError> {
        let id = handle.id();

        let (parent, participants, children) = {
            let mut record = handle.record();
            let parent = match record.parent() {
                Some(parent) => parent.clone(),
                None => {
                    return Err(TransactionError::CannotCommit {
                        id,
                        reason: "transaction is not nested".into(),
                    })
                }
            };
            self.registry
                .transition(handle, &mut record, TransactionState::Voting)?;
            (
                parent,
                record.participants().to_vec(),
                record.children().to_vec(),
            )
        };

        self.abort_children(&children);

        let promoted: Vec<(Arc<dyn Participant>, CrashCount)> = participants
            .iter()
            .map(|entry| (entry.participant.clone(), entry.crash_count))
            .collect();

        let (parent_id, result) = match &parent {
            ParentLink::Local(parent_id) => {
                (*parent_id, self.promote(*parent_id, &promoted, None))
            }
            ParentLink::Remote {
                manager,
                id: parent_id,
            } => {
                let siblings = self.has_open_siblings(manager.manager_id(), *parent_id, Some(id));
                let drop = if siblings {
                    None
                } else {
                    Some(self.manager_participant_id())
                };
                (
                    *parent_id,
                    manager.promote(*parent_id, &promoted, drop.as_ref()),
                )
            }
        };

        let mut record = handle.record();
        match result {
            Ok(()) => {
                let committed = TransactionState::Committed;
                if let Err(err) = self.registry.transition(handle, &mut record, committed) {
                    // The participants already belong to the parent.
                    error!("Unable to log commit of nested transaction {}: {}", id, err);
                    self.registry.publish(handle, &mut record, committed);
                }
                info!("Transaction {} committed into parent {}", id, parent_id);
                Ok(Outcome::Committed)
            }
            Err(err) => {
                warn!("Unable to promote participants of {} into {}: {}", id, parent_id, err);
                let aborted = TransactionState::Aborted;
                self.registry.transition(handle, &mut record, aborted)?;
                record.set_unsettled(pending(participants));
                Ok(Outcome::Aborted(format!(
                    "promotion into parent {} failed: {}",
                    parent_id, err
                )))
            }
        }
    }

    /// Removes this manager from a remote parent it joined for a child which was never
    /// created, unless another open child still needs it there.
    fn leave_remote_parent(&self, parent_manager: &dyn EnclosingManager, parent: TransactionId) {
        if self.has_open_siblings(parent_manager.manager_id(), parent, None) {
            return;
        }
        let id = self.manager_participant_id();
        if let Err(err) = parent_manager.promote(parent, &[], Some(&id)) {
            warn!(
                "Unable to leave transaction {} of manager {}: {}",
                parent,
                parent_manager.manager_id(),
                err
            );
        }
    }

    /// True if any undecided transaction other than `except` is nested under the given remote
    /// parent.
    fn has_open_siblings(
        &self,
        manager_id: &ManagerId,
        parent: TransactionId,
        except: Option<TransactionId>,
    ) -> bool {
        self.registry.handles().iter().any(|handle| {
            Some(handle.id()) != except
                && !handle.state().is_terminal()
                && handle
                    .record()
                    .parent()
                    .map_or(false, |link| link.is_remote(manager_id, parent))
        })
    }

    /// Aborts every undecided transaction nested under the given remote parent.
    fn abort_open_children_of(&self, manager_id: &ManagerId, parent: TransactionId) {
        for handle in self.registry.handles() {
            let nested = !handle.state().is_terminal()
                && handle
                    .record()
                    .parent()
                    .map_or(false, |link| link.is_remote(manager_id, parent));
            if nested {
                self.abort_descendant(&handle);
            }
        }
    }

    fn manager_participant_id(&self) -> ParticipantId {
        ParticipantId::new(self.settings.manager_id.as_str())
    }
}

/// This manager as seen by the manager owning a parent transaction.
///
/// Promotion has already moved committed children's participants into the parent, so the
/// manager itself never has anything to commit. When the parent completes, any child still open
/// is aborted.
struct ManagerParticipant<TS>
where
    TS: TimeSource,
{
    id: ParticipantId,
    parent_manager: ManagerId,
    registry: Weak<TransactionRegistry<TS>>,
    settings: Arc<CoordinatorSettings>,
}

impl<TS> ManagerParticipant<TS>
where
    TS: TimeSource,
{
    fn new(
        registry: &Arc<TransactionRegistry<TS>>,
        settings: Arc<CoordinatorSettings>,
        parent_manager: ManagerId,
    ) -> Self {
        ManagerParticipant {
            id: ParticipantId::new(settings.manager_id.as_str()),
            parent_manager,
            registry: Arc::downgrade(registry),
            settings,
        }
    }

    fn coordinator(&self) -> Result<Coordinator<TS>, CommunicationError> {
        let registry = self.registry.upgrade().ok_or_else(|| {
            CommunicationError::with_message(format!("manager {} has shut down", self.id))
        })?;
        Ok(Coordinator {
            registry,
            settings: self.settings.clone(),
        })
    }

    fn close_children(&self, parent: TransactionId) -> Result<(), CommunicationError> {
        self.coordinator()?
            .abort_open_children_of(&self.parent_manager, parent);
        Ok(())
    }
}

impl<TS> Participant for ManagerParticipant<TS>
where
    TS: TimeSource,
{
    fn id(&self) -> &ParticipantId {
        &self.id
    }

    fn prepare(&self, transaction: TransactionId) -> Result<Vote, CommunicationError> {
        self.close_children(transaction)?;
        Ok(Vote::NotChanged)
    }

    fn commit(&self, _transaction: TransactionId) -> Result<(), CommunicationError> {
        Ok(())
    }

    fn abort(&self, transaction: TransactionId) -> Result<(), CommunicationError> {
        self.close_children(transaction)
    }

    fn prepare_and_commit(
        &self,
        transaction: TransactionId,
    ) -> Result<PrepareAndCommitOutcome, CommunicationError> {
        self.close_children(transaction)?;
        Ok(PrepareAndCommitOutcome::NotChanged)
    }
}
