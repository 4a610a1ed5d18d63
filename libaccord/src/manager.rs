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

//! The public face of the crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::{Coordinator, CoordinatorSettings, SweepReport};
#[cfg(feature = "lease-reaper")]
use crate::error::InternalError;
use crate::error::{InvalidStateError, TransactionError};
use crate::nesting::{EnclosingManager, ManagerId};
use crate::participant::{CrashCount, Participant, ParticipantId};
#[cfg(feature = "lease-reaper")]
use crate::reaper::LeaseReaper;
use crate::registry::TransactionRegistry;
use crate::time::TimeSource;
use crate::transaction::{Created, Lease, TransactionId, TransactionState};
use crate::transaction_log::{recover, InMemoryTransactionLog, RecoveryReport, TransactionLog};

const DEFAULT_MAX_LEASE: Duration = Duration::from_secs(60 * 60);
const DEFAULT_TERMINAL_RETENTION: Duration = Duration::from_secs(60);
const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_SETTLE_ATTEMPTS: u32 = 10;

static MANAGER_COUNT: AtomicU64 = AtomicU64::new(1);

/// Creates, coordinates and tracks leased transactions.
///
/// Clones share the same transactions.
pub struct TransactionManager<TS>
where
    TS: TimeSource,
{
    coordinator: Coordinator<TS>,
    recovery: Arc<RecoveryReport>,
    reaper_interval: Duration,
}

impl<TS> Clone for TransactionManager<TS>
where
    TS: TimeSource,
{
    fn clone(&self) -> Self {
        TransactionManager {
            coordinator: self.coordinator.clone(),
            recovery: self.recovery.clone(),
            reaper_interval: self.reaper_interval,
        }
    }
}

impl<TS> TransactionManager<TS>
where
    TS: TimeSource,
{
    /// Creates a transaction, nested under `parent` if one is given.
    ///
    /// # Errors
    ///
    /// * [`TransactionError::LeaseDenied`] if `lease` is zero
    /// * [`TransactionError::UnknownTransaction`] if `parent` is not known
    /// * [`TransactionError::CannotJoin`] if `parent` is no longer active
    pub fn create(
        &self,
        parent: Option<TransactionId>,
        lease: Duration,
    ) -> Result<Created<TS::Time>, TransactionError> {
        match parent {
            Some(parent) => self.coordinator.create_child(parent, lease),
            None => self.coordinator.create(lease),
        }
    }

    /// Creates a transaction nested under `parent`, which is owned by `parent_manager`.
    pub fn create_nested(
        &self,
        parent_manager: Arc<dyn EnclosingManager>,
        parent: TransactionId,
        lease: Duration,
    ) -> Result<Created<TS::Time>, TransactionError> {
        self.coordinator.create_nested(parent_manager, parent, lease)
    }

    /// Adds a participant to an active transaction.
    ///
    /// Joining again with the same crash count succeeds and changes nothing; joining with a
    /// different one fails with [`TransactionError::CrashCount`].
    pub fn join(
        &self,
        id: TransactionId,
        participant: Arc<dyn Participant>,
        crash_count: CrashCount,
    ) -> Result<(), TransactionError> {
        self.coordinator.join(id, participant, crash_count)
    }

    /// Commits the transaction. Blocks until every prepared participant has been told.
    pub fn commit(&self, id: TransactionId) -> Result<(), TransactionError> {
        self.coordinator.commit(id)
    }

    pub fn commit_with_timeout(
        &self,
        id: TransactionId,
        wait_for: Duration,
    ) -> Result<(), TransactionError> {
        self.coordinator.commit_with_timeout(id, wait_for)
    }

    pub fn abort(&self, id: TransactionId) -> Result<(), TransactionError> {
        self.coordinator.abort(id)
    }

    pub fn abort_with_timeout(
        &self,
        id: TransactionId,
        wait_for: Duration,
    ) -> Result<(), TransactionError> {
        self.coordinator.abort_with_timeout(id, wait_for)
    }

    pub fn get_state(&self, id: TransactionId) -> Result<TransactionState, TransactionError> {
        self.coordinator.state(id)
    }

    pub fn renew_lease(
        &self,
        id: TransactionId,
        lease: Duration,
    ) -> Result<Lease<TS::Time>, TransactionError> {
        self.coordinator.registry.renew_lease(id, lease)
    }

    /// Gives up the lease, which aborts the transaction.
    pub fn cancel_lease(&self, id: TransactionId) -> Result<(), TransactionError> {
        self.coordinator.abort(id)
    }

    pub fn promote(
        &self,
        parent: TransactionId,
        participants: &[(Arc<dyn Participant>, CrashCount)],
        drop: Option<&ParticipantId>,
    ) -> Result<(), TransactionError> {
        self.coordinator.promote(parent, participants, drop)
    }

    /// Returns true if `ancestor` encloses `id`, directly or through other transactions of
    /// this manager.
    pub fn enclosed_by(
        &self,
        id: TransactionId,
        ancestor: TransactionId,
    ) -> Result<bool, TransactionError> {
        self.coordinator.enclosed_by(id, ancestor)
    }

    /// The participants joined to a transaction, with the crash counts they joined with.
    pub fn participants(
        &self,
        id: TransactionId,
    ) -> Result<Vec<(ParticipantId, CrashCount)>, TransactionError> {
        let handle = self.coordinator.registry.lookup(id)?;
        let record = handle.record();
        Ok(record
            .participants()
            .iter()
            .map(|entry| (entry.id().clone(), entry.crash_count))
            .collect())
    }

    /// The number of transactions which have not been decided.
    pub fn active_count(&self) -> usize {
        self.coordinator
            .registry
            .handles()
            .iter()
            .filter(|handle| !handle.state().is_terminal())
            .count()
    }

    /// The number of transactions held, decided or not.
    pub fn len(&self) -> usize {
        self.coordinator.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one pass of lease expiry, settlement retry and retention.
    pub fn sweep(&self) -> SweepReport {
        self.coordinator.sweep()
    }

    /// Starts a thread which sweeps at the configured reaper interval.
    #[cfg(feature = "lease-reaper")]
    pub fn start_reaper(&self) -> Result<LeaseReaper, InternalError> {
        LeaseReaper::start(self.clone(), self.reaper_interval)
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn manager_id(&self) -> &ManagerId {
        &self.coordinator.settings.manager_id
    }

    /// The crash count this manager presents when it joins a parent owned by another manager.
    pub fn incarnation(&self) -> CrashCount {
        self.coordinator.settings.incarnation
    }
}

impl<TS> EnclosingManager for TransactionManager<TS>
where
    TS: TimeSource,
{
    fn manager_id(&self) -> &ManagerId {
        TransactionManager::manager_id(self)
    }

    fn join(
        &self,
        id: TransactionId,
        participant: Arc<dyn Participant>,
        crash_count: CrashCount,
    ) -> Result<(), TransactionError> {
        TransactionManager::join(self, id, participant, crash_count)
    }

    fn promote(
        &self,
        parent: TransactionId,
        participants: &[(Arc<dyn Participant>, CrashCount)],
        drop: Option<&ParticipantId>,
    ) -> Result<(), TransactionError> {
        TransactionManager::promote(self, parent, participants, drop)
    }

    fn get_state(&self, id: TransactionId) -> Result<TransactionState, TransactionError> {
        TransactionManager::get_state(self, id)
    }
}

pub struct TransactionManagerBuilder<TS>
where
    TS: TimeSource,
{
    time_source: Option<TS>,
    manager_id: Option<ManagerId>,
    max_lease: Option<Duration>,
    terminal_retention: Option<Duration>,
    reaper_interval: Option<Duration>,
    prepare_and_commit: Option<bool>,
    max_settle_attempts: Option<u32>,
    log: Option<Box<dyn TransactionLog>>,
}

impl<TS> Default for TransactionManagerBuilder<TS>
where
    TS: TimeSource,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<TS> TransactionManagerBuilder<TS>
where
    TS: TimeSource,
{
    pub fn new() -> Self {
        Self {
            time_source: None,
            manager_id: None,
            max_lease: None,
            terminal_retention: None,
            reaper_interval: None,
            prepare_and_commit: None,
            max_settle_attempts: None,
            log: None,
        }
    }

    pub fn with_time_source(mut self, time_source: TS) -> Self {
        self.time_source = Some(time_source);
        self
    }

    pub fn with_manager_id(mut self, manager_id: ManagerId) -> Self {
        self.manager_id = Some(manager_id);
        self
    }

    pub fn with_max_lease(mut self, max_lease: Duration) -> Self {
        self.max_lease = Some(max_lease);
        self
    }

    pub fn with_terminal_retention(mut self, terminal_retention: Duration) -> Self {
        self.terminal_retention = Some(terminal_retention);
        self
    }

    pub fn with_reaper_interval(mut self, reaper_interval: Duration) -> Self {
        self.reaper_interval = Some(reaper_interval);
        self
    }

    pub fn with_prepare_and_commit(mut self, prepare_and_commit: bool) -> Self {
        self.prepare_and_commit = Some(prepare_and_commit);
        self
    }

    pub fn with_max_settle_attempts(mut self, max_settle_attempts: u32) -> Self {
        self.max_settle_attempts = Some(max_settle_attempts);
        self
    }

    pub fn with_log(mut self, log: Box<dyn TransactionLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Replays the log and builds the manager.
    pub fn build(self) -> Result<TransactionManager<TS>, InvalidStateError> {
        let time_source = self
            .time_source
            .ok_or_else(|| InvalidStateError::with_message("missing time_source field".into()))?;

        let max_lease = self.max_lease.unwrap_or(DEFAULT_MAX_LEASE);
        if max_lease.is_zero() {
            return Err(InvalidStateError::with_message(
                "max_lease must be greater than zero".into(),
            ));
        }

        let reaper_interval = self.reaper_interval.unwrap_or(DEFAULT_REAPER_INTERVAL);
        if reaper_interval.is_zero() {
            return Err(InvalidStateError::with_message(
                "reaper_interval must be greater than zero".into(),
            ));
        }

        let manager_id = self.manager_id.unwrap_or_else(|| {
            ManagerId::new(format!(
                "accord-{}",
                MANAGER_COUNT.fetch_add(1, Ordering::Relaxed)
            ))
        });

        let log = self
            .log
            .unwrap_or_else(|| Box::new(InMemoryTransactionLog::new()));
        let recovery = recover(log.as_ref()).map_err(|err| {
            InvalidStateError::with_message(format!("unable to recover transaction log: {}", err))
        })?;

        let registry = TransactionRegistry::new(time_source, max_lease, log, recovery.next_id());

        let settings = CoordinatorSettings {
            manager_id,
            incarnation: recovery.incarnation(),
            prepare_and_commit: self.prepare_and_commit.unwrap_or(true),
            max_settle_attempts: self
                .max_settle_attempts
                .unwrap_or(DEFAULT_MAX_SETTLE_ATTEMPTS),
            terminal_retention: self
                .terminal_retention
                .unwrap_or(DEFAULT_TERMINAL_RETENTION),
        };

        debug!(
            "Built transaction manager {} at incarnation {}",
            settings.manager_id, settings.incarnation
        );

        Ok(TransactionManager {
            coordinator: Coordinator::new(Arc::new(registry), settings),
            recovery: Arc::new(recovery),
            reaper_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use crate::participant::testing::{Call, MockParticipant};
    use crate::participant::Vote;
    use crate::time::ManualTimeFactory;
    use crate::transaction_log::LogEntry;

    fn manager(time: &ManualTimeFactory) -> TransactionManager<ManualTimeFactory> {
        TransactionManagerBuilder::new()
            .with_time_source(time.clone())
            .with_manager_id(ManagerId::new("m1"))
            .build()
            .expect("unable to build manager")
    }

    #[test]
    fn test_build_requires_time_source() {
        assert!(TransactionManagerBuilder::<ManualTimeFactory>::new()
            .build()
            .is_err());
    }

    /// Test that managers built without an id get distinct ones.
    #[test]
    fn test_default_manager_ids_differ() -> Result<(), Box<dyn std::error::Error>> {
        let first = TransactionManagerBuilder::new()
            .with_time_source(ManualTimeFactory::default())
            .build()?;
        let second = TransactionManagerBuilder::new()
            .with_time_source(ManualTimeFactory::default())
            .build()?;

        assert_ne!(first.manager_id(), second.manager_id());

        Ok(())
    }

    /// Test that configured limits are applied and that counts track decisions.
    #[test]
    fn test_configured_limits() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = TransactionManagerBuilder::new()
            .with_time_source(time.clone())
            .with_max_lease(Duration::from_secs(10))
            .with_terminal_retention(Duration::from_secs(5))
            .with_max_settle_attempts(1)
            .with_prepare_and_commit(false)
            .build()?;

        let first = manager.create(None, Duration::from_secs(40))?;
        assert_eq!(
            first.lease.expiration(),
            time.now() + Duration::from_secs(10)
        );
        let second = manager.create(None, Duration::from_secs(5))?;
        assert_eq!(manager.active_count(), 2);

        let participant = MockParticipant::failing_commits("p1", Vote::Prepared, 3);
        manager.join(first.id, participant.clone(), 0)?;
        manager.commit(first.id)?;
        assert_eq!(manager.active_count(), 1);
        assert_eq!(manager.len(), 2);

        // The single allowed attempt was spent during the commit.
        time.advance(Duration::from_secs(6));
        let report = manager.sweep();
        assert_eq!(report.expired, 1);
        assert_eq!(participant.calls().len(), 2);
        assert_eq!(manager.get_state(second.id)?, TransactionState::Aborted);
        assert!(matches!(
            manager.get_state(first.id),
            Err(TransactionError::UnknownTransaction(_))
        ));

        assert!(TransactionManagerBuilder::new()
            .with_time_source(time)
            .with_max_lease(Duration::ZERO)
            .build()
            .is_err());

        Ok(())
    }

    /// Test that a commit attempted after the lease has run out fails and leaves the
    /// transaction aborted, with no participant told to commit.
    #[test]
    fn test_commit_after_lease_expired() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = manager(&time);
        let created = manager.create(None, Duration::from_secs(40))?;
        let participant = MockParticipant::voting("p1", Vote::Prepared);
        manager.join(created.id, participant.clone(), 0)?;

        time.advance(Duration::from_secs(42));

        assert!(matches!(
            manager.commit(created.id),
            Err(TransactionError::CannotCommit { .. })
        ));
        assert_eq!(manager.get_state(created.id)?, TransactionState::Aborted);
        assert_eq!(participant.calls(), vec![Call::Abort(created.id)]);

        Ok(())
    }

    /// Test that the reaper's sweep aborts an expired transaction before the client commits,
    /// after which the commit fails.
    #[test]
    fn test_sweep_then_commit_after_lease_expired() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = manager(&time);
        let created = manager.create(None, Duration::from_secs(40))?;

        time.advance(Duration::from_secs(42));
        assert_eq!(manager.sweep().expired, 1);

        assert!(matches!(
            manager.commit(created.id),
            Err(TransactionError::CannotCommit { .. })
        ));
        assert_eq!(manager.get_state(created.id)?, TransactionState::Aborted);

        Ok(())
    }

    /// Test that a commit with two prepared participants:
    /// 1. asks both to prepare
    /// 2. tells both to commit
    /// 3. leaves the transaction committed
    #[test]
    fn test_commit_prepared() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = TransactionManagerBuilder::new()
            .with_time_source(time.clone())
            .with_prepare_and_commit(false)
            .build()?;
        let created = manager.create(None, Duration::from_secs(40))?;
        let p1 = MockParticipant::voting("p1", Vote::Prepared);
        let p2 = MockParticipant::voting("p2", Vote::Prepared);
        manager.join(created.id, p1.clone(), 0)?;
        manager.join(created.id, p2.clone(), 0)?;

        manager.commit(created.id)?;

        assert_eq!(manager.get_state(created.id)?, TransactionState::Committed);
        for participant in [&p1, &p2] {
            assert_eq!(
                participant.calls(),
                vec![Call::Prepare(created.id), Call::Commit(created.id)]
            );
        }

        Ok(())
    }

    /// Test that a single abort vote aborts the transaction and that no participant is told to
    /// commit.
    #[test]
    fn test_commit_with_abort_vote() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = TransactionManagerBuilder::new()
            .with_time_source(time.clone())
            .with_prepare_and_commit(false)
            .build()?;
        let created = manager.create(None, Duration::from_secs(40))?;
        let prepared = MockParticipant::voting("prepared", Vote::Prepared);
        let refusing = MockParticipant::voting("refusing", Vote::Abort);
        manager.join(created.id, prepared.clone(), 0)?;
        manager.join(created.id, refusing.clone(), 0)?;

        assert!(matches!(
            manager.commit(created.id),
            Err(TransactionError::CannotCommit { .. })
        ));
        assert_eq!(manager.get_state(created.id)?, TransactionState::Aborted);
        assert!(!prepared.received(Call::Commit(created.id)));
        assert!(prepared.received(Call::Abort(created.id)));
        assert!(!refusing.received(Call::Commit(created.id)));

        Ok(())
    }

    /// Test that rejoining with the same crash count is accepted and a different crash count is
    /// rejected.
    #[test]
    fn test_rejoin_crash_count() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = manager(&time);
        let created = manager.create(None, Duration::from_secs(40))?;
        let participant = MockParticipant::voting("p1", Vote::Prepared);

        manager.join(created.id, participant.clone(), 1)?;
        manager.join(created.id, participant.clone(), 1)?;
        assert_eq!(
            manager.participants(created.id)?,
            vec![(ParticipantId::new("p1"), 1)]
        );

        match manager.join(created.id, participant, 2) {
            Err(TransactionError::CrashCount {
                recorded,
                presented,
                ..
            }) => {
                assert_eq!(recorded, 1);
                assert_eq!(presented, 2);
            }
            other => panic!("expected crash count error, got {:?}", other),
        }

        Ok(())
    }

    /// Test that once decided, a transaction can not be decided again.
    #[test]
    fn test_no_second_decision() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = manager(&time);

        let committed = manager.create(None, Duration::from_secs(40))?;
        manager.commit(committed.id)?;
        assert!(matches!(
            manager.commit(committed.id),
            Err(TransactionError::CannotCommit { .. })
        ));
        assert!(matches!(
            manager.abort(committed.id),
            Err(TransactionError::CannotAbort { .. })
        ));

        let aborted = manager.create(None, Duration::from_secs(40))?;
        manager.cancel_lease(aborted.id)?;
        assert!(matches!(
            manager.commit(aborted.id),
            Err(TransactionError::CannotCommit { .. })
        ));
        assert_eq!(manager.get_state(aborted.id)?, TransactionState::Aborted);

        assert!(matches!(
            manager.join(aborted.id, MockParticipant::voting("late", Vote::Prepared), 0),
            Err(TransactionError::CannotJoin { .. })
        ));

        Ok(())
    }

    #[test]
    fn test_unknown_transaction() {
        let time = ManualTimeFactory::default();
        let manager = manager(&time);
        let id = TransactionId::from(77);

        assert!(matches!(
            manager.get_state(id),
            Err(TransactionError::UnknownTransaction(_))
        ));
        assert!(matches!(
            manager.commit(id),
            Err(TransactionError::UnknownTransaction(_))
        ));
        assert!(matches!(
            manager.abort(id),
            Err(TransactionError::UnknownTransaction(_))
        ));
    }

    /// Test that a decided transaction stays queryable for the retention period and is then
    /// forgotten.
    #[test]
    fn test_terminal_retention() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = manager(&time);
        let created = manager.create(None, Duration::from_secs(40))?;
        manager.commit(created.id)?;

        time.advance(Duration::from_secs(30));
        manager.sweep();
        assert_eq!(manager.get_state(created.id)?, TransactionState::Committed);

        time.advance(Duration::from_secs(31));
        assert_eq!(manager.sweep().discarded, 1);
        assert!(matches!(
            manager.get_state(created.id),
            Err(TransactionError::UnknownTransaction(_))
        ));
        assert!(manager.is_empty());

        Ok(())
    }

    /// Test that a local child's participants reach the parent's participants with their crash
    /// counts, and are committed when the parent commits.
    #[test]
    fn test_nested_commit() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = manager(&time);
        let parent = manager.create(None, Duration::from_secs(40))?;
        let child = manager.create(Some(parent.id), Duration::from_secs(40))?;
        let participant = MockParticipant::voting("p1", Vote::Prepared);
        manager.join(child.id, participant.clone(), 5)?;

        assert!(manager.enclosed_by(child.id, parent.id)?);

        manager.commit(child.id)?;
        assert_eq!(manager.get_state(child.id)?, TransactionState::Committed);
        assert_eq!(
            manager.participants(parent.id)?,
            vec![(ParticipantId::new("p1"), 5)]
        );

        manager.commit(parent.id)?;
        assert_eq!(manager.get_state(parent.id)?, TransactionState::Committed);
        assert!(participant.received(Call::PrepareAndCommit(parent.id)));

        Ok(())
    }

    /// Test nesting across two managers:
    /// 1. the child's manager joins the parent with its incarnation
    /// 2. committing the only child promotes its participants and drops the manager
    /// 3. a child still open when the parent commits is aborted
    #[test]
    fn test_remote_nested() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let outer = manager(&time);
        let inner = TransactionManagerBuilder::new()
            .with_time_source(time.clone())
            .with_manager_id(ManagerId::new("m2"))
            .build()?;
        let enclosing: Arc<dyn EnclosingManager> = Arc::new(outer.clone());

        let parent = outer.create(None, Duration::from_secs(40))?;
        let child = inner.create_nested(enclosing.clone(), parent.id, Duration::from_secs(40))?;
        assert_eq!(
            outer.participants(parent.id)?,
            vec![(ParticipantId::new("m2"), inner.incarnation())]
        );

        let participant = MockParticipant::voting("p1", Vote::Prepared);
        inner.join(child.id, participant.clone(), 2)?;
        inner.commit(child.id)?;
        assert_eq!(
            outer.participants(parent.id)?,
            vec![(ParticipantId::new("p1"), 2)]
        );

        let second_parent = outer.create(None, Duration::from_secs(40))?;
        let open_child =
            inner.create_nested(enclosing, second_parent.id, Duration::from_secs(40))?;
        outer.commit(second_parent.id)?;
        assert_eq!(inner.get_state(open_child.id)?, TransactionState::Aborted);

        outer.commit(parent.id)?;
        assert!(participant.received(Call::PrepareAndCommit(parent.id)));

        Ok(())
    }

    /// A log which accepts a fixed number of entries and then refuses every append.
    struct RefusingLog {
        accepted: InMemoryTransactionLog,
        remaining: parking_lot::Mutex<usize>,
    }

    impl TransactionLog for RefusingLog {
        fn append(&self, entry: LogEntry) -> Result<(), InternalError> {
            let mut remaining = self.remaining.lock();
            if *remaining == 0 {
                return Err(InternalError::with_message("log is full"));
            }
            *remaining -= 1;
            self.accepted.append(entry)
        }

        fn entries(&self) -> Result<Vec<LogEntry>, InternalError> {
            self.accepted.entries()
        }
    }

    /// Test that a nested transaction which can not be created leaves the parent without this
    /// manager as a participant:
    /// 1. a denied lease is refused before the parent is joined
    /// 2. a failure after joining removes the manager from the parent again
    #[test]
    fn test_failed_remote_create_leaves_parent() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let outer = manager(&time);
        let enclosing: Arc<dyn EnclosingManager> = Arc::new(outer.clone());
        let parent = outer.create(None, Duration::from_secs(40))?;

        let inner = TransactionManagerBuilder::new()
            .with_time_source(time.clone())
            .with_manager_id(ManagerId::new("m2"))
            .build()?;
        assert!(matches!(
            inner.create_nested(enclosing.clone(), parent.id, Duration::ZERO),
            Err(TransactionError::LeaseDenied { .. })
        ));
        assert!(outer.participants(parent.id)?.is_empty());

        // Only the incarnation entry written while building is accepted.
        let refusing = TransactionManagerBuilder::new()
            .with_time_source(time.clone())
            .with_manager_id(ManagerId::new("m3"))
            .with_log(Box::new(RefusingLog {
                accepted: InMemoryTransactionLog::new(),
                remaining: parking_lot::Mutex::new(1),
            }))
            .build()?;
        assert!(matches!(
            refusing.create_nested(enclosing, parent.id, Duration::from_secs(40)),
            Err(TransactionError::Internal(_))
        ));
        assert!(outer.participants(parent.id)?.is_empty());
        assert_eq!(outer.get_state(parent.id)?, TransactionState::Active);

        Ok(())
    }

    /// Test that a bounded abort gives up while a commit holds the transaction, and that the
    /// commit then completes.
    #[test]
    fn test_abort_with_timeout_while_committing() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = manager(&time);
        let created = manager.create(None, Duration::from_secs(40))?;
        let (participant, entered, release) = MockParticipant::gated("p1", Vote::Prepared);
        manager.join(created.id, participant, 0)?;

        let committer = {
            let manager = manager.clone();
            let id = created.id;
            thread::spawn(move || manager.commit(id).is_ok())
        };
        entered.recv()?;

        assert_eq!(manager.get_state(created.id)?, TransactionState::Voting);
        assert!(matches!(
            manager.abort_with_timeout(created.id, Duration::from_millis(50)),
            Err(TransactionError::TimeoutExpired { .. })
        ));
        assert!(matches!(
            manager.join(created.id, MockParticipant::voting("late", Vote::Prepared), 0),
            Err(TransactionError::CannotJoin { .. })
        ));
        assert_eq!(manager.sweep().busy, 1);

        release.send(())?;
        assert!(committer.join().expect("committer panicked"));
        assert_eq!(manager.get_state(created.id)?, TransactionState::Committed);

        Ok(())
    }

    #[test]
    fn test_commit_with_timeout() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = manager(&time);
        let created = manager.create(None, Duration::from_secs(40))?;
        let participant = MockParticipant::voting("p1", Vote::Prepared);
        manager.join(created.id, participant.clone(), 0)?;

        manager.commit_with_timeout(created.id, Duration::from_secs(5))?;

        assert_eq!(manager.get_state(created.id)?, TransactionState::Committed);
        assert!(participant.received(Call::PrepareAndCommit(created.id)));

        Ok(())
    }

    /// Test that waits too long to represent behave as unbounded waits.
    #[test]
    fn test_unbounded_waits() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = manager(&time);
        let participant = MockParticipant::voting("p1", Vote::Prepared);

        let committed = manager.create(None, Duration::from_secs(40))?;
        manager.join(committed.id, participant.clone(), 0)?;
        manager.commit_with_timeout(committed.id, Duration::MAX)?;
        assert_eq!(manager.get_state(committed.id)?, TransactionState::Committed);

        let aborted = manager.create(None, Duration::from_secs(40))?;
        manager.join(aborted.id, participant.clone(), 0)?;
        manager.abort_with_timeout(aborted.id, Duration::MAX)?;
        assert_eq!(manager.get_state(aborted.id)?, TransactionState::Aborted);
        assert!(participant.received(Call::Abort(aborted.id)));

        Ok(())
    }

    /// Test that a retention too long to represent keeps decided transactions queryable.
    #[test]
    fn test_unbounded_retention() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = TransactionManagerBuilder::new()
            .with_time_source(time.clone())
            .with_terminal_retention(Duration::MAX)
            .build()?;
        let created = manager.create(None, Duration::from_secs(40))?;
        manager.commit(created.id)?;

        time.advance(Duration::from_secs(10 * 365 * 24 * 60 * 60));
        assert_eq!(manager.sweep().discarded, 0);
        assert_eq!(manager.get_state(created.id)?, TransactionState::Committed);

        Ok(())
    }

    /// Test that when a commit and an abort race, the commit which took the transaction first
    /// decides it and the abort fails.
    #[test]
    fn test_commit_and_abort_race() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = manager(&time);
        let created = manager.create(None, Duration::from_secs(40))?;
        let (participant, entered, release) = MockParticipant::gated("p1", Vote::Prepared);
        manager.join(created.id, participant.clone(), 0)?;

        let committer = {
            let manager = manager.clone();
            let id = created.id;
            thread::spawn(move || manager.commit(id).is_ok())
        };
        entered.recv()?;

        let aborter = {
            let manager = manager.clone();
            let id = created.id;
            thread::spawn(move || {
                matches!(
                    manager.abort(id),
                    Err(TransactionError::CannotAbort { .. })
                )
            })
        };
        release.send(())?;

        assert!(committer.join().expect("committer panicked"));
        assert!(aborter.join().expect("aborter panicked"));
        assert_eq!(manager.get_state(created.id)?, TransactionState::Committed);
        assert!(!participant.received(Call::Abort(created.id)));

        Ok(())
    }

    /// Test that a bounded commit which runs out while the decision is being delivered reports
    /// the timeout, and that the decision stands.
    #[test]
    fn test_commit_with_timeout_during_delivery() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let manager = TransactionManagerBuilder::new()
            .with_time_source(time.clone())
            .with_prepare_and_commit(false)
            .build()?;
        let created = manager.create(None, Duration::from_secs(40))?;
        let (participant, entered, release) = MockParticipant::gated_commits("p1");
        manager.join(created.id, participant.clone(), 0)?;

        assert!(matches!(
            manager.commit_with_timeout(created.id, Duration::from_millis(100)),
            Err(TransactionError::TimeoutExpired { .. })
        ));
        assert_eq!(manager.get_state(created.id)?, TransactionState::Committed);

        entered.recv()?;
        release.send(())?;

        // The abort waits for delivery to finish, then finds the transaction decided.
        assert!(matches!(
            manager.abort(created.id),
            Err(TransactionError::CannotAbort { .. })
        ));
        assert_eq!(
            participant.calls(),
            vec![Call::Prepare(created.id), Call::Commit(created.id)]
        );

        Ok(())
    }

    /// Test that a manager rebuilt over the same log:
    /// 1. does not reuse ids
    /// 2. starts a new incarnation
    /// 3. records transactions left undecided as aborted
    #[test]
    fn test_recovery() -> Result<(), Box<dyn std::error::Error>> {
        let log = InMemoryTransactionLog::new();
        let time = ManualTimeFactory::default();

        let first = TransactionManagerBuilder::new()
            .with_time_source(time.clone())
            .with_log(Box::new(log.clone()))
            .build()?;
        let committed = first.create(None, Duration::from_secs(40))?;
        first.commit(committed.id)?;
        let in_flight = first.create(None, Duration::from_secs(40))?;
        drop(first);

        let second = TransactionManagerBuilder::new()
            .with_time_source(time)
            .with_log(Box::new(log.clone()))
            .build()?;

        let report = second.recovery_report();
        assert_eq!(report.incarnation(), 2);
        assert_eq!(report.presumed_aborted(), &[in_flight.id]);
        assert_eq!(report.committed(), 1);
        assert_eq!(second.incarnation(), 2);

        let created = second.create(None, Duration::from_secs(40))?;
        assert!(created.id.value() > in_flight.id.value());

        assert!(log.entries()?.contains(&LogEntry::StateChanged {
            id: in_flight.id,
            state: TransactionState::Aborted,
        }));

        Ok(())
    }
}
