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

//! The registry of live transactions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::error::{InternalError, TransactionError};
use crate::nesting::ParentLink;
use crate::time::{Time, TimeSource};
use crate::transaction::{
    Lease, TransactionHandle, TransactionId, TransactionRecord, TransactionState,
};
use crate::transaction_log::{LogEntry, TransactionLog};

pub(crate) type Handle<TS> = Arc<TransactionHandle<<TS as TimeSource>::Time>>;

/// Owns every live transaction, keyed by id.
///
/// The map is the only structure shared by all transactions. Lookups clone the handle out of
/// the map so no map lock is held while a transaction's own locks are taken.
pub(crate) struct TransactionRegistry<TS>
where
    TS: TimeSource,
{
    transactions: DashMap<TransactionId, Handle<TS>>,
    next_id: AtomicU64,
    time_source: TS,
    max_lease: Duration,
    log: Box<dyn TransactionLog>,
}

impl<TS> TransactionRegistry<TS>
where
    TS: TimeSource,
{
    pub fn new(
        time_source: TS,
        max_lease: Duration,
        log: Box<dyn TransactionLog>,
        first_id: TransactionId,
    ) -> Self {
        TransactionRegistry {
            transactions: DashMap::new(),
            next_id: AtomicU64::new(first_id.value()),
            time_source,
            max_lease,
            log,
        }
    }

    pub fn now(&self) -> TS::Time {
        self.time_source.now()
    }

    pub fn is_expired(&self, expiration: TS::Time) -> bool {
        self.time_source.is_expired(expiration)
    }

    /// Returns the expiration a lease of `requested` would be granted, or why it is denied.
    pub fn grant(
        &self,
        id: Option<TransactionId>,
        requested: Duration,
    ) -> Result<TS::Time, TransactionError> {
        if requested.is_zero() {
            return Err(TransactionError::LeaseDenied {
                id,
                reason: "requested lease duration is zero".into(),
            });
        }
        self.now()
            .checked_add(requested.min(self.max_lease))
            .ok_or_else(|| TransactionError::LeaseDenied {
                id,
                reason: "requested lease ends beyond the range of the clock".into(),
            })
    }

    /// Allocates a new active transaction with a fresh lease.
    pub fn create(
        &self,
        parent: Option<ParentLink>,
        requested: Duration,
    ) -> Result<(Handle<TS>, Lease<TS::Time>), TransactionError> {
        let expiration = self.grant(None, requested)?;
        let id = TransactionId::from(self.next_id.fetch_add(1, Ordering::SeqCst));

        self.log.append(LogEntry::Created {
            id,
            parent: parent.as_ref().and_then(ParentLink::local_id),
        })?;

        let handle = Arc::new(TransactionHandle::new(TransactionRecord::new(
            id, parent, expiration,
        )));
        self.transactions.insert(id, handle.clone());

        debug!("Created transaction {} expiring at {:?}", id, expiration);

        Ok((handle, Lease::new(id, expiration)))
    }

    pub fn lookup(&self, id: TransactionId) -> Result<Handle<TS>, TransactionError> {
        self.transactions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(TransactionError::UnknownTransaction(id))
    }

    /// Extends the lease of an active transaction.
    pub fn renew_lease(
        &self,
        id: TransactionId,
        requested: Duration,
    ) -> Result<Lease<TS::Time>, TransactionError> {
        let handle = self.lookup(id)?;
        let expiration = self.grant(Some(id), requested)?;

        let mut record = handle.record();
        if record.state() != TransactionState::Active {
            return Err(TransactionError::LeaseDenied {
                id: Some(id),
                reason: format!("transaction is {}", record.state()),
            });
        }
        if self.is_expired(record.expiration()) {
            return Err(TransactionError::LeaseDenied {
                id: Some(id),
                reason: "lease has already expired".into(),
            });
        }
        record.set_expiration(expiration);

        debug!("Renewed lease on transaction {} until {:?}", id, expiration);

        Ok(Lease::new(id, expiration))
    }

    /// Logs and applies a state transition. A terminal transition also stamps the record with
    /// the time it was decided.
    pub fn transition(
        &self,
        handle: &TransactionHandle<TS::Time>,
        record: &mut TransactionRecord<TS::Time>,
        state: TransactionState,
    ) -> Result<(), InternalError> {
        self.log.append(LogEntry::StateChanged {
            id: handle.id(),
            state,
        })?;
        self.publish(handle, record, state);
        Ok(())
    }

    /// Applies a state transition without logging it.
    pub fn publish(
        &self,
        handle: &TransactionHandle<TS::Time>,
        record: &mut TransactionRecord<TS::Time>,
        state: TransactionState,
    ) {
        handle.transition(record, state);
        if state.is_terminal() {
            record.set_terminated_at(self.now());
        }
    }

    /// Removes the transaction. Discarding an id which is not present does nothing.
    pub fn discard(&self, id: TransactionId) -> bool {
        let discarded = self.transactions.remove(&id).is_some();
        if discarded {
            debug!("Discarded transaction {}", id);
        }
        discarded
    }

    /// A snapshot of every live transaction.
    pub fn handles(&self) -> Vec<Handle<TS>> {
        self.transactions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::time::ManualTimeFactory;
    use crate::transaction_log::InMemoryTransactionLog;

    fn registry(time: &ManualTimeFactory) -> TransactionRegistry<ManualTimeFactory> {
        TransactionRegistry::new(
            time.clone(),
            Duration::from_secs(300),
            Box::new(InMemoryTransactionLog::new()),
            TransactionId::from(1),
        )
    }

    /// Test that ids increase, leases are clamped to the maximum, and zero leases are denied.
    #[test]
    fn test_create() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let registry = registry(&time);

        let (first, lease) = registry.create(None, Duration::from_secs(40))?;
        assert_eq!(first.id(), TransactionId::from(1));
        assert_eq!(lease.expiration(), time.now() + Duration::from_secs(40));

        let (second, lease) = registry.create(None, Duration::from_secs(3600))?;
        assert_eq!(second.id(), TransactionId::from(2));
        assert_eq!(lease.expiration(), time.now() + Duration::from_secs(300));

        assert!(matches!(
            registry.create(None, Duration::ZERO),
            Err(TransactionError::LeaseDenied { id: None, .. })
        ));
        assert_eq!(registry.len(), 2);

        Ok(())
    }

    /// Test that a lease which would end beyond the range of the clock is denied, while an
    /// unbounded maximum still grants ordinary leases.
    #[test]
    fn test_create_with_unbounded_max_lease() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let registry = TransactionRegistry::new(
            time.clone(),
            Duration::MAX,
            Box::new(InMemoryTransactionLog::new()),
            TransactionId::from(1),
        );

        assert!(matches!(
            registry.create(None, Duration::MAX),
            Err(TransactionError::LeaseDenied { id: None, .. })
        ));

        let (handle, lease) = registry.create(None, Duration::from_secs(40))?;
        assert_eq!(lease.expiration(), time.now() + Duration::from_secs(40));
        assert!(matches!(
            registry.renew_lease(handle.id(), Duration::MAX),
            Err(TransactionError::LeaseDenied { id: Some(_), .. })
        ));

        Ok(())
    }

    #[test]
    fn test_lookup_and_discard() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let registry = registry(&time);
        let (handle, _) = registry.create(None, Duration::from_secs(40))?;

        assert_eq!(registry.lookup(handle.id())?.id(), handle.id());

        assert!(registry.discard(handle.id()));
        assert!(!registry.discard(handle.id()));
        assert!(matches!(
            registry.lookup(handle.id()),
            Err(TransactionError::UnknownTransaction(_))
        ));

        Ok(())
    }

    /// Test that renewal:
    /// 1. extends an active lease
    /// 2. is denied once the lease has passed
    /// 3. is denied once the transaction has left the active state
    #[test]
    fn test_renew_lease() -> Result<(), Box<dyn std::error::Error>> {
        let time = ManualTimeFactory::default();
        let registry = registry(&time);
        let (handle, _) = registry.create(None, Duration::from_secs(40))?;

        time.advance(Duration::from_secs(30));
        let lease = registry.renew_lease(handle.id(), Duration::from_secs(40))?;
        assert_eq!(lease.expiration(), time.now() + Duration::from_secs(40));

        time.advance(Duration::from_secs(41));
        assert!(matches!(
            registry.renew_lease(handle.id(), Duration::from_secs(40)),
            Err(TransactionError::LeaseDenied { .. })
        ));

        let (other, _) = registry.create(None, Duration::from_secs(40))?;
        {
            let mut record = other.record();
            registry.transition(&other, &mut record, TransactionState::Aborted)?;
        }
        assert!(matches!(
            registry.renew_lease(other.id(), Duration::from_secs(40)),
            Err(TransactionError::LeaseDenied { .. })
        ));

        Ok(())
    }
}
