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

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::time::Time;

use super::{TransactionId, TransactionRecord, TransactionState};

/// A live transaction as held by the registry.
///
/// Two locks guard a handle. The round lock is held for the whole of a protocol run (commit,
/// abort, lease expiry) so at most one run decides the outcome. The record lock guards the
/// record's data and is only held for short critical sections; it is never held while calling a
/// participant or while acquiring another lock. The current state is also published to an atomic
/// so reads never wait on either lock.
pub(crate) struct TransactionHandle<T>
where
    T: Time,
{
    id: TransactionId,
    state: AtomicU8,
    round: Mutex<()>,
    record: Mutex<TransactionRecord<T>>,
}

impl<T> TransactionHandle<T>
where
    T: Time,
{
    pub fn new(record: TransactionRecord<T>) -> Self {
        TransactionHandle {
            id: record.id(),
            state: AtomicU8::new(record.state() as u8),
            round: Mutex::new(()),
            record: Mutex::new(record),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        // Only valid discriminants are ever stored.
        TransactionState::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(TransactionState::Aborted)
    }

    /// Moves the record to `state` and publishes it.
    pub fn transition(&self, record: &mut TransactionRecord<T>, state: TransactionState) {
        record.set_state(state);
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn record(&self) -> MutexGuard<'_, TransactionRecord<T>> {
        self.record.lock()
    }

    pub fn round(&self) -> MutexGuard<'_, ()> {
        self.round.lock()
    }

    pub fn try_round(&self) -> Option<MutexGuard<'_, ()>> {
        self.round.try_lock()
    }

    pub fn try_round_for(&self, timeout: Duration) -> Option<MutexGuard<'_, ()>> {
        self.round.try_lock_for(timeout)
    }
}
