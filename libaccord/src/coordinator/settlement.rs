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

//! Phase two: delivering the decision to the participants.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::error::{InternalError, TransactionError};
use crate::registry::Handle;
use crate::time::TimeSource;
use crate::transaction::{TransactionHandle, TransactionId, TransactionState};

use super::Coordinator;

impl<TS> Coordinator<TS>
where
    TS: TimeSource,
{
    /// Sends the decision to every participant still waiting for it. Returns true if none are
    /// left waiting. The caller must hold the round lock.
    ///
    /// A participant whose call fails stays queued for the next attempt until it has failed
    /// `max_settle_attempts` times.
    pub(crate) fn settle_locked(&self, handle: &TransactionHandle<TS::Time>) -> bool {
        let id = handle.id();
        let (state, pending) = {
            let mut record = handle.record();
            (record.state(), record.take_unsettled())
        };

        if pending.is_empty() {
            return true;
        }

        let mut unsettled = Vec::new();
        for mut notification in pending {
            let participant = notification.participant.clone();
            let result = match state {
                TransactionState::Committed => participant.commit(id),
                TransactionState::Aborted => participant.abort(id),
                TransactionState::Active | TransactionState::Voting => {
                    unsettled.push(notification);
                    continue;
                }
            };

            match result {
                Ok(()) => debug!("Participant {} told {} is {}", participant.id(), id, state),
                Err(err) => {
                    notification.attempts += 1;
                    if notification.attempts >= self.settings.max_settle_attempts {
                        error!(
                            "Giving up telling participant {} that {} is {} after {} attempts: {}",
                            participant.id(),
                            id,
                            state,
                            notification.attempts,
                            err
                        );
                    } else {
                        warn!(
                            "Unable to tell participant {} that {} is {}: {}",
                            participant.id(),
                            id,
                            state,
                            err
                        );
                        unsettled.push(notification);
                    }
                }
            }
        }

        let settled = unsettled.is_empty();
        handle.record().set_unsettled(unsettled);
        settled
    }

    /// Takes the round lock and settles.
    pub(crate) fn settle(&self, handle: &TransactionHandle<TS::Time>) -> bool {
        let _round = handle.round();
        self.settle_locked(handle)
    }

    /// Settles on a new thread. The returned receiver yields once the attempt has finished.
    pub(crate) fn spawn_settlement(
        &self,
        handle: Handle<TS>,
    ) -> Result<Receiver<()>, TransactionError> {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let coordinator = self.clone();

        thread::Builder::new()
            .name(format!("settle-{}", handle.id()))
            .spawn(move || {
                coordinator.settle(&handle);
                // The waiter may have given up already.
                let _ = done_tx.send(());
            })
            .map_err(|err| {
                TransactionError::Internal(InternalError::from_source(Box::new(err)))
            })?;

        Ok(done_rx)
    }
}

/// Waits for a settlement thread to finish. Without a deadline this waits as long as it takes.
pub(super) fn wait_until_settled(
    id: TransactionId,
    settled: Receiver<()>,
    deadline: Option<Instant>,
    wait_for: Duration,
) -> Result<(), TransactionError> {
    let result = match deadline {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            settled.recv_timeout(remaining)
        }
        None => settled.recv().map_err(|_| RecvTimeoutError::Disconnected),
    };

    match result {
        Ok(()) => Ok(()),
        Err(RecvTimeoutError::Timeout) => Err(TransactionError::TimeoutExpired { id, wait_for }),
        Err(RecvTimeoutError::Disconnected) => Err(TransactionError::Internal(
            InternalError::with_message(format!(
                "settlement of transaction {} stopped without finishing",
                id
            )),
        )),
    }
}
