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

//! Lease expiry and reclamation of decided transactions.

use crate::time::{Time, TimeSource};
use crate::transaction::TransactionState;

use super::Coordinator;

/// What one sweep did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub settled: usize,
    pub discarded: usize,
    /// Transactions skipped because a protocol run held them.
    pub busy: usize,
}

impl<TS> Coordinator<TS>
where
    TS: TimeSource,
{
    /// Aborts every undecided transaction whose lease has passed, retries outstanding
    /// notifications, and discards decided transactions once they have been retained long
    /// enough.
    ///
    /// A transaction whose round lock is held is skipped; it is looked at again on the next
    /// sweep. This keeps the sweep from deciding a transaction a client is already deciding.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for handle in self.registry.handles() {
            let round = match handle.try_round() {
                Some(round) => round,
                None => {
                    report.busy += 1;
                    continue;
                }
            };

            match handle.state() {
                TransactionState::Active | TransactionState::Voting => {
                    let expiration = handle.record().expiration();
                    if !self.registry.is_expired(expiration) {
                        continue;
                    }
                    warn!(
                        "Lease on transaction {} expired at {:?}, aborting",
                        handle.id(),
                        expiration
                    );
                    match self.abort_locked(&handle, "lease expired") {
                        Ok(()) => {
                            report.expired += 1;
                            self.settle_locked(&handle);
                        }
                        Err(err) => debug!("Unable to expire {}: {}", handle.id(), err),
                    }
                }
                TransactionState::Committed | TransactionState::Aborted => {
                    let (unsettled, terminated_at) = {
                        let record = handle.record();
                        (!record.unsettled().is_empty(), record.terminated_at())
                    };

                    if unsettled {
                        if self.settle_locked(&handle) {
                            report.settled += 1;
                        }
                        continue;
                    }

                    // A retention too long to represent keeps the record forever.
                    let retained = terminated_at.map_or(false, |at| {
                        at.checked_add(self.settings.terminal_retention)
                            .map_or(true, |until| !self.registry.is_expired(until))
                    });
                    if !retained {
                        drop(round);
                        if self.registry.discard(handle.id()) {
                            report.discarded += 1;
                        }
                    }
                }
            }
        }

        if report != SweepReport::default() {
            debug!("Lease sweep: {:?}", report);
        }

        report
    }
}
