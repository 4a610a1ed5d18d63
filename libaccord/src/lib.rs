// Copyright 2021 Cargill Incorporated
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

//! A leased, nestable two-phase commit transaction manager.
//!
//! Participants [`join`](TransactionManager::join) a transaction created by a
//! [`TransactionManager`]; when the client asks for a commit, the manager runs the two-phase
//! commit protocol against every joined [`Participant`] and records the outcome. Transactions
//! may be nested, in which case committing the child promotes its participants into the parent.
//! Every transaction is leased; a transaction whose lease runs out before a decision is reached
//! is aborted by the lease reaper.

#[macro_use]
extern crate log;

mod coordinator;
pub mod error;
mod manager;
mod nesting;
mod participant;
#[cfg(feature = "lease-reaper")]
mod reaper;
mod registry;
mod time;
mod transaction;
mod transaction_log;

pub use coordinator::SweepReport;
pub use manager::{TransactionManager, TransactionManagerBuilder};
pub use nesting::{EnclosingManager, ManagerId};
pub use participant::{CrashCount, Participant, ParticipantId, PrepareAndCommitOutcome, Vote};
#[cfg(feature = "lease-reaper")]
pub use reaper::LeaseReaper;
pub use time::{ManualTimeFactory, SystemTimeFactory, Time, TimeSource};
pub use transaction::{Created, Lease, TransactionId, TransactionState};
pub use transaction_log::{InMemoryTransactionLog, LogEntry, RecoveryReport, TransactionLog};
