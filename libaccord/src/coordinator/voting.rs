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

//! Phase one: collecting votes and reaching a decision.

use std::thread;

use crate::participant::{PrepareAndCommitOutcome, Vote};
use crate::transaction::{ParticipantEntry, TransactionId, TransactionState};

/// What a single participant answered during phase one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Response {
    Voted(Vote),
    /// The participant was asked to prepare and commit in one call, and committed.
    Committed,
    /// The call failed; counted as an abort vote.
    Unreachable,
}

impl Response {
    fn is_abort(&self) -> bool {
        matches!(self, Response::Voted(Vote::Abort) | Response::Unreachable)
    }

    fn is_not_changed(&self) -> bool {
        matches!(self, Response::Voted(Vote::NotChanged))
    }
}

/// The outcome of phase one.
pub(super) struct Ballot {
    pub responses: Vec<(ParticipantEntry, Response)>,
}

impl Ballot {
    /// Commit unless any participant voted to abort or could not be reached.
    pub fn decision(&self) -> TransactionState {
        if self.responses.iter().any(|(_, response)| response.is_abort()) {
            TransactionState::Aborted
        } else {
            TransactionState::Committed
        }
    }

    /// True if a participant committed through prepare-and-commit, which makes the commit
    /// decision irrevocable.
    pub fn has_committed(&self) -> bool {
        self.responses
            .iter()
            .any(|(_, response)| *response == Response::Committed)
    }

    /// The participants which must hear the decision in phase two.
    ///
    /// On commit, those which prepared. On abort, those which prepared and those whose state is
    /// unknown because they could not be reached. Participants which voted abort or not changed,
    /// and one which already committed through prepare-and-commit, need no further call.
    pub fn to_notify(&self, decision: TransactionState) -> Vec<ParticipantEntry> {
        self.responses
            .iter()
            .filter(|(_, response)| match (decision, response) {
                (_, Response::Voted(Vote::Prepared)) => true,
                (TransactionState::Aborted, Response::Unreachable) => true,
                _ => false,
            })
            .map(|(entry, _)| entry.clone())
            .collect()
    }
}

/// Asks every participant to vote.
///
/// Prepares are issued concurrently. When `prepare_and_commit` is set, the last participant is
/// held back; if every other participant answers not changed it is sent a single
/// prepare-and-commit instead of a prepare. The first answer other than not changed releases
/// the last participant's prepare at once, so it overlaps with the answers still outstanding.
pub(super) fn collect_votes(
    id: TransactionId,
    participants: Vec<ParticipantEntry>,
    prepare_and_commit: bool,
) -> Ballot {
    let mut participants = participants;
    let last = match participants.pop() {
        Some(last) => last,
        None => {
            return Ballot {
                responses: Vec::new(),
            }
        }
    };

    if !prepare_and_commit {
        participants.push(last);
        return Ballot {
            responses: prepare_all(id, participants),
        };
    }

    let (others, last_response) = prepare_holding_back(id, &participants, &last);

    let mut responses: Vec<(ParticipantEntry, Response)> =
        participants.into_iter().zip(others).collect();
    responses.push((last, last_response));

    Ballot { responses }
}

/// Prepares `participants` concurrently and decides how `last` is asked as the answers arrive.
fn prepare_holding_back(
    id: TransactionId,
    participants: &[ParticipantEntry],
    last: &ParticipantEntry,
) -> (Vec<Response>, Response) {
    thread::scope(|scope| {
        let (vote_tx, vote_rx) = crossbeam_channel::unbounded();
        let workers: Vec<_> = participants
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let vote_tx = vote_tx.clone();
                scope.spawn(move || {
                    let _ = vote_tx.send((index, prepare_one(id, entry)));
                })
            })
            .collect();
        drop(vote_tx);

        // A worker which panicked never answers; it stays unreachable.
        let mut responses = vec![Response::Unreachable; participants.len()];
        let mut answered = 0;
        let mut last_worker = None;
        for (index, response) in vote_rx.iter() {
            answered += 1;
            if last_worker.is_none() && !response.is_not_changed() {
                last_worker = Some(scope.spawn(move || prepare_one(id, last)));
            }
            responses[index] = response;
        }

        for worker in workers {
            let _ = worker.join();
        }

        let last_response = match last_worker {
            Some(worker) => worker.join().unwrap_or(Response::Unreachable),
            None if answered < participants.len() => prepare_one(id, last),
            None => prepare_and_commit_one(id, last),
        };

        (responses, last_response)
    })
}

fn prepare_all(
    id: TransactionId,
    participants: Vec<ParticipantEntry>,
) -> Vec<(ParticipantEntry, Response)> {
    if participants.len() <= 1 {
        return participants
            .into_iter()
            .map(|entry| {
                let response = prepare_one(id, &entry);
                (entry, response)
            })
            .collect();
    }

    let responses: Vec<Response> = thread::scope(|scope| {
        let workers: Vec<_> = participants
            .iter()
            .map(|entry| scope.spawn(move || prepare_one(id, entry)))
            .collect();

        workers
            .into_iter()
            .map(|worker| worker.join().unwrap_or(Response::Unreachable))
            .collect()
    });

    participants.into_iter().zip(responses).collect()
}

fn prepare_one(id: TransactionId, entry: &ParticipantEntry) -> Response {
    match entry.participant.prepare(id) {
        Ok(vote) => {
            debug!("Participant {} voted {:?} on {}", entry.id(), vote, id);
            Response::Voted(vote)
        }
        Err(err) => {
            warn!(
                "Participant {} could not be asked to prepare {}: {}",
                entry.id(),
                id,
                err
            );
            Response::Unreachable
        }
    }
}

fn prepare_and_commit_one(id: TransactionId, entry: &ParticipantEntry) -> Response {
    match entry.participant.prepare_and_commit(id) {
        Ok(PrepareAndCommitOutcome::Committed) => {
            debug!("Participant {} prepared and committed {}", entry.id(), id);
            Response::Committed
        }
        Ok(PrepareAndCommitOutcome::NotChanged) => Response::Voted(Vote::NotChanged),
        Ok(PrepareAndCommitOutcome::Abort) => Response::Voted(Vote::Abort),
        Err(err) => {
            warn!(
                "Participant {} could not be asked to prepare and commit {}: {}",
                entry.id(),
                id,
                err
            );
            Response::Unreachable
        }
    }
}
