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

//! A background thread which sweeps a manager on a fixed interval.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::error::InternalError;
use crate::manager::TransactionManager;
use crate::time::TimeSource;

/// Aborts transactions whose leases have expired, retries outstanding notifications and
/// discards old decided transactions.
///
/// The thread stops when the reaper is shut down or dropped.
pub struct LeaseReaper {
    shutdown: Option<Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl LeaseReaper {
    pub fn start<TS>(
        manager: TransactionManager<TS>,
        interval: Duration,
    ) -> Result<Self, InternalError>
    where
        TS: TimeSource,
    {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);

        let join_handle = thread::Builder::new()
            .name(format!("lease-reaper-{}", manager.manager_id()))
            .spawn(move || {
                debug!("Lease reaper for {} started", manager.manager_id());
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            manager.sweep();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Lease reaper for {} stopped", manager.manager_id());
            })
            .map_err(|err| InternalError::from_source(Box::new(err)))?;

        Ok(LeaseReaper {
            shutdown: Some(shutdown_tx),
            join_handle: Some(join_handle),
        })
    }

    /// Stops the thread and waits for it to exit.
    pub fn shutdown(mut self) -> Result<(), InternalError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), InternalError> {
        if let Some(shutdown) = self.shutdown.take() {
            // The thread may already have exited.
            let _ = shutdown.send(());
        }
        match self.join_handle.take() {
            Some(join_handle) => join_handle
                .join()
                .map_err(|_| InternalError::with_message("lease reaper thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for LeaseReaper {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!("Unable to stop lease reaper: {}", err);
        }
    }
}
