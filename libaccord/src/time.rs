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

//! The clock against which leases are granted and checked.

use std::cmp::PartialOrd;
use std::fmt::Debug;
use std::ops::Add;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use parking_lot::Mutex;

pub trait Time:
    Add<Duration, Output = Self> + PartialOrd + Copy + Debug + Send + Sync + 'static
{
    /// Returns `None` if the result can not be represented.
    fn checked_add(&self, duration: Duration) -> Option<Self>;
}

pub trait TimeSource: Send + Sync + 'static {
    type Time: Time;

    fn now(&self) -> Self::Time;

    /// Returns true if `expiration` is at or before the current time.
    fn is_expired(&self, expiration: Self::Time) -> bool {
        expiration <= self.now()
    }
}

impl Time for SystemTime {
    fn checked_add(&self, duration: Duration) -> Option<Self> {
        SystemTime::checked_add(self, duration)
    }
}

#[derive(Default, Clone)]
pub struct SystemTimeFactory {}

impl SystemTimeFactory {
    pub fn new() -> Self {
        SystemTimeFactory {}
    }
}

impl TimeSource for SystemTimeFactory {
    type Time = SystemTime;

    fn now(&self) -> Self::Time {
        SystemTime::now()
    }
}

/// A time source which only moves when told to.
///
/// Clones share the same clock, so a clone handed to a manager can be advanced from a test.
#[derive(Clone)]
pub struct ManualTimeFactory {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualTimeFactory {
    pub fn new(start: SystemTime) -> Self {
        ManualTimeFactory {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }
}

impl Default for ManualTimeFactory {
    fn default() -> Self {
        ManualTimeFactory::new(SystemTime::UNIX_EPOCH)
    }
}

impl TimeSource for ManualTimeFactory {
    type Time = SystemTime;

    fn now(&self) -> Self::Time {
        *self.now.lock()
    }
}
