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

//! Contains CommunicationError

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FormatResult};

/// An error which occurs while carrying a call between the manager and a participant.
///
/// A `CommunicationError` says nothing about the participant's view of the transaction; the
/// call may or may not have been delivered. During voting the manager treats it as an abort
/// vote from that participant.
#[derive(Debug)]
pub struct CommunicationError {
    message: Option<String>,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl CommunicationError {
    pub fn with_message(message: String) -> Self {
        CommunicationError {
            message: Some(message),
            source: None,
        }
    }

    pub fn from_source(source: Box<dyn Error + Send + Sync>) -> Self {
        CommunicationError {
            message: None,
            source: Some(source),
        }
    }

    pub fn from_source_with_message(source: Box<dyn Error + Send + Sync>, message: String) -> Self {
        CommunicationError {
            message: Some(message),
            source: Some(source),
        }
    }
}

impl Error for CommunicationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn Error + 'static))
    }
}

impl Display for CommunicationError {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        match (&self.message, &self.source) {
            (Some(message), Some(source)) => write!(f, "{}: {}", message, source),
            (Some(message), None) => write!(f, "{}", message),
            (None, Some(source)) => write!(f, "{}", source),
            (None, None) => f.write_str("communication with participant failed"),
        }
    }
}
