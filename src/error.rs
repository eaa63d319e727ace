// Copyright (c) 2023 The TQUIC Authors.
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

//! Error type for bandwidth estimation setup.

use strum::IntoEnumIterator;
use strum_macros::EnumIter;

/// Bandwidth estimation error.
///
/// Estimation itself never fails: insufficient or malformed feedback degrades
/// to "no change". Errors only surface while building or parsing
/// configuration.
#[derive(Clone, Debug, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// The configuration is invalid. The payload lists every rejected field.
    InvalidConfig(String),

    /// A textual data rate or data size could not be parsed.
    InvalidUnit(String),
}

impl Error {
    /// Return the detail message carried by the error.
    pub fn reason(&self) -> &str {
        match self {
            Error::InvalidConfig(r) => r,
            Error::InvalidUnit(r) => r,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl std::convert::From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidConfig(format!("{}", err))
    }
}
