// Copyright 2023 the fsrepo contributors
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

//! The error type returned by every fallible operation in this crate.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::checksum::Checksum;

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("object not found: {0}")]
    NotFound(Checksum),

    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("corrupt object {checksum}: {message}")]
    Corrupt { checksum: Checksum, message: String },

    #[error("corrupt repository state: {0}")]
    CorruptState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid repository state: {0}")]
    State(String),
}

impl RepoError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RepoError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(checksum: Checksum, message: impl fmt::Display) -> Self {
        RepoError::Corrupt {
            checksum,
            message: message.to_string(),
        }
    }
}

pub(crate) trait IoResultExt<T> {
    fn io_context(self, path: impl Into<PathBuf>) -> RepoResult<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn io_context(self, path: impl Into<PathBuf>) -> RepoResult<T> {
        self.map_err(|source| RepoError::io(path, source))
    }
}
