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

//! A validated, slash-separated path relative to a tree root.
//!
//! Unlike a filesystem [`Path`](std::path::Path), a [`RepoPathBuf`] is
//! always relative, always uses `/` as the component separator regardless
//! of host platform, and can never contain a `.` or `..` component or an
//! empty component. This is the path type stored inside directory-tree
//! objects and passed to the staging and checkout engines.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use crate::error::RepoError;
use crate::error::RepoResult;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoPathBuf {
    value: String,
}

impl RepoPathBuf {
    pub fn root() -> Self {
        RepoPathBuf {
            value: String::new(),
        }
    }

    /// Parses a `/`-separated path, rejecting empty, `.`, and `..`
    /// components and any backslash (which would be ambiguous on Windows
    /// checkouts).
    pub fn parse(value: &str) -> RepoResult<Self> {
        if value.is_empty() {
            return Ok(RepoPathBuf::root());
        }
        for component in value.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(RepoError::InvalidArgument(format!(
                    "invalid path component {component:?} in {value:?}"
                )));
            }
            if component.contains('\\') {
                return Err(RepoError::InvalidArgument(format!(
                    "backslash not allowed in path {value:?}"
                )));
            }
        }
        Ok(RepoPathBuf {
            value: value.to_string(),
        })
    }

    pub fn join(&self, name: &RepoPathComponent) -> Self {
        if self.value.is_empty() {
            RepoPathBuf {
                value: name.as_str().to_string(),
            }
        } else {
            RepoPathBuf {
                value: format!("{}/{}", self.value, name.as_str()),
            }
        }
    }

    pub fn is_root(&self) -> bool {
        self.value.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.value.split('/').filter(|s| !s.is_empty())
    }

    /// The parent path and final component, or `None` if this is the root.
    pub fn split(&self) -> Option<(RepoPathBuf, RepoPathComponent)> {
        let (parent, name) = self.value.rsplit_once('/').unwrap_or(("", &self.value));
        if self.value.is_empty() {
            return None;
        }
        Some((
            RepoPathBuf {
                value: parent.to_string(),
            },
            RepoPathComponent {
                value: name.to_string(),
            },
        ))
    }

    pub fn to_fs_path(&self, base: &Path) -> PathBuf {
        if self.value.is_empty() {
            base.to_path_buf()
        } else {
            let mut path = base.to_path_buf();
            for component in self.value.split('/') {
                path.push(component);
            }
            path
        }
    }
}

impl fmt::Display for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl fmt::Debug for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoPathBuf({:?})", self.value)
    }
}

/// A single path component, i.e. a file or directory name within a single
/// directory listing. Never empty, never `.`/`..`, never contains `/`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RepoPathComponent {
    value: String,
}

impl RepoPathComponent {
    pub fn parse(value: &str) -> RepoResult<Self> {
        if value.is_empty() || value == "." || value == ".." || value.contains('/') {
            return Err(RepoError::InvalidArgument(format!(
                "invalid path component {value:?}"
            )));
        }
        Ok(RepoPathComponent {
            value: value.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for RepoPathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}
