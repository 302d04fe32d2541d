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

//! The `config` key/value file at the root of a repository.

use std::path::Path;
use std::path::PathBuf;

use tini::Ini;

use crate::error::RepoError;
use crate::error::RepoResult;

pub const SUPPORTED_REPO_VERSION: u32 = 1;
const CONFIG_SECTION: &str = "core";

/// The on-disk object layout, fixed for the lifetime of a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoMode {
    /// File objects are stored as plain filesystem files.
    Bare,
    /// File objects are split into a header file and a raw content file.
    Archive,
    /// File objects are a single zlib-compressed header+content blob.
    ArchiveZ2,
}

impl RepoMode {
    fn as_str(self) -> &'static str {
        match self {
            RepoMode::Bare => "bare",
            RepoMode::Archive => "archive",
            RepoMode::ArchiveZ2 => "archive-z2",
        }
    }

    fn parse(s: &str) -> RepoResult<Self> {
        match s {
            "bare" => Ok(RepoMode::Bare),
            "archive" => Ok(RepoMode::Archive),
            "archive-z2" => Ok(RepoMode::ArchiveZ2),
            // Legacy spelling carried over from the format this repository
            // layout descends from.
            "true" => Ok(RepoMode::Archive),
            other => Err(RepoError::InvalidArgument(format!(
                "unknown repository mode {other:?}"
            ))),
        }
    }

    pub fn is_archive_like(self) -> bool {
        matches!(self, RepoMode::Archive | RepoMode::ArchiveZ2)
    }
}

#[derive(Debug, Clone)]
pub struct RepoConfig {
    pub repo_version: u32,
    pub mode: RepoMode,
    pub parent_path: Option<PathBuf>,
    pub enable_uncompressed_cache: bool,
}

impl Default for RepoConfig {
    fn default() -> Self {
        RepoConfig {
            repo_version: SUPPORTED_REPO_VERSION,
            mode: RepoMode::Bare,
            parent_path: None,
            enable_uncompressed_cache: true,
        }
    }
}

impl RepoConfig {
    pub fn load(path: &Path) -> RepoResult<Self> {
        let ini = Ini::from_file(path)
            .map_err(|e| RepoError::CorruptState(format!("cannot read config {path:?}: {e}")))?;

        let repo_version: u32 = ini
            .get(CONFIG_SECTION, "repo_version")
            .ok_or_else(|| RepoError::CorruptState("config missing repo_version".to_string()))?;
        if repo_version != SUPPORTED_REPO_VERSION {
            return Err(RepoError::CorruptState(format!(
                "unsupported repo_version {repo_version}, expected {SUPPORTED_REPO_VERSION}"
            )));
        }

        let mode_str: String = ini
            .get(CONFIG_SECTION, "mode")
            .unwrap_or_else(|| "bare".to_string());
        let mode = RepoMode::parse(&mode_str)?;

        let parent_path: Option<String> = ini.get(CONFIG_SECTION, "parent");
        let parent_path = parent_path.map(PathBuf::from);

        let enable_uncompressed_cache: bool = ini
            .get(CONFIG_SECTION, "enable-uncompressed-cache")
            .unwrap_or(true);

        Ok(RepoConfig {
            repo_version,
            mode,
            parent_path,
            enable_uncompressed_cache,
        })
    }

    pub fn save(&self, path: &Path) -> RepoResult<()> {
        let mut ini = Ini::new()
            .section(CONFIG_SECTION)
            .item("repo_version", self.repo_version.to_string())
            .item("mode", self.mode.as_str());
        if let Some(parent) = &self.parent_path {
            ini = ini.item("parent", parent.display().to_string());
        }
        ini = ini.item(
            "enable-uncompressed-cache",
            self.enable_uncompressed_cache.to_string(),
        );
        ini.to_file(path)
            .map_err(|e| RepoError::io(path, std::io::Error::other(e.to_string())))
    }
}
