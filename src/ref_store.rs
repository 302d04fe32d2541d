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

//! Named mutable pointers into the immutable object DAG.
//!
//! A ref is a small text file under `refs/heads/<name>` or
//! `refs/remotes/<remote>/<name>` holding a single checksum followed by a
//! newline. `refs/summary` is a best-effort derived index regenerated after
//! every write or removal in archive-like modes.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use tracing::trace;
use tracing::warn;

use crate::checksum::Checksum;
use crate::checksum::looks_like_checksum;
use crate::config::RepoMode;
use crate::error::RepoError;
use crate::error::RepoResult;
use crate::file_util;

pub struct RefStore {
    root: PathBuf,
    mode: RepoMode,
}

/// A resolved reference: where it lives (a local branch or a remote
/// tracking ref) and the name used to look it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefLocation {
    Head,
    Remote(String),
}

impl RefStore {
    pub fn new(root: PathBuf, mode: RepoMode) -> Self {
        RefStore { root, mode }
    }

    fn heads_dir(&self) -> PathBuf {
        self.root.join("refs").join("heads")
    }

    fn remotes_dir(&self) -> PathBuf {
        self.root.join("refs").join("remotes")
    }

    fn summary_path(&self) -> PathBuf {
        self.root.join("refs").join("summary")
    }

    fn ref_path(&self, location: &RefLocation, name: &str) -> RepoResult<PathBuf> {
        validate_ref_name(name)?;
        let base = match location {
            RefLocation::Head => self.heads_dir(),
            RefLocation::Remote(remote) => {
                validate_ref_name(remote)?;
                self.remotes_dir().join(remote)
            }
        };
        let mut path = base;
        for component in name.split('/') {
            path.push(component);
        }
        Ok(path)
    }

    /// Reads the checksum stored at `refs/heads/<name>` (or
    /// `refs/remotes/<remote>/<name>` if `location` is a remote).
    pub fn read(&self, location: &RefLocation, name: &str) -> RepoResult<Option<Checksum>> {
        let path = self.ref_path(location, name)?;
        read_ref_file(&path)
    }

    /// Scans every configured remote for a ref named `name`, returning the
    /// first match. Used by `resolve` for the bare `refs/remotes/<rev>`
    /// fallback, where `rev` may itself embed a remote name
    /// (`origin/main`) or be a bare branch name searched across remotes.
    pub fn find_in_any_remote(&self, name: &str) -> RepoResult<Option<Checksum>> {
        let remotes_dir = self.remotes_dir();
        let entries = match fs::read_dir(&remotes_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RepoError::io(remotes_dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| RepoError::io(&remotes_dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(remote) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(checksum) = self.read(&RefLocation::Remote(remote), name)? {
                return Ok(Some(checksum));
            }
        }
        Ok(None)
    }

    /// Writes `<checksum>\n` atomically to the ref at `name`, creating
    /// intermediate directories for any `/` in the name. Regenerates
    /// `refs/summary` afterwards in archive-like modes (best-effort).
    pub fn write(&self, location: &RefLocation, name: &str, checksum: Checksum) -> RepoResult<()> {
        if looks_like_checksum(name) {
            return Err(RepoError::InvalidArgument(format!(
                "ref name {name:?} looks like a checksum"
            )));
        }
        let path = self.ref_path(location, name)?;
        if let Some(parent) = path.parent() {
            file_util::create_or_reuse_dir_all(parent).map_err(|e| RepoError::io(parent, e))?;
        }
        let tmp_dir = self.root.join("tmp");
        file_util::create_or_reuse_dir_all(&tmp_dir).map_err(|e| RepoError::io(&tmp_dir, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&tmp_dir).map_err(|e| RepoError::io(&tmp_dir, e))?;
        use std::io::Write as _;
        writeln!(tmp, "{checksum}").map_err(|e| RepoError::io(&path, e))?;
        file_util::persist_content_addressed_temp_file(tmp, &path).map_err(|e| RepoError::io(&path, e))?;
        trace!(ref_name = name, %checksum, "wrote ref");
        self.try_regenerate_summary();
        Ok(())
    }

    /// Removes a ref. Regenerates `refs/summary` afterwards, for symmetry
    /// with `write`, so a stale summary never outlives the branch it
    /// described.
    pub fn remove(&self, location: &RefLocation, name: &str) -> RepoResult<()> {
        let path = self.ref_path(location, name)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RepoError::RefNotFound(name.to_string()));
            }
            Err(e) => return Err(RepoError::io(path, e)),
        }
        self.try_regenerate_summary();
        Ok(())
    }

    /// Lists refs whose name starts with `prefix` (pass `""` for all),
    /// under both `refs/heads` and `refs/remotes/<remote>`, as
    /// `(display_name, checksum)` pairs. `display_name` is `<name>` for
    /// heads and `<remote>/<name>` for remote-tracking refs.
    pub fn list_refs(&self, prefix: &str) -> RepoResult<Vec<(String, Checksum)>> {
        let mut out = Vec::new();
        collect_refs(&self.heads_dir(), "", &mut out)?;
        let remotes_dir = self.remotes_dir();
        if let Ok(entries) = fs::read_dir(&remotes_dir) {
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let Some(remote) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                collect_refs(&entry.path(), &format!("{remote}/"), &mut out)?;
            }
        }
        out.retain(|(name, _)| name.starts_with(prefix));
        out.sort();
        Ok(out)
    }

    fn try_regenerate_summary(&self) {
        if !self.mode.is_archive_like() {
            return;
        }
        if let Err(e) = self.regenerate_summary() {
            warn!(error = %e, "failed to regenerate refs/summary");
        }
    }

    fn regenerate_summary(&self) -> RepoResult<()> {
        let refs = self.list_refs("")?;
        let mut body = String::new();
        for (name, checksum) in refs {
            body.push_str(&format!("{checksum} {name}\n"));
        }
        let path = self.summary_path();
        let tmp_dir = self.root.join("tmp");
        let mut tmp = tempfile::NamedTempFile::new_in(&tmp_dir).map_err(|e| RepoError::io(&tmp_dir, e))?;
        use std::io::Write as _;
        tmp.write_all(body.as_bytes()).map_err(|e| RepoError::io(&path, e))?;
        file_util::persist_content_addressed_temp_file(tmp, &path).map_err(|e| RepoError::io(&path, e))?;
        Ok(())
    }
}

fn collect_refs(dir: &Path, display_prefix: &str, out: &mut Vec<(String, Checksum)>) -> RepoResult<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    walk_refs(dir, dir, display_prefix, out)
}

fn walk_refs(root: &Path, dir: &Path, display_prefix: &str, out: &mut Vec<(String, Checksum)>) -> RepoResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(RepoError::io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| RepoError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            walk_refs(root, &path, display_prefix, out)?;
        } else if let Some(checksum) = read_ref_file(&path)? {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");
            out.push((format!("{display_prefix}{relative}"), checksum));
        }
    }
    Ok(())
}

fn read_ref_file(path: &Path) -> RepoResult<Option<Checksum>> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let trimmed = contents.trim_end_matches('\n');
            Checksum::parse(trimmed)
                .map(Some)
                .ok_or_else(|| RepoError::CorruptState(format!("ref {path:?} does not contain a checksum")))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RepoError::io(path, e)),
    }
}

fn validate_ref_name(name: &str) -> RepoResult<()> {
    if name.is_empty() {
        return Err(RepoError::InvalidArgument("ref name must not be empty".to_string()));
    }
    if looks_like_checksum(name) {
        return Err(RepoError::InvalidArgument(format!(
            "ref name {name:?} looks like a checksum"
        )));
    }
    for component in name.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(RepoError::InvalidArgument(format!(
                "invalid ref name component {component:?} in {name:?}"
            )));
        }
    }
    Ok(())
}
