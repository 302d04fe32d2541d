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

//! Materializes a commit's tree onto the filesystem.
//!
//! Whenever the repository mode and the requested [`PermissionMode`] make a
//! stored object byte-identical to the checkout target, the file is
//! hardlinked from the object store instead of copied. Falling that, the
//! content is streamed into a temp file next to the destination and
//! persisted into place.
//!
//! Concurrency follows the pattern this crate's teacher uses for its own
//! working-copy snapshotter: a `rayon::scope` per directory level, a
//! `OnceLock` latch recording the first error so sibling jobs already
//! queued can notice and stop doing useful work, and atomic counters for
//! the stats returned to the caller.

use std::fs;
use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt as _;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use rustix::io::Errno;
use tracing::debug;
use tracing::trace;

use crate::cancellation::CancellationToken;
use crate::checksum::Checksum;
use crate::config::RepoMode;
use crate::error::RepoError;
use crate::error::RepoResult;
use crate::file_util;
use crate::objects::DirMeta;
use crate::objects::DirTree;
use crate::objects::FileHeader;
use crate::objects::ObjectKind;
use crate::repo::Repo;
use crate::repo_path::RepoPathBuf;
use crate::repo_path::RepoPathComponent;

/// Whether the checkout engine is allowed to apply ownership and extended
/// attributes (requires running as the object's owner, typically root), or
/// must fall back to a mode-only, no-ownership rendition suitable for an
/// unprivileged user checking out shared content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    /// Apply uid/gid/xattrs from the stored metadata.
    None,
    /// Checkout as an unprivileged user: skip device nodes, skip
    /// ownership, and allow the uncompressed-cache hardlink path.
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteMode {
    /// An existing destination entry is an error.
    Fail,
    /// An existing destination entry is atomically replaced
    /// ("union-files": the final tree wins, entry by entry).
    UnionFiles,
}

pub struct CheckoutOptions<'a> {
    pub permission_mode: PermissionMode,
    pub overwrite_mode: OverwriteMode,
    pub progress: Option<Box<dyn Fn(&RepoPathBuf) + Send + Sync + 'a>>,
}

impl Default for CheckoutOptions<'_> {
    fn default() -> Self {
        CheckoutOptions {
            permission_mode: PermissionMode::None,
            overwrite_mode: OverwriteMode::Fail,
            progress: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CheckoutStats {
    pub files_written: u64,
    pub files_hardlinked: u64,
    pub bytes_written: u64,
}

/// Checks out `commit`'s root tree into `dest`, which must already exist as
/// an empty or (under [`OverwriteMode::UnionFiles`]) pre-populated
/// directory.
pub fn checkout(
    repo: &Repo,
    commit: Checksum,
    dest: &Path,
    options: CheckoutOptions<'_>,
    cancel: &CancellationToken,
) -> RepoResult<CheckoutStats> {
    let commit = repo.load_commit(commit)?;
    let engine = Checkout {
        repo,
        options,
        cancel,
        error: OnceLock::new(),
        files_written: AtomicU64::new(0),
        files_hardlinked: AtomicU64::new(0),
        bytes_written: AtomicU64::new(0),
    };
    rayon::scope(|scope| {
        engine.checkout_dir(scope, &RepoPathBuf::root(), dest, commit.root_content, commit.root_meta);
    });
    if let Some(error) = engine.error.into_inner() {
        return Err(error);
    }
    Ok(CheckoutStats {
        files_written: engine.files_written.load(Ordering::Relaxed),
        files_hardlinked: engine.files_hardlinked.load(Ordering::Relaxed),
        bytes_written: engine.bytes_written.load(Ordering::Relaxed),
    })
}

struct Checkout<'a, 'p> {
    repo: &'a Repo,
    options: CheckoutOptions<'p>,
    cancel: &'a CancellationToken,
    error: OnceLock<RepoError>,
    files_written: AtomicU64,
    files_hardlinked: AtomicU64,
    bytes_written: AtomicU64,
}

impl<'a, 'p> Checkout<'a, 'p> {
    fn spawn_ok<'scope>(
        &'scope self,
        scope: &rayon::Scope<'scope>,
        job: impl FnOnce(&rayon::Scope<'scope>) + Send + 'scope,
    ) {
        if self.error.get().is_some() {
            return;
        }
        scope.spawn(move |scope| job(scope));
    }

    fn fail(&self, error: RepoError) {
        let _ = self.error.set(error);
    }

    /// Checks out the directory at `path` (content/meta checksums already
    /// resolved) into `dest_dir`. All direct file children are checked out
    /// in a nested scope before any subdirectory recursion is spawned on
    /// the outer `scope`, so this call's own ordering requirement ("a
    /// directory's files exist before its children are visited") holds
    /// without forcing siblings to wait on each other.
    fn checkout_dir<'scope>(
        &'scope self,
        scope: &rayon::Scope<'scope>,
        path: &RepoPathBuf,
        dest_dir: &Path,
        content: Checksum,
        meta: Checksum,
    ) {
        if self.error.get().is_some() {
            return;
        }
        if let Err(e) = self.cancel.check() {
            self.fail(e);
            return;
        }
        let dir_meta = match self.load_dir_meta(meta) {
            Ok(m) => m,
            Err(e) => return self.fail(e),
        };
        if let Err(e) = self.prepare_dir(dest_dir, &dir_meta) {
            return self.fail(e);
        }
        let tree = match self.load_dir_tree(content) {
            Ok(t) => t,
            Err(e) => return self.fail(e),
        };

        rayon::scope(|file_scope| {
            for (name, file_checksum) in &tree.files {
                if self.error.get().is_some() {
                    break;
                }
                let Ok(component) = RepoPathComponent::parse(name) else {
                    self.fail(RepoError::CorruptState(format!("invalid file name {name:?} in dir-tree")));
                    break;
                };
                let child_path = path.join(&component);
                let dest_path = dest_dir.join(name);
                file_scope.spawn(move |_| {
                    if self.error.get().is_some() {
                        return;
                    }
                    if let Err(e) = self.checkout_file(&child_path, &dest_path, *file_checksum) {
                        self.fail(e);
                        return;
                    }
                    if let Some(progress) = &self.options.progress {
                        progress(&child_path);
                    }
                });
            }
        });
        if self.error.get().is_some() {
            return;
        }

        for (name, child_content, child_meta) in tree.dirs.clone() {
            if self.error.get().is_some() {
                break;
            }
            let Ok(component) = RepoPathComponent::parse(&name) else {
                self.fail(RepoError::CorruptState(format!("invalid dir name {name:?} in dir-tree")));
                break;
            };
            let child_path = path.join(&component);
            let dest_path = dest_dir.join(&name);
            self.spawn_ok(scope, move |scope| {
                self.checkout_dir(scope, &child_path, &dest_path, child_content, child_meta);
            });
        }
    }

    fn load_dir_tree(&self, checksum: Checksum) -> RepoResult<DirTree> {
        DirTree::from_bytes(&self.repo.store().load_metadata(checksum, ObjectKind::DirTree)?)
    }

    fn load_dir_meta(&self, checksum: Checksum) -> RepoResult<DirMeta> {
        DirMeta::from_bytes(&self.repo.store().load_metadata(checksum, ObjectKind::DirMeta)?)
    }

    fn prepare_dir(&self, dest_dir: &Path, meta: &DirMeta) -> RepoResult<()> {
        match fs::create_dir(dest_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if self.options.overwrite_mode != OverwriteMode::UnionFiles {
                    return Err(RepoError::AlreadyExists(dest_dir.display().to_string()));
                }
            }
            Err(e) => return Err(RepoError::io(dest_dir, e)),
        }
        fs::set_permissions(dest_dir, fs::Permissions::from_mode(meta.mode & 0o7777))
            .map_err(|e| RepoError::io(dest_dir, e))?;
        if self.options.permission_mode == PermissionMode::None {
            rustix::fs::chown(
                dest_dir,
                Some(rustix::fs::Uid::from_raw(meta.uid)),
                Some(rustix::fs::Gid::from_raw(meta.gid)),
            )
            .map_err(|e| RepoError::io(dest_dir, io::Error::from(e)))?;
            for (name, value) in &meta.xattrs {
                xattr::set(dest_dir, name, value).map_err(|e| RepoError::io(dest_dir, e))?;
            }
        }
        Ok(())
    }

    fn checkout_file(&self, path: &RepoPathBuf, dest_path: &Path, checksum: Checksum) -> RepoResult<()> {
        self.cancel.check()?;
        let header = self.load_header(checksum)?;
        if header.is_device() && self.options.permission_mode == PermissionMode::User {
            trace!(%path, "skipping device node for unprivileged checkout");
            return Ok(());
        }

        if self.hardlink_eligible(&header) {
            if let Some(source) = self.hardlink_source(checksum, &header)? {
                match self.try_hardlink(&source, dest_path) {
                    Ok(true) => {
                        self.files_hardlinked.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    Ok(false) => {} // fall through to copy
                    Err(e) => return Err(e),
                }
            }
        }

        if header.is_symlink() {
            self.copy_symlink(&header, dest_path)?;
        } else if header.is_device() {
            self.copy_device(&header, dest_path)?;
        } else {
            self.copy_regular(checksum, &header, dest_path)?;
        }
        self.files_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn load_header(&self, checksum: Checksum) -> RepoResult<FileHeader> {
        match self.repo.store().mode() {
            RepoMode::Bare => {
                let path = self.repo.store().bare_node_path(checksum)?;
                file_util::header_from_fs_path(&path)
            }
            RepoMode::Archive | RepoMode::ArchiveZ2 => self.repo.store().load_file_header(checksum),
        }
    }

    fn hardlink_eligible(&self, header: &FileHeader) -> bool {
        if header.is_symlink() {
            // Symlinks are cheap enough, and a caller may reasonably expect
            // a distinct inode per checkout to re-target independently.
            return false;
        }
        matches!(
            (self.repo.store().mode(), self.options.permission_mode),
            (RepoMode::Bare, PermissionMode::None)
                | (RepoMode::Archive, PermissionMode::User)
                | (RepoMode::ArchiveZ2, PermissionMode::User)
        )
    }

    fn hardlink_source(&self, checksum: Checksum, header: &FileHeader) -> RepoResult<Option<PathBuf>> {
        match self.repo.store().mode() {
            RepoMode::Bare => Ok(Some(self.repo.store().bare_node_path(checksum)?)),
            RepoMode::Archive => {
                if header.is_device() {
                    return Ok(None);
                }
                Ok(Some(self.repo.store().archive_content_path(checksum)?))
            }
            RepoMode::ArchiveZ2 => {
                if header.is_device() || !self.repo.config().enable_uncompressed_cache {
                    return Ok(None);
                }
                Ok(Some(self.ensure_uncompressed_cache(checksum, header)?))
            }
        }
    }

    /// Attempts to hardlink `source` at `dest_path`. Returns `Ok(false)` if
    /// the hardlink is unsupported in this situation (cross-device, too
    /// many links, or no permission) so the caller falls back to copying;
    /// any other error is propagated.
    fn try_hardlink(&self, source: &Path, dest_path: &Path) -> RepoResult<bool> {
        match fs::hard_link(source, dest_path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if self.options.overwrite_mode == OverwriteMode::UnionFiles {
                    let _ = fs::remove_file(dest_path);
                    match fs::hard_link(source, dest_path) {
                        Ok(()) => Ok(true),
                        Err(e) => Err(RepoError::io(dest_path, e)),
                    }
                } else {
                    Err(RepoError::AlreadyExists(dest_path.display().to_string()))
                }
            }
            Err(e) => {
                let unsupported = matches!(
                    e.raw_os_error(),
                    Some(code)
                        if code == Errno::MLINK.raw_os_error()
                            || code == Errno::XDEV.raw_os_error()
                            || code == Errno::PERM.raw_os_error()
                );
                if unsupported {
                    Ok(false)
                } else {
                    Err(RepoError::io(dest_path, e))
                }
            }
        }
    }

    fn open_dest(&self, dest_path: &Path) -> RepoResult<tempfile::NamedTempFile> {
        let parent = dest_path.parent().unwrap_or_else(|| Path::new("."));
        tempfile::NamedTempFile::new_in(parent).map_err(|e| RepoError::io(dest_path, e))
    }

    fn persist_dest(&self, tmp: tempfile::NamedTempFile, dest_path: &Path) -> RepoResult<()> {
        match self.options.overwrite_mode {
            OverwriteMode::UnionFiles => tmp
                .persist(dest_path)
                .map(|_| ())
                .map_err(|e| RepoError::io(dest_path, e.error)),
            OverwriteMode::Fail => tmp
                .persist_noclobber(dest_path)
                .map(|_| ())
                .map_err(|e| RepoError::io(dest_path, e.error)),
        }
    }

    fn copy_regular(&self, checksum: Checksum, header: &FileHeader, dest_path: &Path) -> RepoResult<()> {
        let mut content = self.repo.store().open_file_content(checksum)?;
        let tmp = self.open_dest(dest_path)?;
        let written = {
            let mut file = tmp.as_file();
            io::copy(&mut content, &mut file).map_err(|e| RepoError::io(dest_path, e))?
        };
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(header.mode & 0o7777))
            .map_err(|e| RepoError::io(dest_path, e))?;
        self.apply_ownership(tmp.path(), header)?;
        self.persist_dest(tmp, dest_path)?;
        self.bytes_written.fetch_add(written, Ordering::Relaxed);
        Ok(())
    }

    fn copy_symlink(&self, header: &FileHeader, dest_path: &Path) -> RepoResult<()> {
        let target = header
            .symlink_target
            .as_deref()
            .ok_or_else(|| RepoError::CorruptState("symlink header missing target".to_string()))?;
        match file_util::try_symlink(target, dest_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if self.options.overwrite_mode == OverwriteMode::UnionFiles {
                    fs::remove_file(dest_path).map_err(|e| RepoError::io(dest_path, e))?;
                    file_util::try_symlink(target, dest_path).map_err(|e| RepoError::io(dest_path, e))
                } else {
                    Err(RepoError::AlreadyExists(dest_path.display().to_string()))
                }
            }
            Err(e) => Err(RepoError::io(dest_path, e)),
        }
    }

    fn copy_device(&self, header: &FileHeader, dest_path: &Path) -> RepoResult<()> {
        if self.options.overwrite_mode == OverwriteMode::UnionFiles && dest_path.exists() {
            fs::remove_file(dest_path).map_err(|e| RepoError::io(dest_path, e))?;
        }
        crate::object_store::make_device_node(dest_path, header.mode, header.rdev.unwrap_or(0))
            .map_err(|e| RepoError::io(dest_path, e))?;
        self.apply_ownership(dest_path, header)?;
        Ok(())
    }

    fn apply_ownership(&self, path: &Path, header: &FileHeader) -> RepoResult<()> {
        if self.options.permission_mode != PermissionMode::None {
            return Ok(());
        }
        rustix::fs::chown(
            path,
            Some(rustix::fs::Uid::from_raw(header.uid)),
            Some(rustix::fs::Gid::from_raw(header.gid)),
        )
        .map_err(|e| RepoError::io(path, io::Error::from(e)))?;
        for (name, value) in &header.xattrs {
            xattr::set(path, name, value).map_err(|e| RepoError::io(path, e))?;
        }
        Ok(())
    }

    /// Returns the path of a decompressed copy of `checksum`'s content
    /// under `uncompressed-objects-cache/objects/`, creating it on demand.
    /// Only reachable for `(ArchiveZ2, User)` with caching enabled.
    fn ensure_uncompressed_cache(&self, checksum: Checksum, header: &FileHeader) -> RepoResult<PathBuf> {
        let (prefix, rest) = checksum.split_for_path();
        let cache_dir = self.repo.uncompressed_cache_objects_dir().join(&prefix);
        let cache_path = cache_dir.join(&rest);
        if cache_path.exists() {
            self.repo.note_uncompressed_touch(&prefix);
            return Ok(cache_path);
        }
        file_util::create_or_reuse_dir_all(&cache_dir).map_err(|e| RepoError::io(&cache_dir, e))?;
        let mut content = self.repo.store().open_file_content(checksum)?;
        let tmp_dir = self.repo.store().tmp_dir();
        file_util::create_or_reuse_dir_all(&tmp_dir).map_err(|e| RepoError::io(&tmp_dir, e))?;
        let tmp = tempfile::NamedTempFile::new_in(&tmp_dir).map_err(|e| RepoError::io(&tmp_dir, e))?;
        {
            let mut file = tmp.as_file();
            io::copy(&mut content, &mut file).map_err(|e| RepoError::io(&cache_path, e))?;
        }
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(header.mode & 0o777))
            .map_err(|e| RepoError::io(&cache_path, e))?;
        match file_util::persist_content_addressed_temp_file(tmp, &cache_path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(RepoError::io(&cache_path, e)),
        }
        self.repo.note_uncompressed_touch(&prefix);
        debug!(%checksum, "populated uncompressed cache entry");
        Ok(cache_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::config::RepoMode;
    use crate::mutable_tree::MutableTree;
    use crate::objects::S_IFREG;
    use crate::objects::XattrMap;
    use crate::repo::Repo;
    use std::collections::BTreeMap;

    fn default_meta() -> DirMeta {
        DirMeta {
            uid: current_uid(),
            gid: current_gid(),
            mode: 0o755,
            xattrs: XattrMap::new(),
        }
    }

    fn current_uid() -> u32 {
        rustix::process::getuid().as_raw()
    }

    fn current_gid() -> u32 {
        rustix::process::getgid().as_raw()
    }

    fn commit_one_file(repo: &Repo, name: &str, content: &[u8]) -> Checksum {
        let cancel = CancellationToken::new();
        repo.begin_transaction(false).unwrap();
        let mut mtree = MutableTree::new();
        let header = FileHeader {
            mode: S_IFREG | 0o644,
            uid: current_uid(),
            gid: current_gid(),
            symlink_target: None,
            rdev: None,
            xattrs: XattrMap::new(),
        };
        let mut bytes = content;
        let checksum = repo.store().insert_file(&header, Some(&mut bytes), None, &cancel).unwrap();
        mtree.set_file(&[name], checksum).unwrap();
        let (root_content, root_meta) = repo.stage_mutable_tree(&mtree, &default_meta(), &cancel).unwrap();
        let commit = repo
            .stage_commit(None, "t", "", BTreeMap::new(), vec![], root_content, root_meta, 1, &cancel)
            .unwrap();
        repo.commit_transaction();
        commit
    }

    #[test]
    fn test_checkout_bare_hardlinks_by_default() {
        let repo_dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(repo_dir.path(), RepoMode::Bare).unwrap();
        let commit = commit_one_file(&repo, "a", b"hello");

        let dest = tempfile::tempdir().unwrap();
        fs::remove_dir(dest.path()).unwrap();
        let cancel = CancellationToken::new();
        let stats = checkout(&repo, commit, dest.path(), CheckoutOptions::default(), &cancel).unwrap();
        assert_eq!(stats.files_hardlinked, 1);
        assert_eq!(stats.files_written, 0);
        assert_eq!(fs::read(dest.path().join("a")).unwrap(), b"hello");
    }

    #[test]
    fn test_checkout_archive_user_mode_copies() {
        let repo_dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(repo_dir.path(), RepoMode::Archive).unwrap();
        let commit = commit_one_file(&repo, "a", b"world");

        let dest = tempfile::tempdir().unwrap();
        fs::remove_dir(dest.path()).unwrap();
        let cancel = CancellationToken::new();
        let options = CheckoutOptions {
            permission_mode: PermissionMode::None,
            ..CheckoutOptions::default()
        };
        let stats = checkout(&repo, commit, dest.path(), options, &cancel).unwrap();
        assert_eq!(stats.files_written, 1);
        assert_eq!(fs::read(dest.path().join("a")).unwrap(), b"world");
    }

    #[test]
    fn test_checkout_union_files_overwrites() {
        let repo_dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(repo_dir.path(), RepoMode::Bare).unwrap();
        let commit = commit_one_file(&repo, "a", b"second");

        let dest = tempfile::tempdir().unwrap();
        fs::write(dest.path().join("a"), b"first").unwrap();
        let cancel = CancellationToken::new();
        let options = CheckoutOptions {
            overwrite_mode: OverwriteMode::UnionFiles,
            ..CheckoutOptions::default()
        };
        let stats = checkout(&repo, commit, dest.path(), options, &cancel).unwrap();
        assert_eq!(stats.files_hardlinked, 1);
        assert_eq!(fs::read(dest.path().join("a")).unwrap(), b"second");
    }

    #[test]
    fn test_checkout_fail_mode_rejects_existing_file() {
        let repo_dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(repo_dir.path(), RepoMode::Bare).unwrap();
        let commit = commit_one_file(&repo, "a", b"second");

        let dest = tempfile::tempdir().unwrap();
        fs::write(dest.path().join("a"), b"first").unwrap();
        let cancel = CancellationToken::new();
        assert!(checkout(&repo, commit, dest.path(), CheckoutOptions::default(), &cancel).is_err());
    }

    #[test]
    fn test_checkout_gc_sweeps_untouched_uncompressed_cache_entries() {
        let repo_dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(repo_dir.path(), RepoMode::ArchiveZ2).unwrap();
        let commit = commit_one_file(&repo, "a", b"cache me");

        let dest = tempfile::tempdir().unwrap();
        fs::remove_dir(dest.path()).unwrap();
        let cancel = CancellationToken::new();
        let options = CheckoutOptions {
            permission_mode: PermissionMode::User,
            ..CheckoutOptions::default()
        };
        checkout(&repo, commit, dest.path(), options, &cancel).unwrap();
        let cache_dir = repo.uncompressed_cache_objects_dir();
        assert!(fs::read_dir(&cache_dir).unwrap().flatten().next().is_some());

        drop(dest);
        repo.checkout_gc().unwrap();
        let remaining: usize = fs::read_dir(&cache_dir)
            .unwrap()
            .flatten()
            .map(|prefix| fs::read_dir(prefix.path()).map(|d| d.count()).unwrap_or(0))
            .sum();
        assert_eq!(remaining, 0);
    }
}
