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

//! The repository handle: config, object store, ref store, the single
//! staging transaction bracket, and rev resolution.
//!
//! A [`Repo`] is the one entry point a caller needs; it owns an
//! [`ObjectStore`] and a [`RefStore`] rooted at the same directory and wires
//! a configured parent repo (see spec §9, "parent-repo chaining") into both.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tracing::debug;

use crate::cancellation::CancellationToken;
use crate::checksum::Checksum;
use crate::config::RepoConfig;
use crate::config::RepoMode;
use crate::devino_cache::DevinoCache;
use crate::error::RepoError;
use crate::error::RepoResult;
use crate::file_util;
use crate::mutable_tree::MutableTree;
use crate::object_store::ObjectStore;
use crate::objects::Commit;
use crate::objects::DirMeta;
use crate::objects::ObjectKind;
use crate::ref_store::RefLocation;
use crate::ref_store::RefStore;
use crate::repo_path::RepoPathBuf;
use crate::serialization::Value;
use crate::staging::ArchiveEntries;
use crate::staging::CommitFilter;

const UNCOMPRESSED_CACHE_DIR: &str = "uncompressed-objects-cache";

pub struct Repo {
    root: PathBuf,
    config: RepoConfig,
    store: ObjectStore,
    refs: RefStore,
    parent: Option<Box<Repo>>,
    in_transaction: AtomicBool,
    devino: Mutex<Option<DevinoCache>>,
    uncompressed_cache_touched: Mutex<HashSet<String>>,
}

impl Repo {
    /// Creates the on-disk layout and config for a fresh repository and
    /// opens it. Fails with [`RepoError::AlreadyExists`] if `root` already
    /// holds a `config` file.
    pub fn init(root: impl Into<PathBuf>, mode: RepoMode) -> RepoResult<Repo> {
        let root = root.into();
        let config_path = root.join("config");
        if config_path.exists() {
            return Err(RepoError::AlreadyExists(config_path.display().to_string()));
        }
        file_util::create_or_reuse_dir_all(&root).map_err(|e| RepoError::io(&root, e))?;
        ObjectStore::init_layout(&root)?;
        let config = RepoConfig {
            mode,
            ..RepoConfig::default()
        };
        config.save(&config_path)?;
        Repo::open(&root)
    }

    /// Opens an existing repository, following its configured parent chain.
    /// Rejects a chain that would point back to a repo already being
    /// opened (spec §9, "parent-repo chaining with cycle rejection").
    pub fn open(root: impl AsRef<Path>) -> RepoResult<Repo> {
        Repo::open_inner(root.as_ref(), &mut HashSet::new())
    }

    fn open_inner(root: &Path, visited: &mut HashSet<PathBuf>) -> RepoResult<Repo> {
        let canonical = fs::canonicalize(root).map_err(|e| RepoError::io(root, e))?;
        if !visited.insert(canonical.clone()) {
            return Err(RepoError::CorruptState(format!(
                "parent repo chain revisits {canonical:?}; refusing to open a cyclic chain"
            )));
        }
        let config = RepoConfig::load(&root.join("config"))?;
        let parent = match &config.parent_path {
            Some(parent_path) => Some(Box::new(Repo::open_inner(parent_path, visited)?)),
            None => None,
        };
        let parent_store = parent.as_ref().map(|p| Box::new(p.store.clone()));
        let store = ObjectStore::new(root.to_path_buf(), config.mode, parent_store);
        let refs = RefStore::new(root.to_path_buf(), config.mode);
        Ok(Repo {
            root: root.to_path_buf(),
            config,
            store,
            refs,
            parent,
            in_transaction: AtomicBool::new(false),
            devino: Mutex::new(None),
            uncompressed_cache_touched: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    pub fn parent(&self) -> Option<&Repo> {
        self.parent.as_deref()
    }

    pub fn uncompressed_cache_root(&self) -> PathBuf {
        self.root.join(UNCOMPRESSED_CACHE_DIR)
    }

    pub fn uncompressed_cache_objects_dir(&self) -> PathBuf {
        self.uncompressed_cache_root().join("objects")
    }

    pub(crate) fn note_uncompressed_touch(&self, prefix: &str) {
        self.uncompressed_cache_touched
            .lock()
            .unwrap()
            .insert(prefix.to_string());
    }

    // -- Transaction bracket (spec §4.2) -----------------------------------

    /// Begins the single staging transaction this repo handle allows at a
    /// time. `build_devino_cache` walks existing loose FILE objects (a
    /// no-op outside BARE mode) to populate the fast-path cache used by
    /// [`Repo::stage_directory`].
    pub fn begin_transaction(&self, build_devino_cache: bool) -> RepoResult<()> {
        if self.in_transaction.swap(true, Ordering::SeqCst) {
            return Err(RepoError::State(
                "a staging transaction is already active on this repo handle".to_string(),
            ));
        }
        if build_devino_cache {
            let cache = DevinoCache::build(&self.store).map_err(|e| RepoError::io(self.store.objects_dir(), e))?;
            debug!(entries = cache.len(), "built devino cache");
            *self.devino.lock().unwrap() = Some(cache);
        }
        Ok(())
    }

    /// Ends the transaction. Identical to [`Repo::abort_transaction`]:
    /// object insertion is already atomic and idempotent, so there is no
    /// rollback to perform (spec §4.2).
    pub fn commit_transaction(&self) {
        self.end_transaction();
    }

    pub fn abort_transaction(&self) {
        self.end_transaction();
    }

    fn end_transaction(&self) {
        *self.devino.lock().unwrap() = None;
        self.in_transaction.store(false, Ordering::SeqCst);
    }

    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    fn require_transaction(&self) -> RepoResult<()> {
        if self.is_in_transaction() {
            Ok(())
        } else {
            Err(RepoError::State(
                "no active staging transaction on this repo handle".to_string(),
            ))
        }
    }

    // -- Staging (spec §4.2) ------------------------------------------------

    /// Recursively stages `source_dir` into the object store, returning
    /// `(root_content_checksum, root_meta_checksum)`.
    pub fn stage_directory(
        &self,
        path: &RepoPathBuf,
        source_dir: &Path,
        filter: Option<&CommitFilter<'_>>,
        cancel: &CancellationToken,
    ) -> RepoResult<(Checksum, Checksum)> {
        self.require_transaction()?;
        let guard = self.devino.lock().unwrap();
        let empty = DevinoCache::empty();
        let devino = guard.as_ref().unwrap_or(&empty);
        crate::staging::stage_directory(&self.store, devino, path, source_dir, filter, cancel)
    }

    /// Ingests an external archive entry stream into `mtree` (spec
    /// §4.2, "Archive ingestion").
    pub fn ingest_archive(
        &self,
        mtree: &mut MutableTree,
        entries: &mut dyn ArchiveEntries,
        cancel: &CancellationToken,
    ) -> RepoResult<()> {
        self.require_transaction()?;
        crate::staging::ingest_archive(&self.store, mtree, entries, cancel)
    }

    /// Flushes an in-memory [`MutableTree`] (built by [`Repo::ingest_archive`]
    /// or directly) into dir-tree/dir-meta objects.
    pub fn stage_mutable_tree(
        &self,
        mtree: &MutableTree,
        default_meta: &DirMeta,
        cancel: &CancellationToken,
    ) -> RepoResult<(Checksum, Checksum)> {
        self.require_transaction()?;
        mtree.write(&self.store, default_meta, cancel)
    }

    /// Builds and stages a `COMMIT` object, returning its checksum (spec
    /// §4.2, "Commit emission").
    #[allow(clippy::too_many_arguments)]
    pub fn stage_commit(
        &self,
        parent: Option<Checksum>,
        subject: impl Into<String>,
        body: impl Into<String>,
        metadata: BTreeMap<String, Value>,
        related: Vec<Checksum>,
        root_content: Checksum,
        root_meta: Checksum,
        timestamp: u64,
        cancel: &CancellationToken,
    ) -> RepoResult<Checksum> {
        self.require_transaction()?;
        let commit = Commit {
            metadata,
            parent,
            related,
            subject: subject.into(),
            body: body.into(),
            timestamp,
            root_content,
            root_meta,
        };
        self.store.insert_metadata(ObjectKind::Commit, &commit.to_bytes(), None, cancel)
    }

    pub fn load_commit(&self, checksum: Checksum) -> RepoResult<Commit> {
        Commit::from_bytes(&self.store.load_metadata(checksum, ObjectKind::Commit)?)
    }

    // -- Refs (spec §4.5) ----------------------------------------------------

    pub fn write_ref(&self, name: &str, checksum: Checksum) -> RepoResult<()> {
        self.refs.write(&RefLocation::Head, name, checksum)
    }

    pub fn write_remote_ref(&self, remote: &str, name: &str, checksum: Checksum) -> RepoResult<()> {
        self.refs.write(&RefLocation::Remote(remote.to_string()), name, checksum)
    }

    /// Resolves a rev, failing with [`RepoError::RefNotFound`] if it cannot
    /// be found anywhere in the parent chain.
    pub fn resolve(&self, rev: &str) -> RepoResult<Checksum> {
        self.resolve_opt(rev)?
            .ok_or_else(|| RepoError::RefNotFound(rev.to_string()))
    }

    /// Resolves a rev, returning `None` rather than an error if nothing
    /// matches anywhere in the parent chain (the "missing-is-ok" mode of
    /// spec §4.5).
    pub fn resolve_opt(&self, rev: &str) -> RepoResult<Option<Checksum>> {
        if let Some(prefix) = rev.strip_suffix('^') {
            let parent_checksum = match self.resolve_opt(prefix)? {
                Some(c) => c,
                None => return Ok(None),
            };
            let commit = self.load_commit(parent_checksum)?;
            return match commit.parent {
                Some(parent) => Ok(Some(parent)),
                None => Err(RepoError::InvalidArgument(format!(
                    "Commit {parent_checksum} has no parent"
                ))),
            };
        }

        if let Some(checksum) = Checksum::parse(rev) {
            return Ok(Some(checksum));
        }

        if let Some(checksum) = self.refs.read(&RefLocation::Head, rev)? {
            return Ok(Some(checksum));
        }
        if let Some(checksum) = self.refs.find_in_any_remote(rev)? {
            return Ok(Some(checksum));
        }
        if let Some((remote, name)) = rev.split_once('/') {
            if let Some(checksum) = self.refs.read(&RefLocation::Remote(remote.to_string()), name)? {
                return Ok(Some(checksum));
            }
        }
        if let Some(parent) = &self.parent {
            if let Some(checksum) = parent.resolve_opt(rev)? {
                return Ok(Some(checksum));
            }
        }
        Ok(None)
    }

    // -- Checkout GC (spec §4.3) ---------------------------------------------

    /// Sweeps the uncompressed-cache directories touched since the last GC
    /// (or since this handle was opened), removing entries with link count
    /// 1 i.e. not held open by any live checkout (spec §4.3, "checkout-gc").
    pub fn checkout_gc(&self) -> RepoResult<()> {
        let prefixes: HashSet<String> = std::mem::take(&mut *self.uncompressed_cache_touched.lock().unwrap());
        let objects_dir = self.uncompressed_cache_objects_dir();
        for prefix in prefixes {
            let dir = objects_dir.join(&prefix);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(RepoError::io(dir, e)),
            };
            for entry in entries {
                let entry = entry.map_err(|e| RepoError::io(&dir, e))?;
                let path = entry.path();
                if let Ok(metadata) = fs::metadata(&path) {
                    if metadata.nlink() == 1 {
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::S_IFREG;
    use crate::objects::XattrMap;

    fn init_repo(mode: RepoMode) -> (tempfile::TempDir, Repo) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(dir.path(), mode).unwrap();
        (dir, repo)
    }

    fn commit_empty_tree(repo: &Repo, parent: Option<Checksum>, subject: &str) -> Checksum {
        let cancel = CancellationToken::new();
        repo.begin_transaction(false).unwrap();
        let mtree = MutableTree::new();
        let default_meta = DirMeta {
            uid: 0,
            gid: 0,
            mode: 0o755,
            xattrs: XattrMap::new(),
        };
        let (content, meta) = repo.stage_mutable_tree(&mtree, &default_meta, &cancel).unwrap();
        let commit = repo
            .stage_commit(
                parent,
                subject,
                "",
                BTreeMap::new(),
                vec![],
                content,
                meta,
                1_700_000_000,
                &cancel,
            )
            .unwrap();
        repo.commit_transaction();
        commit
    }

    #[test]
    fn test_init_then_open() {
        let dir = tempfile::tempdir().unwrap();
        Repo::init(dir.path(), RepoMode::Bare).unwrap();
        let repo = Repo::open(dir.path()).unwrap();
        assert_eq!(repo.config().mode, RepoMode::Bare);
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        Repo::init(dir.path(), RepoMode::Bare).unwrap();
        assert!(Repo::init(dir.path(), RepoMode::Bare).is_err());
    }

    #[test]
    fn test_second_transaction_fails_while_active() {
        let (_dir, repo) = init_repo(RepoMode::Bare);
        repo.begin_transaction(false).unwrap();
        assert!(repo.begin_transaction(false).is_err());
        repo.commit_transaction();
        assert!(repo.begin_transaction(false).is_ok());
        repo.abort_transaction();
    }

    #[test]
    fn test_stage_outside_transaction_fails() {
        let (_dir, repo) = init_repo(RepoMode::Bare);
        let cancel = CancellationToken::new();
        let mtree = MutableTree::new();
        let default_meta = DirMeta {
            uid: 0,
            gid: 0,
            mode: 0o755,
            xattrs: XattrMap::new(),
        };
        assert!(repo.stage_mutable_tree(&mtree, &default_meta, &cancel).is_err());
    }

    #[test]
    fn test_resolve_checksum_direct() {
        let (_dir, repo) = init_repo(RepoMode::Bare);
        let c1 = commit_empty_tree(&repo, None, "init");
        assert_eq!(repo.resolve(&c1.hex()).unwrap(), c1);
    }

    #[test]
    fn test_resolve_branch_and_parent() {
        let (_dir, repo) = init_repo(RepoMode::Bare);
        let c1 = commit_empty_tree(&repo, None, "init");
        let c2 = commit_empty_tree(&repo, Some(c1), "second");
        repo.write_ref("main", c2).unwrap();

        assert_eq!(repo.resolve("main").unwrap(), c2);
        assert_eq!(repo.resolve("main^").unwrap(), c1);
        assert!(repo.resolve("main^^").is_err());
    }

    #[test]
    fn test_resolve_missing_is_none() {
        let (_dir, repo) = init_repo(RepoMode::Bare);
        assert_eq!(repo.resolve_opt("nope").unwrap(), None);
        assert!(repo.resolve("nope").is_err());
    }

    #[test]
    fn test_parent_repo_cycle_rejected() {
        let dir = tempfile::tempdir().unwrap();
        Repo::init(dir.path(), RepoMode::Bare).unwrap();
        let config_path = dir.path().join("config");
        let mut config = RepoConfig::load(&config_path).unwrap();
        config.parent_path = Some(dir.path().to_path_buf());
        config.save(&config_path).unwrap();

        assert!(Repo::open(dir.path()).is_err());
    }

    #[test]
    fn test_parent_repo_resolves_commits() {
        let parent_dir = tempfile::tempdir().unwrap();
        let parent_repo = Repo::init(parent_dir.path(), RepoMode::Bare).unwrap();
        let parent_commit = commit_empty_tree(&parent_repo, None, "in parent");
        parent_repo.write_ref("main", parent_commit).unwrap();

        let child_dir = tempfile::tempdir().unwrap();
        file_util::create_or_reuse_dir_all(child_dir.path()).unwrap();
        ObjectStore::init_layout(child_dir.path()).unwrap();
        let config = RepoConfig {
            parent_path: Some(parent_dir.path().to_path_buf()),
            ..RepoConfig::default()
        };
        config.save(&child_dir.path().join("config")).unwrap();
        let child_repo = Repo::open(child_dir.path()).unwrap();

        assert_eq!(child_repo.resolve("main").unwrap(), parent_commit);
        assert!(child_repo.store().has(parent_commit, ObjectKind::Commit).unwrap());
    }

    #[test]
    fn test_insert_file_for_devino_smoke() {
        let (_dir, repo) = init_repo(RepoMode::Bare);
        let cancel = CancellationToken::new();
        repo.begin_transaction(true).unwrap();
        let header = crate::objects::FileHeader {
            mode: S_IFREG | 0o644,
            uid: 0,
            gid: 0,
            symlink_target: None,
            rdev: None,
            xattrs: XattrMap::new(),
        };
        let mut content: &[u8] = b"hi";
        repo.store().insert_file(&header, Some(&mut content), None, &cancel).unwrap();
        repo.commit_transaction();
    }
}
