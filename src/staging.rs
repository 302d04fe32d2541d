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

//! Ingests a filesystem subtree or an archive entry stream into the object
//! store, producing the checksums of a root dir-tree and dir-meta ready to
//! be wrapped in a commit.

use std::fs;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileTypeExt as _;
use std::os::unix::fs::MetadataExt as _;
use std::path::Path;

use tracing::trace;

use crate::cancellation::CancellationToken;
use crate::checksum::Checksum;
use crate::devino_cache::DevinoCache;
use crate::error::RepoError;
use crate::error::RepoResult;
use crate::mutable_tree::MutableTree;
use crate::object_store::ObjectStore;
use crate::objects::DirMeta;
use crate::objects::DirTree;
use crate::objects::FileHeader;
use crate::objects::ObjectKind;
use crate::objects::S_IFLNK;
use crate::objects::S_IFMT;
use crate::objects::S_IFREG;
use crate::objects::XattrMap;
use crate::repo_path::RepoPathBuf;
use crate::repo_path::RepoPathComponent;

/// The type and permission bits of a directory entry under consideration
/// by a [`CommitFilter`], as read from `lstat`.
#[derive(Debug, Clone, Copy)]
pub struct FileMode(pub u32);

const S_IFDIR: u32 = 0o040000;

impl FileMode {
    pub fn is_dir(self) -> bool {
        self.0 & S_IFMT == S_IFDIR
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Skip,
}

pub type CommitFilter<'a> = dyn Fn(&RepoPathBuf, FileMode) -> FilterDecision + 'a;

/// Recursively stages `source_dir` as `path` within the tree, returning
/// `(content_checksum, meta_checksum)`. Files found via `devino` are
/// reused without being re-read or re-hashed.
pub fn stage_directory(
    store: &ObjectStore,
    devino: &DevinoCache,
    path: &RepoPathBuf,
    source_dir: &Path,
    filter: Option<&CommitFilter<'_>>,
    cancel: &CancellationToken,
) -> RepoResult<(Checksum, Checksum)> {
    cancel.check()?;
    let dir_metadata = fs::symlink_metadata(source_dir).map_err(|e| RepoError::io(source_dir, e))?;

    let mut entries: Vec<_> = fs::read_dir(source_dir)
        .map_err(|e| RepoError::io(source_dir, e))?
        .collect::<std::io::Result<_>>()
        .map_err(|e| RepoError::io(source_dir, e))?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    let mut tree = DirTree::default();
    for entry in entries {
        cancel.check()?;
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| RepoError::InvalidArgument("non-UTF-8 file name".to_string()))?;
        let component = RepoPathComponent::parse(&name)?;
        let child_path = path.join(&component);
        let entry_metadata = entry.metadata().map_err(|e| RepoError::io(entry.path(), e))?;

        if let Some(filter) = filter {
            if filter(&child_path, FileMode(entry_metadata.mode())) == FilterDecision::Skip {
                continue;
            }
        }

        if entry_metadata.is_dir() {
            let (content, meta) = stage_directory(store, devino, &child_path, &entry.path(), filter, cancel)?;
            tree.dirs.push((name, content, meta));
        } else {
            let checksum = stage_fs_file(store, devino, &entry.path(), cancel)?;
            tree.files.push((name, checksum));
        }
    }
    tree.sort();

    let content_checksum = store.insert_metadata(ObjectKind::DirTree, &tree.to_bytes(), None, cancel)?;
    let meta = dir_meta_from_fs(&dir_metadata)?;
    let meta_checksum = store.insert_metadata(ObjectKind::DirMeta, &meta.to_bytes(), None, cancel)?;
    trace!(path = %path, %content_checksum, %meta_checksum, "staged directory");
    Ok((content_checksum, meta_checksum))
}

fn stage_fs_file(
    store: &ObjectStore,
    devino: &DevinoCache,
    path: &Path,
    cancel: &CancellationToken,
) -> RepoResult<Checksum> {
    cancel.check()?;
    let metadata = fs::symlink_metadata(path).map_err(|e| RepoError::io(path, e))?;
    if let Some(checksum) = devino.lookup(metadata.dev(), metadata.ino()) {
        return Ok(checksum);
    }

    let header = crate::file_util::header_from_fs_path(path)?;
    if header.is_symlink() || header.is_device() {
        return store.insert_file(&header, None, None, cancel);
    }
    if header.is_regular() {
        let mut file = File::open(path).map_err(|e| RepoError::io(path, e))?;
        return store.insert_file(&header, Some(&mut file), None, cancel);
    }
    Err(RepoError::InvalidArgument(format!(
        "unsupported file type at {path:?}: sockets and FIFOs cannot be staged"
    )))
}

fn dir_meta_from_fs(metadata: &fs::Metadata) -> RepoResult<DirMeta> {
    Ok(DirMeta {
        uid: metadata.uid(),
        gid: metadata.gid(),
        mode: metadata.mode() & 0o1777,
        xattrs: XattrMap::new(),
    })
}

/// A single entry surfaced by an external archive-stream iterator (e.g. a
/// libarchive wrapper supplied by the caller). Entries are visited in
/// stream order, which need not be directory-before-children.
pub enum ArchiveEntryKind {
    Directory,
    Regular,
    Symlink { target: String },
    Hardlink { target_path: String },
    Unsupported { description: String },
}

pub struct ArchiveEntry<'a> {
    pub path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub xattrs: XattrMap,
    pub kind: ArchiveEntryKind,
    pub content: Option<&'a mut dyn Read>,
}

/// A "lending" iterator over archive entries: each entry's content stream
/// borrows the underlying archive reader, so entries cannot be collected
/// into a `Vec` ahead of time the way a normal `Iterator` would allow.
pub trait ArchiveEntries {
    fn next_entry(&mut self) -> RepoResult<Option<ArchiveEntry<'_>>>;
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Ingests every entry from `entries` into `mtree`. A single unsupported
/// entry fails the whole ingestion, per spec.
pub fn ingest_archive(
    store: &ObjectStore,
    mtree: &mut MutableTree,
    entries: &mut dyn ArchiveEntries,
    cancel: &CancellationToken,
) -> RepoResult<()> {
    while let Some(entry) = entries.next_entry()? {
        cancel.check()?;
        let components = split_path(&entry.path);
        match entry.kind {
            ArchiveEntryKind::Directory => {
                let meta = DirMeta {
                    uid: entry.uid,
                    gid: entry.gid,
                    mode: entry.mode & 0o1777,
                    xattrs: entry.xattrs,
                };
                mtree.set_dir_meta(&components, meta)?;
            }
            ArchiveEntryKind::Hardlink { target_path } => {
                let target_components = split_path(&target_path);
                let checksum = mtree.get_file_checksum(&target_components).ok_or_else(|| {
                    RepoError::InvalidArgument(format!(
                        "hardlink target {target_path:?} not staged before its link"
                    ))
                })?;
                mtree.set_file(&components, checksum)?;
            }
            ArchiveEntryKind::Symlink { target } => {
                let header = FileHeader {
                    mode: S_IFLNK | 0o777,
                    uid: entry.uid,
                    gid: entry.gid,
                    symlink_target: Some(target),
                    rdev: None,
                    xattrs: entry.xattrs,
                };
                let checksum = store.insert_file(&header, None, None, cancel)?;
                mtree.set_file(&components, checksum)?;
            }
            ArchiveEntryKind::Regular => {
                let header = FileHeader {
                    mode: S_IFREG | (entry.mode & 0o777),
                    uid: entry.uid,
                    gid: entry.gid,
                    symlink_target: None,
                    rdev: None,
                    xattrs: entry.xattrs,
                };
                let mut content = entry
                    .content
                    .ok_or_else(|| RepoError::InvalidArgument("regular entry missing content".to_string()))?;
                let checksum = store.insert_file(&header, Some(&mut content), None, cancel)?;
                mtree.set_file(&components, checksum)?;
            }
            ArchiveEntryKind::Unsupported { description } => {
                return Err(RepoError::InvalidArgument(format!(
                    "unsupported archive entry at {:?}: {description}",
                    entry.path
                )));
            }
        }
    }
    Ok(())
}
