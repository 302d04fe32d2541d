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

//! An in-memory directory tree staged by name, used to assemble a commit's
//! root from entries that may arrive in arbitrary order (as from an
//! archive stream) before anything is written to the object store.
//!
//! The filesystem staging path (see [`crate::staging`]) walks a real
//! directory tree and can emit dir-tree/dir-meta objects bottom-up as it
//! recurses, without needing this structure. Archive ingestion cannot:
//! entries show up in whatever order the archive stores them, parent
//! directories may need to be synthesized before their own entry appears,
//! and a hardlink entry needs to look up a sibling's checksum that might
//! already be staged. [`MutableTree`] gives both paths for object emission
//! a single home.

use std::collections::BTreeMap;

use crate::cancellation::CancellationToken;
use crate::checksum::Checksum;
use crate::error::RepoError;
use crate::error::RepoResult;
use crate::object_store::ObjectStore;
use crate::objects::DirMeta;
use crate::objects::DirTree;
use crate::objects::ObjectKind;

enum MutableEntry {
    File(Checksum),
    Dir(MutableTree),
}

/// A directory being assembled in memory. Every directory gets a
/// [`DirMeta`] eventually; until it is set explicitly (or inherited as a
/// default), attempting to [`MutableTree::write`] the tree fails.
pub struct MutableTree {
    meta: Option<DirMeta>,
    entries: BTreeMap<String, MutableEntry>,
}

impl Default for MutableTree {
    fn default() -> Self {
        MutableTree::new()
    }
}

impl MutableTree {
    pub fn new() -> Self {
        MutableTree {
            meta: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn set_meta(&mut self, meta: DirMeta) {
        self.meta = Some(meta);
    }

    /// Returns the subtree at `components`, creating any missing
    /// intermediate directories (without metadata, to be filled in later
    /// when their own directory entry is encountered).
    pub fn ensure_dir(&mut self, components: &[&str]) -> RepoResult<&mut MutableTree> {
        let mut current = self;
        for component in components {
            let entry = current
                .entries
                .entry(component.to_string())
                .or_insert_with(|| MutableEntry::Dir(MutableTree::new()));
            match entry {
                MutableEntry::Dir(dir) => current = dir,
                MutableEntry::File(_) => {
                    return Err(RepoError::InvalidArgument(format!(
                        "path component {component:?} is a file, not a directory"
                    )));
                }
            }
        }
        Ok(current)
    }

    pub fn set_file(&mut self, components: &[&str], checksum: Checksum) -> RepoResult<()> {
        let (dir_components, name) = split_last(components)?;
        let dir = self.ensure_dir(dir_components)?;
        dir.entries.insert(name.to_string(), MutableEntry::File(checksum));
        Ok(())
    }

    pub fn set_dir_meta(&mut self, components: &[&str], meta: DirMeta) -> RepoResult<()> {
        let dir = self.ensure_dir(components)?;
        dir.set_meta(meta);
        Ok(())
    }

    /// Looks up a previously staged file's checksum, for resolving a
    /// hardlink entry against a sibling already seen in this stream.
    pub fn get_file_checksum(&self, components: &[&str]) -> Option<Checksum> {
        let (dir_components, name) = split_last(components).ok()?;
        let mut current = self;
        for component in dir_components {
            match current.entries.get(*component)? {
                MutableEntry::Dir(dir) => current = dir,
                MutableEntry::File(_) => return None,
            }
        }
        match current.entries.get(name)? {
            MutableEntry::File(checksum) => Some(*checksum),
            MutableEntry::Dir(_) => None,
        }
    }

    /// Recursively stages this subtree's children, builds and stages its
    /// own `DIR_TREE` object, and stages its `DIR_META`. Returns
    /// `(content_checksum, meta_checksum)` for linking into the parent.
    pub fn write(
        &self,
        store: &ObjectStore,
        default_meta: &DirMeta,
        cancel: &CancellationToken,
    ) -> RepoResult<(Checksum, Checksum)> {
        cancel.check()?;
        let mut tree = DirTree::default();
        for (name, entry) in &self.entries {
            match entry {
                MutableEntry::File(checksum) => tree.files.push((name.clone(), *checksum)),
                MutableEntry::Dir(dir) => {
                    let (content, meta) = dir.write(store, default_meta, cancel)?;
                    tree.dirs.push((name.clone(), content, meta));
                }
            }
        }
        tree.sort();
        let content_checksum = store.insert_metadata(ObjectKind::DirTree, &tree.to_bytes(), None, cancel)?;
        let meta = self.meta.clone().unwrap_or_else(|| default_meta.clone());
        let meta_checksum = store.insert_metadata(ObjectKind::DirMeta, &meta.to_bytes(), None, cancel)?;
        Ok((content_checksum, meta_checksum))
    }
}

fn split_last<'a>(components: &'a [&'a str]) -> RepoResult<(&'a [&'a str], &'a str)> {
    match components.split_last() {
        Some((name, dirs)) => Ok((dirs, name)),
        None => Err(RepoError::InvalidArgument("empty path".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum_bytes;
    use crate::config::RepoMode;

    fn default_meta() -> DirMeta {
        DirMeta {
            uid: 0,
            gid: 0,
            mode: 0o755,
            xattrs: Default::default(),
        }
    }

    #[test]
    fn test_set_file_creates_parents() {
        let mut tree = MutableTree::new();
        let checksum = checksum_bytes(b"x");
        tree.set_file(&["a", "b", "c"], checksum).unwrap();
        assert_eq!(tree.get_file_checksum(&["a", "b", "c"]), Some(checksum));
    }

    #[test]
    fn test_hardlink_lookup_across_siblings() {
        let mut tree = MutableTree::new();
        let checksum = checksum_bytes(b"shared");
        tree.set_file(&["dir", "original"], checksum).unwrap();
        let resolved = tree.get_file_checksum(&["dir", "original"]);
        assert_eq!(resolved, Some(checksum));
        tree.set_file(&["dir", "alias"], resolved.unwrap()).unwrap();
        assert_eq!(tree.get_file_checksum(&["dir", "alias"]), Some(checksum));
    }

    #[test]
    fn test_write_produces_deterministic_checksum_regardless_of_insertion_order() {
        let dir1 = tempfile::tempdir().unwrap();
        crate::object_store::ObjectStore::init_layout(dir1.path()).unwrap();
        let store1 = ObjectStore::new(dir1.path().to_path_buf(), RepoMode::Bare, None);
        let cancel = CancellationToken::new();
        let checksum_a = checksum_bytes(b"a-content");
        let checksum_b = checksum_bytes(b"b-content");

        let mut tree1 = MutableTree::new();
        tree1.set_file(&["a"], checksum_a).unwrap();
        tree1.set_file(&["b"], checksum_b).unwrap();
        let (content1, _) = tree1.write(&store1, &default_meta(), &cancel).unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        crate::object_store::ObjectStore::init_layout(dir2.path()).unwrap();
        let store2 = ObjectStore::new(dir2.path().to_path_buf(), RepoMode::Bare, None);
        let mut tree2 = MutableTree::new();
        tree2.set_file(&["b"], checksum_b).unwrap();
        tree2.set_file(&["a"], checksum_a).unwrap();
        let (content2, _) = tree2.write(&store2, &default_meta(), &cancel).unwrap();

        assert_eq!(content1, content2);
    }
}
