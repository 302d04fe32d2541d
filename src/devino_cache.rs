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

//! Maps a source file's `(device, inode)` to a previously computed content
//! checksum, to skip re-hashing a tree that was checked out (via hardlink)
//! from this same BARE repository and hasn't changed since.
//!
//! Only meaningful in BARE mode: that is the only mode where a stored file
//! object is a plain filesystem node that can be hardlinked into a
//! checkout, so only there can a working tree file's inode coincide with a
//! stored object's inode. Building the cache for other modes is a no-op.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt as _;

use crate::checksum::Checksum;
use crate::config::RepoMode;
use crate::object_store::ObjectStore;
use crate::objects::ObjectKind;

/// Hashing quality does not affect correctness here, only how often a hit
/// is found on a genuine (dev, ino) collision-free lookup; `HashMap`'s
/// default hasher over the `(u64, u64)` key is sufficient.
#[derive(Default)]
pub struct DevinoCache {
    map: HashMap<(u64, u64), Checksum>,
}

impl DevinoCache {
    pub fn empty() -> Self {
        DevinoCache::default()
    }

    /// Walks every loose `FILE` object in `store` and records its
    /// `(st_dev, st_ino)`. No-op outside BARE mode.
    pub fn build(store: &ObjectStore) -> io::Result<Self> {
        let mut cache = DevinoCache::default();
        if store.mode() != RepoMode::Bare {
            return Ok(cache);
        }
        let checksums = match store.enumerate(ObjectKind::File) {
            Ok(checksums) => checksums,
            Err(_) => return Ok(cache),
        };
        for checksum in checksums {
            let (dir, rest) = checksum.split_for_path();
            let path = store.objects_dir().join(dir).join(format!("{rest}.file"));
            if let Ok(metadata) = fs::symlink_metadata(&path) {
                if metadata.is_file() {
                    cache.map.insert((metadata.dev(), metadata.ino()), checksum);
                }
            }
        }
        Ok(cache)
    }

    pub fn lookup(&self, dev: u64, ino: u64) -> Option<Checksum> {
        self.map.get(&(dev, ino)).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::objects::FileHeader;
    use crate::objects::S_IFREG;
    use crate::objects::XattrMap;
    use std::os::unix::fs::MetadataExt as _;

    #[test]
    fn test_build_finds_inserted_file() {
        let dir = tempfile::tempdir().unwrap();
        ObjectStore::init_layout(dir.path()).unwrap();
        let store = ObjectStore::new(dir.path().to_path_buf(), RepoMode::Bare, None);
        let header = FileHeader {
            mode: S_IFREG | 0o644,
            uid: 0,
            gid: 0,
            symlink_target: None,
            rdev: None,
            xattrs: XattrMap::new(),
        };
        let cancel = CancellationToken::new();
        let mut content: &[u8] = b"devino";
        let checksum = store
            .insert_file(&header, Some(&mut content), None, &cancel)
            .unwrap();

        let (hexdir, rest) = checksum.split_for_path();
        let path = store.objects_dir().join(hexdir).join(format!("{rest}.file"));
        let metadata = fs::metadata(&path).unwrap();

        let cache = DevinoCache::build(&store).unwrap();
        assert_eq!(cache.lookup(metadata.dev(), metadata.ino()), Some(checksum));
    }

    #[test]
    fn test_build_is_noop_outside_bare_mode() {
        let dir = tempfile::tempdir().unwrap();
        ObjectStore::init_layout(dir.path()).unwrap();
        let store = ObjectStore::new(dir.path().to_path_buf(), RepoMode::Archive, None);
        let cache = DevinoCache::build(&store).unwrap();
        assert!(cache.is_empty());
    }
}
