// Copyright 2021 The Jujutsu Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Filesystem helpers shared by the object store and the checkout engine.

use std::fs;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileTypeExt as _;
use std::os::unix::fs::MetadataExt as _;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tempfile::PersistError;
use thiserror::Error;

use crate::error::RepoError;
use crate::error::RepoResult;
use crate::objects::FileHeader;
use crate::objects::S_IFMT;
use crate::objects::XattrMap;

#[derive(Debug, Error)]
#[error("Cannot access {path}")]
pub struct PathError {
    pub path: PathBuf,
    pub source: io::Error,
}

pub trait IoResultExt<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError> {
        self.map_err(|error| PathError {
            path: path.as_ref().to_path_buf(),
            source: error,
        })
    }
}

/// Creates a directory or does nothing if the directory already exists.
pub fn create_or_reuse_dir(dirname: &Path) -> io::Result<()> {
    match fs::create_dir(dirname) {
        Ok(()) => Ok(()),
        Err(_) if dirname.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Creates all missing components of `dirname`, tolerating a concurrent
/// creator (EEXIST on any component is not an error).
pub fn create_or_reuse_dir_all(dirname: &Path) -> io::Result<()> {
    match fs::create_dir_all(dirname) {
        Ok(()) => Ok(()),
        Err(_) if dirname.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Persists the temporary file after synchronizing its content to disk.
///
/// On Unix, `rename(2)` is atomic and succeeds even if the destination
/// already exists, so for content-addressed destinations this is exactly
/// the "write-to-temp-then-rename" insertion protocol: an existing target
/// means another writer already inserted identical bytes, and the rename
/// harmlessly replaces it with an identical copy.
///
/// See also <https://lwn.net/Articles/457667/> for the fsync-before-rename
/// discussion on Linux.
pub fn persist_content_addressed_temp_file<P: AsRef<Path>>(
    temp_file: NamedTempFile,
    new_path: P,
) -> io::Result<File> {
    temp_file.as_file().sync_data()?;
    temp_file
        .persist(new_path)
        .map_err(|PersistError { error, file: _ }| error)
}

pub fn try_symlink<P: AsRef<Path>, Q: AsRef<Path>>(original: P, link: Q) -> io::Result<()> {
    symlink(original, link)
}

/// Builds a [`FileHeader`] by `lstat`-ing a real filesystem path, reading
/// its symlink target and extended attributes as needed. Used both to
/// stage a source file (see [`crate::staging`]) and to recover a BARE-mode
/// stored file's logical header from the filesystem node it is stored as
/// (see [`crate::object_store`]).
pub fn header_from_fs_path(path: &Path) -> RepoResult<FileHeader> {
    let metadata = fs::symlink_metadata(path).map_err(|e| RepoError::io(path, e))?;
    let file_type = metadata.file_type();
    let mode = metadata.mode() & (S_IFMT | 0o1777);

    if file_type.is_socket() || file_type.is_fifo() {
        return Err(RepoError::InvalidArgument(format!(
            "unsupported file type at {path:?}: sockets and FIFOs cannot be staged"
        )));
    }

    let symlink_target = if file_type.is_symlink() {
        Some(
            fs::read_link(path)
                .map_err(|e| RepoError::io(path, e))?
                .to_str()
                .ok_or_else(|| RepoError::InvalidArgument("non-UTF-8 symlink target".to_string()))?
                .to_string(),
        )
    } else {
        None
    };
    let rdev = if file_type.is_char_device() || file_type.is_block_device() {
        Some(metadata.rdev())
    } else {
        None
    };

    let mut xattrs = XattrMap::new();
    if !file_type.is_symlink() {
        if let Ok(names) = xattr::list(path) {
            for name in names {
                if let Some(name) = name.to_str() {
                    if let Ok(Some(value)) = xattr::get(path, name) {
                        xattrs.insert(name.to_string(), value);
                    }
                }
            }
        }
    }

    Ok(FileHeader {
        mode,
        uid: metadata.uid(),
        gid: metadata.gid(),
        symlink_target,
        rdev,
        xattrs,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn new_temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn test_persist_no_existing_file() {
        let temp_dir = new_temp_dir();
        let target = temp_dir.path().join("file");
        let mut temp_file = NamedTempFile::new_in(&temp_dir).unwrap();
        temp_file.write_all(b"contents").unwrap();
        assert!(persist_content_addressed_temp_file(temp_file, target).is_ok());
    }

    #[test]
    fn test_persist_target_exists() {
        let temp_dir = new_temp_dir();
        let target = temp_dir.path().join("file");
        let mut temp_file = NamedTempFile::new_in(&temp_dir).unwrap();
        temp_file.write_all(b"contents").unwrap();

        fs::write(&target, b"contents").unwrap();

        assert!(persist_content_addressed_temp_file(temp_file, &target).is_ok());
    }

    #[test]
    fn test_create_or_reuse_dir_is_idempotent() {
        let temp_dir = new_temp_dir();
        let dir = temp_dir.path().join("d");
        create_or_reuse_dir(&dir).unwrap();
        create_or_reuse_dir(&dir).unwrap();
        assert!(dir.is_dir());
    }
}
