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

//! The four object kinds stored in the object store, and their canonical
//! serialized shapes.

use std::collections::BTreeMap;

use crate::checksum::Checksum;
use crate::error::RepoError;
use crate::error::RepoResult;
use crate::serialization::Value;
use crate::serialization::from_slice;
use crate::serialization::to_vec;

/// Permission and type bits stripped of setuid/setgid, as stored in an
/// object. The type nibble follows the standard POSIX `S_IFMT` values so
/// `mode & S_IFMT` recovers the file type.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFBLK: u32 = 0o060000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    DirMeta,
    DirTree,
    Commit,
}

impl ObjectKind {
    pub fn is_metadata(self) -> bool {
        !matches!(self, ObjectKind::File)
    }
}

/// Name → value map of extended attributes, keyed by attribute name
/// (e.g. `user.foo`). Values are opaque byte strings.
pub type XattrMap = BTreeMap<String, Vec<u8>>;

/// The header that precedes (BARE, ARCHIVE_Z2) or stands alongside
/// (ARCHIVE) a file's raw content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub symlink_target: Option<String>,
    pub rdev: Option<u64>,
    pub xattrs: XattrMap,
}

impl FileHeader {
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_device(&self) -> bool {
        matches!(self.mode & S_IFMT, S_IFCHR | S_IFBLK)
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    fn to_value(&self) -> Value {
        let mut dict = BTreeMap::new();
        dict.insert("mode".to_string(), Value::UInt(self.mode as u64));
        dict.insert("uid".to_string(), Value::UInt(self.uid as u64));
        dict.insert("gid".to_string(), Value::UInt(self.gid as u64));
        if let Some(target) = &self.symlink_target {
            dict.insert("symlink_target".to_string(), Value::String(target.clone()));
        }
        if let Some(rdev) = self.rdev {
            dict.insert("rdev".to_string(), Value::UInt(rdev));
        }
        dict.insert("xattrs".to_string(), xattrs_to_value(&self.xattrs));
        Value::Dict(dict)
    }

    fn from_value(value: &Value) -> RepoResult<Self> {
        let dict = expect_dict(value)?;
        Ok(FileHeader {
            mode: expect_uint(dict, "mode")? as u32,
            uid: expect_uint(dict, "uid")? as u32,
            gid: expect_uint(dict, "gid")? as u32,
            symlink_target: dict
                .get("symlink_target")
                .map(|v| v.as_str().map(str::to_string))
                .transpose()
                .ok_or_else(|| RepoError::CorruptState("symlink_target not a string".to_string()))?,
            rdev: dict.get("rdev").map(|v| v.as_uint()).transpose().ok_or_else(|| {
                RepoError::CorruptState("rdev not an integer".to_string())
            })?,
            xattrs: dict
                .get("xattrs")
                .map(xattrs_from_value)
                .transpose()?
                .unwrap_or_default(),
        })
    }

    pub fn to_header_bytes(&self) -> Vec<u8> {
        to_vec(&self.to_value())
    }

    pub fn from_header_bytes(bytes: &[u8]) -> RepoResult<Self> {
        FileHeader::from_value(&from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirMeta {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub xattrs: XattrMap,
}

impl DirMeta {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert("uid".to_string(), Value::UInt(self.uid as u64));
        dict.insert("gid".to_string(), Value::UInt(self.gid as u64));
        dict.insert("mode".to_string(), Value::UInt(self.mode as u64));
        dict.insert("xattrs".to_string(), xattrs_to_value(&self.xattrs));
        to_vec(&Value::Dict(dict))
    }

    pub fn from_bytes(bytes: &[u8]) -> RepoResult<Self> {
        let value = from_slice(bytes)?;
        let dict = expect_dict(&value)?;
        Ok(DirMeta {
            uid: expect_uint(dict, "uid")? as u32,
            gid: expect_uint(dict, "gid")? as u32,
            mode: expect_uint(dict, "mode")? as u32,
            xattrs: dict
                .get("xattrs")
                .map(xattrs_from_value)
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

/// A directory's child listing: files and subdirectories, each sorted
/// lexicographically by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirTree {
    pub files: Vec<(String, Checksum)>,
    pub dirs: Vec<(String, Checksum, Checksum)>,
}

impl DirTree {
    pub fn to_bytes(&self) -> Vec<u8> {
        let files = self
            .files
            .iter()
            .map(|(name, csum)| {
                Value::Array(vec![Value::String(name.clone()), checksum_value(csum)])
            })
            .collect();
        let dirs = self
            .dirs
            .iter()
            .map(|(name, content, meta)| {
                Value::Array(vec![
                    Value::String(name.clone()),
                    checksum_value(content),
                    checksum_value(meta),
                ])
            })
            .collect();
        let mut dict = BTreeMap::new();
        dict.insert("files".to_string(), Value::Array(files));
        dict.insert("dirs".to_string(), Value::Array(dirs));
        to_vec(&Value::Dict(dict))
    }

    pub fn from_bytes(bytes: &[u8]) -> RepoResult<Self> {
        let value = from_slice(bytes)?;
        let dict = expect_dict(&value)?;
        let files = dict
            .get("files")
            .and_then(Value::as_array)
            .ok_or_else(|| RepoError::CorruptState("dir-tree missing files array".to_string()))?
            .iter()
            .map(|entry| {
                let items = entry
                    .as_array()
                    .ok_or_else(|| RepoError::CorruptState("file entry not an array".to_string()))?;
                let [name, csum] = items else {
                    return Err(RepoError::CorruptState("file entry has wrong arity".to_string()));
                };
                Ok((expect_string_value(name)?, checksum_from_value(csum)?))
            })
            .collect::<RepoResult<Vec<_>>>()?;
        let dirs = dict
            .get("dirs")
            .and_then(Value::as_array)
            .ok_or_else(|| RepoError::CorruptState("dir-tree missing dirs array".to_string()))?
            .iter()
            .map(|entry| {
                let items = entry
                    .as_array()
                    .ok_or_else(|| RepoError::CorruptState("dir entry not an array".to_string()))?;
                let [name, content, meta] = items else {
                    return Err(RepoError::CorruptState("dir entry has wrong arity".to_string()));
                };
                Ok((
                    expect_string_value(name)?,
                    checksum_from_value(content)?,
                    checksum_from_value(meta)?,
                ))
            })
            .collect::<RepoResult<Vec<_>>>()?;
        Ok(DirTree { files, dirs })
    }

    /// Sorts both lists lexicographically by name, as required before
    /// serialization.
    pub fn sort(&mut self) {
        self.files.sort_by(|a, b| a.0.cmp(&b.0));
        self.dirs.sort_by(|a, b| a.0.cmp(&b.0));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub metadata: BTreeMap<String, Value>,
    pub parent: Option<Checksum>,
    pub related: Vec<Checksum>,
    pub subject: String,
    pub body: String,
    pub timestamp: u64,
    pub root_content: Checksum,
    pub root_meta: Checksum,
}

impl Commit {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert("metadata".to_string(), Value::Dict(self.metadata.clone()));
        dict.insert(
            "parent".to_string(),
            match &self.parent {
                Some(csum) => checksum_value(csum),
                None => Value::Bytes(Vec::new()),
            },
        );
        dict.insert(
            "related".to_string(),
            Value::Array(self.related.iter().map(checksum_value).collect()),
        );
        dict.insert("subject".to_string(), Value::String(self.subject.clone()));
        dict.insert("body".to_string(), Value::String(self.body.clone()));
        dict.insert("timestamp".to_string(), Value::Timestamp(self.timestamp));
        dict.insert("root_content".to_string(), checksum_value(&self.root_content));
        dict.insert("root_meta".to_string(), checksum_value(&self.root_meta));
        to_vec(&Value::Dict(dict))
    }

    pub fn from_bytes(bytes: &[u8]) -> RepoResult<Self> {
        let value = from_slice(bytes)?;
        let dict = expect_dict(&value)?;
        let metadata = dict
            .get("metadata")
            .and_then(Value::as_dict)
            .cloned()
            .unwrap_or_default();
        let parent_value = dict
            .get("parent")
            .ok_or_else(|| RepoError::CorruptState("commit missing parent".to_string()))?;
        let parent = match parent_value {
            Value::Bytes(bytes) if bytes.is_empty() => None,
            other => Some(checksum_from_value(other)?),
        };
        let related = dict
            .get("related")
            .and_then(Value::as_array)
            .ok_or_else(|| RepoError::CorruptState("commit missing related".to_string()))?
            .iter()
            .map(checksum_from_value)
            .collect::<RepoResult<Vec<_>>>()?;
        Ok(Commit {
            metadata,
            parent,
            related,
            subject: expect_string(dict, "subject")?,
            body: expect_string(dict, "body")?,
            timestamp: dict
                .get("timestamp")
                .and_then(Value::as_timestamp)
                .ok_or_else(|| RepoError::CorruptState("commit missing timestamp".to_string()))?,
            root_content: checksum_from_value(
                dict.get("root_content")
                    .ok_or_else(|| RepoError::CorruptState("commit missing root_content".to_string()))?,
            )?,
            root_meta: checksum_from_value(
                dict.get("root_meta")
                    .ok_or_else(|| RepoError::CorruptState("commit missing root_meta".to_string()))?,
            )?,
        })
    }
}

fn checksum_value(checksum: &Checksum) -> Value {
    Value::Bytes(checksum.as_bytes().to_vec())
}

fn checksum_from_value(value: &Value) -> RepoResult<Checksum> {
    let bytes = value
        .as_bytes()
        .ok_or_else(|| RepoError::CorruptState("expected a checksum byte string".to_string()))?;
    let array: [u8; crate::checksum::CHECKSUM_BYTES] = bytes
        .try_into()
        .map_err(|_| RepoError::CorruptState("checksum has wrong length".to_string()))?;
    Ok(Checksum::from_bytes(array))
}

fn xattrs_to_value(xattrs: &XattrMap) -> Value {
    let dict = xattrs
        .iter()
        .map(|(name, value)| (name.clone(), Value::Bytes(value.clone())))
        .collect();
    Value::Dict(dict)
}

fn xattrs_from_value(value: &Value) -> RepoResult<XattrMap> {
    let dict = expect_dict(value)?;
    dict.iter()
        .map(|(name, value)| {
            let bytes = value
                .as_bytes()
                .ok_or_else(|| RepoError::CorruptState("xattr value not bytes".to_string()))?;
            Ok((name.clone(), bytes.to_vec()))
        })
        .collect()
}

fn expect_dict(value: &Value) -> RepoResult<&BTreeMap<String, Value>> {
    value
        .as_dict()
        .ok_or_else(|| RepoError::CorruptState("expected a dictionary".to_string()))
}

fn expect_uint(dict: &BTreeMap<String, Value>, key: &str) -> RepoResult<u64> {
    dict.get(key)
        .and_then(Value::as_uint)
        .ok_or_else(|| RepoError::CorruptState(format!("missing or invalid integer field {key:?}")))
}

fn expect_string(dict: &BTreeMap<String, Value>, key: &str) -> RepoResult<String> {
    dict.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RepoError::CorruptState(format!("missing or invalid string field {key:?}")))
}

fn expect_string_value(value: &Value) -> RepoResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RepoError::CorruptState("expected a string".to_string()))
}
