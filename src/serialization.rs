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

//! A small, self-describing tagged binary format used for every metadata
//! object and file header.
//!
//! Fixed-width integers are little-endian, except a timestamp, which is
//! encoded big-endian per the commit object format. Every value is
//! prefixed with a one-byte tag so a reader can walk a buffer without
//! external schema knowledge, which is what lets [`crate::objects`]
//! validate a buffer's shape before trusting its fields.

use std::collections::BTreeMap;
use std::io;
use std::io::Read;
use std::io::Write;

use crate::error::RepoError;
use crate::error::RepoResult;

const TAG_UINT: u8 = 1;
const TAG_TIMESTAMP_BE: u8 = 2;
const TAG_BYTES: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_ARRAY: u8 = 5;
const TAG_DICT: u8 = 6;

/// A decoded value in the tagged format. Dictionaries preserve insertion
/// order on write but are read back into a sorted map, since every
/// consumer in this crate looks values up by key rather than iterating in
/// original order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    UInt(u64),
    Timestamp(u64),
    Bytes(Vec<u8>),
    String(String),
    Array(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<u64> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(v) => Some(v),
            _ => None,
        }
    }
}

pub fn write_value<W: Write>(w: &mut W, value: &Value) -> io::Result<()> {
    match value {
        Value::UInt(v) => {
            w.write_all(&[TAG_UINT])?;
            w.write_all(&v.to_le_bytes())
        }
        Value::Timestamp(v) => {
            w.write_all(&[TAG_TIMESTAMP_BE])?;
            w.write_all(&v.to_be_bytes())
        }
        Value::Bytes(bytes) => {
            w.write_all(&[TAG_BYTES])?;
            w.write_all(&(bytes.len() as u32).to_le_bytes())?;
            w.write_all(bytes)
        }
        Value::String(s) => {
            w.write_all(&[TAG_STRING])?;
            let bytes = s.as_bytes();
            w.write_all(&(bytes.len() as u32).to_le_bytes())?;
            w.write_all(bytes)
        }
        Value::Array(items) => {
            w.write_all(&[TAG_ARRAY])?;
            w.write_all(&(items.len() as u32).to_le_bytes())?;
            for item in items {
                write_value(w, item)?;
            }
            Ok(())
        }
        Value::Dict(map) => {
            w.write_all(&[TAG_DICT])?;
            w.write_all(&(map.len() as u32).to_le_bytes())?;
            for (key, val) in map {
                write_value(w, &Value::String(key.clone()))?;
                write_value(w, val)?;
            }
            Ok(())
        }
    }
}

pub fn read_value<R: Read>(r: &mut R) -> RepoResult<Value> {
    let mut tag = [0u8; 1];
    read_exact(r, &mut tag)?;
    match tag[0] {
        TAG_UINT => {
            let mut buf = [0u8; 8];
            read_exact(r, &mut buf)?;
            Ok(Value::UInt(u64::from_le_bytes(buf)))
        }
        TAG_TIMESTAMP_BE => {
            let mut buf = [0u8; 8];
            read_exact(r, &mut buf)?;
            Ok(Value::Timestamp(u64::from_be_bytes(buf)))
        }
        TAG_BYTES => {
            let len = read_u32_le(r)?;
            let mut buf = vec![0u8; len as usize];
            read_exact(r, &mut buf)?;
            Ok(Value::Bytes(buf))
        }
        TAG_STRING => {
            let len = read_u32_le(r)?;
            let mut buf = vec![0u8; len as usize];
            read_exact(r, &mut buf)?;
            let s = String::from_utf8(buf)
                .map_err(|_| RepoError::CorruptState("invalid utf-8 string".to_string()))?;
            Ok(Value::String(s))
        }
        TAG_ARRAY => {
            let len = read_u32_le(r)?;
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(read_value(r)?);
            }
            Ok(Value::Array(items))
        }
        TAG_DICT => {
            let len = read_u32_le(r)?;
            let mut map = BTreeMap::new();
            for _ in 0..len {
                let key = match read_value(r)? {
                    Value::String(s) => s,
                    _ => return Err(RepoError::CorruptState("dict key must be a string".to_string())),
                };
                let value = read_value(r)?;
                map.insert(key, value);
            }
            Ok(Value::Dict(map))
        }
        other => Err(RepoError::CorruptState(format!("unknown tag byte {other}"))),
    }
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> RepoResult<()> {
    r.read_exact(buf)
        .map_err(|e| RepoError::CorruptState(format!("truncated serialization: {e}")))
}

fn read_u32_le<R: Read>(r: &mut R) -> RepoResult<u32> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Serializes `value` into a freshly allocated buffer.
pub fn to_vec(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    write_value(&mut buf, value).expect("writing to a Vec cannot fail");
    buf
}

/// Deserializes a single value, requiring that it consume the entire
/// buffer (trailing bytes are treated as corruption).
pub fn from_slice(data: &[u8]) -> RepoResult<Value> {
    let mut cursor = io::Cursor::new(data);
    let value = read_value(&mut cursor)?;
    if (cursor.position() as usize) != data.len() {
        return Err(RepoError::CorruptState(
            "trailing bytes after serialized value".to_string(),
        ));
    }
    Ok(value)
}
