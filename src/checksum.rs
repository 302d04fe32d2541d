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

//! The content address used to name every object in the store.
//!
//! A [`Checksum`] is the SHA-256 digest of an object's canonical serialized
//! form (see [`crate::serialization`]). It is always displayed and parsed
//! as 64 lowercase hex characters.

use std::fmt;
use std::io;
use std::io::Write as _;

use sha2::Digest as _;
use sha2::Sha256;

pub const CHECKSUM_BYTES: usize = 32;
pub const CHECKSUM_HEX_LEN: usize = CHECKSUM_BYTES * 2;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checksum([u8; CHECKSUM_BYTES]);

impl Checksum {
    pub fn from_bytes(bytes: [u8; CHECKSUM_BYTES]) -> Self {
        Checksum(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHECKSUM_BYTES] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character lowercase hex string.
    pub fn parse(s: &str) -> Option<Self> {
        if !looks_like_checksum(s) {
            return None;
        }
        let bytes = hex::decode(s).ok()?;
        let array: [u8; CHECKSUM_BYTES] = bytes.try_into().ok()?;
        Some(Checksum(array))
    }

    /// The two-character directory component and the remaining 62-character
    /// filename component used for loose object storage (`objects/XX/YYYY…`).
    pub fn split_for_path(&self) -> (String, String) {
        let hex = self.hex();
        let (dir, rest) = hex.split_at(2);
        (dir.to_string(), rest.to_string())
    }
}

/// Returns true if `s` is syntactically a valid checksum: exactly
/// [`CHECKSUM_HEX_LEN`] lowercase hex digits.
pub fn looks_like_checksum(s: &str) -> bool {
    s.len() == CHECKSUM_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.hex())
    }
}

/// A streaming SHA-256 hasher that also implements [`io::Write`], so content
/// can be hashed while it is copied to a temporary file in a single pass.
#[derive(Default)]
pub struct ChecksumWriter {
    hasher: Sha256,
}

impl ChecksumWriter {
    pub fn new() -> Self {
        ChecksumWriter {
            hasher: Sha256::new(),
        }
    }

    pub fn finish(self) -> Checksum {
        let digest = self.hasher.finalize();
        let mut bytes = [0u8; CHECKSUM_BYTES];
        bytes.copy_from_slice(&digest);
        Checksum(bytes)
    }
}

impl io::Write for ChecksumWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hashes a complete in-memory buffer in one call.
pub fn checksum_bytes(data: &[u8]) -> Checksum {
    let mut writer = ChecksumWriter::new();
    writer.write_all(data).expect("writing to a hasher cannot fail");
    writer.finish()
}
