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

//! A content-addressed filesystem-tree repository: an object store keyed
//! by SHA-256 checksum, a staging pipeline that turns a directory or an
//! archive stream into an immutable commit, a checkout engine that
//! materializes a commit back onto disk (hardlinking from the store where
//! the repository mode allows it), and a flat-file ref store on top.

pub mod cancellation;
pub mod checksum;
pub mod checkout;
pub mod config;
pub mod devino_cache;
pub mod error;
pub mod file_util;
pub mod mutable_tree;
pub mod object_store;
pub mod objects;
pub mod ref_store;
pub mod repo;
pub mod repo_path;
pub mod serialization;
pub mod staging;

pub use cancellation::CancellationToken;
pub use checksum::Checksum;
pub use checkout::CheckoutOptions;
pub use checkout::CheckoutStats;
pub use checkout::OverwriteMode;
pub use checkout::PermissionMode;
pub use checkout::checkout;
pub use config::RepoConfig;
pub use config::RepoMode;
pub use error::RepoError;
pub use error::RepoResult;
pub use objects::Commit;
pub use objects::DirMeta;
pub use objects::DirTree;
pub use objects::FileHeader;
pub use objects::ObjectKind;
pub use repo::Repo;
pub use repo_path::RepoPathBuf;
pub use repo_path::RepoPathComponent;
pub use staging::ArchiveEntries;
pub use staging::ArchiveEntry;
pub use staging::ArchiveEntryKind;
pub use staging::CommitFilter;
pub use staging::FileMode;
pub use staging::FilterDecision;
