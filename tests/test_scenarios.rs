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

//! Black-box scenarios exercising a whole stage-commit-checkout cycle
//! through the public API, one test per scenario.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::os::unix::fs::MetadataExt as _;

use fsrepo::CancellationToken;
use fsrepo::CheckoutOptions;
use fsrepo::OverwriteMode;
use fsrepo::PermissionMode;
use fsrepo::RepoMode;
use fsrepo::checkout;
use fsrepo::checksum::checksum_bytes;
use fsrepo::objects::DirTree;
use fsrepo::objects::FileHeader;
use fsrepo::objects::ObjectKind;
use fsrepo::objects::S_IFREG;
use fsrepo::objects::XattrMap;
use fsrepo::repo::Repo;
use fsrepo::repo_path::RepoPathBuf;

fn current_owner() -> (u32, u32) {
    let uid = rustix::process::getuid().as_raw();
    let gid = rustix::process::getgid().as_raw();
    (uid, gid)
}

fn default_dir_meta() -> fsrepo::DirMeta {
    let (uid, gid) = current_owner();
    fsrepo::DirMeta {
        uid,
        gid,
        mode: 0o755,
        xattrs: XattrMap::new(),
    }
}

// S1 — bare commit round-trip.
#[test]
fn test_bare_commit_round_trip() {
    let repo_dir = tempfile::tempdir().unwrap();
    let repo = Repo::init(repo_dir.path(), RepoMode::Bare).unwrap();
    let cancel = CancellationToken::new();

    let src = tempfile::tempdir().unwrap();
    fs::write(src.path().join("a"), b"hello\n").unwrap();
    fs::create_dir(src.path().join("b")).unwrap();
    std::os::unix::fs::symlink("../a", src.path().join("b").join("c")).unwrap();

    repo.begin_transaction(true).unwrap();
    let (root_content, root_meta) = repo
        .stage_directory(&RepoPathBuf::root(), src.path(), None, &cancel)
        .unwrap();
    let commit_checksum = repo
        .stage_commit(
            None,
            "init",
            "",
            BTreeMap::new(),
            vec![],
            root_content,
            root_meta,
            1_700_000_000,
            &cancel,
        )
        .unwrap();
    repo.write_ref("main", commit_checksum).unwrap();
    repo.commit_transaction();

    let out = tempfile::tempdir().unwrap();
    fs::remove_dir(out.path()).unwrap();
    let options = CheckoutOptions {
        permission_mode: PermissionMode::None,
        ..CheckoutOptions::default()
    };
    checkout(&repo, commit_checksum, out.path(), options, &cancel).unwrap();

    let a_meta = fs::metadata(out.path().join("a")).unwrap();
    assert_eq!(fs::read(out.path().join("a")).unwrap(), b"hello\n");
    assert_eq!(a_meta.mode() & 0o777, 0o644);

    let link = fs::read_link(out.path().join("b").join("c")).unwrap();
    assert_eq!(link, std::path::Path::new("../a"));

    assert_eq!(repo.resolve("main").unwrap(), commit_checksum);
}

// S2 — archive-z2 dedup.
#[test]
fn test_archive_z2_dedup() {
    let repo_dir = tempfile::tempdir().unwrap();
    let repo = Repo::init(repo_dir.path(), RepoMode::ArchiveZ2).unwrap();
    let cancel = CancellationToken::new();

    let src = tempfile::tempdir().unwrap();
    fs::create_dir(src.path().join("x")).unwrap();
    fs::create_dir(src.path().join("y")).unwrap();
    fs::write(src.path().join("x").join("f"), b"shared bytes").unwrap();
    fs::write(src.path().join("y").join("f"), b"shared bytes").unwrap();

    repo.begin_transaction(false).unwrap();
    let (root_content, _root_meta) = repo
        .stage_directory(&RepoPathBuf::root(), src.path(), None, &cancel)
        .unwrap();
    repo.commit_transaction();

    let root_tree = DirTree::from_bytes(&repo.store().load_metadata(root_content, ObjectKind::DirTree).unwrap()).unwrap();
    let mut dir_contents = BTreeMap::new();
    for (name, content, _meta) in &root_tree.dirs {
        dir_contents.insert(name.clone(), *content);
    }
    let x_tree = DirTree::from_bytes(&repo.store().load_metadata(dir_contents["x"], ObjectKind::DirTree).unwrap()).unwrap();
    let y_tree = DirTree::from_bytes(&repo.store().load_metadata(dir_contents["y"], ObjectKind::DirTree).unwrap()).unwrap();

    assert_ne!(dir_contents["x"], dir_contents["y"], "distinct dir-tree objects for /x and /y");
    assert_eq!(x_tree.files[0].1, y_tree.files[0].1, "same file object referenced from both");

    let checksum = x_tree.files[0].1;
    let (prefix, rest) = checksum.split_for_path();
    let object_path = repo.store().root().join("objects").join(&prefix).join(format!("{rest}.file"));
    assert!(object_path.exists());

    let mut seen = 0;
    for entry in fs::read_dir(repo.store().root().join("objects").join(&prefix)).unwrap() {
        let entry = entry.unwrap();
        if entry.file_name().to_string_lossy().ends_with(".file") {
            seen += 1;
        }
    }
    assert_eq!(seen, 1, "exactly one stored file object for the shared content");
}

// S3 — parent rev resolution.
#[test]
fn test_parent_rev_resolution() {
    let repo_dir = tempfile::tempdir().unwrap();
    let repo = Repo::init(repo_dir.path(), RepoMode::Bare).unwrap();
    let cancel = CancellationToken::new();

    let empty_tree_meta = default_dir_meta();
    repo.begin_transaction(false).unwrap();
    let mtree = fsrepo::mutable_tree::MutableTree::new();
    let (root_content, root_meta) = repo.stage_mutable_tree(&mtree, &empty_tree_meta, &cancel).unwrap();
    let c1 = repo
        .stage_commit(None, "c1", "", BTreeMap::new(), vec![], root_content, root_meta, 1, &cancel)
        .unwrap();
    let c2 = repo
        .stage_commit(Some(c1), "c2", "", BTreeMap::new(), vec![], root_content, root_meta, 2, &cancel)
        .unwrap();
    repo.write_ref("main", c2).unwrap();
    repo.commit_transaction();

    assert_eq!(repo.resolve("main^").unwrap(), c1);
    let err = repo.resolve("main^^").unwrap_err();
    let message = err.to_string();
    assert!(message.contains("has no parent"), "unexpected error message: {message}");
}

// S4 — corruption detection.
#[test]
fn test_corruption_detection_rejects_mismatched_checksum() {
    let repo_dir = tempfile::tempdir().unwrap();
    let repo = Repo::init(repo_dir.path(), RepoMode::Bare).unwrap();
    let cancel = CancellationToken::new();

    let header = FileHeader {
        mode: S_IFREG | 0o644,
        uid: 0,
        gid: 0,
        symlink_target: None,
        rdev: None,
        xattrs: XattrMap::new(),
    };
    let expected = checksum_bytes(b"this is not the real content");
    let mut actual_content: &[u8] = b"the real content";

    repo.begin_transaction(false).unwrap();
    let result = repo.store().insert_file(&header, Some(&mut actual_content), Some(expected), &cancel);
    repo.commit_transaction();

    let err = result.unwrap_err();
    let message = err.to_string();
    assert!(message.contains(&expected.hex()), "error should name expected checksum: {message}");

    // The real stored name is hash(header-bytes ‖ content), not hash(content)
    // alone — reconstruct it the same way the object store does so this
    // actually guards the "neither checksum is ever filed" invariant.
    let mut hasher = fsrepo::checksum::ChecksumWriter::new();
    hasher.write_all(&header.to_header_bytes()).unwrap();
    hasher.write_all(b"the real content").unwrap();
    let actual = hasher.finish();
    assert_ne!(actual, expected);
    assert!(message.contains(&actual.hex()), "error should name actual checksum: {message}");
    assert!(!repo.store().has(expected, ObjectKind::File).unwrap());
    assert!(!repo.store().has(actual, ObjectKind::File).unwrap());
}

// S5 — checkout gc.
#[test]
fn test_checkout_gc_unlinks_only_unreferenced_cache_entries() {
    let repo_dir = tempfile::tempdir().unwrap();
    let repo = Repo::init(repo_dir.path(), RepoMode::ArchiveZ2).unwrap();
    assert!(repo.config().enable_uncompressed_cache);
    let cancel = CancellationToken::new();

    let src = tempfile::tempdir().unwrap();
    fs::write(src.path().join("f"), b"cached content").unwrap();

    repo.begin_transaction(false).unwrap();
    let (root_content, root_meta) = repo
        .stage_directory(&RepoPathBuf::root(), src.path(), None, &cancel)
        .unwrap();
    let commit = repo
        .stage_commit(None, "c", "", BTreeMap::new(), vec![], root_content, root_meta, 1, &cancel)
        .unwrap();
    repo.commit_transaction();

    let out1 = tempfile::tempdir().unwrap();
    fs::remove_dir(out1.path()).unwrap();
    let out2 = tempfile::tempdir().unwrap();
    fs::remove_dir(out2.path()).unwrap();
    let options = || CheckoutOptions {
        permission_mode: PermissionMode::User,
        ..CheckoutOptions::default()
    };
    checkout(&repo, commit, out1.path(), options(), &cancel).unwrap();
    checkout(&repo, commit, out2.path(), options(), &cancel).unwrap();

    // Drop one checkout's hardlink to the cache entry; the other survives.
    fs::remove_file(out1.path().join("f")).unwrap();
    drop(out1);

    repo.checkout_gc().unwrap();

    let cache_dir = repo.uncompressed_cache_objects_dir();
    let remaining: usize = fs::read_dir(&cache_dir)
        .unwrap()
        .flatten()
        .map(|prefix| fs::read_dir(prefix.path()).map(|d| d.count()).unwrap_or(0))
        .sum();
    assert_eq!(remaining, 1, "the entry still linked from out2 must survive gc");
    assert_eq!(fs::read(out2.path().join("f")).unwrap(), b"cached content");
}

// S6 — union overwrite.
#[test]
fn test_union_overwrite_replaces_existing_file() {
    let repo_dir = tempfile::tempdir().unwrap();
    let repo = Repo::init(repo_dir.path(), RepoMode::Bare).unwrap();
    let cancel = CancellationToken::new();

    repo.begin_transaction(false).unwrap();
    let header = FileHeader {
        mode: S_IFREG | 0o644,
        uid: 0,
        gid: 0,
        symlink_target: None,
        rdev: None,
        xattrs: XattrMap::new(),
    };
    let mut content: &[u8] = b"new content";
    let checksum = repo.store().insert_file(&header, Some(&mut content), None, &cancel).unwrap();
    let mut mtree = fsrepo::mutable_tree::MutableTree::new();
    mtree.set_file(&["a"], checksum).unwrap();
    let (root_content, root_meta) = repo.stage_mutable_tree(&mtree, &default_dir_meta(), &cancel).unwrap();
    let commit = repo
        .stage_commit(None, "c", "", BTreeMap::new(), vec![], root_content, root_meta, 1, &cancel)
        .unwrap();
    repo.commit_transaction();

    let out = tempfile::tempdir().unwrap();
    fs::write(out.path().join("a"), b"old content").unwrap();

    let options = CheckoutOptions {
        overwrite_mode: OverwriteMode::UnionFiles,
        ..CheckoutOptions::default()
    };
    checkout(&repo, commit, out.path(), options, &cancel).unwrap();

    assert_eq!(fs::read(out.path().join("a")).unwrap(), b"new content");
}
