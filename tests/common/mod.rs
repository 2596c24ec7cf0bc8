//! Shared fixtures: build small repositories the way the backup client does —
//! snapshot, blobs, file records, completion.

#![allow(dead_code)]

use snapvault::catalog::types::{FileSpec, NodeId, ROOT_PARENT};
use snapvault::repo::Repository;

pub struct TestRepo {
    pub dir:  tempfile::TempDir,
    pub repo: Repository,
}

pub fn plain_repo() -> TestRepo {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::create(dir.path().join("repo")).unwrap();
    TestRepo { dir, repo }
}

pub fn file_spec(name: &str, inode: u64, content_len: i64) -> FileSpec {
    FileSpec {
        name: name.to_owned(),
        inode,
        device: 1,
        size: content_len,
        mtime: 1_700_000_000,
        ctime: 1_700_000_000,
        atime: 1_700_000_000,
        mode: 0o644,
        nlinks: 1,
        ..FileSpec::default()
    }
}

pub fn dir_spec(name: &str, inode: u64) -> FileSpec {
    FileSpec {
        name: name.to_owned(),
        inode,
        device: 1,
        is_dir: true,
        mtime: 1_700_000_000,
        ctime: 1_700_000_000,
        atime: 1_700_000_000,
        mode: 0o755,
        nlinks: 2,
        ..FileSpec::default()
    }
}

/// Store content and insert its file record in one go.  Names are converted
/// to the stored form, so the same helper works for encrypted repositories.
pub fn store_file(
    repo: &mut Repository,
    bset: i64,
    parent: NodeId,
    name: &str,
    inode: u64,
    content: &[u8],
) -> String {
    let digest = repo.store_blob(content, None, false).unwrap();
    let mut spec = file_spec(&repo.stored_name(name), inode, content.len() as i64);
    spec.checksum = Some(digest.clone());
    repo.catalog_mut().insert_file(&spec, parent, bset).unwrap();
    digest
}

pub fn store_dir(repo: &mut Repository, bset: i64, parent: NodeId, name: &str, inode: u64) {
    let spec = dir_spec(&repo.stored_name(name), inode);
    repo.catalog_mut().insert_file(&spec, parent, bset).unwrap();
}

/// The standard S1 tree: `{a.txt = "hello", sub/b.txt = "world"}`.
pub fn build_s1_tree(repo: &mut Repository) -> i64 {
    let bset = repo.begin_snapshot("s1", 0).unwrap();
    store_file(repo, bset, ROOT_PARENT, "a.txt", 2, b"hello");
    store_dir(repo, bset, ROOT_PARENT, "sub", 3);
    store_file(repo, bset, (3, 1), "b.txt", 4, b"world");
    repo.catalog_mut().complete_snapshot(bset).unwrap();
    bset
}
