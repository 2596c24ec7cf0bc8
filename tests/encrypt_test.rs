mod common;

use common::*;
use snapvault::catalog::types::ROOT_PARENT;
use snapvault::catalog::CatalogRead;
use snapvault::crypto::{CryptoParams, KeySet};
use snapvault::recover::{RecoverOptions, SnapshotSelector};
use snapvault::repo::Repository;
use std::fs;
use std::path::Path;

fn test_keys(passphrase: &str) -> KeySet {
    KeySet::derive(passphrase, "testclient", &CryptoParams { iterations: 64 })
}

fn encrypted_repo(passphrase: &str) -> TestRepo {
    let mut fx = plain_repo();
    fx.repo.set_keys(Some(test_keys(passphrase)));
    fx
}

/// Every regular file below `dir`, recursively.
fn files_under(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_owned()];
    while let Some(d) = stack.pop() {
        for entry in fs::read_dir(&d).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn s4_no_plaintext_on_disk_and_key_separation() {
    let mut fx = encrypted_repo("key-K");
    let bset = fx
        .repo
        .catalog_mut()
        .begin_snapshot("s1", "session-1", 0, None)
        .unwrap();
    let digest = store_file(&mut fx.repo, bset, ROOT_PARENT, "secret.txt", 2, b"s3cret");
    fx.repo.catalog_mut().complete_snapshot(bset).unwrap();

    // No file under the blob cache contains the plaintext, and the stored
    // name is not the plaintext either.
    for path in files_under(fx.repo.cache().root()) {
        let bytes = fs::read(&path).unwrap();
        assert!(!contains(&bytes, b"s3cret"), "plaintext leaked into {path:?}");
    }
    let names = fx.repo.catalog().list_names().unwrap();
    assert_eq!(names.len(), 1);
    assert_ne!(names[0].1, "secret.txt");

    // Recovery with key K yields the plaintext.
    let out = fx.dir.path().join("out");
    fs::create_dir_all(&out).unwrap();
    let opts = RecoverOptions {
        output: Some(out.clone()),
        set_perms: false,
        ..RecoverOptions::default()
    };
    let failures = fx
        .repo
        .recoverer(opts)
        .recover(&["secret.txt".into()], &SnapshotSelector::Latest)
        .unwrap();
    assert_eq!(failures, 0);
    assert_eq!(fs::read(out.join("secret.txt")).unwrap(), b"s3cret");

    // Recovery with key K' fails to decrypt.
    let root = fx.repo.root().to_owned();
    let wrong = Repository::open_with_keys(&root, Some(test_keys("key-Kprime"))).unwrap();
    let regen = wrong.regenerator();
    let err = regen.recover_verified(&digest).unwrap_err();
    match err {
        snapvault::Error::Crypto(snapvault::CryptoError::Decrypt) => {}
        other => panic!("expected a decrypt failure, got {other:?}"),
    }
}

#[test]
fn encrypted_names_resolve_paths() {
    let mut fx = encrypted_repo("key-K");
    let bset = fx
        .repo
        .catalog_mut()
        .begin_snapshot("s1", "session-1", 0, None)
        .unwrap();
    store_dir(&mut fx.repo, bset, ROOT_PARENT, "etc", 3);
    store_file(&mut fx.repo, bset, (3, 1), "passwd", 4, b"root:x:0:0");
    fx.repo.catalog_mut().complete_snapshot(bset).unwrap();

    // Path lookup goes through component-wise encryption.
    let keys = test_keys("key-K");
    let stored = keys.encrypt_path(Path::new("etc/passwd"));
    let hit = fx.repo.catalog().file_by_path(&stored, bset).unwrap().unwrap();
    assert_eq!(hit.inode, 4);

    // End to end: recover the directory, decrypted names come back.
    let out = fx.dir.path().join("out");
    fs::create_dir_all(&out).unwrap();
    let opts = RecoverOptions {
        output: Some(out.clone()),
        set_perms: false,
        ..RecoverOptions::default()
    };
    let failures = fx
        .repo
        .recoverer(opts)
        .recover(&["etc".into()], &SnapshotSelector::Latest)
        .unwrap();
    assert_eq!(failures, 0);
    assert_eq!(fs::read(out.join("etc/passwd")).unwrap(), b"root:x:0:0");
}

#[test]
fn encrypted_delta_chain_round_trips() {
    let mut fx = encrypted_repo("key-K");
    let bset = fx
        .repo
        .catalog_mut()
        .begin_snapshot("s1", "session-1", 0, None)
        .unwrap();

    let v1: Vec<u8> = (0..300_000u32).map(|i| (i % 199) as u8).collect();
    let mut v2 = v1.clone();
    v2[150_000..150_010].copy_from_slice(b"0123456789");

    let d1 = fx.repo.store_blob(&v1, None, true).unwrap();
    let d2 = fx.repo.store_blob(&v2, Some(&d1), true).unwrap();
    let mut spec = file_spec("evolving", 2, v2.len() as i64);
    spec.checksum = Some(d2.clone());
    fx.repo.catalog_mut().insert_file(&spec, ROOT_PARENT, bset).unwrap();
    fx.repo.catalog_mut().complete_snapshot(bset).unwrap();

    let info = fx.repo.catalog().checksum_info(&d2).unwrap().unwrap();
    assert!(info.encrypted);
    assert!(info.compressed);
    assert_eq!(info.chain_length, 1);

    let out = fx.dir.path().join("out");
    fs::create_dir_all(&out).unwrap();
    let opts = RecoverOptions {
        output: Some(out.clone()),
        set_perms: false,
        ..RecoverOptions::default()
    };
    let failures = fx
        .repo
        .recoverer(opts)
        .recover(&["evolving".into()], &SnapshotSelector::Latest)
        .unwrap();
    assert_eq!(failures, 0);
    assert_eq!(fs::read(out.join("evolving")).unwrap(), v2);
}
