//! Commit Recovery Tests
//!
//! These tests validate the file commit protocol across simulated crashes:
//!
//! - Replaying an intent record twice equals replaying it once
//! - Replay equals a direct apply of the same record
//! - A crash after the intent record yields the same files as a clean commit
//! - An abort before the intent record leaves no trace
//! - For random dirty sets, crash plus recovery (once or twice) equals a
//!   clean commit

use depot_durability::{
    apply_renames, recover, DirtyFileSet, FileStore, IntentLog, PendingRenames, RenamePair,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Snapshot of every regular file under `dir`, relative path -> content
fn tree(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in fs::read_dir(&d).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(dir).unwrap().to_string_lossy().into_owned();
                out.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    out
}

/// Base directory holding `final2` plus a staged `tmpA` for `final1`, and
/// an intent record `[(tmpA, final1), (null, final2)]`
fn crashed_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("files")).unwrap();
    fs::write(dir.path().join("files/final1-a-tmp"), b"new content").unwrap();
    fs::write(dir.path().join("files/final2"), b"doomed").unwrap();
    IntentLog::new(dir.path())
        .write(&PendingRenames::new(vec![
            RenamePair::rename("files/final1-a-tmp", "files/final1"),
            RenamePair::delete("files/final2"),
        ]))
        .unwrap();
    dir
}

#[test]
fn test_recovery_replays_intent() {
    let dir = crashed_dir();
    let report = recover(dir.path()).unwrap().unwrap();

    assert_eq!(report.files_commit, vec!["files/final1".to_string()]);
    assert_eq!(report.files_del, vec!["files/final2".to_string()]);

    let files = tree(dir.path());
    assert_eq!(files.len(), 1);
    assert_eq!(files["files/final1"], b"new content");
}

#[test]
fn test_recovery_is_idempotent() {
    let once = crashed_dir();
    recover(once.path()).unwrap();

    let twice = crashed_dir();
    recover(twice.path()).unwrap();
    assert!(recover(twice.path()).unwrap().is_none());

    assert_eq!(tree(once.path()), tree(twice.path()));
}

#[test]
fn test_replay_after_record_survives_second_crash() {
    // Crash after the renames landed but before the record was removed.
    let dir = crashed_dir();
    let log = IntentLog::new(dir.path());
    let renames = log.read().unwrap().unwrap();
    apply_renames(dir.path(), &renames).unwrap();
    let after_apply = tree(dir.path());

    recover(dir.path()).unwrap();
    let mut expected = after_apply;
    expected.remove(".pending-renames");
    assert_eq!(tree(dir.path()), expected);
}

#[test]
fn test_recovery_matches_direct_apply() {
    let replayed = crashed_dir();
    recover(replayed.path()).unwrap();

    let applied = crashed_dir();
    let log = IntentLog::new(applied.path());
    let renames = log.read().unwrap().unwrap();
    apply_renames(applied.path(), &renames).unwrap();
    log.clear().unwrap();

    assert_eq!(tree(replayed.path()), tree(applied.path()));
}

#[test]
fn test_crash_before_apply_equals_clean_commit() {
    let seed = |dir: &Path| {
        fs::create_dir_all(dir.join("pkg")).unwrap();
        fs::write(dir.join("pkg/old.whl"), b"old").unwrap();
    };

    let clean = TempDir::new().unwrap();
    seed(clean.path());
    let store = FileStore::open(clean.path()).unwrap();
    let mut dirty = store.begin();
    dirty.set_bytes("pkg/new.whl", b"wheel").unwrap();
    dirty.set_bytes("pkg/index.json", b"{}").unwrap();
    dirty.delete("pkg/old.whl").unwrap();
    store.commit(dirty).unwrap();

    let crashed = TempDir::new().unwrap();
    seed(crashed.path());
    let store = FileStore::open(crashed.path()).unwrap();
    let mut dirty = store.begin();
    dirty.set_bytes("pkg/new.whl", b"wheel").unwrap();
    dirty.set_bytes("pkg/index.json", b"{}").unwrap();
    dirty.delete("pkg/old.whl").unwrap();
    let prepared = store.prepare(dirty).unwrap();
    // Simulated crash: the process dies before applying.
    std::mem::forget(prepared);

    assert!(IntentLog::new(crashed.path()).exists());
    store.recover().unwrap();

    assert_eq!(tree(clean.path()), tree(crashed.path()));
}

#[test]
fn test_abort_before_intent_leaves_destinations_alone() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("existing"), b"keep me").unwrap();
    let before = tree(dir.path());

    let store = FileStore::open(dir.path()).unwrap();
    let mut dirty = store.begin();
    dirty.set_bytes("existing", b"overwrite").unwrap();
    dirty.set_bytes("a/b/c", b"new").unwrap();
    dirty.delete("existing").unwrap();
    dirty.set_bytes("d", b"new").unwrap();
    dirty.discard().unwrap();

    assert_eq!(tree(dir.path()), before);
    assert!(!IntentLog::new(dir.path()).exists());
}

#[test]
fn test_corrupt_intent_blocks_recovery() {
    let dir = crashed_dir();
    let path = dir.path().join(".pending-renames");
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    assert!(recover(dir.path()).is_err());
    // The staged file is untouched so a fixed record can still be replayed.
    assert!(dir.path().join("files/final1-a-tmp").exists());
}

const PATHS: [&str; 5] = ["a", "pkg/x.whl", "pkg/y.json", "deep/er/z", "b"];

fn seed_files(dir: &Path) {
    fs::create_dir_all(dir.join("pkg")).unwrap();
    fs::write(dir.join("a"), b"seed a").unwrap();
    fs::write(dir.join("pkg/x.whl"), b"seed x").unwrap();
}

/// One change per path: `Some` writes the bytes, `None` deletes
fn arb_dirty() -> impl Strategy<Value = BTreeMap<String, Option<Vec<u8>>>> {
    proptest::collection::btree_map(
        proptest::sample::select(PATHS.to_vec()).prop_map(|path: &str| path.to_string()),
        proptest::option::of(proptest::collection::vec(any::<u8>(), 0..32)),
        1..PATHS.len(),
    )
}

fn stage(store: &FileStore, changes: &BTreeMap<String, Option<Vec<u8>>>) -> DirtyFileSet {
    let mut dirty = store.begin();
    for (path, data) in changes {
        match data {
            Some(data) => dirty.set_bytes(path, data).unwrap(),
            None => dirty.delete(path).unwrap(),
        }
    }
    dirty
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_crash_then_recover_equals_clean_commit(changes in arb_dirty(), replays in 1usize..3) {
        let clean = TempDir::new().unwrap();
        seed_files(clean.path());
        let store = FileStore::open(clean.path()).unwrap();
        store.commit(stage(&store, &changes)).unwrap();

        let crashed = TempDir::new().unwrap();
        seed_files(crashed.path());
        let store = FileStore::open(crashed.path()).unwrap();
        let prepared = store.prepare(stage(&store, &changes)).unwrap();
        std::mem::forget(prepared);
        for _ in 0..replays {
            recover(crashed.path()).unwrap();
        }

        prop_assert!(!IntentLog::new(crashed.path()).exists());
        prop_assert_eq!(tree(clean.path()), tree(crashed.path()));
        for (path, data) in &changes {
            prop_assert_eq!(store.read(path).unwrap(), data.clone());
        }
    }
}
