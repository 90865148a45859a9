//! End-to-end behavior of an open store
//!
//! Covers:
//! 1. Commit then read back a nested value at and before its serial
//! 2. Frozen value invariants on nested containers
//! 3. Atomic visibility of keys and blobs, across reopen
//! 4. Pool shutdown ordering with real workers

use depot::{
    freeze, is_frozen, is_sequence, thaw, Error, KeyFs, Mapping, Result, Sequence, Set, ThreadPool,
    Value, ValueKind, Worker, WorkerHandle,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn package_value() -> Value {
    let tags: Set = ["x", "y"].into_iter().map(Value::from).collect();
    let mut m = Mapping::new();
    m.insert("name", "pkg1").unwrap();
    m.insert("tags", tags).unwrap();
    Value::Map(m)
}

#[test]
fn test_commit_and_read_back_nested_value() {
    let dir = TempDir::new().unwrap();
    let keyfs = KeyFs::open(dir.path()).unwrap();
    let spec = keyfs
        .add_key("PACKAGE", "{name}/.meta", ValueKind::Map)
        .unwrap();
    let key = spec.key(&[("name", "pkg1")]).unwrap();
    let other = keyfs
        .add_key("MARK", "mark", ValueKind::Int)
        .unwrap()
        .plain()
        .unwrap();
    keyfs.write(|tx| tx.set(&other, 1)).unwrap();

    let (_, serial) = keyfs.write(|tx| tx.set(&key, package_value())).unwrap();
    let n = serial.unwrap();
    assert_eq!(n, 2);

    let at_n = keyfs.begin_read_at(n).unwrap();
    let value = at_n.get(&key).unwrap().unwrap();
    assert!(value.is_frozen());
    assert_eq!(value, package_value());
    assert!(matches!(value.get_str("tags"), Some(Value::Set(_))));

    let before = keyfs.begin_read_at(n - 1).unwrap();
    assert!(before.get(&key).unwrap().is_none());
    assert_eq!(
        keyfs.begin_read().unwrap().keys_with_name(&spec).unwrap().len(),
        1
    );
}

#[test]
fn test_frozen_value_invariants() {
    let mut m = Mapping::new();
    m.insert(1, Sequence::new()).unwrap();
    let frozen = freeze(Value::Map(m));

    let item = frozen.get(&Value::Int(1)).unwrap();
    assert_eq!(item, &Value::Seq(Sequence::new()));
    assert!(is_frozen(item));
    assert!(is_sequence(item));

    let mut nested = item.clone();
    let err = nested.as_seq_mut().unwrap().push(1).unwrap_err();
    assert_eq!(err.to_string(), "cannot append to a frozen sequence");

    let mut copy = thaw(item);
    copy.as_seq_mut().unwrap().push(1).unwrap();
    assert_ne!(&copy, item);
    assert_eq!(item, &Value::Seq(Sequence::new()));
}

#[test]
fn test_keys_and_blobs_visible_together() {
    let dir = TempDir::new().unwrap();
    {
        let keyfs = KeyFs::open(dir.path()).unwrap();
        let key = keyfs
            .add_key("FILE", "{name}/.entry", ValueKind::Map)
            .unwrap()
            .key(&[("name", "pkg1-1.0.tar.gz")])
            .unwrap();

        let rx = keyfs.begin_read().unwrap();
        let mut tx = keyfs.begin_write().unwrap();
        tx.set_bytes("+files/pkg1-1.0.tar.gz", b"tarball").unwrap();
        let mut entry = Mapping::new();
        entry.insert("path", "+files/pkg1-1.0.tar.gz").unwrap();
        tx.set(&key, entry).unwrap();
        assert!(!rx.file_exists("+files/pkg1-1.0.tar.gz").unwrap());
        tx.commit().unwrap();

        let rx = keyfs.begin_read().unwrap();
        assert!(rx.exists(&key).unwrap());
        assert_eq!(
            rx.read_file("+files/pkg1-1.0.tar.gz").unwrap().unwrap(),
            b"tarball"
        );
    }

    let keyfs = KeyFs::open(dir.path()).unwrap();
    assert_eq!(keyfs.current_serial(), 1);
    let mut tx = keyfs.begin_write().unwrap();
    tx.delete_file("+files/pkg1-1.0.tar.gz").unwrap();
    assert_eq!(tx.commit().unwrap(), Some(2));
    assert!(!dir.path().join("+files/pkg1-1.0.tar.gz").exists());
}

#[test]
fn test_aborted_write_leaves_no_temp_files() {
    let dir = TempDir::new().unwrap();
    let keyfs = KeyFs::open(dir.path()).unwrap();
    let result: Result<((), Option<u64>)> = keyfs.write(|tx| {
        tx.set_bytes("+files/a", b"a")?;
        tx.set_bytes("+files/b", b"b")?;
        Err(Error::InvalidOperation("upload rejected".into()))
    });
    assert!(result.is_err());
    let staged: Vec<_> = std::fs::read_dir(dir.path().join("+files"))
        .map(|rd| rd.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(staged.is_empty());
    assert_eq!(keyfs.current_serial(), 0);
}

struct Recording {
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Worker for Recording {
    fn name(&self) -> &str {
        self.name
    }

    fn run(&self, handle: &WorkerHandle) -> Result<()> {
        loop {
            handle.sleep(Duration::from_secs(60))?;
        }
    }

    fn on_shutdown(&self) {
        self.log.lock().push(self.name);
    }
}

#[test]
fn test_pool_shutdown_runs_hooks_in_reverse_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pool = ThreadPool::new();
    for name in ["A", "B"] {
        pool.register(Arc::new(Recording {
            name,
            log: Arc::clone(&log),
        }))
        .unwrap();
    }
    pool.live(|_| Ok(())).unwrap();
    assert_eq!(*log.lock(), vec!["B", "A"]);
    assert!(pool.take_fatal_error().is_none());
}
