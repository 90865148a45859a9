//! Background workers against real stores
//!
//! Covers:
//! 1. Notification delivery through the pool, in serial order
//! 2. Resuming notifications after a restart
//! 3. A replica following a primary through the puller worker
//! 4. Workers leaving on a backend outage, and hooks that call back into
//!    the pool during shutdown

use depot_core::{Error, KeySpec, Mapping, Result, Serial, Value, ValueKind};
use depot_engine::{
    ChangeSource, KeyChangeEvent, KeyFs, ReplicaPuller, ThreadPool, Worker, WorkerHandle,
    WorkerState,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn register(keyfs: &KeyFs) -> KeySpec {
    keyfs
        .add_key("PROJECT", "{user}/{name}/.config", ValueKind::Map)
        .unwrap()
}

fn config(version: i64) -> Value {
    let mut m = Mapping::new();
    m.insert("version", version).unwrap();
    Value::Map(m)
}

fn write_project(keyfs: &KeyFs, spec: &KeySpec, name: &str, version: i64) -> Serial {
    let key = spec.key(&[("user", "alice"), ("name", name)]).unwrap();
    keyfs
        .write(|tx| tx.set(&key, config(version)))
        .unwrap()
        .1
        .unwrap()
}

type Seen = Arc<Mutex<Vec<(Serial, String, Option<Serial>)>>>;

fn recorder(keyfs: &KeyFs) -> Seen {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    keyfs
        .notifier()
        .on_key_change(
            "PROJECT",
            Arc::new(move |ev: &KeyChangeEvent| -> Result<()> {
                sink.lock().push((
                    ev.at_serial,
                    ev.key.param("name").unwrap_or_default().to_string(),
                    ev.back_serial,
                ));
                Ok(())
            }),
        )
        .unwrap();
    seen
}

#[test]
fn test_notifications_delivered_in_order() {
    let dir = TempDir::new().unwrap();
    let keyfs = KeyFs::open(dir.path()).unwrap();
    let spec = register(&keyfs);
    let seen = recorder(&keyfs);

    let pool = ThreadPool::new();
    pool.register(keyfs.notifier().clone()).unwrap();
    pool.live(|pool| {
        assert_eq!(pool.state("notifications"), Some(WorkerState::Running));
        write_project(&keyfs, &spec, "web", 1);
        write_project(&keyfs, &spec, "cli", 1);
        let last = write_project(&keyfs, &spec, "web", 2);
        assert!(keyfs.notifier().wait_event_serial(last, WAIT));
        Ok(())
    })
    .unwrap();

    assert_eq!(
        *seen.lock(),
        vec![
            (1, "web".to_string(), None),
            (2, "cli".to_string(), None),
            (3, "web".to_string(), Some(1)),
        ]
    );
    assert_eq!(pool.state("notifications"), Some(WorkerState::Stopped));
    assert!(pool.take_fatal_error().is_none());
}

#[test]
fn test_notifications_resume_after_restart() {
    let dir = TempDir::new().unwrap();
    {
        let keyfs = KeyFs::open(dir.path()).unwrap();
        let spec = register(&keyfs);
        let seen = recorder(&keyfs);
        write_project(&keyfs, &spec, "a", 1);
        keyfs.notifier().process_pending().unwrap();
        assert_eq!(seen.lock().len(), 1);
        write_project(&keyfs, &spec, "b", 1);
    }

    let keyfs = KeyFs::open(dir.path()).unwrap();
    register(&keyfs);
    let seen = recorder(&keyfs);
    assert_eq!(keyfs.notifier().read_event_serial(), 1);
    keyfs.notifier().process_pending().unwrap();
    assert_eq!(*seen.lock(), vec![(2, "b".to_string(), None)]);
}

#[test]
fn test_replica_follows_primary() {
    let primary_dir = TempDir::new().unwrap();
    let replica_dir = TempDir::new().unwrap();
    let primary = KeyFs::open(primary_dir.path()).unwrap();
    let replica = KeyFs::open(replica_dir.path()).unwrap();
    let spec = register(&primary);
    register(&replica);

    write_project(&primary, &spec, "web", 1);
    let key = spec.key(&[("user", "alice"), ("name", "web")]).unwrap();
    primary.write(|tx| tx.delete(&key)).unwrap();
    let last = write_project(&primary, &spec, "web", 3);

    let pool = ThreadPool::new();
    let source: Arc<dyn ChangeSource> = Arc::new(primary.clone());
    pool.start_one(Arc::new(ReplicaPuller::new(
        replica.clone(),
        source,
        Duration::from_millis(5),
    )))
    .unwrap();
    assert!(replica.wait_for_serial(last, WAIT).unwrap());
    pool.shutdown();
    assert!(pool.take_fatal_error().is_none());

    let rx = replica.begin_read().unwrap();
    assert_eq!(rx.get(&key).unwrap().unwrap(), config(3));
    let serials: Vec<_> = rx.history(&key).unwrap().iter().map(|v| v.serial).collect();
    assert_eq!(serials, vec![3, 2, 1]);
    assert!(rx.history(&key).unwrap()[1].is_tombstone());
}

#[test]
fn test_import_refuses_gap() {
    let primary_dir = TempDir::new().unwrap();
    let replica_dir = TempDir::new().unwrap();
    let primary = KeyFs::open(primary_dir.path()).unwrap();
    let replica = KeyFs::open(replica_dir.path()).unwrap();
    let spec = register(&primary);
    write_project(&primary, &spec, "a", 1);
    write_project(&primary, &spec, "b", 1);

    let delta = primary.export_changes(2).unwrap();
    let err = replica.import_changes(2, &delta).unwrap_err();
    assert!(matches!(
        err,
        Error::ReplicationGap {
            expected: 1,
            actual: 2
        }
    ));
    replica
        .import_changes(1, &primary.export_changes(1).unwrap())
        .unwrap();
    replica.import_changes(2, &delta).unwrap();
    assert_eq!(replica.current_serial(), 2);
}

/// Reads the store once, then reports the backend as gone
struct OutageWorker {
    keyfs: KeyFs,
    hooked: AtomicBool,
}

impl Worker for OutageWorker {
    fn name(&self) -> &str {
        "outage"
    }

    fn run(&self, handle: &WorkerHandle) -> Result<()> {
        handle.exit_if_shutdown()?;
        self.keyfs.begin_read()?;
        Err(Error::unavailable("connection refused"))
    }

    fn on_shutdown(&self) {
        self.hooked.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_backend_outage_runs_shutdown_hook() {
    let dir = TempDir::new().unwrap();
    let keyfs = KeyFs::open(dir.path()).unwrap();
    let worker = Arc::new(OutageWorker {
        keyfs: keyfs.clone(),
        hooked: AtomicBool::new(false),
    });

    let pool = ThreadPool::new();
    pool.start_one(worker.clone()).unwrap();
    let deadline = Instant::now() + WAIT;
    while pool.state("outage") != Some(WorkerState::Stopped) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(pool.state("outage"), Some(WorkerState::Stopped));
    assert!(worker.hooked.load(Ordering::SeqCst));
    assert!(!pool.is_shutting_down());

    pool.shutdown();
    assert!(pool.take_fatal_error().is_none());
}

/// Looks at the pool from inside its own shutdown hook
struct Inspector {
    pool: Mutex<Weak<ThreadPool>>,
    seen: Mutex<Option<(Option<WorkerState>, bool)>>,
}

impl Worker for Inspector {
    fn name(&self) -> &str {
        "inspector"
    }

    fn run(&self, handle: &WorkerHandle) -> Result<()> {
        loop {
            handle.sleep(Duration::from_secs(60))?;
        }
    }

    fn on_shutdown(&self) {
        let Some(pool) = self.pool.lock().upgrade() else {
            return;
        };
        let state = pool.state("inspector");
        let late = Arc::new(Inspector {
            pool: Mutex::new(Weak::new()),
            seen: Mutex::new(None),
        });
        let registered = pool.register(late).is_ok();
        *self.seen.lock() = Some((state, registered));
    }
}

#[test]
fn test_shutdown_hook_can_call_back_into_pool() {
    let pool = Arc::new(ThreadPool::new());
    let inspector = Arc::new(Inspector {
        pool: Mutex::new(Arc::downgrade(&pool)),
        seen: Mutex::new(None),
    });
    pool.start_one(inspector.clone()).unwrap();

    pool.shutdown();
    assert_eq!(
        *inspector.seen.lock(),
        Some((Some(WorkerState::ShuttingDown), true))
    );
    assert_eq!(pool.state("inspector"), Some(WorkerState::Stopped));
    assert_eq!(pool.states().len(), 2);
    assert!(pool.take_fatal_error().is_none());
}
