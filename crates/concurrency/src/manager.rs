//! Transaction manager
//!
//! Owns the backend handle, the value cache and the published serial, and
//! hands out transactions:
//! - any number of [`ReadTransaction`]s, each pinned to a serial
//! - at most one [`WriteTransaction`] at a time
//!
//! ## Serial publication
//!
//! ```text
//! 1. Backend commit of serial N returns (durable)
//! 2. Versions written by N enter the value cache
//! 3. published = N, serial waiters wake
//! 4. Commit listeners run, in commit order
//! 5. Writer slot is released
//! ```
//!
//! A reader started before step 3 stays at N-1 and never sees cache
//! entries of N, because cache lookups only consider versions at or before
//! the reader's serial.
//!
//! Commits made by another process sharing the backend are noticed by
//! [`TransactionManager::refresh`], which drops the cache before
//! publishing the newer serial.

use crate::cache::ValueCache;
use crate::transaction::{KeyVersion, ReadTransaction, WriteTransaction};
use depot_core::{decode, Error, FrozenValue, Result, Serial};
use depot_storage::{ChangeRecord, PendingChange, StorageBackend};
use parking_lot::{Condvar, Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Tuning knobs of a [`TransactionManager`]
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Maximum number of keys in the value cache, 0 disables it
    pub cache_capacity: usize,
    /// How often serial waiters re-check the backend for commits made by
    /// other processes
    pub recheck_interval: Duration,
    /// Refuse write transactions
    pub readonly: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        ManagerOptions {
            cache_capacity: 10_000,
            recheck_interval: Duration::from_millis(500),
            readonly: false,
        }
    }
}

/// One key changed by a commit
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedKey {
    /// Key relpath
    pub relpath: String,
    /// Key family name
    pub keyname: String,
    /// Previous serial that wrote the key
    pub back_serial: Option<Serial>,
    /// New value, `None` for a deletion
    pub value: Option<FrozenValue>,
}

impl ChangedKey {
    /// Decode a stored record
    pub fn from_record(record: ChangeRecord) -> Result<Self> {
        let value = match &record.value {
            Some(bytes) => Some(FrozenValue::new(decode(bytes)?)),
            None => None,
        };
        Ok(ChangedKey {
            relpath: record.relpath,
            keyname: record.keyname,
            back_serial: record.back_serial,
            value,
        })
    }
}

/// Everything one commit changed
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    /// Serial of the commit
    pub serial: Serial,
    /// Changed keys in relpath order
    pub keys: Vec<ChangedKey>,
    /// Blobs written
    pub files_commit: Vec<String>,
    /// Blobs deleted
    pub files_del: Vec<String>,
}

/// Receives every commit made through this manager
///
/// Called on the committing thread after the serial is published and
/// before the writer slot is released, so events arrive in serial order.
pub trait CommitListener: Send + Sync {
    /// Handle one commit
    fn on_commit(&self, event: &CommitEvent);
}

impl<F> CommitListener for F
where
    F: Fn(&CommitEvent) + Send + Sync,
{
    fn on_commit(&self, event: &CommitEvent) {
        self(event)
    }
}

pub(crate) struct ManagerInner {
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) cache: ValueCache,
    options: ManagerOptions,

    /// Latest serial visible to new readers
    published: AtomicU64,
    /// Serial currently being committed by this process, 0 if none
    in_flight: AtomicU64,
    serial_lock: Mutex<()>,
    serial_changed: Condvar,

    writer_active: Mutex<bool>,
    writer_released: Condvar,

    listeners: RwLock<Vec<Arc<dyn CommitListener>>>,
}

impl ManagerInner {
    pub(crate) fn lookup(&self, relpath: &str, at: Serial) -> Result<Option<KeyVersion>> {
        if let Some(hit) = self.cache.get(relpath, at) {
            return Ok(Some(hit));
        }
        match self.backend.get_at_or_before(relpath, at)? {
            Some(record) => Ok(Some(KeyVersion::from_record(record)?)),
            None => Ok(None),
        }
    }

    fn published(&self) -> Serial {
        self.published.load(Ordering::Acquire)
    }

    fn refresh(&self) -> Result<Serial> {
        let backend_serial = self.backend.last_serial()?;
        let guard = self.serial_lock.lock();
        let published = self.published();
        if backend_serial <= published || backend_serial == self.in_flight.load(Ordering::Acquire)
        {
            return Ok(published);
        }
        self.cache.clear();
        self.published.store(backend_serial, Ordering::Release);
        drop(guard);
        self.serial_changed.notify_all();
        debug!(
            target: "depot::txn",
            from = published,
            to = backend_serial,
            "Observed commits from another process"
        );
        Ok(backend_serial)
    }

    pub(crate) fn begin_commit(&self, serial: Serial) {
        self.in_flight.store(serial, Ordering::Release);
    }

    pub(crate) fn end_commit(&self) {
        self.in_flight.store(0, Ordering::Release);
    }

    /// Make a durable commit visible
    pub(crate) fn publish(&self, event: CommitEvent) {
        for key in &event.keys {
            self.cache.insert(
                &key.relpath,
                KeyVersion {
                    serial: event.serial,
                    back_serial: key.back_serial,
                    value: key.value.clone(),
                },
            );
        }
        {
            let _guard = self.serial_lock.lock();
            if event.serial > self.published() {
                self.published.store(event.serial, Ordering::Release);
            }
        }
        self.end_commit();
        self.serial_changed.notify_all();

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_commit(&event))).is_err() {
                error!(target: "depot::txn", serial = event.serial, "Commit listener panicked");
            }
        }
    }

    fn try_acquire_writer(self: &Arc<Self>) -> Option<WriteGuard> {
        let mut active = self.writer_active.lock();
        if *active {
            return None;
        }
        *active = true;
        Some(WriteGuard {
            inner: Arc::clone(self),
        })
    }

    fn acquire_writer(self: &Arc<Self>, timeout: Duration) -> Option<WriteGuard> {
        let deadline = Instant::now() + timeout;
        let mut active = self.writer_active.lock();
        while *active {
            if self
                .writer_released
                .wait_until(&mut active, deadline)
                .timed_out()
                && *active
            {
                return None;
            }
        }
        *active = true;
        Some(WriteGuard {
            inner: Arc::clone(self),
        })
    }
}

/// Holds the single writer slot; released on drop
pub(crate) struct WriteGuard {
    inner: Arc<ManagerInner>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        *self.inner.writer_active.lock() = false;
        self.inner.writer_released.notify_one();
    }
}

/// Hands out transactions over one storage backend
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
}

impl TransactionManager {
    /// Create a manager starting at the backend's last serial
    pub fn new(backend: Arc<dyn StorageBackend>, options: ManagerOptions) -> Result<Self> {
        let serial = backend.last_serial()?;
        info!(
            target: "depot::txn",
            backend = backend.name(),
            serial,
            readonly = options.readonly || backend.is_readonly(),
            "Transaction manager ready"
        );
        Ok(TransactionManager {
            inner: Arc::new(ManagerInner {
                cache: ValueCache::new(options.cache_capacity),
                backend,
                options,
                published: AtomicU64::new(serial),
                in_flight: AtomicU64::new(0),
                serial_lock: Mutex::new(()),
                serial_changed: Condvar::new(),
                writer_active: Mutex::new(false),
                writer_released: Condvar::new(),
                listeners: RwLock::new(Vec::new()),
            }),
        })
    }

    /// The storage backend
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.backend
    }

    /// The process-wide value cache
    pub fn cache(&self) -> &ValueCache {
        &self.inner.cache
    }

    /// Whether write transactions are refused
    pub fn is_readonly(&self) -> bool {
        self.inner.options.readonly || self.inner.backend.is_readonly()
    }

    /// Latest serial visible to new readers, without asking the backend
    pub fn current_serial(&self) -> Serial {
        self.inner.published()
    }

    /// Pick up commits made by other processes sharing the backend
    pub fn refresh(&self) -> Result<Serial> {
        self.inner.refresh()
    }

    /// Read transaction at the latest serial
    pub fn begin_read(&self) -> Result<ReadTransaction> {
        let at = self.inner.refresh()?;
        Ok(ReadTransaction::new(Arc::clone(&self.inner), at))
    }

    /// Read transaction at an earlier serial
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] for a serial that is not yet
    /// committed.
    pub fn begin_read_at(&self, serial: Serial) -> Result<ReadTransaction> {
        let latest = self.inner.refresh()?;
        if serial > latest {
            return Err(Error::InvalidOperation(format!(
                "serial {serial} is not committed yet (latest {latest})"
            )));
        }
        Ok(ReadTransaction::new(Arc::clone(&self.inner), serial))
    }

    /// Start the write transaction without waiting
    ///
    /// # Errors
    ///
    /// - [`Error::ReadOnly`] on a read-only manager
    /// - [`Error::WriteConflict`] if another write transaction is active
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        if self.is_readonly() {
            return Err(Error::ReadOnly);
        }
        let guard = self.inner.try_acquire_writer().ok_or_else(|| {
            Error::WriteConflict("another write transaction is in progress".into())
        })?;
        self.start_write(guard)
    }

    /// Start the write transaction, waiting up to `timeout` for the
    /// current one to finish
    pub fn begin_write_wait(&self, timeout: Duration) -> Result<WriteTransaction> {
        if self.is_readonly() {
            return Err(Error::ReadOnly);
        }
        let guard = self.inner.acquire_writer(timeout).ok_or_else(|| {
            Error::WriteConflict(format!(
                "no write transaction available within {}ms",
                timeout.as_millis()
            ))
        })?;
        self.start_write(guard)
    }

    fn start_write(&self, guard: WriteGuard) -> Result<WriteTransaction> {
        let at = self.inner.refresh()?;
        let writer = self.inner.backend.begin_write()?;
        debug!(target: "depot::txn", at_serial = at, "Write transaction started");
        Ok(WriteTransaction::new(
            ReadTransaction::new(Arc::clone(&self.inner), at),
            writer,
            guard,
        ))
    }

    /// Block until `serial` is published or `timeout` passes
    ///
    /// Returns whether the serial was reached. Commits by other processes
    /// are noticed within the configured recheck interval.
    pub fn wait_for_serial(&self, serial: Serial, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.inner.refresh()? >= serial {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let wait = (deadline - now).min(self.inner.options.recheck_interval);
            let mut guard = self.inner.serial_lock.lock();
            if self.inner.published() >= serial {
                return Ok(true);
            }
            self.inner.serial_changed.wait_for(&mut guard, wait);
        }
    }

    /// Register a commit listener
    pub fn add_listener(&self, listener: Arc<dyn CommitListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Keys written by `serial`, decoded
    pub fn changes_at(&self, serial: Serial) -> Result<Vec<ChangedKey>> {
        self.inner
            .backend
            .changes_at(serial)?
            .into_iter()
            .map(ChangedKey::from_record)
            .collect()
    }

    /// Apply a commit received from another store under its original serial
    ///
    /// `files` lists blobs to write (`Some`) or delete (`None`).
    ///
    /// # Errors
    ///
    /// - [`Error::ReplicationGap`] unless `serial` is exactly one past the
    ///   latest local serial
    /// - [`Error::WriteConflict`] if a local write transaction is active
    /// - [`Error::Codec`] if a value does not decode; nothing is written
    pub fn import_changes(
        &self,
        serial: Serial,
        changes: Vec<PendingChange>,
        files: &[(String, Option<Vec<u8>>)],
    ) -> Result<()> {
        let _guard = self.inner.try_acquire_writer().ok_or_else(|| {
            Error::WriteConflict("another write transaction is in progress".into())
        })?;
        let current = self.inner.refresh()?;
        if serial != current + 1 {
            return Err(Error::ReplicationGap {
                expected: current + 1,
                actual: serial,
            });
        }

        let mut keys = Vec::with_capacity(changes.len());
        for change in &changes {
            keys.push(ChangedKey::from_record(change.clone().into_record(serial))?);
        }

        let mut writer = self.inner.backend.begin_write()?;
        for (relpath, data) in files {
            let staged = match data {
                Some(bytes) => writer.set_file(relpath, bytes),
                None => writer.delete_file(relpath),
            };
            if let Err(e) = staged {
                writer.rollback()?;
                return Err(e);
            }
        }

        self.inner.begin_commit(serial);
        let summary = match writer.commit(serial, changes) {
            Ok(summary) => summary,
            Err(e) => {
                self.inner.end_commit();
                return Err(e);
            }
        };
        info!(
            target: "depot::replica",
            serial,
            keys = keys.len(),
            files = files.len(),
            "Imported"
        );
        self.inner.publish(CommitEvent {
            serial,
            keys,
            files_commit: summary.files_commit,
            files_del: summary.files_del,
        });
        Ok(())
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("backend", &self.inner.backend.name())
            .field("serial", &self.inner.published())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::{KeySpec, Value, ValueKind};
    use depot_storage::SqliteBackend;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> TransactionManager {
        let backend = Arc::new(SqliteBackend::open(dir.path(), false).unwrap());
        TransactionManager::new(backend, ManagerOptions::default()).unwrap()
    }

    fn counter() -> depot_core::TypedKey {
        KeySpec::new("COUNTER", "counter", ValueKind::Int)
            .unwrap()
            .plain()
            .unwrap()
    }

    #[test]
    fn test_new_starts_at_backend_serial() {
        let dir = TempDir::new().unwrap();
        {
            let tm = manager(&dir);
            let mut tx = tm.begin_write().unwrap();
            tx.set(&counter(), 1).unwrap();
            tx.commit().unwrap();
        }
        let tm = manager(&dir);
        assert_eq!(tm.current_serial(), 1);
    }

    #[test]
    fn test_second_writer_conflicts() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);
        let tx = tm.begin_write().unwrap();
        assert!(matches!(tm.begin_write(), Err(Error::WriteConflict(_))));
        drop(tx);
        assert!(tm.begin_write().is_ok());
    }

    #[test]
    fn test_begin_write_wait_times_out() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);
        let _tx = tm.begin_write().unwrap();
        let err = tm.begin_write_wait(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::WriteConflict(_)));
    }

    #[test]
    fn test_begin_write_wait_gets_released_slot() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);
        let tx = tm.begin_write().unwrap();
        let tm2 = tm.clone();
        let waiter = thread::spawn(move || {
            let mut tx = tm2.begin_write_wait(Duration::from_secs(10)).unwrap();
            tx.set(&counter(), 2).unwrap();
            tx.commit().unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        drop(tx);
        assert_eq!(waiter.join().unwrap(), Some(1));
    }

    #[test]
    fn test_readonly_refuses_writes() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(SqliteBackend::open(dir.path(), false).unwrap());
        let tm = TransactionManager::new(
            backend,
            ManagerOptions {
                readonly: true,
                ..ManagerOptions::default()
            },
        )
        .unwrap();
        assert!(matches!(tm.begin_write(), Err(Error::ReadOnly)));
        assert!(tm.begin_read().is_ok());
    }

    #[test]
    fn test_wait_for_serial() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);
        assert!(!tm.wait_for_serial(1, Duration::from_millis(10)).unwrap());

        let tm2 = tm.clone();
        let waiter = thread::spawn(move || tm2.wait_for_serial(1, Duration::from_secs(10)).unwrap());
        let mut tx = tm.begin_write().unwrap();
        tx.set(&counter(), 5).unwrap();
        tx.commit().unwrap();
        assert!(waiter.join().unwrap());
        assert!(tm.wait_for_serial(0, Duration::ZERO).unwrap());
    }

    #[test]
    fn test_listeners_see_commits_in_order() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tm.add_listener(Arc::new(move |event: &CommitEvent| {
            sink.lock().push((event.serial, event.keys.len()));
        }));

        for n in 1..=3i64 {
            let mut tx = tm.begin_write().unwrap();
            tx.set(&counter(), n).unwrap();
            tx.commit().unwrap();
        }
        assert_eq!(*seen.lock(), vec![(1, 1), (2, 1), (3, 1)]);
    }

    #[test]
    fn test_panicking_listener_does_not_fail_commit() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        tm.add_listener(Arc::new(|_: &CommitEvent| panic!("listener bug")));
        tm.add_listener(Arc::new(move |_: &CommitEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let mut tx = tm.begin_write().unwrap();
        tx.set(&counter(), 1).unwrap();
        assert_eq!(tx.commit().unwrap(), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_import_requires_next_serial() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);
        let change = PendingChange {
            relpath: "counter".into(),
            keyname: "COUNTER".into(),
            back_serial: None,
            value: Some(depot_core::encode(&Value::Int(7)).unwrap()),
        };

        let err = tm.import_changes(3, vec![change.clone()], &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::ReplicationGap {
                expected: 1,
                actual: 3
            }
        ));

        tm.import_changes(1, vec![change], &[("blobs/a".into(), Some(b"A".to_vec()))])
            .unwrap();
        let rx = tm.begin_read().unwrap();
        assert_eq!(rx.at_serial(), 1);
        assert_eq!(rx.get(&counter()).unwrap().unwrap(), Value::Int(7));
        assert_eq!(rx.read_file("blobs/a").unwrap().unwrap(), b"A");
    }

    #[test]
    fn test_import_rejects_undecodable_value() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);
        let change = PendingChange {
            relpath: "counter".into(),
            keyname: "COUNTER".into(),
            back_serial: None,
            value: Some(vec![0xff]),
        };
        assert!(matches!(
            tm.import_changes(1, vec![change], &[]),
            Err(Error::Codec(_))
        ));
        assert_eq!(tm.refresh().unwrap(), 0);
    }

    #[test]
    fn test_changes_at_decodes() {
        let dir = TempDir::new().unwrap();
        let tm = manager(&dir);
        let mut tx = tm.begin_write().unwrap();
        tx.set(&counter(), 9).unwrap();
        tx.commit().unwrap();

        let changes = tm.changes_at(1).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].keyname, "COUNTER");
        assert_eq!(changes[0].value.as_ref().unwrap(), &Value::Int(9));
    }
}
