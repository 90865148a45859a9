//! Embedded backend: SQLite index plus blob files
//!
//! # On-disk layout
//!
//! ```text
//! basedir/
//!   .sqlite              changelog + kv tables (WAL journal)
//!   .lock                exclusive process lock
//!   .pending-renames     intent record, only while a commit is applying
//!   <relpath>            committed blobs
//!   <relpath>-<id>-tmp   staged blobs of the in-flight write
//! ```
//!
//! # Commit ordering
//!
//! 1. `BEGIN IMMEDIATE`, re-check the serial, insert the records
//! 2. Write the intent record and apply the renames
//! 3. `COMMIT`, which is the moment the serial becomes visible
//! 4. Remove the intent record
//!
//! A crash before 3 leaves blobs that no serial references yet; recovery
//! replays the intent record and the serial is simply never seen.

use crate::backend::{BackendWriter, ChangeRecord, CommitSummary, PendingChange, StorageBackend};
use depot_core::{Error, Result, Serial};
use depot_durability::{DirtyFileSet, FileStore};
use fs2::FileExt;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Index file name inside the base directory
pub const DB_FILE: &str = ".sqlite";
/// Lock file name inside the base directory
pub const LOCK_FILE: &str = ".lock";

const READERS: usize = 4;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS changelog (
        serial INTEGER PRIMARY KEY,
        committed_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS kv (
        key TEXT NOT NULL,
        keyname TEXT NOT NULL,
        serial INTEGER NOT NULL,
        back_serial INTEGER,
        value BLOB,
        PRIMARY KEY (key, serial)
    );
    CREATE INDEX IF NOT EXISTS kv_keyname ON kv (keyname, key, serial);
    CREATE INDEX IF NOT EXISTS kv_serial ON kv (serial);
";

const RECORD_COLUMNS: &str = "key, keyname, serial, back_serial, value";

/// Map a SQLite error onto the storage error taxonomy
pub(crate) fn sql_err(e: rusqlite::Error) -> Error {
    let transient = matches!(
        &e,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
            )
    );
    if transient {
        Error::unavailable(e)
    } else {
        Error::backend(e)
    }
}

fn to_sql(serial: Serial) -> i64 {
    i64::try_from(serial).unwrap_or(i64::MAX)
}

fn from_sql(serial: i64) -> Serial {
    Serial::try_from(serial).unwrap_or(0)
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeRecord> {
    Ok(ChangeRecord {
        relpath: row.get(0)?,
        keyname: row.get(1)?,
        serial: from_sql(row.get(2)?),
        back_serial: row.get::<_, Option<i64>>(3)?.map(from_sql),
        value: row.get(4)?,
    })
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(sql_err)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
        .map_err(sql_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(30))
        .map_err(sql_err)?;
    Ok(conn)
}

struct SqliteInner {
    basedir: PathBuf,
    files: FileStore,
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    readonly: bool,
    _lock: Option<File>,
}

impl SqliteInner {
    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx].lock();
        f(&conn).map_err(sql_err)
    }
}

/// SQLite index with blobs stored as files
#[derive(Clone)]
pub struct SqliteBackend {
    inner: Arc<SqliteInner>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("basedir", &self.inner.basedir)
            .field("readonly", &self.inner.readonly)
            .finish()
    }
}

impl SqliteBackend {
    /// Open the store in `basedir`, creating it if needed
    ///
    /// A writable open takes the exclusive directory lock and replays any
    /// interrupted commit before returning.
    pub fn open(basedir: impl Into<PathBuf>, readonly: bool) -> Result<Self> {
        let basedir = basedir.into();
        let files = FileStore::open(&basedir)?;

        let lock = if readonly {
            None
        } else {
            let lock_path = basedir.join(LOCK_FILE);
            let lock_file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            lock_file.try_lock_exclusive().map_err(|_| {
                Error::unavailable(format!(
                    "{} is locked by another process",
                    basedir.display()
                ))
            })?;

            if let Some(report) = files.recover()? {
                warn!(
                    target: "depot::recovery",
                    files_commit = report.files_commit.len(),
                    files_del = report.files_del.len(),
                    "Recovered interrupted commit"
                );
            }
            files.remove_orphaned_temps()?;
            Some(lock_file)
        };

        let db_path = basedir.join(DB_FILE);
        let writer = open_connection(&db_path)?;
        writer.execute_batch(SCHEMA).map_err(sql_err)?;
        let readers = (0..READERS)
            .map(|_| open_connection(&db_path).map(Mutex::new))
            .collect::<Result<Vec<_>>>()?;

        info!(
            target: "depot::storage",
            basedir = %basedir.display(),
            readonly,
            "Opened sqlite backend"
        );

        Ok(SqliteBackend {
            inner: Arc::new(SqliteInner {
                basedir,
                files,
                writer: Mutex::new(writer),
                readers,
                next_reader: AtomicUsize::new(0),
                readonly,
                _lock: lock,
            }),
        })
    }

    /// Base directory
    pub fn basedir(&self) -> &Path {
        &self.inner.basedir
    }
}

impl StorageBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn is_readonly(&self) -> bool {
        self.inner.readonly
    }

    fn last_serial(&self) -> Result<Serial> {
        self.inner.with_reader(|conn| {
            conn.query_row("SELECT COALESCE(MAX(serial), 0) FROM changelog", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(from_sql)
        })
    }

    fn get_at_or_before(&self, relpath: &str, serial: Serial) -> Result<Option<ChangeRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM kv WHERE key = ?1 AND serial <= ?2 \
             ORDER BY serial DESC LIMIT 1"
        );
        self.inner.with_reader(|conn| {
            conn.query_row(&sql, params![relpath, to_sql(serial)], record_from_row)
                .optional()
        })
    }

    fn changes_at(&self, serial: Serial) -> Result<Vec<ChangeRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM kv WHERE serial = ?1 ORDER BY key");
        self.inner.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![to_sql(serial)], record_from_row)?;
            rows.collect()
        })
    }

    fn keys_with_name(&self, keyname: &str, at: Serial) -> Result<Vec<ChangeRecord>> {
        let sql = "
            SELECT k.key, k.keyname, k.serial, k.back_serial, k.value
            FROM kv k
            JOIN (
                SELECT key, MAX(serial) AS serial FROM kv
                WHERE keyname = ?1 AND serial <= ?2
                GROUP BY key
            ) latest ON k.key = latest.key AND k.serial = latest.serial
            WHERE k.value IS NOT NULL
            ORDER BY k.key";
        self.inner.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params![keyname, to_sql(at)], record_from_row)?;
            rows.collect()
        })
    }

    fn read_file(&self, relpath: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.files.read(relpath)?)
    }

    fn file_exists(&self, relpath: &str) -> Result<bool> {
        Ok(self.inner.files.exists(relpath)?)
    }

    fn begin_write(&self) -> Result<Box<dyn BackendWriter>> {
        if self.inner.readonly {
            return Err(Error::ReadOnly);
        }
        Ok(Box::new(SqliteWriter {
            dirty: self.inner.files.begin(),
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct SqliteWriter {
    inner: Arc<SqliteInner>,
    dirty: DirtyFileSet,
}

impl BackendWriter for SqliteWriter {
    fn set_file(&mut self, relpath: &str, data: &[u8]) -> Result<()> {
        Ok(self.dirty.set_bytes(relpath, data)?)
    }

    fn delete_file(&mut self, relpath: &str) -> Result<()> {
        Ok(self.dirty.delete(relpath)?)
    }

    fn read_file(&self, relpath: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.dirty.read(relpath)?)
    }

    fn file_exists(&self, relpath: &str) -> Result<bool> {
        Ok(self.dirty.exists(relpath)?)
    }

    fn dirty_files(&self) -> usize {
        self.dirty.len()
    }

    fn commit(
        self: Box<Self>,
        serial: Serial,
        changes: Vec<PendingChange>,
    ) -> Result<CommitSummary> {
        let SqliteWriter { inner, dirty } = *self;
        let mut conn = inner.writer.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;

        let current: i64 = tx
            .query_row("SELECT COALESCE(MAX(serial), 0) FROM changelog", [], |row| {
                row.get(0)
            })
            .map_err(sql_err)?;
        if from_sql(current) + 1 != serial {
            return Err(Error::WriteConflict(format!(
                "serial {serial} is stale, store is at {current}"
            )));
        }

        tx.execute(
            "INSERT INTO changelog (serial, committed_at) VALUES (?1, ?2)",
            params![to_sql(serial), chrono::Utc::now().to_rfc3339()],
        )
        .map_err(sql_err)?;

        let mut keys = Vec::with_capacity(changes.len());
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO kv (key, keyname, serial, back_serial, value) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(sql_err)?;
            for change in changes {
                stmt.execute(params![
                    change.relpath,
                    change.keyname,
                    to_sql(serial),
                    change.back_serial.map(to_sql),
                    change.value,
                ])
                .map_err(sql_err)?;
                keys.push(change.relpath);
            }
        }

        let mut summary = CommitSummary {
            serial,
            keys,
            ..CommitSummary::default()
        };

        let prepared = if dirty.is_empty() {
            None
        } else {
            let prepared = inner.files.prepare(dirty)?;
            match prepared.apply() {
                Ok(report) => {
                    summary.files_commit = report.files_commit;
                    summary.files_del = report.files_del;
                }
                Err(e) => {
                    error!(target: "depot::commit", serial, error = %e, "Applying file changes failed");
                    if let Err(abort_err) = prepared.abort() {
                        warn!(target: "depot::commit", error = %abort_err, "Cleanup after failed apply failed");
                    }
                    return Err(e.into());
                }
            }
            Some(prepared)
        };

        if let Err(e) = tx.commit() {
            error!(target: "depot::commit", serial, error = %e, "Index commit failed after files were applied");
            if let Some(prepared) = prepared {
                if let Err(finish_err) = prepared.finish() {
                    warn!(target: "depot::commit", serial, error = %finish_err, "Clearing intent record after failed index commit failed");
                }
            }
            return Err(sql_err(e));
        }
        if let Some(prepared) = prepared {
            prepared.finish()?;
        }

        debug!(
            target: "depot::storage",
            serial,
            keys = summary.keys.len(),
            files_commit = summary.files_commit.len(),
            files_del = summary.files_del.len(),
            "Committed to sqlite"
        );
        Ok(summary)
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        let removed = self.dirty.discard()?;
        if removed > 0 {
            debug!(target: "depot::storage", removed, "Discarded staged files");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn change(relpath: &str, back: Option<Serial>, value: Option<&[u8]>) -> PendingChange {
        PendingChange {
            relpath: relpath.to_string(),
            keyname: "K".to_string(),
            back_serial: back,
            value: value.map(<[u8]>::to_vec),
        }
    }

    #[test]
    fn test_empty_store() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path(), false).unwrap();
        assert_eq!(backend.last_serial().unwrap(), 0);
        assert!(backend.get_at_or_before("a", 10).unwrap().is_none());
    }

    #[test]
    fn test_commit_and_versioned_read() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path(), false).unwrap();

        let w = backend.begin_write().unwrap();
        w.commit(1, vec![change("a", None, Some(b"v1"))]).unwrap();
        let w = backend.begin_write().unwrap();
        w.commit(2, vec![change("a", Some(1), None)]).unwrap();

        assert_eq!(backend.last_serial().unwrap(), 2);
        let at1 = backend.get_at_or_before("a", 1).unwrap().unwrap();
        assert_eq!(at1.value.as_deref(), Some(&b"v1"[..]));
        let at2 = backend.get_at_or_before("a", 2).unwrap().unwrap();
        assert!(at2.is_tombstone());
        assert_eq!(at2.back_serial, Some(1));
    }

    #[test]
    fn test_stale_serial_is_conflict() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path(), false).unwrap();
        let w = backend.begin_write().unwrap();
        let err = w.commit(2, vec![change("a", None, Some(b"x"))]).unwrap_err();
        assert!(matches!(err, Error::WriteConflict(_)));
        assert_eq!(backend.last_serial().unwrap(), 0);
    }

    #[test]
    fn test_files_commit_with_serial() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path(), false).unwrap();
        let mut w = backend.begin_write().unwrap();
        w.set_file("+files/x.tgz", b"blob").unwrap();
        assert!(w.file_exists("+files/x.tgz").unwrap());
        assert!(!backend.file_exists("+files/x.tgz").unwrap());

        let summary = w.commit(1, vec![]).unwrap();
        assert_eq!(summary.files_commit, vec!["+files/x.tgz".to_string()]);
        assert_eq!(backend.read_file("+files/x.tgz").unwrap().unwrap(), b"blob");
    }

    #[test]
    fn test_rollback_discards_files() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path(), false).unwrap();
        let mut w = backend.begin_write().unwrap();
        w.set_file("f", b"x").unwrap();
        w.rollback().unwrap();
        assert!(!backend.file_exists("f").unwrap());
        assert_eq!(backend.last_serial().unwrap(), 0);
    }

    #[test]
    fn test_keys_with_name_skips_deleted() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(dir.path(), false).unwrap();
        backend
            .begin_write()
            .unwrap()
            .commit(
                1,
                vec![change("u/a", None, Some(b"1")), change("u/b", None, Some(b"2"))],
            )
            .unwrap();
        backend
            .begin_write()
            .unwrap()
            .commit(2, vec![change("u/a", Some(1), None)])
            .unwrap();

        let at1: Vec<_> = backend
            .keys_with_name("K", 1)
            .unwrap()
            .into_iter()
            .map(|r| r.relpath)
            .collect();
        assert_eq!(at1, vec!["u/a", "u/b"]);
        let at2: Vec<_> = backend
            .keys_with_name("K", 2)
            .unwrap()
            .into_iter()
            .map(|r| r.relpath)
            .collect();
        assert_eq!(at2, vec!["u/b"]);
    }

    #[test]
    fn test_second_writer_process_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let _first = SqliteBackend::open(dir.path(), false).unwrap();
        let err = SqliteBackend::open(dir.path(), false).unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert!(SqliteBackend::open(dir.path(), true).is_ok());
    }

    #[test]
    fn test_readonly_refuses_writes() {
        let dir = TempDir::new().unwrap();
        drop(SqliteBackend::open(dir.path(), false).unwrap());
        let backend = SqliteBackend::open(dir.path(), true).unwrap();
        assert!(matches!(backend.begin_write(), Err(Error::ReadOnly)));
    }
}
