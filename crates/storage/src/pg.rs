//! Networked backend: PostgreSQL holds index and blobs
//!
//! Several processes may share one database. A commit runs in a single
//! database transaction under `pg_advisory_xact_lock`, so blobs and records
//! become visible together and no intent record is needed. The serial is
//! re-checked after taking the lock; losing the race is a `WriteConflict`.
//!
//! Reads go through a small set of reader connections picked round-robin.
//! The writer has its own connection, so a long commit never holds up
//! readers in this process.

use crate::backend::{
    BackendWriter, ChangeRecord, CommitSummary, PendingChange, PostgresParams, StorageBackend,
};
use depot_core::{Error, Result, Serial};
use depot_durability::validate_relpath;
use parking_lot::Mutex;
use postgres::{Client, NoTls, Row};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const READERS: usize = 2;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS changelog (
        serial BIGINT PRIMARY KEY,
        committed_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    CREATE TABLE IF NOT EXISTS kv (
        key TEXT NOT NULL,
        keyname TEXT NOT NULL,
        serial BIGINT NOT NULL,
        back_serial BIGINT,
        value BYTEA,
        PRIMARY KEY (key, serial)
    );
    CREATE INDEX IF NOT EXISTS kv_keyname_idx ON kv (keyname, key, serial);
    CREATE INDEX IF NOT EXISTS kv_serial_idx ON kv (serial);
    CREATE TABLE IF NOT EXISTS files (
        path TEXT PRIMARY KEY,
        data BYTEA NOT NULL
    );
";

const WRITE_LOCK_ID: i64 = 1;

fn pg_err(e: postgres::Error) -> Error {
    // Errors without a SQLSTATE come from the connection, not the query.
    if e.is_closed() || e.code().is_none() {
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

fn record_from_row(row: &Row) -> Result<ChangeRecord> {
    Ok(ChangeRecord {
        relpath: row.try_get(0).map_err(pg_err)?,
        keyname: row.try_get(1).map_err(pg_err)?,
        serial: from_sql(row.try_get(2).map_err(pg_err)?),
        back_serial: row
            .try_get::<_, Option<i64>>(3)
            .map_err(pg_err)?
            .map(from_sql),
        value: row.try_get(4).map_err(pg_err)?,
    })
}

/// Build a client configuration from connection parameters
pub fn client_config(params: &PostgresParams) -> postgres::Config {
    let mut config = postgres::Config::new();
    match &params.unix_socket {
        Some(socket) => config.host(socket),
        None => config.host(&params.host),
    };
    config
        .port(params.port)
        .user(&params.user)
        .dbname(&params.database)
        .application_name("depot");
    if let Some(password) = &params.password {
        config.password(password);
    }
    config
}

struct PostgresInner {
    writer: Option<Mutex<Client>>,
    readers: Vec<Mutex<Client>>,
    next_reader: AtomicUsize,
    readonly: bool,
}

impl PostgresInner {
    fn with_reader<T>(
        &self,
        f: impl FnOnce(&mut Client) -> std::result::Result<T, postgres::Error>,
    ) -> Result<T> {
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let mut client = self.readers[idx].lock();
        f(&mut *client).map_err(pg_err)
    }
}

/// PostgreSQL index and blob store
#[derive(Clone)]
pub struct PostgresBackend {
    inner: Arc<PostgresInner>,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("readonly", &self.inner.readonly)
            .finish()
    }
}

impl PostgresBackend {
    /// Connect and make sure the schema exists
    pub fn connect(params: &PostgresParams, readonly: bool) -> Result<Self> {
        let config = client_config(params);
        let writer = if readonly {
            None
        } else {
            let mut client = config.connect(NoTls).map_err(pg_err)?;
            client.batch_execute(SCHEMA).map_err(pg_err)?;
            Some(Mutex::new(client))
        };
        let readers = (0..READERS)
            .map(|_| config.connect(NoTls).map(Mutex::new).map_err(pg_err))
            .collect::<Result<Vec<_>>>()?;
        info!(
            target: "depot::storage",
            host = %params.unix_socket.as_deref().unwrap_or(&params.host),
            database = %params.database,
            readonly,
            readers = readers.len(),
            "Connected postgres backend"
        );
        Ok(PostgresBackend {
            inner: Arc::new(PostgresInner {
                writer,
                readers,
                next_reader: AtomicUsize::new(0),
                readonly,
            }),
        })
    }

    fn query_records(&self, sql: &str, params: &[&(dyn postgres::types::ToSql + Sync)]) -> Result<Vec<ChangeRecord>> {
        let rows = self.inner.with_reader(|client| client.query(sql, params))?;
        rows.iter().map(record_from_row).collect()
    }
}

impl StorageBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn is_readonly(&self) -> bool {
        self.inner.readonly
    }

    fn last_serial(&self) -> Result<Serial> {
        let row = self.inner.with_reader(|client| {
            client.query_one("SELECT COALESCE(MAX(serial), 0) FROM changelog", &[])
        })?;
        Ok(from_sql(row.try_get(0).map_err(pg_err)?))
    }

    fn get_at_or_before(&self, relpath: &str, serial: Serial) -> Result<Option<ChangeRecord>> {
        let mut records = self.query_records(
            "SELECT key, keyname, serial, back_serial, value FROM kv \
             WHERE key = $1 AND serial <= $2 ORDER BY serial DESC LIMIT 1",
            &[&relpath, &to_sql(serial)],
        )?;
        Ok(records.pop())
    }

    fn changes_at(&self, serial: Serial) -> Result<Vec<ChangeRecord>> {
        self.query_records(
            "SELECT key, keyname, serial, back_serial, value FROM kv \
             WHERE serial = $1 ORDER BY key",
            &[&to_sql(serial)],
        )
    }

    fn keys_with_name(&self, keyname: &str, at: Serial) -> Result<Vec<ChangeRecord>> {
        self.query_records(
            "SELECT DISTINCT ON (key) key, keyname, serial, back_serial, value FROM kv \
             WHERE keyname = $1 AND serial <= $2 ORDER BY key, serial DESC",
            &[&keyname, &to_sql(at)],
        )
        .map(|records| records.into_iter().filter(|r| !r.is_tombstone()).collect())
    }

    fn read_file(&self, relpath: &str) -> Result<Option<Vec<u8>>> {
        validate_relpath(relpath)?;
        let row = self.inner.with_reader(|client| {
            client.query_opt("SELECT data FROM files WHERE path = $1", &[&relpath])
        })?;
        row.map(|r| r.try_get(0).map_err(pg_err)).transpose()
    }

    fn file_exists(&self, relpath: &str) -> Result<bool> {
        validate_relpath(relpath)?;
        let row = self.inner.with_reader(|client| {
            client.query_opt("SELECT 1 FROM files WHERE path = $1", &[&relpath])
        })?;
        Ok(row.is_some())
    }

    fn begin_write(&self) -> Result<Box<dyn BackendWriter>> {
        if self.inner.readonly {
            return Err(Error::ReadOnly);
        }
        Ok(Box::new(PostgresWriter {
            backend: self.clone(),
            files: BTreeMap::new(),
        }))
    }
}

struct PostgresWriter {
    backend: PostgresBackend,
    files: BTreeMap<String, Option<Vec<u8>>>,
}

impl BackendWriter for PostgresWriter {
    fn set_file(&mut self, relpath: &str, data: &[u8]) -> Result<()> {
        validate_relpath(relpath)?;
        self.files.insert(relpath.to_string(), Some(data.to_vec()));
        Ok(())
    }

    fn delete_file(&mut self, relpath: &str) -> Result<()> {
        validate_relpath(relpath)?;
        self.files.insert(relpath.to_string(), None);
        Ok(())
    }

    fn read_file(&self, relpath: &str) -> Result<Option<Vec<u8>>> {
        match self.files.get(relpath) {
            Some(staged) => Ok(staged.clone()),
            None => self.backend.read_file(relpath),
        }
    }

    fn file_exists(&self, relpath: &str) -> Result<bool> {
        match self.files.get(relpath) {
            Some(staged) => Ok(staged.is_some()),
            None => self.backend.file_exists(relpath),
        }
    }

    fn dirty_files(&self) -> usize {
        self.files.len()
    }

    fn commit(
        self: Box<Self>,
        serial: Serial,
        changes: Vec<PendingChange>,
    ) -> Result<CommitSummary> {
        let PostgresWriter { backend, files } = *self;
        let writer = backend.inner.writer.as_ref().ok_or(Error::ReadOnly)?;
        let mut client = writer.lock();
        let mut tx = client.transaction().map_err(pg_err)?;

        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&WRITE_LOCK_ID])
            .map_err(pg_err)?;
        let current: i64 = tx
            .query_one("SELECT COALESCE(MAX(serial), 0) FROM changelog", &[])
            .map_err(pg_err)?
            .try_get(0)
            .map_err(pg_err)?;
        if from_sql(current) + 1 != serial {
            return Err(Error::WriteConflict(format!(
                "serial {serial} is stale, store is at {current}"
            )));
        }

        tx.execute("INSERT INTO changelog (serial) VALUES ($1)", &[&to_sql(serial)])
            .map_err(pg_err)?;

        let mut summary = CommitSummary {
            serial,
            ..CommitSummary::default()
        };
        for change in changes {
            tx.execute(
                "INSERT INTO kv (key, keyname, serial, back_serial, value) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &change.relpath,
                    &change.keyname,
                    &to_sql(serial),
                    &change.back_serial.map(to_sql),
                    &change.value,
                ],
            )
            .map_err(pg_err)?;
            summary.keys.push(change.relpath);
        }

        for (path, data) in files {
            match data {
                Some(data) => {
                    tx.execute(
                        "INSERT INTO files (path, data) VALUES ($1, $2) \
                         ON CONFLICT (path) DO UPDATE SET data = EXCLUDED.data",
                        &[&path, &data],
                    )
                    .map_err(pg_err)?;
                    summary.files_commit.push(path);
                }
                None => {
                    tx.execute("DELETE FROM files WHERE path = $1", &[&path])
                        .map_err(pg_err)?;
                    summary.files_del.push(path);
                }
            }
        }

        tx.commit().map_err(pg_err)?;
        debug!(
            target: "depot::storage",
            serial,
            keys = summary.keys.len(),
            files_commit = summary.files_commit.len(),
            files_del = summary.files_del.len(),
            "Committed to postgres"
        );
        Ok(summary)
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
