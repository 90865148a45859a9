//! Storage backend capability interface
//!
//! This module defines the [`StorageBackend`] and [`BackendWriter`] traits
//! that let the transaction manager stay ignorant of where records and blobs
//! live.
//!
//! Backends store encoded values; they never decode them. A record with
//! `value == None` is a tombstone.
//!
//! Thread safety: all [`StorageBackend`] methods must be safe to call
//! concurrently. A [`BackendWriter`] is owned by the single write
//! transaction and never shared.

use depot_core::{Result, Serial};
use serde::{Deserialize, Serialize};

/// One versioned record of one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Key relpath
    pub relpath: String,
    /// Key family name
    pub keyname: String,
    /// Serial that wrote this record
    pub serial: Serial,
    /// Previous serial that wrote the same key
    pub back_serial: Option<Serial>,
    /// Encoded value, `None` for a tombstone
    pub value: Option<Vec<u8>>,
}

impl ChangeRecord {
    /// Whether this record deletes the key
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// A key change handed to [`BackendWriter::commit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    /// Key relpath
    pub relpath: String,
    /// Key family name
    pub keyname: String,
    /// Previous serial that wrote the same key
    pub back_serial: Option<Serial>,
    /// Encoded value, `None` for a tombstone
    pub value: Option<Vec<u8>>,
}

impl PendingChange {
    /// Attach the commit serial
    pub fn into_record(self, serial: Serial) -> ChangeRecord {
        ChangeRecord {
            relpath: self.relpath,
            keyname: self.keyname,
            serial,
            back_serial: self.back_serial,
            value: self.value,
        }
    }
}

/// What a commit made durable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Serial of the commit
    pub serial: Serial,
    /// Relpaths of changed keys
    pub keys: Vec<String>,
    /// Files written
    pub files_commit: Vec<String>,
    /// Files deleted
    pub files_del: Vec<String>,
}

/// Durable record and blob storage
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Whether writes are refused
    fn is_readonly(&self) -> bool;

    /// Highest committed serial, 0 if nothing was committed
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    fn last_serial(&self) -> Result<Serial>;

    /// Latest record of `relpath` written at or before `serial`
    ///
    /// Returns tombstones as records; `None` means the key was never
    /// written at or before `serial`.
    fn get_at_or_before(&self, relpath: &str, serial: Serial) -> Result<Option<ChangeRecord>>;

    /// Every record written by `serial`, ordered by relpath
    fn changes_at(&self, serial: Serial) -> Result<Vec<ChangeRecord>>;

    /// Latest live record at or before `at` of every key in family `keyname`
    fn keys_with_name(&self, keyname: &str, at: Serial) -> Result<Vec<ChangeRecord>>;

    /// Committed content of a blob
    fn read_file(&self, relpath: &str) -> Result<Option<Vec<u8>>>;

    /// Whether a committed blob exists
    fn file_exists(&self, relpath: &str) -> Result<bool>;

    /// Start staging a commit
    ///
    /// # Errors
    ///
    /// Returns [`depot_core::Error::ReadOnly`] on a read-only backend.
    fn begin_write(&self) -> Result<Box<dyn BackendWriter>>;
}

/// Staging area of the single write transaction
pub trait BackendWriter: Send {
    /// Stage new content for a blob
    fn set_file(&mut self, relpath: &str, data: &[u8]) -> Result<()>;

    /// Stage deletion of a blob
    fn delete_file(&mut self, relpath: &str) -> Result<()>;

    /// Blob content as this transaction sees it
    fn read_file(&self, relpath: &str) -> Result<Option<Vec<u8>>>;

    /// Blob existence as this transaction sees it
    fn file_exists(&self, relpath: &str) -> Result<bool>;

    /// Number of staged blob changes
    fn dirty_files(&self) -> usize;

    /// Make `changes` and the staged blobs durable as `serial`
    ///
    /// `serial` must be exactly one past the backend's last serial; a
    /// mismatch means another process committed and yields
    /// [`depot_core::Error::WriteConflict`]. On any error nothing becomes
    /// visible at `serial` and staged blobs are discarded.
    fn commit(self: Box<Self>, serial: Serial, changes: Vec<PendingChange>)
        -> Result<CommitSummary>;

    /// Discard everything staged
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// Which backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// SQLite index plus blob files in the base directory
    #[default]
    Sqlite,
    /// PostgreSQL server holding index and blobs
    Postgres,
}

/// Connection parameters for the PostgreSQL backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresParams {
    /// Server host name
    pub host: String,
    /// Server port
    pub port: u16,
    /// Role name
    pub user: String,
    /// Password, if the server requires one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Database name
    pub database: String,
    /// Unix socket directory; takes precedence over `host`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unix_socket: Option<String>,
}

impl Default for PostgresParams {
    fn default() -> Self {
        PostgresParams {
            host: "localhost".to_string(),
            port: 5432,
            user: "depot".to_string(),
            password: None,
            database: "depot".to_string(),
            unix_socket: None,
        }
    }
}

/// Everything [`crate::open_backend`] needs
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// Backend selection
    pub kind: BackendKind,
    /// Refuse writes, skip recovery and the directory lock
    pub readonly: bool,
    /// PostgreSQL connection parameters
    pub postgres: Option<PostgresParams>,
}
