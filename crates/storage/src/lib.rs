//! Storage layer for depot
//!
//! This crate implements the pluggable persistence behind the transaction
//! manager:
//! - StorageBackend / BackendWriter: the capability interface
//! - SqliteBackend: embedded index plus blob files (crash-safe via
//!   `depot-durability`)
//! - PostgresBackend: shared database server (feature `postgres`)
//! - open_backend: configuration-driven selection

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
#[cfg(feature = "postgres")]
pub mod pg;
pub mod sqlite;

pub use backend::{
    BackendKind, BackendOptions, BackendWriter, ChangeRecord, CommitSummary, PendingChange,
    PostgresParams, StorageBackend,
};
#[cfg(feature = "postgres")]
pub use pg::PostgresBackend;
pub use sqlite::SqliteBackend;

use depot_core::Result;
use std::path::Path;
use std::sync::Arc;

/// Open the backend selected by `options`
///
/// The embedded backend lives in `basedir`; the networked backend ignores
/// it.
pub fn open_backend(basedir: &Path, options: &BackendOptions) -> Result<Arc<dyn StorageBackend>> {
    match options.kind {
        BackendKind::Sqlite => Ok(Arc::new(SqliteBackend::open(basedir, options.readonly)?)),
        BackendKind::Postgres => open_postgres(options),
    }
}

#[cfg(feature = "postgres")]
fn open_postgres(options: &BackendOptions) -> Result<Arc<dyn StorageBackend>> {
    let params = options.postgres.clone().unwrap_or_default();
    Ok(Arc::new(PostgresBackend::connect(&params, options.readonly)?))
}

#[cfg(not(feature = "postgres"))]
fn open_postgres(_options: &BackendOptions) -> Result<Arc<dyn StorageBackend>> {
    Err(depot_core::Error::Config(
        "postgres backend selected but depot was built without the `postgres` feature".into(),
    ))
}
