//! depot - versioned key/value and blob storage for a package index
//!
//! depot stores typed values under path-like keys. Every commit gets the
//! next serial; readers see a consistent snapshot at one serial while a
//! single writer stages the next one. Blob files commit atomically with the
//! key changes, and an interrupted commit is finished on the next open.
//!
//! # Quick Start
//!
//! ```no_run
//! use depot::{KeyFs, Mapping, Value, ValueKind};
//!
//! # fn main() -> depot::Result<()> {
//! let keyfs = KeyFs::open(std::path::Path::new("/srv/depot"))?;
//! let project = keyfs.add_key("PROJECT", "{user}/{name}/.config", ValueKind::Map)?;
//! let key = project.key(&[("user", "alice"), ("name", "web")])?;
//!
//! let (_, serial) = keyfs.write(|tx| {
//!     let mut config = Mapping::new();
//!     config.insert("title", "web")?;
//!     tx.set(&key, config)
//! })?;
//!
//! let value = keyfs.read(|tx| tx.get(&key))?;
//! assert_eq!(value.unwrap().get_str("title"), Some(&Value::from("web")));
//! # let _ = serial;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`core`]: values, codec, frozen values, keys, errors
//! - [`durability`]: crash-safe multi-file commit protocol
//! - [`storage`]: SQLite and PostgreSQL backends
//! - [`concurrency`]: transaction manager and snapshot reads
//! - [`engine`]: the [`KeyFs`] facade, worker pool, notifications, replication

pub use depot_concurrency as concurrency;
pub use depot_core as core;
pub use depot_durability as durability;
pub use depot_engine as engine;
pub use depot_storage as storage;

pub use depot_concurrency::{
    CommitEvent, CommitListener, KeyVersion, ReadTransaction, TransactionManager,
    WriteTransaction,
};
pub use depot_core::{
    decode, encode, freeze, is_frozen, is_sequence, thaw, CodecError, CommitError, Error,
    FrozenValue, ImmutabilityViolation, KeySpec, Mapping, OrderedSet, Result, Sequence, Serial,
    Set, TypedKey, Value, ValueKind,
};
pub use depot_engine::{
    ChangeSource, DepotConfig, KeyChangeEvent, KeyChangeHandler, KeyFs, NotificationWorker,
    ReplicaPuller, ThreadPool, Worker, WorkerHandle, WorkerState,
};
pub use depot_storage::{BackendKind, PostgresParams};
