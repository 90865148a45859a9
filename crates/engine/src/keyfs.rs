//! KeyFs: the store facade
//!
//! Ties together the configured backend, the transaction manager, the key
//! registry and the notification worker. Everything above this type talks
//! to the store through it.

use crate::config::{DepotConfig, CONFIG_FILE_NAME};
use crate::notify::NotificationWorker;
use crate::replica;
use depot_concurrency::{
    CommitListener, ReadTransaction, TransactionManager, WriteTransaction,
};
use depot_core::{Error, KeySpec, Result, Serial, TypedKey, ValueKind};
use depot_storage::open_backend;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Key families registered by name
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    specs: Arc<RwLock<BTreeMap<String, KeySpec>>>,
}

impl KeyRegistry {
    /// Register a key family
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] for a duplicate name or a malformed
    /// pattern.
    pub fn add(&self, name: &str, pattern: &str, kind: ValueKind) -> Result<KeySpec> {
        let spec = KeySpec::new(name, pattern, kind)?;
        let mut specs = self.specs.write();
        if specs.contains_key(name) {
            return Err(Error::InvalidKey(format!(
                "duplicate registration for key named {name:?}"
            )));
        }
        specs.insert(name.to_string(), spec.clone());
        Ok(spec)
    }

    /// Family registered under `name`
    pub fn get(&self, name: &str) -> Option<KeySpec> {
        self.specs.read().get(name).cloned()
    }

    /// Registered names in order
    pub fn names(&self) -> Vec<String> {
        self.specs.read().keys().cloned().collect()
    }

    /// Typed key for a stored `(keyname, relpath)` pair
    pub fn key_instance(&self, keyname: &str, relpath: &str) -> Result<TypedKey> {
        let spec = self
            .get(keyname)
            .ok_or_else(|| Error::KeyNotFound(keyname.to_string()))?;
        spec.key_for_relpath(relpath)
    }
}

struct KeyFsInner {
    basedir: PathBuf,
    config: DepotConfig,
    manager: TransactionManager,
    keys: KeyRegistry,
    notifier: Arc<NotificationWorker>,
}

/// Handle to an open store; clones share everything
#[derive(Clone)]
pub struct KeyFs {
    inner: Arc<KeyFsInner>,
}

impl KeyFs {
    /// Open the store in `basedir` using its `depot.toml`
    ///
    /// A default config file is written if none exists.
    pub fn open(basedir: &Path) -> Result<Self> {
        std::fs::create_dir_all(basedir)?;
        let path = basedir.join(CONFIG_FILE_NAME);
        DepotConfig::write_default_if_missing(&path)?;
        let config = DepotConfig::from_file(&path)?;
        Self::open_with(basedir, config)
    }

    /// Open the store in `basedir` with an explicit config
    ///
    /// Crash recovery of the embedded backend runs here, before any
    /// transaction can start.
    pub fn open_with(basedir: &Path, config: DepotConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(basedir)?;
        let backend = open_backend(basedir, &config.backend_options())?;
        let manager = TransactionManager::new(backend, config.manager_options())?;
        let keys = KeyRegistry::default();
        let notifier = Arc::new(NotificationWorker::new(
            basedir,
            manager.clone(),
            keys.clone(),
            config.notify_recheck(),
        )?);
        info!(
            target: "depot::storage",
            basedir = %basedir.display(),
            backend = manager.backend().name(),
            serial = manager.current_serial(),
            readonly = manager.is_readonly(),
            "Opened store"
        );
        Ok(KeyFs {
            inner: Arc::new(KeyFsInner {
                basedir: basedir.to_path_buf(),
                config,
                manager,
                keys,
                notifier,
            }),
        })
    }

    /// Base directory
    pub fn basedir(&self) -> &Path {
        &self.inner.basedir
    }

    /// Configuration the store was opened with
    pub fn config(&self) -> &DepotConfig {
        &self.inner.config
    }

    /// The transaction manager
    pub fn manager(&self) -> &TransactionManager {
        &self.inner.manager
    }

    /// The key registry
    pub fn keys(&self) -> &KeyRegistry {
        &self.inner.keys
    }

    /// The notification worker; register it with a pool to run it
    pub fn notifier(&self) -> &Arc<NotificationWorker> {
        &self.inner.notifier
    }

    /// Register a key family
    pub fn add_key(&self, name: &str, pattern: &str, kind: ValueKind) -> Result<KeySpec> {
        self.inner.keys.add(name, pattern, kind)
    }

    /// Family registered under `name`
    pub fn get_key(&self, name: &str) -> Option<KeySpec> {
        self.inner.keys.get(name)
    }

    /// Typed key for a stored `(keyname, relpath)` pair
    pub fn key_instance(&self, keyname: &str, relpath: &str) -> Result<TypedKey> {
        self.inner.keys.key_instance(keyname, relpath)
    }

    /// Whether writes are refused
    pub fn is_readonly(&self) -> bool {
        self.inner.manager.is_readonly()
    }

    /// Latest published serial
    pub fn current_serial(&self) -> Serial {
        self.inner.manager.current_serial()
    }

    /// Read transaction at the latest serial
    pub fn begin_read(&self) -> Result<ReadTransaction> {
        self.inner.manager.begin_read()
    }

    /// Read transaction at an earlier serial
    pub fn begin_read_at(&self, serial: Serial) -> Result<ReadTransaction> {
        self.inner.manager.begin_read_at(serial)
    }

    /// Write transaction, failing fast if another one is active
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        self.inner.manager.begin_write()
    }

    /// Write transaction, waiting up to `timeout` for the active one
    pub fn begin_write_wait(&self, timeout: Duration) -> Result<WriteTransaction> {
        self.inner.manager.begin_write_wait(timeout)
    }

    /// Run `f` in a read transaction at the latest serial
    pub fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ReadTransaction) -> Result<R>,
    {
        let tx = self.begin_read()?;
        f(&tx)
    }

    /// Run `f` in a write transaction and commit if it succeeds
    ///
    /// Waits up to `write_timeout_ms` for the write slot. Returns `f`'s
    /// result and the new serial, `None` if nothing changed. An error from
    /// `f` rolls everything back.
    pub fn write<F, R>(&self, f: F) -> Result<(R, Option<Serial>)>
    where
        F: FnOnce(&mut WriteTransaction) -> Result<R>,
    {
        let mut tx = self.begin_write_wait(self.inner.config.write_timeout())?;
        let out = f(&mut tx)?;
        let serial = tx.commit()?;
        Ok((out, serial))
    }

    /// Block until `serial` is committed or `timeout` passes
    pub fn wait_for_serial(&self, serial: Serial, timeout: Duration) -> Result<bool> {
        self.inner.manager.wait_for_serial(serial, timeout)
    }

    /// Register a synchronous commit listener
    pub fn add_listener(&self, listener: Arc<dyn CommitListener>) {
        self.inner.manager.add_listener(listener)
    }

    /// Encoded delta of everything `serial` wrote to keys
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] for a serial that is not
    /// committed.
    pub fn export_changes(&self, serial: Serial) -> Result<Vec<u8>> {
        let current = self.inner.manager.refresh()?;
        if serial == 0 || serial > current {
            return Err(Error::InvalidOperation(format!(
                "serial {serial} is not committed (latest {current})"
            )));
        }
        let records = self.inner.manager.backend().changes_at(serial)?;
        replica::encode_delta(serial, &records)
    }

    /// Apply a delta produced by [`KeyFs::export_changes`] on another store
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReplicationGap`] unless `serial` directly follows
    /// the local serial.
    pub fn import_changes(&self, serial: Serial, delta: &[u8]) -> Result<()> {
        let (delta_serial, changes) = replica::decode_delta(delta)?;
        if delta_serial != serial {
            return Err(Error::InvalidOperation(format!(
                "delta is for serial {delta_serial}, expected {serial}"
            )));
        }
        self.inner.manager.import_changes(serial, changes, &[])
    }
}

impl std::fmt::Debug for KeyFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFs")
            .field("basedir", &self.inner.basedir)
            .field("serial", &self.current_serial())
            .finish()
    }
}
