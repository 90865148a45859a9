//! Read and write transactions
//!
//! A [`ReadTransaction`] is pinned to one serial and sees exactly the state
//! committed at that serial, no matter how many commits land afterwards.
//!
//! A [`WriteTransaction`] reads from the snapshot it started at, stages key
//! and blob changes, and on commit makes all of them durable under one new
//! serial. Only one write transaction exists at a time; see
//! [`crate::TransactionManager::begin_write`].

use crate::manager::{ChangedKey, CommitEvent, ManagerInner, WriteGuard};
use depot_core::{decode, encode, Error, FrozenValue, KeySpec, Result, Serial, TypedKey, Value};
use depot_storage::{BackendWriter, ChangeRecord, PendingChange};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One committed version of a key
#[derive(Debug, Clone, PartialEq)]
pub struct KeyVersion {
    /// Serial that wrote this version
    pub serial: Serial,
    /// Serial of the previous version of the same key
    pub back_serial: Option<Serial>,
    /// Value, `None` if the key was deleted
    pub value: Option<FrozenValue>,
}

impl KeyVersion {
    pub(crate) fn from_record(record: ChangeRecord) -> Result<Self> {
        let value = match record.value {
            Some(bytes) => Some(FrozenValue::new(decode(&bytes)?)),
            None => None,
        };
        Ok(KeyVersion {
            serial: record.serial,
            back_serial: record.back_serial,
            value,
        })
    }

    /// Whether this version deletes the key
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Lifecycle of a write transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Accepting reads and writes
    Active,
    /// Changes are durable
    Committed,
    /// Changes were discarded
    Aborted,
}

fn default_for(key: &TypedKey) -> FrozenValue {
    FrozenValue::new(key.kind().empty().unwrap_or(Value::Null))
}

// ============================================================================
// ReadTransaction
// ============================================================================

/// Consistent view of the store at one serial
pub struct ReadTransaction {
    inner: Arc<ManagerInner>,
    at_serial: Serial,
    /// Lookups already answered at `at_serial`
    local: Mutex<FxHashMap<String, Option<KeyVersion>>>,
}

impl ReadTransaction {
    pub(crate) fn new(inner: Arc<ManagerInner>, at_serial: Serial) -> Self {
        ReadTransaction {
            inner,
            at_serial,
            local: Mutex::new(FxHashMap::default()),
        }
    }

    /// Serial this transaction reads at
    pub fn at_serial(&self) -> Serial {
        self.at_serial
    }

    fn version(&self, key: &TypedKey) -> Result<Option<KeyVersion>> {
        if let Some(hit) = self.local.lock().get(key.relpath()) {
            return Ok(hit.clone());
        }
        let found = self.inner.lookup(key.relpath(), self.at_serial)?;
        self.local
            .lock()
            .insert(key.relpath().to_string(), found.clone());
        Ok(found)
    }

    /// Value of `key`, `None` if it was never written or was deleted
    pub fn get(&self, key: &TypedKey) -> Result<Option<FrozenValue>> {
        Ok(self.version(key)?.and_then(|v| v.value))
    }

    /// Value of `key`, or the empty value of its kind
    pub fn get_or_default(&self, key: &TypedKey) -> Result<FrozenValue> {
        Ok(self.get(key)?.unwrap_or_else(|| default_for(key)))
    }

    /// Whether `key` has a live value
    pub fn exists(&self, key: &TypedKey) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Serial of the latest change to `key`, deletions included
    pub fn last_serial(&self, key: &TypedKey) -> Result<Option<Serial>> {
        Ok(self.version(key)?.map(|v| v.serial))
    }

    /// Value of `key` as of an earlier serial
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] if `serial` lies beyond this
    /// transaction's snapshot.
    pub fn get_value_at(&self, key: &TypedKey, serial: Serial) -> Result<Option<FrozenValue>> {
        if serial > self.at_serial {
            return Err(Error::InvalidOperation(format!(
                "serial {serial} is after the snapshot at {}",
                self.at_serial
            )));
        }
        if serial == self.at_serial {
            return self.get(key);
        }
        Ok(self
            .inner
            .lookup(key.relpath(), serial)?
            .and_then(|v| v.value))
    }

    /// Every version of `key` up to the snapshot, newest first
    pub fn history(&self, key: &TypedKey) -> Result<Vec<KeyVersion>> {
        let mut versions = Vec::new();
        let mut next = self.version(key)?;
        while let Some(version) = next {
            next = match version.back_serial {
                Some(back) => {
                    let prev = self.inner.lookup(key.relpath(), back)?;
                    if let Some(p) = &prev {
                        if p.serial != back {
                            return Err(Error::backend(format!(
                                "{key}: back serial {back} points at missing record"
                            )));
                        }
                    }
                    prev
                }
                None => None,
            };
            versions.push(version);
        }
        Ok(versions)
    }

    /// Live keys of the family `spec` with their values
    pub fn keys_with_name(&self, spec: &KeySpec) -> Result<Vec<(TypedKey, FrozenValue)>> {
        let records = self
            .inner
            .backend
            .keys_with_name(spec.name(), self.at_serial)?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let key = spec.key_for_relpath(&record.relpath)?;
            if let Some(value) = KeyVersion::from_record(record)?.value {
                out.push((key, value));
            }
        }
        Ok(out)
    }

    /// Committed content of a blob
    pub fn read_file(&self, relpath: &str) -> Result<Option<Vec<u8>>> {
        self.inner.backend.read_file(relpath)
    }

    /// Whether a committed blob exists
    pub fn file_exists(&self, relpath: &str) -> Result<bool> {
        self.inner.backend.file_exists(relpath)
    }
}

impl std::fmt::Debug for ReadTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("at_serial", &self.at_serial)
            .finish()
    }
}

// ============================================================================
// WriteTransaction
// ============================================================================

#[derive(Debug, Clone)]
enum Staged {
    Set(FrozenValue),
    Delete,
}

#[derive(Debug, Clone)]
struct StagedKey {
    key: TypedKey,
    change: Staged,
}

/// Summary of what a write transaction would commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingOperations {
    /// Keys receiving a new value
    pub sets: usize,
    /// Keys being deleted
    pub deletes: usize,
    /// Blob changes
    pub files: usize,
}

impl PendingOperations {
    /// Total number of staged changes
    pub fn total(&self) -> usize {
        self.sets + self.deletes + self.files
    }
}

/// The single staging transaction
///
/// Dropping an uncommitted transaction rolls it back.
pub struct WriteTransaction {
    snapshot: ReadTransaction,
    writer: Option<Box<dyn BackendWriter>>,
    staged: BTreeMap<String, StagedKey>,
    status: TransactionStatus,
    _guard: WriteGuard,
}

impl WriteTransaction {
    pub(crate) fn new(
        snapshot: ReadTransaction,
        writer: Box<dyn BackendWriter>,
        guard: WriteGuard,
    ) -> Self {
        WriteTransaction {
            snapshot,
            writer: Some(writer),
            staged: BTreeMap::new(),
            status: TransactionStatus::Active,
            _guard: guard,
        }
    }

    /// Serial of the snapshot this transaction started from
    pub fn at_serial(&self) -> Serial {
        self.snapshot.at_serial()
    }

    /// Current lifecycle state
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    fn ensure_active(&self) -> Result<()> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            other => Err(Error::InvalidOperation(format!(
                "transaction is {other:?}"
            ))),
        }
    }

    fn writer(&mut self) -> Result<&mut Box<dyn BackendWriter>> {
        self.ensure_active()?;
        self.writer
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation("transaction already finished".into()))
    }

    /// Value of `key` including this transaction's own changes
    pub fn get(&self, key: &TypedKey) -> Result<Option<FrozenValue>> {
        match self.staged.get(key.relpath()) {
            Some(StagedKey {
                change: Staged::Set(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(StagedKey {
                change: Staged::Delete,
                ..
            }) => Ok(None),
            None => self.snapshot.get(key),
        }
    }

    /// Value of `key` or the empty value of its kind
    pub fn get_or_default(&self, key: &TypedKey) -> Result<FrozenValue> {
        Ok(self.get(key)?.unwrap_or_else(|| default_for(key)))
    }

    /// Whether `key` has a live value, including staged changes
    pub fn exists(&self, key: &TypedKey) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Committed value at the snapshot, ignoring staged changes
    pub fn get_committed(&self, key: &TypedKey) -> Result<Option<FrozenValue>> {
        self.snapshot.get(key)
    }

    /// Serial of the latest committed change to `key`
    pub fn last_serial(&self, key: &TypedKey) -> Result<Option<Serial>> {
        self.snapshot.last_serial(key)
    }

    /// Live keys of the family `spec`, including staged changes
    pub fn keys_with_name(&self, spec: &KeySpec) -> Result<Vec<(TypedKey, FrozenValue)>> {
        let mut merged: BTreeMap<TypedKey, FrozenValue> =
            self.snapshot.keys_with_name(spec)?.into_iter().collect();
        for entry in self.staged.values() {
            if entry.key.name() != spec.name() {
                continue;
            }
            match &entry.change {
                Staged::Set(value) => {
                    merged.insert(entry.key.clone(), value.clone());
                }
                Staged::Delete => {
                    merged.remove(&entry.key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Stage a new value for `key`
    ///
    /// Setting the value already committed at the snapshot is not a change
    /// and drops any earlier staged change to the key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] if the value does not fit the key's
    /// declared kind.
    pub fn set(&mut self, key: &TypedKey, value: impl Into<Value>) -> Result<()> {
        self.ensure_active()?;
        let value = value.into();
        key.check_value(&value)?;
        let committed = self.snapshot.get(key)?;
        if committed.is_some_and(|c| c == value) {
            self.staged.remove(key.relpath());
            return Ok(());
        }
        self.staged.insert(
            key.relpath().to_string(),
            StagedKey {
                key: key.clone(),
                change: Staged::Set(FrozenValue::new(value)),
            },
        );
        Ok(())
    }

    /// Stage deletion of `key`
    pub fn delete(&mut self, key: &TypedKey) -> Result<()> {
        self.ensure_active()?;
        if self.snapshot.exists(key)? {
            self.staged.insert(
                key.relpath().to_string(),
                StagedKey {
                    key: key.clone(),
                    change: Staged::Delete,
                },
            );
        } else {
            self.staged.remove(key.relpath());
        }
        Ok(())
    }

    /// Modify a mutable copy of the current value and stage the result
    ///
    /// Starts from the empty value of the key's kind if the key is unset.
    pub fn update<F, R>(&mut self, key: &TypedKey, f: F) -> Result<R>
    where
        F: FnOnce(&mut Value) -> R,
    {
        let mut value = self.get_or_default(key)?.thaw();
        let out = f(&mut value);
        self.set(key, value)?;
        Ok(out)
    }

    /// Stage new content for a blob
    pub fn set_bytes(&mut self, relpath: &str, data: &[u8]) -> Result<()> {
        self.writer()?.set_file(relpath, data)
    }

    /// Stage deletion of a blob
    pub fn delete_file(&mut self, relpath: &str) -> Result<()> {
        self.writer()?.delete_file(relpath)
    }

    /// Blob content including staged changes
    pub fn read_file(&self, relpath: &str) -> Result<Option<Vec<u8>>> {
        match &self.writer {
            Some(w) => w.read_file(relpath),
            None => self.snapshot.read_file(relpath),
        }
    }

    /// Blob existence including staged changes
    pub fn file_exists(&self, relpath: &str) -> Result<bool> {
        match &self.writer {
            Some(w) => w.file_exists(relpath),
            None => self.snapshot.file_exists(relpath),
        }
    }

    /// Keys with a staged change, in relpath order
    pub fn changed_keys(&self) -> Vec<TypedKey> {
        self.staged.values().map(|e| e.key.clone()).collect()
    }

    /// Counts of staged changes
    pub fn pending_operations(&self) -> PendingOperations {
        let mut ops = PendingOperations {
            files: self.writer.as_ref().map_or(0, |w| w.dirty_files()),
            ..PendingOperations::default()
        };
        for entry in self.staged.values() {
            match entry.change {
                Staged::Set(_) => ops.sets += 1,
                Staged::Delete => ops.deletes += 1,
            }
        }
        ops
    }

    /// Whether anything is staged
    pub fn is_dirty(&self) -> bool {
        self.pending_operations().total() > 0
    }

    /// Make every staged change durable under one new serial
    ///
    /// Returns the new serial, or `None` if nothing was staged; an empty
    /// commit does not allocate a serial.
    ///
    /// ## Commit Sequence
    ///
    /// ```text
    /// 1. Encode staged values and look up each key's back serial
    /// 2. Allocate serial = snapshot serial + 1
    /// 3. Backend commit (blobs and records, crash-safe)
    /// 4. Insert the new versions into the value cache
    /// 5. Publish the serial, wake serial waiters
    /// 6. Deliver the commit event to listeners
    /// ```
    ///
    /// A failure before step 3 completes leaves nothing visible.
    pub fn commit(mut self) -> Result<Option<Serial>> {
        self.ensure_active()?;

        if !self.is_dirty() {
            self.status = TransactionStatus::Committed;
            if let Some(writer) = self.writer.take() {
                writer.rollback()?;
            }
            debug!(target: "depot::txn", at_serial = self.at_serial(), "Empty commit, no serial allocated");
            return Ok(None);
        }

        let serial = self.at_serial() + 1;
        let mut pending = Vec::with_capacity(self.staged.len());
        let mut changed = Vec::with_capacity(self.staged.len());
        for (relpath, entry) in &self.staged {
            let back_serial = self.snapshot.last_serial(&entry.key)?;
            let value = match &entry.change {
                Staged::Set(v) => Some(v.clone()),
                Staged::Delete => None,
            };
            let encoded = match &value {
                Some(v) => Some(encode(v)?),
                None => None,
            };
            pending.push(PendingChange {
                relpath: relpath.clone(),
                keyname: entry.key.name().to_string(),
                back_serial,
                value: encoded,
            });
            changed.push(ChangedKey {
                relpath: relpath.clone(),
                keyname: entry.key.name().to_string(),
                back_serial,
                value,
            });
        }

        let writer = self
            .writer
            .take()
            .ok_or_else(|| Error::InvalidOperation("transaction already finished".into()))?;
        let inner = Arc::clone(&self.snapshot.inner);
        inner.begin_commit(serial);
        let summary = match writer.commit(serial, pending) {
            Ok(summary) => summary,
            Err(e) => {
                inner.end_commit();
                self.status = TransactionStatus::Aborted;
                warn!(target: "depot::txn", serial, error = %e, "Commit failed");
                return Err(e);
            }
        };
        self.status = TransactionStatus::Committed;

        info!(
            target: "depot::txn",
            serial,
            keys = changed.len(),
            files_commit = summary.files_commit.len(),
            files_del = summary.files_del.len(),
            "Committed"
        );
        inner.publish(CommitEvent {
            serial,
            keys: changed,
            files_commit: summary.files_commit,
            files_del: summary.files_del,
        });
        Ok(Some(serial))
    }

    /// Discard everything staged and release the writer slot
    pub fn abort(mut self) -> Result<()> {
        self.ensure_active()?;
        self.status = TransactionStatus::Aborted;
        self.staged.clear();
        match self.writer.take() {
            Some(writer) => writer.rollback(),
            None => Ok(()),
        }
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if self.status != TransactionStatus::Active {
            return;
        }
        self.status = TransactionStatus::Aborted;
        if let Some(writer) = self.writer.take() {
            debug!(target: "depot::txn", at_serial = self.at_serial(), "Rolling back dropped write transaction");
            if let Err(e) = writer.rollback() {
                warn!(target: "depot::txn", error = %e, "Rollback of dropped transaction failed");
            }
        }
    }
}

impl std::fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("at_serial", &self.at_serial())
            .field("status", &self.status)
            .field("staged", &self.staged.len())
            .finish()
    }
}
