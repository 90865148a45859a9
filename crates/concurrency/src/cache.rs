//! Process-wide value cache
//!
//! Maps a key relpath to the versions written by recent commits of this
//! process. Each entry is an immutable `Arc` snapshot; inserting a version
//! builds a new snapshot and swaps it in, so a reader holding the old one
//! never observes a change.
//!
//! # Completeness
//!
//! Only the commit path inserts, and it inserts every key it writes. So for
//! any cached version `s` of a key, every later write to that key committed
//! by this process is cached too. A lookup at serial `at` may therefore
//! answer with the newest cached version `<= at`. When no cached version is
//! `<= at` the caller must ask the backend.
//!
//! Writes by other processes break this; the manager calls [`ValueCache::clear`]
//! as soon as it observes them.

use crate::transaction::KeyVersion;
use dashmap::DashMap;
use depot_core::Serial;
use std::sync::Arc;
use tracing::debug;

/// Versions kept per key; older ones fall back to the backend
pub const MAX_VERSIONS_PER_KEY: usize = 8;

/// Append-only cache of committed key versions
#[derive(Debug)]
pub struct ValueCache {
    entries: DashMap<String, Arc<Vec<KeyVersion>>>,
    capacity: usize,
}

impl ValueCache {
    /// Cache holding at most `capacity` keys
    pub fn new(capacity: usize) -> Self {
        ValueCache {
            entries: DashMap::new(),
            capacity,
        }
    }

    /// Number of cached keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest cached version of `relpath` written at or before `at`
    pub fn get(&self, relpath: &str, at: Serial) -> Option<KeyVersion> {
        let versions = Arc::clone(self.entries.get(relpath)?.value());
        versions.iter().rev().find(|v| v.serial <= at).cloned()
    }

    /// Record a version written by a commit of this process
    ///
    /// Versions of one key must be inserted in increasing serial order.
    pub fn insert(&self, relpath: &str, version: KeyVersion) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(relpath) && self.entries.len() >= self.capacity {
            debug!(target: "depot::txn", capacity = self.capacity, "Value cache full, clearing");
            self.entries.clear();
        }
        let mut entry = self.entries.entry(relpath.to_string()).or_default();
        let mut versions: Vec<KeyVersion> = entry.value().as_ref().clone();
        versions.push(version);
        if versions.len() > MAX_VERSIONS_PER_KEY {
            versions.drain(..versions.len() - MAX_VERSIONS_PER_KEY);
        }
        *entry.value_mut() = Arc::new(versions);
    }

    /// Forget everything
    pub fn clear(&self) {
        self.entries.clear();
    }
}
