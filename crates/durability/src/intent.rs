//! Pending rename record
//!
//! The list of `(tmp | null, dest)` pairs a commit is about to apply,
//! persisted before the first rename. Paths are relative to the base
//! directory so the record survives the directory being moved.
//!
//! # Format
//!
//! ```text
//! +--------------------------------+
//! | codec value: [[tmp|null, dest], ...] |
//! +--------------------------------+
//! | CRC32 of the above (4 bytes LE)|
//! +--------------------------------+
//! ```

use crate::fileutil::{read_if_exists, remove_if_exists, sync_dir, write_atomic};
use depot_core::{codec, CommitError, Sequence, Value};
use std::path::{Path, PathBuf};

/// File name of the intent record inside the base directory
pub const INTENT_FILE: &str = ".pending-renames";

/// One filesystem side effect of a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePair {
    /// Staged temporary relpath, or `None` to delete `dest`
    pub tmp: Option<String>,
    /// Destination relpath
    pub dest: String,
}

impl RenamePair {
    /// Rename `tmp` onto `dest`
    pub fn rename(tmp: impl Into<String>, dest: impl Into<String>) -> Self {
        RenamePair {
            tmp: Some(tmp.into()),
            dest: dest.into(),
        }
    }

    /// Delete `dest` if present
    pub fn delete(dest: impl Into<String>) -> Self {
        RenamePair {
            tmp: None,
            dest: dest.into(),
        }
    }

    /// Whether this pair deletes its destination
    pub fn is_delete(&self) -> bool {
        self.tmp.is_none()
    }
}

/// Ordered list of rename pairs for one commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingRenames {
    pairs: Vec<RenamePair>,
}

impl PendingRenames {
    /// Wrap a list of pairs
    pub fn new(pairs: Vec<RenamePair>) -> Self {
        PendingRenames { pairs }
    }

    /// The pairs in apply order
    pub fn pairs(&self) -> &[RenamePair] {
        &self.pairs
    }

    /// Number of pairs
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether there is nothing to apply
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Serialize with a trailing checksum
    pub fn to_bytes(&self) -> Result<Vec<u8>, CommitError> {
        let list: Sequence = self
            .pairs
            .iter()
            .map(|p| {
                let tmp = p.tmp.clone().map(Value::Str).unwrap_or(Value::Null);
                Value::Seq(Sequence::from_vec(vec![tmp, Value::Str(p.dest.clone())]))
            })
            .collect();
        let mut bytes = codec::encode(&Value::Seq(list))?;
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Ok(bytes)
    }

    /// Parse and verify bytes written by [`PendingRenames::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CommitError> {
        let corrupt = |msg: &str| CommitError::CorruptIntent(msg.to_string());
        if bytes.len() < 4 {
            return Err(corrupt("record too short"));
        }
        let (body, footer) = bytes.split_at(bytes.len() - 4);
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(footer);
        if crc32fast::hash(body) != u32::from_le_bytes(crc_bytes) {
            return Err(corrupt("checksum mismatch"));
        }

        let value = codec::decode(body).map_err(|e| CommitError::CorruptIntent(e.to_string()))?;
        let list = value.as_seq().ok_or_else(|| corrupt("expected a list"))?;
        let mut pairs = Vec::with_capacity(list.len());
        for item in list {
            let pair = item
                .as_seq()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| corrupt("expected [tmp, dest] pairs"))?;
            let tmp = match pair.get(0) {
                Some(Value::Null) => None,
                Some(Value::Str(s)) => Some(s.clone()),
                _ => return Err(corrupt("tmp must be a string or null")),
            };
            let dest = pair
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| corrupt("dest must be a string"))?;
            pairs.push(RenamePair {
                tmp,
                dest: dest.to_string(),
            });
        }
        Ok(PendingRenames { pairs })
    }
}

/// Location of the durable intent record
#[derive(Debug, Clone)]
pub struct IntentLog {
    basedir: PathBuf,
    path: PathBuf,
}

impl IntentLog {
    /// Intent record for `basedir`
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        let basedir = basedir.into();
        let path = basedir.join(INTENT_FILE);
        IntentLog { basedir, path }
    }

    /// Path of the record file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a record is present
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Durably replace the record with `renames`
    pub fn write(&self, renames: &PendingRenames) -> Result<(), CommitError> {
        write_atomic(&self.path, &renames.to_bytes()?)
    }

    /// Load the record, if any
    pub fn read(&self) -> Result<Option<PendingRenames>, CommitError> {
        match read_if_exists(&self.path)? {
            None => Ok(None),
            Some(bytes) => PendingRenames::from_bytes(&bytes).map(Some),
        }
    }

    /// Remove the record
    pub fn clear(&self) -> Result<(), CommitError> {
        if remove_if_exists(&self.path)? {
            sync_dir(&self.basedir)?;
        }
        Ok(())
    }
}
