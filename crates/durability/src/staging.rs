//! Staged file writes for the in-flight write transaction
//!
//! Writes land in a uniquely named temporary file next to the destination
//! (`<dest>-<uuid>-tmp`). Nothing touches the destination until the commit
//! applies the pending renames. Dropping a [`DirtyFileSet`] without
//! converting it into [`PendingRenames`] removes every temporary file it
//! created.

use crate::fileutil::{read_if_exists, remove_if_exists};
use crate::intent::{PendingRenames, RenamePair};
use depot_core::CommitError;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Suffix marking staging files; final relpaths may not end with it
pub const TMP_SUFFIX: &str = "-tmp";

/// Names in the base directory owned by the store itself
pub const RESERVED_NAMES: &[&str] = &[
    crate::intent::INTENT_FILE,
    ".sqlite",
    ".sqlite-wal",
    ".sqlite-shm",
    ".lock",
    ".event_serial",
    "depot.toml",
];

/// Check that `relpath` stays inside the base directory and cannot be
/// mistaken for a staging or bookkeeping file
pub fn validate_relpath(relpath: &str) -> Result<(), CommitError> {
    let invalid = || CommitError::InvalidPath(relpath.to_string());
    if relpath.is_empty() || relpath.ends_with(TMP_SUFFIX) || relpath.ends_with('/') {
        return Err(invalid());
    }
    if RESERVED_NAMES.contains(&relpath) {
        return Err(invalid());
    }
    for component in Path::new(relpath).components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(invalid()),
        }
    }
    Ok(())
}

/// Absolute path of `relpath` under `basedir`
pub fn resolve(basedir: &Path, relpath: &str) -> Result<PathBuf, CommitError> {
    validate_relpath(relpath)?;
    Ok(basedir.join(relpath))
}

fn tmp_relpath(relpath: &str) -> String {
    format!("{}-{}{}", relpath, uuid::Uuid::new_v4().simple(), TMP_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Staged {
    Write { tmp: String },
    Delete,
}

/// File changes staged by one write transaction
#[derive(Debug)]
pub struct DirtyFileSet {
    basedir: PathBuf,
    entries: BTreeMap<String, Staged>,
}

impl DirtyFileSet {
    /// Empty staging area rooted at `basedir`
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        DirtyFileSet {
            basedir: basedir.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Base directory
    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// Number of staged changes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is staged
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Staged relpaths in order
    pub fn relpaths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Stage new content for `relpath`
    pub fn set_bytes(&mut self, relpath: &str, data: &[u8]) -> Result<(), CommitError> {
        let dest = resolve(&self.basedir, relpath)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| CommitError::io(parent, e))?;
        }
        let tmp = tmp_relpath(relpath);
        let tmp_path = self.basedir.join(&tmp);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .map_err(|e| CommitError::io(&tmp_path, e))?;
        if let Err(e) = file.write_all(data).and_then(|_| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(&tmp_path);
            return Err(CommitError::io(&tmp_path, e));
        }

        if let Some(Staged::Write { tmp: previous }) =
            self.entries.insert(relpath.to_string(), Staged::Write { tmp })
        {
            remove_if_exists(&self.basedir.join(previous))?;
        }
        Ok(())
    }

    /// Stage deletion of `relpath`; deleting an absent file is not an error
    pub fn delete(&mut self, relpath: &str) -> Result<(), CommitError> {
        validate_relpath(relpath)?;
        if let Some(Staged::Write { tmp: previous }) =
            self.entries.insert(relpath.to_string(), Staged::Delete)
        {
            remove_if_exists(&self.basedir.join(previous))?;
        }
        Ok(())
    }

    /// Content of `relpath` as this transaction sees it
    pub fn read(&self, relpath: &str) -> Result<Option<Vec<u8>>, CommitError> {
        let dest = resolve(&self.basedir, relpath)?;
        match self.entries.get(relpath) {
            Some(Staged::Write { tmp }) => read_if_exists(&self.basedir.join(tmp)),
            Some(Staged::Delete) => Ok(None),
            None => read_if_exists(&dest),
        }
    }

    /// Whether `relpath` exists as this transaction sees it
    pub fn exists(&self, relpath: &str) -> Result<bool, CommitError> {
        let dest = resolve(&self.basedir, relpath)?;
        Ok(match self.entries.get(relpath) {
            Some(Staged::Write { .. }) => true,
            Some(Staged::Delete) => false,
            None => dest.exists(),
        })
    }

    /// Convert the staged changes into the rename list of a commit
    pub fn into_pending(mut self) -> PendingRenames {
        let entries = std::mem::take(&mut self.entries);
        PendingRenames::new(
            entries
                .into_iter()
                .map(|(dest, staged)| match staged {
                    Staged::Write { tmp } => RenamePair::rename(tmp, dest),
                    Staged::Delete => RenamePair::delete(dest),
                })
                .collect(),
        )
    }

    /// Abort: remove every temporary file, touching no destination
    pub fn discard(mut self) -> Result<usize, CommitError> {
        self.remove_temps()
    }

    fn remove_temps(&mut self) -> Result<usize, CommitError> {
        let mut removed = 0;
        let mut first_error = None;
        for staged in std::mem::take(&mut self.entries).into_values() {
            if let Staged::Write { tmp } = staged {
                match remove_if_exists(&self.basedir.join(&tmp)) {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }
}

impl Drop for DirtyFileSet {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        if let Err(e) = self.remove_temps() {
            warn!(target: "depot::commit", error = %e, "Failed to remove staged files");
        }
    }
}
