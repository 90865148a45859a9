//! Crash-safe file commit
//!
//! A write transaction's file changes go through these states:
//!
//! 1. **Staging**: [`DirtyFileSet`] writes temporary files
//! 2. **Intent-Recorded**: [`FileStore::prepare`] persists the rename list
//! 3. **Applying**: [`PreparedCommit::apply`] renames and deletes
//! 4. **Committed**: [`PreparedCommit::finish`] removes the intent record
//!
//! A crash between 2 and 4 leaves the intent record on disk; [`recover`]
//! replays it at startup. Every step of the replay tolerates having already
//! happened, so recovery can itself crash and be rerun.

use crate::fileutil::{read_if_exists, remove_if_exists, sync_dir};
use crate::intent::{IntentLog, PendingRenames};
use crate::staging::{resolve, DirtyFileSet, TMP_SUFFIX};
use depot_core::CommitError;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Outcome of applying a rename list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Destinations written
    pub files_commit: Vec<String>,
    /// Destinations deleted
    pub files_del: Vec<String>,
}

impl ApplyReport {
    /// Total number of applied pairs
    pub fn total(&self) -> usize {
        self.files_commit.len() + self.files_del.len()
    }
}

/// Apply every pair of `renames` under `basedir`
///
/// - staged file present: rename it onto the destination
/// - staged file gone but destination present: already applied, skip
/// - both gone: [`CommitError::MissingFile`]
/// - delete: remove the destination if present
pub fn apply_renames(basedir: &Path, renames: &PendingRenames) -> Result<ApplyReport, CommitError> {
    let mut report = ApplyReport::default();
    let mut touched_dirs = BTreeSet::new();

    for pair in renames.pairs() {
        let dest = basedir.join(&pair.dest);
        match &pair.tmp {
            Some(tmp) => {
                let tmp_path = basedir.join(tmp);
                if tmp_path.exists() {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent).map_err(|e| CommitError::io(parent, e))?;
                    }
                    fs::rename(&tmp_path, &dest).map_err(|e| CommitError::io(&dest, e))?;
                } else if !dest.exists() {
                    return Err(CommitError::MissingFile(dest));
                }
                report.files_commit.push(pair.dest.clone());
            }
            None => {
                remove_if_exists(&dest)?;
                report.files_del.push(pair.dest.clone());
            }
        }
        if let Some(parent) = dest.parent() {
            touched_dirs.insert(parent.to_path_buf());
        }
    }

    for dir in touched_dirs {
        if dir.exists() {
            sync_dir(&dir)?;
        }
    }
    Ok(report)
}

/// Replay an interrupted commit, if one is recorded under `basedir`
///
/// Returns the replayed report, or `None` when there was nothing to do.
pub fn recover(basedir: &Path) -> Result<Option<ApplyReport>, CommitError> {
    let log = IntentLog::new(basedir);
    let renames = match log.read()? {
        Some(renames) => renames,
        None => return Ok(None),
    };
    warn!(
        target: "depot::recovery",
        pairs = renames.len(),
        "Found pending renames from an interrupted commit, replaying"
    );
    let report = apply_renames(basedir, &renames)?;
    for path in &report.files_commit {
        warn!(target: "depot::recovery", path = %path, "Completed rename");
    }
    for path in &report.files_del {
        warn!(target: "depot::recovery", path = %path, "Completed delete");
    }
    log.clear()?;
    Ok(Some(report))
}

/// File half of the embedded store: blobs under a base directory
#[derive(Debug, Clone)]
pub struct FileStore {
    basedir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) the base directory
    pub fn open(basedir: impl Into<PathBuf>) -> Result<Self, CommitError> {
        let basedir = basedir.into();
        fs::create_dir_all(&basedir).map_err(|e| CommitError::io(&basedir, e))?;
        Ok(FileStore { basedir })
    }

    /// Base directory
    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// Read committed content of `relpath`
    pub fn read(&self, relpath: &str) -> Result<Option<Vec<u8>>, CommitError> {
        read_if_exists(&resolve(&self.basedir, relpath)?)
    }

    /// Whether committed content exists for `relpath`
    pub fn exists(&self, relpath: &str) -> Result<bool, CommitError> {
        Ok(resolve(&self.basedir, relpath)?.is_file())
    }

    /// Fresh staging area for a write transaction
    pub fn begin(&self) -> DirtyFileSet {
        DirtyFileSet::new(&self.basedir)
    }

    /// Replay any interrupted commit
    pub fn recover(&self) -> Result<Option<ApplyReport>, CommitError> {
        recover(&self.basedir)
    }

    /// Remove staging files left by transactions that never reached the
    /// intent record
    ///
    /// Only valid once [`FileStore::recover`] has run; a pending intent
    /// record still refers to its staging files.
    pub fn remove_orphaned_temps(&self) -> Result<usize, CommitError> {
        if IntentLog::new(&self.basedir).exists() {
            return Ok(0);
        }
        let mut removed = 0;
        let mut stack = vec![self.basedir.clone()];
        while let Some(dir) = stack.pop() {
            let entries = fs::read_dir(&dir).map_err(|e| CommitError::io(&dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| CommitError::io(&dir, e))?;
                let path = entry.path();
                let file_type = entry.file_type().map_err(|e| CommitError::io(&path, e))?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if entry.file_name().to_string_lossy().ends_with(TMP_SUFFIX) {
                    remove_if_exists(&path)?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            warn!(target: "depot::recovery", removed, "Removed orphaned staging files");
        }
        Ok(removed)
    }

    /// Persist the intent record for `dirty`
    ///
    /// On failure the staged temporary files are removed and nothing else
    /// is touched.
    pub fn prepare(&self, dirty: DirtyFileSet) -> Result<PreparedCommit, CommitError> {
        let renames = dirty.into_pending();
        let log = IntentLog::new(&self.basedir);
        if let Err(e) = log.write(&renames) {
            error!(target: "depot::commit", error = %e, "Could not write intent record");
            discard_temps(&self.basedir, &renames);
            let _ = log.clear();
            return Err(e);
        }
        Ok(PreparedCommit {
            basedir: self.basedir.clone(),
            log,
            renames,
        })
    }

    /// Stage-to-committed in one call, for callers with no index to update
    pub fn commit(&self, dirty: DirtyFileSet) -> Result<ApplyReport, CommitError> {
        if dirty.is_empty() {
            return Ok(ApplyReport::default());
        }
        let prepared = self.prepare(dirty)?;
        match prepared.apply() {
            Ok(report) => {
                prepared.finish()?;
                Ok(report)
            }
            Err(e) => {
                error!(target: "depot::commit", error = %e, "Applying file changes failed");
                prepared.abort()?;
                Err(e)
            }
        }
    }
}

fn discard_temps(basedir: &Path, renames: &PendingRenames) {
    for pair in renames.pairs() {
        if let Some(tmp) = &pair.tmp {
            match fs::remove_file(basedir.join(tmp)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(target: "depot::commit", path = %tmp, error = %e, "Failed to remove staged file")
                }
            }
        }
    }
}

/// A commit whose intent record is durable
#[derive(Debug)]
pub struct PreparedCommit {
    basedir: PathBuf,
    log: IntentLog,
    renames: PendingRenames,
}

impl PreparedCommit {
    /// The recorded rename list
    pub fn renames(&self) -> &PendingRenames {
        &self.renames
    }

    /// Perform the renames and deletes
    pub fn apply(&self) -> Result<ApplyReport, CommitError> {
        let report = apply_renames(&self.basedir, &self.renames)?;
        debug!(
            target: "depot::commit",
            files_commit = report.files_commit.len(),
            files_del = report.files_del.len(),
            "Applied file changes"
        );
        Ok(report)
    }

    /// Remove the intent record; the commit is complete
    pub fn finish(self) -> Result<(), CommitError> {
        self.log.clear()
    }

    /// Give up on this commit: remove remaining staged files and the record
    ///
    /// Renames that already landed stay in place.
    pub fn abort(self) -> Result<(), CommitError> {
        discard_temps(&self.basedir, &self.renames);
        self.log.clear()
    }
}
