//! Durability layer for depot
//!
//! This crate implements the crash-safe file commit protocol:
//! - staging: temporary files for the in-flight write transaction
//! - intent: the durable pending-rename record
//! - commit: apply, finish, abort and recovery replay
//! - fileutil: atomic small-file helpers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod commit;
pub mod fileutil;
pub mod intent;
pub mod staging;

pub use commit::{apply_renames, recover, ApplyReport, FileStore, PreparedCommit};
pub use fileutil::{read_int_from_file, write_atomic, write_int_to_file};
pub use intent::{IntentLog, PendingRenames, RenamePair, INTENT_FILE};
pub use staging::{validate_relpath, DirtyFileSet, TMP_SUFFIX};
