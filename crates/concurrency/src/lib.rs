//! Transactions for depot
//!
//! This crate implements serial-based snapshot isolation over a
//! [`depot_storage::StorageBackend`]:
//! - TransactionManager: single writer, serial publication, commit listeners
//! - ReadTransaction: consistent reads pinned to one serial
//! - WriteTransaction: staged key and blob changes, atomic commit
//! - ValueCache: process-wide cache of recently committed versions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod manager;
pub mod transaction;

pub use cache::ValueCache;
pub use manager::{ChangedKey, CommitEvent, CommitListener, ManagerOptions, TransactionManager};
pub use transaction::{
    KeyVersion, PendingOperations, ReadTransaction, TransactionStatus, WriteTransaction,
};
