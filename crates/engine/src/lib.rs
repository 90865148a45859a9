//! Store engine for depot
//!
//! This crate assembles the lower layers into the store that applications
//! use:
//! - KeyFs: open a store, register key families, run transactions
//! - DepotConfig: `depot.toml` handling and backend selection
//! - ThreadPool: cooperative background workers with ordered shutdown
//! - NotificationWorker: ordered key change events, resumable after restart
//! - ReplicaPuller: follow another store through transaction deltas

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod keyfs;
pub mod notify;
pub mod pool;
pub mod replica;

pub use config::{DepotConfig, CONFIG_FILE_NAME};
pub use keyfs::{KeyFs, KeyRegistry};
pub use notify::{KeyChangeEvent, KeyChangeHandler, NotificationWorker, EVENT_SERIAL_FILE};
pub use pool::{ThreadPool, Worker, WorkerHandle, WorkerState};
pub use replica::{decode_delta, encode_delta, ChangeSource, ReplicaPuller};
