//! Cooperative background worker pool
//!
//! Every worker runs on its own named thread. Workers are never interrupted;
//! they observe shutdown at the checkpoints their [`WorkerHandle`] offers
//! ([`WorkerHandle::sleep`] and [`WorkerHandle::exit_if_shutdown`]), which
//! return [`Error::Shutdown`] once the pool is going down.
//!
//! ## Shutdown Sequence
//!
//! ```text
//! 1. on_shutdown() of every worker, last registered first
//! 2. shutdown flag set, sleeping workers wake with Shutdown
//! 3. join every worker thread
//! ```
//!
//! The worker list is only locked long enough to copy out what each step
//! needs, so hooks and workers may query or register with the pool while it
//! shuts down. A worker whose `run` gives up with
//! [`Error::BackendUnavailable`] gets its `on_shutdown` called right away on
//! its own thread. Each hook runs at most once.

use depot_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// A long-running background task
pub trait Worker: Send + Sync + 'static {
    /// Name for logs and the thread name
    fn name(&self) -> &str;

    /// Main loop; return `Err(Error::Shutdown)` from a checkpoint to stop
    fn run(&self, handle: &WorkerHandle) -> Result<()>;

    /// Called from the thread running `shutdown()`, before the shutdown
    /// flag is raised, so the worker can wake itself; also called on the
    /// worker's own thread when `run` fails with a backend outage
    fn on_shutdown(&self) {}
}

/// Lifecycle of a registered worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Known to the pool, not started
    Registered,
    /// Thread running
    Running,
    /// Shutdown requested, thread not yet finished
    ShuttingDown,
    /// Thread finished or never started before shutdown
    Stopped,
}

struct PoolShared {
    shutdown: Mutex<bool>,
    wake: Condvar,
    fatal: Mutex<Option<Error>>,
}

impl PoolShared {
    fn is_shutdown(&self) -> bool {
        *self.shutdown.lock()
    }

    fn record_fatal(&self, err: Error) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }
}

/// What a running worker uses to cooperate with shutdown
pub struct WorkerHandle {
    name: String,
    shared: Arc<PoolShared>,
}

impl WorkerHandle {
    /// Name of the worker this handle belongs to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the pool is shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Return [`Error::Shutdown`] if the pool is shutting down
    pub fn exit_if_shutdown(&self) -> Result<()> {
        if self.shared.is_shutdown() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early with [`Error::Shutdown`]
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let mut shutdown = self.shared.shutdown.lock();
        loop {
            if *shutdown {
                return Err(Error::Shutdown);
            }
            if self.shared.wake.wait_until(&mut shutdown, deadline).timed_out() {
                return if *shutdown {
                    Err(Error::Shutdown)
                } else {
                    Ok(())
                };
            }
        }
    }
}

struct Entry {
    worker: Arc<dyn Worker>,
    state: Arc<Mutex<WorkerState>>,
    hooked: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Entry {
    fn new(worker: Arc<dyn Worker>) -> Self {
        Entry {
            worker,
            state: Arc::new(Mutex::new(WorkerState::Registered)),
            hooked: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

/// Run the worker's `on_shutdown` unless it already ran
fn run_hook(worker: &dyn Worker, hooked: &AtomicBool) {
    if hooked.swap(true, Ordering::SeqCst) {
        return;
    }
    if catch_unwind(AssertUnwindSafe(|| worker.on_shutdown())).is_err() {
        error!(target: "depot::pool", worker = worker.name(), "on_shutdown hook panicked");
    }
}

/// Owns background workers and their threads
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    entries: Mutex<Vec<Entry>>,
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPool {
    /// Create an empty pool
    pub fn new() -> Self {
        ThreadPool {
            shared: Arc::new(PoolShared {
                shutdown: Mutex::new(false),
                wake: Condvar::new(),
                fatal: Mutex::new(None),
            }),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Add a worker without starting it
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] once shutdown has begun.
    pub fn register(&self, worker: Arc<dyn Worker>) -> Result<()> {
        let mut entries = self.entries.lock();
        if self.shared.is_shutdown() {
            return Err(Error::Shutdown);
        }
        entries.push(Entry::new(worker));
        Ok(())
    }

    /// Start every registered worker that is not running yet
    pub fn start(&self) -> Result<()> {
        let mut entries = self.entries.lock();
        if self.shared.is_shutdown() {
            return Err(Error::Shutdown);
        }
        for entry in entries.iter_mut() {
            if *entry.state.lock() == WorkerState::Registered {
                self.spawn(entry)?;
            }
        }
        Ok(())
    }

    /// Register `worker` and start it immediately
    pub fn start_one(&self, worker: Arc<dyn Worker>) -> Result<()> {
        let mut entries = self.entries.lock();
        if self.shared.is_shutdown() {
            return Err(Error::Shutdown);
        }
        let mut entry = Entry::new(worker);
        self.spawn(&mut entry)?;
        entries.push(entry);
        Ok(())
    }

    fn spawn(&self, entry: &mut Entry) -> Result<()> {
        let worker = Arc::clone(&entry.worker);
        let state = Arc::clone(&entry.state);
        let hooked = Arc::clone(&entry.hooked);
        let handle = WorkerHandle {
            name: worker.name().to_string(),
            shared: Arc::clone(&self.shared),
        };
        *state.lock() = WorkerState::Running;
        let spawned = std::thread::Builder::new()
            .name(format!("depot-{}", worker.name()))
            .spawn(move || {
                run_worker(worker.as_ref(), &handle, &hooked);
                *state.lock() = WorkerState::Stopped;
            });
        match spawned {
            Ok(thread) => {
                debug!(target: "depot::pool", worker = entry.worker.name(), "Started worker");
                entry.thread = Some(thread);
                Ok(())
            }
            Err(e) => {
                *entry.state.lock() = WorkerState::Registered;
                Err(Error::Io(e))
            }
        }
    }

    /// State of the first worker registered under `name`
    pub fn state(&self, name: &str) -> Option<WorkerState> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.worker.name() == name)
            .map(|e| *e.state.lock())
    }

    /// Names and states of all workers in registration order
    pub fn states(&self) -> Vec<(String, WorkerState)> {
        self.entries
            .lock()
            .iter()
            .map(|e| (e.worker.name().to_string(), *e.state.lock()))
            .collect()
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// First error a worker ended with, other than shutdown
    pub fn take_fatal_error(&self) -> Option<Error> {
        self.shared.fatal.lock().take()
    }

    /// Stop every worker and wait for their threads
    ///
    /// Calling it again is a no-op.
    pub fn shutdown(&self) {
        let hooks: Vec<(Arc<dyn Worker>, Arc<AtomicBool>)> = {
            let entries = self.entries.lock();
            let pending = entries.iter().any(|e| e.thread.is_some());
            if self.shared.is_shutdown() && !pending {
                return;
            }
            debug!(target: "depot::pool", workers = entries.len(), "Shutting down worker pool");
            entries
                .iter()
                .rev()
                .map(|entry| {
                    let mut state = entry.state.lock();
                    *state = match *state {
                        WorkerState::Running => WorkerState::ShuttingDown,
                        WorkerState::Registered => WorkerState::Stopped,
                        other => other,
                    };
                    (Arc::clone(&entry.worker), Arc::clone(&entry.hooked))
                })
                .collect()
        };

        for (worker, hooked) in &hooks {
            run_hook(worker.as_ref(), hooked);
        }

        {
            let mut shutdown = self.shared.shutdown.lock();
            *shutdown = true;
            self.shared.wake.notify_all();
        }

        let threads: Vec<(String, Arc<Mutex<WorkerState>>, JoinHandle<()>)> = self
            .entries
            .lock()
            .iter_mut()
            .filter_map(|entry| {
                let thread = entry.thread.take()?;
                Some((
                    entry.worker.name().to_string(),
                    Arc::clone(&entry.state),
                    thread,
                ))
            })
            .collect();

        for (name, state, thread) in threads {
            if thread.join().is_err() {
                error!(target: "depot::pool", worker = %name, "Worker thread panicked");
            }
            *state.lock() = WorkerState::Stopped;
        }
        debug!(target: "depot::pool", "Worker pool stopped");
    }

    /// Run `f` with all workers started, shutting them down afterwards
    ///
    /// Shutdown happens even if `f` fails or panics.
    pub fn live<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ThreadPool) -> Result<R>,
    {
        struct ShutdownOnDrop<'a>(&'a ThreadPool);
        impl Drop for ShutdownOnDrop<'_> {
            fn drop(&mut self) {
                self.0.shutdown();
            }
        }

        let _guard = ShutdownOnDrop(self);
        self.start()?;
        f(self)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(worker: &dyn Worker, handle: &WorkerHandle, hooked: &AtomicBool) {
    let name = worker.name();
    match catch_unwind(AssertUnwindSafe(|| worker.run(handle))) {
        Ok(Ok(())) => debug!(target: "depot::pool", worker = name, "Worker finished"),
        Ok(Err(Error::Shutdown)) => {
            debug!(target: "depot::pool", worker = name, "Worker stopped for shutdown")
        }
        Ok(Err(e @ Error::BackendUnavailable(_))) => {
            warn!(target: "depot::pool", worker = name, error = %e, "Worker exiting, backend unavailable");
            run_hook(worker, hooked);
        }
        Ok(Err(e)) => {
            error!(target: "depot::pool", worker = name, error = %e, "Worker failed");
            handle.shared.record_fatal(e);
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "(non-string panic)".to_string());
            error!(target: "depot::pool", worker = name, panic = %msg, "Worker panicked");
            handle
                .shared
                .record_fatal(Error::InvalidOperation(format!("worker {name} panicked: {msg}")));
        }
    }
}
