//! Key change notifications
//!
//! The [`NotificationWorker`] replays committed serials in order and calls
//! the handlers registered for each changed key family. The last fully
//! processed serial is kept in `.event_serial` in the base directory, so
//! after a restart processing resumes where it stopped.
//!
//! Unlike [`depot_concurrency::CommitListener`]s, handlers run on the
//! worker thread, never on the committing one, and also see commits made
//! before the process started.

use crate::keyfs::KeyRegistry;
use crate::pool::{Worker, WorkerHandle};
use depot_concurrency::{ChangedKey, CommitEvent, TransactionManager};
use depot_core::{Error, FrozenValue, Result, Serial, TypedKey};
use depot_durability::{read_int_from_file, write_int_to_file};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// File holding the last processed serial
pub const EVENT_SERIAL_FILE: &str = ".event_serial";

/// One key changed by one serial
#[derive(Debug, Clone)]
pub struct KeyChangeEvent {
    /// The changed key
    pub key: TypedKey,
    /// New value, `None` if the key was deleted
    pub value: Option<FrozenValue>,
    /// Serial of the change
    pub at_serial: Serial,
    /// Previous serial that changed the key
    pub back_serial: Option<Serial>,
}

/// Receives key change events
pub trait KeyChangeHandler: Send + Sync {
    /// Handle one event; errors are logged and do not stop processing
    fn on_key_change(&self, event: &KeyChangeEvent) -> Result<()>;
}

impl<F> KeyChangeHandler for F
where
    F: Fn(&KeyChangeEvent) -> Result<()> + Send + Sync,
{
    fn on_key_change(&self, event: &KeyChangeEvent) -> Result<()> {
        self(event)
    }
}

#[derive(Default)]
struct WakeState {
    pending: bool,
    stopping: bool,
}

/// Wakes the worker on commits and on shutdown
#[derive(Default)]
struct Wake {
    state: Mutex<WakeState>,
    cv: Condvar,
}

impl Wake {
    fn signal(&self, stop: bool) {
        let mut state = self.state.lock();
        state.pending = true;
        state.stopping |= stop;
        self.cv.notify_all();
    }

    fn is_stopping(&self) -> bool {
        self.state.lock().stopping
    }

    fn wait(&self, timeout: Duration) {
        let mut state = self.state.lock();
        if !state.pending && !state.stopping {
            self.cv.wait_for(&mut state, timeout);
        }
        state.pending = false;
    }
}

/// Background worker delivering key change events
pub struct NotificationWorker {
    manager: TransactionManager,
    keys: KeyRegistry,
    path: PathBuf,
    recheck: Duration,
    handlers: RwLock<BTreeMap<String, Vec<Arc<dyn KeyChangeHandler>>>>,
    started: AtomicBool,
    processed: Mutex<Serial>,
    processed_cv: Condvar,
    wake: Arc<Wake>,
}

impl NotificationWorker {
    /// Create the worker for the store in `basedir`
    pub fn new(
        basedir: &Path,
        manager: TransactionManager,
        keys: KeyRegistry,
        recheck: Duration,
    ) -> Result<Self> {
        let path = basedir.join(EVENT_SERIAL_FILE);
        let processed = read_int_from_file(&path, 0)?;
        let wake = Arc::new(Wake::default());
        let sink = Arc::clone(&wake);
        manager.add_listener(Arc::new(move |_: &CommitEvent| sink.signal(false)));
        Ok(NotificationWorker {
            manager,
            keys,
            path,
            recheck,
            handlers: RwLock::new(BTreeMap::new()),
            started: AtomicBool::new(false),
            processed: Mutex::new(processed),
            processed_cv: Condvar::new(),
            wake,
        })
    }

    /// Call `handler` for every change to keys of family `keyname`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperation`] once the worker has started.
    pub fn on_key_change(&self, keyname: &str, handler: Arc<dyn KeyChangeHandler>) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(Error::InvalidOperation(
                "cannot register handlers after the notification worker started".into(),
            ));
        }
        self.handlers
            .write()
            .entry(keyname.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    /// Last serial whose handlers all ran
    pub fn read_event_serial(&self) -> Serial {
        *self.processed.lock()
    }

    fn write_event_serial(&self, serial: Serial) -> Result<()> {
        write_int_to_file(&self.path, serial)?;
        let mut processed = self.processed.lock();
        *processed = serial;
        self.processed_cv.notify_all();
        Ok(())
    }

    /// Block until handlers for `serial` ran or `timeout` passes
    pub fn wait_event_serial(&self, serial: Serial, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut processed = self.processed.lock();
        while *processed < serial {
            if self
                .processed_cv
                .wait_until(&mut processed, deadline)
                .timed_out()
            {
                return *processed >= serial;
            }
        }
        true
    }

    /// Process every committed serial not yet handled, on the calling thread
    ///
    /// Returns the last processed serial.
    pub fn process_pending(&self) -> Result<Serial> {
        self.catch_up(|| Ok(()))
    }

    fn catch_up(&self, checkpoint: impl Fn() -> Result<()>) -> Result<Serial> {
        let current = self.manager.refresh()?;
        let mut serial = self.read_event_serial();
        while serial < current {
            checkpoint()?;
            serial += 1;
            self.execute_hooks(serial)?;
            self.write_event_serial(serial)?;
        }
        Ok(serial)
    }

    fn execute_hooks(&self, serial: Serial) -> Result<()> {
        debug!(target: "depot::notify", serial, "Calling hooks");
        let changes = self.manager.changes_at(serial)?;
        let handlers = self.handlers.read();
        for ChangedKey {
            relpath,
            keyname,
            back_serial,
            value,
        } in changes
        {
            let Some(subscribers) = handlers.get(&keyname) else {
                continue;
            };
            let key = match self.keys.key_instance(&keyname, &relpath) {
                Ok(key) => key,
                Err(e) => {
                    warn!(target: "depot::notify", serial, %relpath, error = %e, "Skipping change to unknown key");
                    continue;
                }
            };
            let event = KeyChangeEvent {
                key,
                value,
                at_serial: serial,
                back_serial,
            };
            for handler in subscribers {
                match catch_unwind(AssertUnwindSafe(|| handler.on_key_change(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(target: "depot::notify", serial, key = %event.key, error = %e, "Key change handler failed")
                    }
                    Err(_) => {
                        error!(target: "depot::notify", serial, key = %event.key, "Key change handler panicked")
                    }
                }
            }
        }
        debug!(target: "depot::notify", serial, "Finished hooks");
        Ok(())
    }
}

impl Worker for NotificationWorker {
    fn name(&self) -> &str {
        "notifications"
    }

    fn run(&self, handle: &WorkerHandle) -> Result<()> {
        self.started.store(true, Ordering::Release);
        loop {
            handle.exit_if_shutdown()?;
            if self.wake.is_stopping() {
                return Err(Error::Shutdown);
            }
            let checkpoint = || {
                if self.wake.is_stopping() {
                    return Err(Error::Shutdown);
                }
                handle.exit_if_shutdown()
            };
            match self.catch_up(checkpoint) {
                Ok(_) => {}
                Err(e @ (Error::Shutdown | Error::BackendUnavailable(_))) => return Err(e),
                Err(e) => {
                    error!(target: "depot::notify", error = %e, "Unhandled error in notification worker");
                    handle.sleep(Duration::from_secs(1))?;
                    continue;
                }
            }
            self.wake.wait(self.recheck);
        }
    }

    fn on_shutdown(&self) {
        self.wake.signal(true);
    }
}
