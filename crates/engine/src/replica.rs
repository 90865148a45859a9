//! Replication of transaction deltas
//!
//! A delta is one serial's key changes encoded with the value codec:
//!
//! ```text
//! {"serial": N,
//!  "changes": [[relpath, keyname, back_serial | null, encoded | null], ...]}
//! ```
//!
//! Values travel as their stored encoding (a byte string), so a replica
//! stores exactly the bytes the primary stored. `null` marks a deletion.
//! Blob files are not part of deltas.

use crate::keyfs::KeyFs;
use crate::pool::{Worker, WorkerHandle};
use depot_core::{decode, encode, Error, Mapping, Result, Sequence, Serial, Value};
use depot_storage::{ChangeRecord, PendingChange};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

fn malformed(detail: impl std::fmt::Display) -> Error {
    Error::InvalidOperation(format!("malformed replication delta: {detail}"))
}

fn serial_value(serial: Serial) -> Result<Value> {
    i64::try_from(serial)
        .map(Value::Int)
        .map_err(|_| malformed(format!("serial {serial} out of range")))
}

fn serial_from(value: &Value) -> Result<Serial> {
    let n = value
        .as_int()
        .ok_or_else(|| malformed(format!("expected a serial, got {}", value.type_name())))?;
    Serial::try_from(n).map_err(|_| malformed(format!("negative serial {n}")))
}

fn string_from(value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| malformed(format!("expected a string, got {}", value.type_name())))
}

/// Encode the records of `serial` as a delta
pub fn encode_delta(serial: Serial, records: &[ChangeRecord]) -> Result<Vec<u8>> {
    let mut changes = Sequence::new();
    for record in records {
        let back = match record.back_serial {
            Some(back) => serial_value(back)?,
            None => Value::Null,
        };
        let value = match &record.value {
            Some(bytes) => Value::Bytes(bytes.clone()),
            None => Value::Null,
        };
        changes.push(Value::Seq(Sequence::from_vec(vec![
            Value::from(record.relpath.as_str()),
            Value::from(record.keyname.as_str()),
            back,
            value,
        ])))?;
    }
    let mut delta = Mapping::new();
    delta.insert("serial", serial_value(serial)?)?;
    delta.insert("changes", changes)?;
    Ok(encode(&Value::Map(delta))?)
}

/// Decode a delta into its serial and the changes to apply
pub fn decode_delta(bytes: &[u8]) -> Result<(Serial, Vec<PendingChange>)> {
    let delta = decode(bytes)?;
    let serial = serial_from(
        delta
            .get_str("serial")
            .ok_or_else(|| malformed("missing serial"))?,
    )?;
    let entries = delta
        .get_str("changes")
        .and_then(Value::as_seq)
        .ok_or_else(|| malformed("missing changes"))?;

    let mut changes = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = entry
            .as_seq()
            .filter(|s| s.len() == 4)
            .ok_or_else(|| malformed("change entry is not a 4-item sequence"))?
            .as_slice();
        let back_serial = match &fields[2] {
            Value::Null => None,
            other => Some(serial_from(other)?),
        };
        let value = match &fields[3] {
            Value::Null => None,
            Value::Bytes(b) => Some(b.clone()),
            other => return Err(malformed(format!("value is a {}", other.type_name()))),
        };
        changes.push(PendingChange {
            relpath: string_from(&fields[0])?,
            keyname: string_from(&fields[1])?,
            back_serial,
            value,
        });
    }
    Ok((serial, changes))
}

/// Where a replica gets its deltas from
pub trait ChangeSource: Send + Sync {
    /// Delta for `serial`, or `None` if the source has not committed it yet
    fn fetch_changes(&self, serial: Serial) -> Result<Option<Vec<u8>>>;
}

impl ChangeSource for KeyFs {
    fn fetch_changes(&self, serial: Serial) -> Result<Option<Vec<u8>>> {
        if serial > self.manager().refresh()? {
            return Ok(None);
        }
        self.export_changes(serial).map(Some)
    }
}

/// Worker keeping a replica store in step with a [`ChangeSource`]
pub struct ReplicaPuller {
    keyfs: KeyFs,
    source: Arc<dyn ChangeSource>,
    poll_interval: Duration,
}

impl ReplicaPuller {
    /// Pull into `keyfs` from `source`, polling every `poll_interval` when
    /// caught up
    pub fn new(keyfs: KeyFs, source: Arc<dyn ChangeSource>, poll_interval: Duration) -> Self {
        ReplicaPuller {
            keyfs,
            source,
            poll_interval,
        }
    }

    /// Import the next delta if one is available
    ///
    /// Returns the imported serial, `None` when caught up.
    pub fn pull_once(&self) -> Result<Option<Serial>> {
        let next = self.keyfs.manager().refresh()? + 1;
        match self.source.fetch_changes(next)? {
            Some(delta) => {
                self.keyfs.import_changes(next, &delta)?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }
}

impl Worker for ReplicaPuller {
    fn name(&self) -> &str {
        "replica-puller"
    }

    fn run(&self, handle: &WorkerHandle) -> Result<()> {
        info!(
            target: "depot::replica",
            serial = self.keyfs.current_serial(),
            "Replica puller started"
        );
        loop {
            handle.exit_if_shutdown()?;
            match self.pull_once() {
                Ok(Some(serial)) => debug!(target: "depot::replica", serial, "Pulled"),
                Ok(None) => handle.sleep(self.poll_interval)?,
                Err(e) if e.is_transient() => {
                    warn!(target: "depot::replica", error = %e, "Pull failed, retrying");
                    handle.sleep(self.poll_interval)?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
