//! Core types for depot
//!
//! This crate defines the foundational types used throughout the system:
//! - Value: structured values with frozen (read-only) containers
//! - FrozenValue: shared, deeply frozen value handed out by the read path
//! - codec: stack-machine wire format for values
//! - KeySpec / TypedKey: key families and concrete keys
//! - Serial: commit serial numbers
//! - Error: Error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod readonly;
pub mod types;
pub mod value;

pub use codec::{decode, decode_from, encode, encode_into, encoded_len, CodecError, MAX_DEPTH};
pub use error::{CommitError, Error, Result};
pub use readonly::{freeze, is_frozen, is_sequence, thaw, FrozenValue, ImmutabilityViolation};
pub use types::{KeySpec, Serial, TypedKey};
pub use value::{Complex, Mapping, OrderedSet, Sequence, Set, Value, ValueKind};
