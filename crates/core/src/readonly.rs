//! Frozen views over values
//!
//! Values handed out by the read path are shared between the process-wide
//! cache and every transaction that asked for them. [`FrozenValue`] wraps such
//! a value in an `Arc` after marking every container inside it as frozen, so
//! mutating a shared value fails instead of silently corrupting cache state.
//! Callers that need to change a value take a [`thaw`]ed deep copy.

use crate::value::Value;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;

/// Mutation was attempted on a frozen container
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {operation} a frozen {container}")]
pub struct ImmutabilityViolation {
    /// Attempted operation, e.g. "append to"
    pub operation: &'static str,
    /// Container kind, e.g. "mapping"
    pub container: &'static str,
}

/// Shared, deeply frozen value
///
/// Cloning is an `Arc` clone. Two clones of the same `FrozenValue` point at
/// the same allocation; [`FrozenValue::ptr_eq`] tells them apart from equal
/// values that were decoded separately.
#[derive(Clone)]
pub struct FrozenValue(Arc<Value>);

impl FrozenValue {
    /// Freeze `value` and wrap it for sharing
    pub fn new(value: Value) -> Self {
        FrozenValue(Arc::new(value.freeze()))
    }

    /// Borrow the inner value
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Deep mutable copy of the inner value
    pub fn thaw(&self) -> Value {
        self.0.thaw()
    }

    /// Whether both handles share one allocation
    pub fn ptr_eq(a: &FrozenValue, b: &FrozenValue) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl Deref for FrozenValue {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.0
    }
}

impl AsRef<Value> for FrozenValue {
    fn as_ref(&self) -> &Value {
        &self.0
    }
}

impl fmt::Debug for FrozenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FrozenValue").field(&*self.0).finish()
    }
}

impl PartialEq for FrozenValue {
    fn eq(&self, other: &Self) -> bool {
        *self.0 == *other.0
    }
}

impl Eq for FrozenValue {}

impl PartialEq<Value> for FrozenValue {
    fn eq(&self, other: &Value) -> bool {
        *self.0 == *other
    }
}

impl PartialEq<FrozenValue> for Value {
    fn eq(&self, other: &FrozenValue) -> bool {
        *self == *other.0
    }
}

impl From<Value> for FrozenValue {
    fn from(value: Value) -> Self {
        FrozenValue::new(value)
    }
}

/// Freeze a value for sharing
pub fn freeze(value: Value) -> FrozenValue {
    FrozenValue::new(value)
}

/// Deep mutable copy of a (possibly frozen) value
pub fn thaw(value: &Value) -> Value {
    value.thaw()
}

/// Whether mutating `value` would be rejected
pub fn is_frozen(value: &Value) -> bool {
    value.is_frozen()
}

/// Whether `value` is a sequence, as opposed to a set, mapping or scalar
pub fn is_sequence(value: &Value) -> bool {
    matches!(value, Value::Seq(_))
}
