//! Value types for depot
//!
//! This module defines:
//! - Value: tagged union of every structure the store can persist
//! - Sequence, Mapping, Set, OrderedSet: container types carrying a frozen marker
//! - Complex: pair of IEEE doubles
//! - ValueKind: shape discriminant used by typed keys
//!
//! ## Frozen containers
//!
//! Every container carries a `frozen` marker. Reads work the same either way;
//! every mutating method checks the marker first and returns
//! [`ImmutabilityViolation`] for a frozen container. [`Value::freeze`]
//! propagates the marker to all nested containers and [`Value::thaw`]
//! produces a fully mutable deep copy.
//!
//! ## Ordering and equality
//!
//! Values are totally ordered so they can be used as mapping keys and set
//! members. Different variants order by variant rank and are never equal.
//! Floats compare with `f64::total_cmp`, so `NaN == NaN` and `-0.0 != 0.0`.
//! The frozen marker never takes part in comparisons.

use crate::readonly::ImmutabilityViolation;
use std::cmp::Ordering;
use std::collections::{btree_map, btree_set, BTreeMap, BTreeSet};
use std::fmt;

/// Complex number as a pair of doubles
#[derive(Debug, Clone, Copy)]
pub struct Complex {
    /// Real part
    pub re: f64,
    /// Imaginary part
    pub im: f64,
}

impl Complex {
    /// Create a complex number
    pub fn new(re: f64, im: f64) -> Self {
        Complex { re, im }
    }
}

impl PartialEq for Complex {
    fn eq(&self, other: &Self) -> bool {
        self.re.total_cmp(&other.re) == Ordering::Equal
            && self.im.total_cmp(&other.im) == Ordering::Equal
    }
}

/// Shape of a value, used to type-check writes against a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Any value is accepted
    Any,
    /// Null only
    Null,
    /// Boolean
    Bool,
    /// Signed integer
    Int,
    /// IEEE double
    Float,
    /// Complex number
    Complex,
    /// Byte string
    Bytes,
    /// Text string
    Str,
    /// Ordered sequence
    Seq,
    /// Mapping
    Map,
    /// Unordered set
    Set,
    /// Set preserving insertion order
    OrderedSet,
}

impl ValueKind {
    /// Human readable name
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Any => "any",
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Complex => "complex",
            ValueKind::Bytes => "bytes",
            ValueKind::Str => "str",
            ValueKind::Seq => "sequence",
            ValueKind::Map => "mapping",
            ValueKind::Set => "set",
            ValueKind::OrderedSet => "ordered set",
        }
    }

    /// Whether `value` has this shape
    pub fn matches(&self, value: &Value) -> bool {
        *self == ValueKind::Any || *self == value.kind()
    }

    /// The empty value of this kind, if the kind has one
    pub fn empty(&self) -> Option<Value> {
        match self {
            ValueKind::Any | ValueKind::Null => None,
            ValueKind::Bool => Some(Value::Bool(false)),
            ValueKind::Int => Some(Value::Int(0)),
            ValueKind::Float => Some(Value::Float(0.0)),
            ValueKind::Complex => Some(Value::Complex(Complex::new(0.0, 0.0))),
            ValueKind::Bytes => Some(Value::Bytes(Vec::new())),
            ValueKind::Str => Some(Value::Str(String::new())),
            ValueKind::Seq => Some(Value::Seq(Sequence::new())),
            ValueKind::Map => Some(Value::Map(Mapping::new())),
            ValueKind::Set => Some(Value::Set(Set::new())),
            ValueKind::OrderedSet => Some(Value::OrderedSet(OrderedSet::new())),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Structured value stored under a key
#[derive(Debug, Clone)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point (IEEE-754)
    Float(f64),
    /// Complex number
    Complex(Complex),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// UTF-8 string
    Str(String),
    /// Ordered sequence
    Seq(Sequence),
    /// Mapping with unique keys
    Map(Mapping),
    /// Unordered set
    Set(Set),
    /// Set preserving first-insertion order
    OrderedSet(OrderedSet),
}

impl Value {
    /// Shape of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Complex(_) => ValueKind::Complex,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Str(_) => ValueKind::Str,
            Value::Seq(_) => ValueKind::Seq,
            Value::Map(_) => ValueKind::Map,
            Value::Set(_) => ValueKind::Set,
            Value::OrderedSet(_) => ValueKind::OrderedSet,
        }
    }

    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        self.kind().name()
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Complex(_) => 4,
            Value::Bytes(_) => 5,
            Value::Str(_) => 6,
            Value::Seq(_) => 7,
            Value::Map(_) => 8,
            Value::Set(_) => 9,
            Value::OrderedSet(_) => 10,
        }
    }

    /// Check if this is a null value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value is a container
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Value::Seq(_) | Value::Map(_) | Value::Set(_) | Value::OrderedSet(_)
        )
    }

    /// Get as bool if this is a Bool value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as i64 if this is an Int value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64 if this is a Float value
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get as &str if this is a Str value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get as &[u8] if this is a Bytes value
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get the sequence if this is a Seq value
    pub fn as_seq(&self) -> Option<&Sequence> {
        match self {
            Value::Seq(s) => Some(s),
            _ => None,
        }
    }

    /// Get the mapping if this is a Map value
    pub fn as_map(&self) -> Option<&Mapping> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Get the set if this is a Set value
    pub fn as_set(&self) -> Option<&Set> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    /// Get the ordered set if this is an OrderedSet value
    pub fn as_ordered_set(&self) -> Option<&OrderedSet> {
        match self {
            Value::OrderedSet(s) => Some(s),
            _ => None,
        }
    }

    /// Mutable access to a sequence; its mutators still check the frozen marker
    pub fn as_seq_mut(&mut self) -> Option<&mut Sequence> {
        match self {
            Value::Seq(s) => Some(s),
            _ => None,
        }
    }

    /// Mutable access to a mapping; its mutators still check the frozen marker
    pub fn as_map_mut(&mut self) -> Option<&mut Mapping> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Mutable access to a set; its mutators still check the frozen marker
    pub fn as_set_mut(&mut self) -> Option<&mut Set> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    /// Mutable access to an ordered set; its mutators still check the frozen marker
    pub fn as_ordered_set_mut(&mut self) -> Option<&mut OrderedSet> {
        match self {
            Value::OrderedSet(s) => Some(s),
            _ => None,
        }
    }

    /// Number of items for containers, strings and byte strings
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Bytes(b) => Some(b.len()),
            Value::Str(s) => Some(s.len()),
            Value::Seq(s) => Some(s.len()),
            Value::Map(m) => Some(m.len()),
            Value::Set(s) => Some(s.len()),
            Value::OrderedSet(s) => Some(s.len()),
            _ => None,
        }
    }

    /// Keyed lookup for mappings, indexed lookup for sequences
    ///
    /// Sequences and ordered sets accept a non-negative `Int` index.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        match (self, key) {
            (Value::Map(m), _) => m.get(key),
            (Value::Seq(s), Value::Int(i)) => usize::try_from(*i).ok().and_then(|i| s.get(i)),
            (Value::OrderedSet(s), Value::Int(i)) => {
                usize::try_from(*i).ok().and_then(|i| s.get(i))
            }
            _ => None,
        }
    }

    /// Mapping lookup by string key
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get_str(key))
    }

    /// Whether this value (and everything nested in it) rejects mutation
    ///
    /// Scalars are always immutable.
    pub fn is_frozen(&self) -> bool {
        match self {
            Value::Seq(s) => s.frozen,
            Value::Map(m) => m.frozen,
            Value::Set(s) => s.frozen,
            Value::OrderedSet(s) => s.frozen,
            _ => true,
        }
    }

    /// Mark this value and every nested container as frozen
    pub fn freeze(self) -> Value {
        match self {
            Value::Seq(s) => Value::Seq(Sequence {
                items: s.items.into_iter().map(Value::freeze).collect(),
                frozen: true,
            }),
            Value::Map(m) => Value::Map(Mapping {
                entries: m
                    .entries
                    .into_iter()
                    .map(|(k, v)| (k.freeze(), v.freeze()))
                    .collect(),
                frozen: true,
            }),
            Value::Set(s) => Value::Set(Set {
                items: s.items.into_iter().map(Value::freeze).collect(),
                frozen: true,
            }),
            Value::OrderedSet(s) => Value::OrderedSet(OrderedSet {
                items: s.items.into_iter().map(Value::freeze).collect(),
                frozen: true,
            }),
            scalar => scalar,
        }
    }

    /// Deep copy with every container mutable, sharing nothing with `self`
    pub fn thaw(&self) -> Value {
        match self {
            Value::Seq(s) => Value::Seq(Sequence {
                items: s.items.iter().map(Value::thaw).collect(),
                frozen: false,
            }),
            Value::Map(m) => Value::Map(Mapping {
                entries: m.entries.iter().map(|(k, v)| (k.thaw(), v.thaw())).collect(),
                frozen: false,
            }),
            Value::Set(s) => Value::Set(Set {
                items: s.items.iter().map(Value::thaw).collect(),
                frozen: false,
            }),
            Value::OrderedSet(s) => Value::OrderedSet(OrderedSet {
                items: s.items.iter().map(Value::thaw).collect(),
                frozen: false,
            }),
            scalar => scalar.clone(),
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Complex(a), Value::Complex(b)) => {
                a.re.total_cmp(&b.re).then(a.im.total_cmp(&b.im))
            }
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Seq(a), Value::Seq(b)) => a.items.cmp(&b.items),
            (Value::Map(a), Value::Map(b)) => a.entries.iter().cmp(b.entries.iter()),
            (Value::Set(a), Value::Set(b)) => a.items.iter().cmp(b.items.iter()),
            (Value::OrderedSet(a), Value::OrderedSet(b)) => a.items.cmp(&b.items),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

// ============================================================================
// Containers
// ============================================================================

fn violation(operation: &'static str, container: &'static str) -> ImmutabilityViolation {
    ImmutabilityViolation {
        operation,
        container,
    }
}

/// Ordered sequence of values
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    items: Vec<Value>,
    frozen: bool,
}

impl Sequence {
    /// Create an empty, mutable sequence
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a vector as a mutable sequence
    pub fn from_vec(items: Vec<Value>) -> Self {
        Sequence {
            items,
            frozen: false,
        }
    }

    fn check(&self, operation: &'static str) -> Result<(), ImmutabilityViolation> {
        if self.frozen {
            return Err(violation(operation, "sequence"));
        }
        Ok(())
    }

    /// Whether mutation is rejected
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the sequence has no items
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item at `index`
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    /// Iterate in order
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }

    /// Items as a slice
    pub fn as_slice(&self) -> &[Value] {
        &self.items
    }

    /// Append an item
    pub fn push(&mut self, value: impl Into<Value>) -> Result<(), ImmutabilityViolation> {
        self.check("append to")?;
        self.items.push(value.into());
        Ok(())
    }

    /// Insert an item at `index`, shifting later items
    ///
    /// # Panics
    ///
    /// Panics if `index > len`, like `Vec::insert`.
    pub fn insert(
        &mut self,
        index: usize,
        value: impl Into<Value>,
    ) -> Result<(), ImmutabilityViolation> {
        self.check("insert into")?;
        self.items.insert(index, value.into());
        Ok(())
    }

    /// Remove and return the last item
    pub fn pop(&mut self) -> Result<Option<Value>, ImmutabilityViolation> {
        self.check("pop from")?;
        Ok(self.items.pop())
    }

    /// Remove the item at `index`, returning `None` when out of bounds
    pub fn remove(&mut self, index: usize) -> Result<Option<Value>, ImmutabilityViolation> {
        self.check("remove from")?;
        if index < self.items.len() {
            Ok(Some(self.items.remove(index)))
        } else {
            Ok(None)
        }
    }

    /// Replace the item at `index`, returning the previous item
    pub fn set(
        &mut self,
        index: usize,
        value: impl Into<Value>,
    ) -> Result<Option<Value>, ImmutabilityViolation> {
        self.check("assign into")?;
        Ok(self
            .items
            .get_mut(index)
            .map(|slot| std::mem::replace(slot, value.into())))
    }

    /// Mutable access to the item at `index`
    pub fn get_mut(&mut self, index: usize) -> Result<Option<&mut Value>, ImmutabilityViolation> {
        self.check("borrow mutably from")?;
        Ok(self.items.get_mut(index))
    }

    /// Append every item of `iter`
    pub fn extend<I, T>(&mut self, iter: I) -> Result<(), ImmutabilityViolation>
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        self.check("extend")?;
        self.items.extend(iter.into_iter().map(Into::into));
        Ok(())
    }

    /// Remove all items
    pub fn clear(&mut self) -> Result<(), ImmutabilityViolation> {
        self.check("clear")?;
        self.items.clear();
        Ok(())
    }
}

impl PartialEq for Sequence {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<T: Into<Value>> FromIterator<T> for Sequence {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Sequence::from_vec(iter.into_iter().map(Into::into).collect())
    }
}

impl<'a> IntoIterator for &'a Sequence {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Mapping with unique keys
///
/// Iteration order is key order; insertion order is not retained.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    entries: BTreeMap<Value, Value>,
    frozen: bool,
}

impl Mapping {
    /// Create an empty, mutable mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mapping from key/value pairs; later duplicates win
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Value>,
        V: Into<Value>,
    {
        pairs.into_iter().collect()
    }

    fn check(&self, operation: &'static str) -> Result<(), ImmutabilityViolation> {
        if self.frozen {
            return Err(violation(operation, "mapping"));
        }
        Ok(())
    }

    /// Whether mutation is rejected
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the mapping has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value stored under `key`
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Value stored under a string key
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries.get(&Value::Str(key.to_string()))
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: &Value) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> btree_map::Iter<'_, Value, Value> {
        self.entries.iter()
    }

    /// Iterate keys in order
    pub fn keys(&self) -> btree_map::Keys<'_, Value, Value> {
        self.entries.keys()
    }

    /// Iterate values in key order
    pub fn values(&self) -> btree_map::Values<'_, Value, Value> {
        self.entries.values()
    }

    /// Insert an entry, returning the value it replaced
    pub fn insert(
        &mut self,
        key: impl Into<Value>,
        value: impl Into<Value>,
    ) -> Result<Option<Value>, ImmutabilityViolation> {
        self.check("insert into")?;
        Ok(self.entries.insert(key.into(), value.into()))
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &Value) -> Result<Option<Value>, ImmutabilityViolation> {
        self.check("remove from")?;
        Ok(self.entries.remove(key))
    }

    /// Mutable access to the value stored under `key`
    pub fn get_mut(&mut self, key: &Value) -> Result<Option<&mut Value>, ImmutabilityViolation> {
        self.check("borrow mutably from")?;
        Ok(self.entries.get_mut(key))
    }

    /// Remove all entries
    pub fn clear(&mut self) -> Result<(), ImmutabilityViolation> {
        self.check("clear")?;
        self.entries.clear();
        Ok(())
    }

    pub(crate) fn try_insert_unique(&mut self, key: Value, value: Value) -> bool {
        match self.entries.entry(key) {
            btree_map::Entry::Occupied(_) => false,
            btree_map::Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }
}

impl PartialEq for Mapping {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<K: Into<Value>, V: Into<Value>> FromIterator<(K, V)> for Mapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Mapping {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            frozen: false,
        }
    }
}

impl<'a> IntoIterator for &'a Mapping {
    type Item = (&'a Value, &'a Value);
    type IntoIter = btree_map::Iter<'a, Value, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Unordered set of unique values
#[derive(Debug, Clone, Default)]
pub struct Set {
    items: BTreeSet<Value>,
    frozen: bool,
}

impl Set {
    /// Create an empty, mutable set
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self, operation: &'static str) -> Result<(), ImmutabilityViolation> {
        if self.frozen {
            return Err(violation(operation, "set"));
        }
        Ok(())
    }

    /// Whether mutation is rejected
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set has no members
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether `value` is a member
    pub fn contains(&self, value: &Value) -> bool {
        self.items.contains(value)
    }

    /// Iterate members in value order
    pub fn iter(&self) -> btree_set::Iter<'_, Value> {
        self.items.iter()
    }

    /// Add a member, returning whether it was newly added
    pub fn insert(&mut self, value: impl Into<Value>) -> Result<bool, ImmutabilityViolation> {
        self.check("add to")?;
        Ok(self.items.insert(value.into()))
    }

    /// Remove a member, returning whether it was present
    pub fn remove(&mut self, value: &Value) -> Result<bool, ImmutabilityViolation> {
        self.check("remove from")?;
        Ok(self.items.remove(value))
    }

    /// Remove all members
    pub fn clear(&mut self) -> Result<(), ImmutabilityViolation> {
        self.check("clear")?;
        self.items.clear();
        Ok(())
    }
}

impl PartialEq for Set {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<T: Into<Value>> FromIterator<T> for Set {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Set {
            items: iter.into_iter().map(Into::into).collect(),
            frozen: false,
        }
    }
}

impl<'a> IntoIterator for &'a Set {
    type Item = &'a Value;
    type IntoIter = btree_set::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Set of unique values that remembers first-insertion order
///
/// Inserting a value already present is a no-op, so duplicates coming from
/// separately built parts collapse to the first occurrence.
#[derive(Debug, Clone, Default)]
pub struct OrderedSet {
    items: Vec<Value>,
    frozen: bool,
}

impl OrderedSet {
    /// Create an empty, mutable ordered set
    pub fn new() -> Self {
        Self::default()
    }

    fn check(&self, operation: &'static str) -> Result<(), ImmutabilityViolation> {
        if self.frozen {
            return Err(violation(operation, "ordered set"));
        }
        Ok(())
    }

    /// Whether mutation is rejected
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the set has no members
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether `value` is a member
    pub fn contains(&self, value: &Value) -> bool {
        self.items.contains(value)
    }

    /// Member at insertion position `index`
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    /// Iterate members in insertion order
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }

    /// Add a member, returning whether it was newly added
    pub fn insert(&mut self, value: impl Into<Value>) -> Result<bool, ImmutabilityViolation> {
        self.check("add to")?;
        Ok(self.insert_unique(value.into()))
    }

    /// Remove a member, returning whether it was present
    pub fn remove(&mut self, value: &Value) -> Result<bool, ImmutabilityViolation> {
        self.check("remove from")?;
        match self.items.iter().position(|item| item == value) {
            Some(index) => {
                self.items.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove all members
    pub fn clear(&mut self) -> Result<(), ImmutabilityViolation> {
        self.check("clear")?;
        self.items.clear();
        Ok(())
    }

    fn insert_unique(&mut self, value: Value) -> bool {
        if self.items.contains(&value) {
            return false;
        }
        self.items.push(value);
        true
    }
}

impl PartialEq for OrderedSet {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<T: Into<Value>> FromIterator<T> for OrderedSet {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = OrderedSet::new();
        for item in iter {
            set.insert_unique(item.into());
        }
        set
    }
}

impl<'a> IntoIterator for &'a OrderedSet {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

// ============================================================================
// From implementations for ergonomic API usage
// ============================================================================

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Complex> for Value {
    fn from(c: Complex) -> Self {
        Value::Complex(c)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Seq(Sequence::from_vec(items))
    }
}

impl From<Sequence> for Value {
    fn from(s: Sequence) -> Self {
        Value::Seq(s)
    }
}

impl From<Mapping> for Value {
    fn from(m: Mapping) -> Self {
        Value::Map(m)
    }
}

impl From<Set> for Value {
    fn from(s: Set) -> Self {
        Value::Set(s)
    }
}

impl From<OrderedSet> for Value {
    fn from(s: OrderedSet) -> Self {
        Value::OrderedSet(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_different_types_never_equal() {
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Bytes(b"a".to_vec()), Value::Str("a".into()));
        assert_ne!(Value::Null, Value::Bool(false));
    }

    #[test]
    fn test_float_total_order() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert!(Value::Float(1.0) < Value::Float(2.0));
    }

    #[test]
    fn test_set_and_ordered_set_differ() {
        let set: Set = ["a", "b"].into_iter().collect();
        let ordered: OrderedSet = ["a", "b"].into_iter().collect();
        assert_ne!(Value::Set(set), Value::OrderedSet(ordered));
    }

    #[test]
    fn test_ordered_set_keeps_first_occurrence() {
        let set: OrderedSet = ["b", "a", "b", "c", "a"].into_iter().collect();
        let items: Vec<_> = set.iter().filter_map(Value::as_str).collect();
        assert_eq!(items, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_mapping_equality_ignores_insertion_order() {
        let a = Mapping::from_pairs([("x", 1), ("y", 2)]);
        let b = Mapping::from_pairs([("y", 2), ("x", 1)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_freeze_propagates() {
        let inner = Sequence::from_iter([1, 2]);
        let map = Mapping::from_pairs([("list", Value::Seq(inner))]);
        let frozen = Value::Map(map).freeze();

        assert!(frozen.is_frozen());
        assert!(frozen.get_str("list").unwrap().is_frozen());
    }

    #[test]
    fn test_frozen_rejects_every_mutation() {
        let mut seq = Value::Seq(Sequence::from_iter([1])).freeze();
        let s = seq.as_seq_mut().unwrap();
        assert!(s.push(2).is_err());
        assert!(s.insert(0, 2).is_err());
        assert!(s.pop().is_err());
        assert!(s.remove(0).is_err());
        assert!(s.set(0, 5).is_err());
        assert!(s.get_mut(0).is_err());
        assert!(s.clear().is_err());
        assert_eq!(s.len(), 1);

        let mut map = Value::Map(Mapping::from_pairs([("a", 1)])).freeze();
        let m = map.as_map_mut().unwrap();
        assert!(m.insert("b", 2).is_err());
        assert!(m.remove(&"a".into()).is_err());
        assert!(m.get_mut(&"a".into()).is_err());
        assert_eq!(m.len(), 1);

        let mut set = Value::Set(Set::from_iter(["a"])).freeze();
        assert!(set.as_set_mut().unwrap().insert("b").is_err());

        let mut oset = Value::OrderedSet(OrderedSet::from_iter(["a"])).freeze();
        assert!(oset.as_ordered_set_mut().unwrap().insert("b").is_err());
    }

    #[test]
    fn test_violation_names_operation() {
        let mut seq = Value::Seq(Sequence::new()).freeze();
        let err = seq.as_seq_mut().unwrap().push(1).unwrap_err();
        assert_eq!(err.container, "sequence");
        assert!(err.to_string().contains("append"));
    }

    #[test]
    fn test_thaw_is_deep_and_mutable() {
        let map = Mapping::from_pairs([("tags", Value::Seq(Sequence::from_iter(["x"])))]);
        let frozen = Value::Map(map).freeze();
        let mut thawed = frozen.thaw();

        assert!(!thawed.is_frozen());
        let tags = thawed
            .as_map_mut()
            .unwrap()
            .get_mut(&"tags".into())
            .unwrap()
            .unwrap();
        tags.as_seq_mut().unwrap().push("y").unwrap();

        assert_ne!(thawed, frozen);
        assert_eq!(frozen.get_str("tags").unwrap().len(), Some(1));
    }

    #[test]
    fn test_get_by_index() {
        let seq = Value::Seq(Sequence::from_iter(["a", "b"]));
        assert_eq!(seq.get(&Value::Int(1)), Some(&Value::Str("b".into())));
        assert_eq!(seq.get(&Value::Int(-1)), None);
        assert_eq!(seq.get(&Value::Int(2)), None);
    }

    #[test]
    fn test_kind_empty_values() {
        assert_eq!(ValueKind::Map.empty(), Some(Value::Map(Mapping::new())));
        assert_eq!(ValueKind::Any.empty(), None);
        assert!(ValueKind::Any.matches(&Value::Int(3)));
        assert!(!ValueKind::Map.matches(&Value::Int(3)));
    }

    #[test]
    fn test_option_into_value() {
        let none: Option<i64> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some(4)), Value::Int(4));
    }
}
