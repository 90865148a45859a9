//! Key types for depot
//!
//! Keys are logical paths. A [`KeySpec`] declares a named key family with a
//! pattern such as `{user}/{index}/.config` and the value kind stored under
//! it; binding the parameters yields a [`TypedKey`] whose relpath is what the
//! backend stores. Parameter values never contain `/`, which is what makes
//! [`KeySpec::extract_params`] unambiguous for the patterns the store uses.

use crate::error::{Error, Result};
use crate::value::{Value, ValueKind};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Commit serial number
///
/// Serial 0 means "nothing committed yet"; the first commit is serial 1.
pub type Serial = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = pattern;
    while !rest.is_empty() {
        match rest.find('{') {
            Some(0) => {
                let close = rest
                    .find('}')
                    .ok_or_else(|| Error::InvalidKey(format!("unclosed '{{' in {pattern:?}")))?;
                let name = &rest[1..close];
                if name.is_empty() || name.contains('{') {
                    return Err(Error::InvalidKey(format!(
                        "bad parameter name in {pattern:?}"
                    )));
                }
                if matches!(segments.last(), Some(Segment::Param(_))) {
                    return Err(Error::InvalidKey(format!(
                        "adjacent parameters in {pattern:?}"
                    )));
                }
                segments.push(Segment::Param(name.to_string()));
                rest = &rest[close + 1..];
            }
            Some(open) => {
                let literal = &rest[..open];
                if literal.contains('}') {
                    return Err(Error::InvalidKey(format!("stray '}}' in {pattern:?}")));
                }
                segments.push(Segment::Literal(literal.to_string()));
                rest = &rest[open..];
            }
            None => {
                if rest.contains('}') {
                    return Err(Error::InvalidKey(format!("stray '}}' in {pattern:?}")));
                }
                segments.push(Segment::Literal(rest.to_string()));
                rest = "";
            }
        }
    }
    Ok(segments)
}

fn match_segments(segments: &[Segment], input: &str, out: &mut BTreeMap<String, String>) -> bool {
    match segments.split_first() {
        None => input.is_empty(),
        Some((Segment::Literal(lit), rest)) => match input.strip_prefix(lit.as_str()) {
            Some(remaining) => match_segments(rest, remaining, out),
            None => false,
        },
        Some((Segment::Param(name), rest)) => {
            let max = input.find('/').unwrap_or(input.len());
            // Longest match first, backing off until the remainder matches.
            for end in (1..=max).rev() {
                if !input.is_char_boundary(end) {
                    continue;
                }
                if match_segments(rest, &input[end..], out) {
                    out.insert(name.clone(), input[..end].to_string());
                    return true;
                }
            }
            false
        }
    }
}

/// Declaration of a key family
#[derive(Debug, Clone)]
pub struct KeySpec {
    name: Arc<str>,
    pattern: Arc<str>,
    kind: ValueKind,
    segments: Arc<[Segment]>,
}

impl KeySpec {
    /// Declare a key family
    ///
    /// `pattern` may contain `{param}` placeholders. A pattern without
    /// placeholders declares a single plain key.
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        kind: ValueKind,
    ) -> Result<Self> {
        let name = name.into();
        let pattern = pattern.into();
        if name.is_empty() {
            return Err(Error::InvalidKey("key name must not be empty".into()));
        }
        if pattern.is_empty() {
            return Err(Error::InvalidKey(format!("key {name} has an empty pattern")));
        }
        let segments = parse_pattern(&pattern)?;
        let mut seen = Vec::new();
        for segment in &segments {
            if let Segment::Param(p) = segment {
                if seen.contains(&p) {
                    return Err(Error::InvalidKey(format!(
                        "parameter {p:?} repeated in {pattern:?}"
                    )));
                }
                seen.push(p);
            }
        }
        Ok(KeySpec {
            name: name.into(),
            pattern: pattern.into(),
            kind,
            segments: segments.into(),
        })
    }

    /// Key family name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Relpath pattern
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Kind of value stored under keys of this family
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Parameter names in pattern order
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(p) => Some(p.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Whether the pattern has placeholders
    pub fn is_parametrized(&self) -> bool {
        self.params().next().is_some()
    }

    /// Bind every parameter and build the concrete key
    pub fn key(&self, params: &[(&str, &str)]) -> Result<TypedKey> {
        let mut bound = BTreeMap::new();
        for (name, value) in params {
            if !self.params().any(|p| p == *name) {
                return Err(Error::InvalidKey(format!(
                    "{} has no parameter {name:?}",
                    self.name
                )));
            }
            if value.is_empty() || value.contains('/') {
                return Err(Error::InvalidKey(format!(
                    "parameter {name}={value:?} must be non-empty and contain no '/'"
                )));
            }
            bound.insert((*name).to_string(), (*value).to_string());
        }

        let mut relpath = String::with_capacity(self.pattern.len());
        for segment in self.segments.iter() {
            match segment {
                Segment::Literal(lit) => relpath.push_str(lit),
                Segment::Param(p) => {
                    let value = bound.get(p).ok_or_else(|| {
                        Error::InvalidKey(format!("{} needs parameter {p:?}", self.name))
                    })?;
                    relpath.push_str(value);
                }
            }
        }
        Ok(TypedKey {
            name: self.name.clone(),
            relpath,
            kind: self.kind,
            params: bound,
        })
    }

    /// The single key of an unparametrized family
    pub fn plain(&self) -> Result<TypedKey> {
        self.key(&[])
    }

    /// Parameters of `relpath` if it belongs to this family
    pub fn extract_params(&self, relpath: &str) -> Option<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        if match_segments(&self.segments, relpath, &mut out) {
            Some(out)
        } else {
            None
        }
    }

    /// Rebuild the typed key for a stored relpath
    pub fn key_for_relpath(&self, relpath: &str) -> Result<TypedKey> {
        let params = self.extract_params(relpath).ok_or_else(|| {
            Error::InvalidKey(format!("{relpath:?} does not match {}", self.pattern))
        })?;
        Ok(TypedKey {
            name: self.name.clone(),
            relpath: relpath.to_string(),
            kind: self.kind,
            params,
        })
    }
}

/// Concrete key: a family name, its kind and the resolved relpath
///
/// Identity, ordering and hashing use the relpath only.
#[derive(Debug, Clone)]
pub struct TypedKey {
    name: Arc<str>,
    relpath: String,
    kind: ValueKind,
    params: BTreeMap<String, String>,
}

impl TypedKey {
    /// Name of the key family
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stored relpath
    pub fn relpath(&self) -> &str {
        &self.relpath
    }

    /// Declared value kind
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Bound parameters
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// A single bound parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Reject values whose shape differs from the declared kind
    pub fn check_value(&self, value: &Value) -> Result<()> {
        if self.kind.matches(value) {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                key: self.relpath.clone(),
                expected: self.kind.name(),
                actual: value.type_name(),
            })
        }
    }
}

impl PartialEq for TypedKey {
    fn eq(&self, other: &Self) -> bool {
        self.relpath == other.relpath
    }
}

impl Eq for TypedKey {}

impl Hash for TypedKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.relpath.hash(state);
    }
}

impl PartialOrd for TypedKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypedKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.relpath.cmp(&other.relpath)
    }
}

impl fmt::Display for TypedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.name, self.relpath)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_config() -> KeySpec {
        KeySpec::new("INDEXCONFIG", "{user}/{index}/.config", ValueKind::Map).unwrap()
    }

    #[test]
    fn test_plain_key() {
        let spec = KeySpec::new("USERLIST", ".config", ValueKind::Set).unwrap();
        assert!(!spec.is_parametrized());
        let key = spec.plain().unwrap();
        assert_eq!(key.relpath(), ".config");
        assert_eq!(key.name(), "USERLIST");
    }

    #[test]
    fn test_bind_params() {
        let key = index_config()
            .key(&[("user", "root"), ("index", "pypi")])
            .unwrap();
        assert_eq!(key.relpath(), "root/pypi/.config");
        assert_eq!(key.param("index"), Some("pypi"));
    }

    #[test]
    fn test_missing_or_unknown_param() {
        assert!(index_config().key(&[("user", "root")]).is_err());
        assert!(index_config()
            .key(&[("user", "root"), ("index", "x"), ("other", "y")])
            .is_err());
    }

    #[test]
    fn test_param_with_slash_rejected() {
        let err = index_config()
            .key(&[("user", "root/evil"), ("index", "pypi")])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
    }

    #[test]
    fn test_extract_params() {
        let spec = index_config();
        let params = spec.extract_params("root/dev/.config").unwrap();
        assert_eq!(params["user"], "root");
        assert_eq!(params["index"], "dev");
        assert!(spec.extract_params("root/dev/sub/.config").is_none());
        assert!(spec.extract_params("root/.config").is_none());
    }

    #[test]
    fn test_extract_params_is_greedy() {
        let spec = KeySpec::new("FILE", "{user}/{index}/+f/{hash}-{name}", ValueKind::Any).unwrap();
        let params = spec.extract_params("root/pypi/+f/abc-pkg-1.0.tar.gz").unwrap();
        assert_eq!(params["hash"], "abc-pkg");
        assert_eq!(params["name"], "1.0.tar.gz");
    }

    #[test]
    fn test_key_for_relpath_roundtrip() {
        let spec = index_config();
        let key = spec.key(&[("user", "u"), ("index", "i")]).unwrap();
        let again = spec.key_for_relpath(key.relpath()).unwrap();
        assert_eq!(key, again);
        assert_eq!(again.params(), key.params());
    }

    #[test]
    fn test_bad_patterns() {
        assert!(KeySpec::new("A", "{user", ValueKind::Any).is_err());
        assert!(KeySpec::new("A", "user}", ValueKind::Any).is_err());
        assert!(KeySpec::new("A", "{}/x", ValueKind::Any).is_err());
        assert!(KeySpec::new("A", "{a}/{a}", ValueKind::Any).is_err());
        assert!(KeySpec::new("A", "{a}{b}", ValueKind::Any).is_err());
        assert!(KeySpec::new("", "x", ValueKind::Any).is_err());
    }

    #[test]
    fn test_check_value() {
        let key = index_config().key(&[("user", "u"), ("index", "i")]).unwrap();
        assert!(key.check_value(&Value::Map(Default::default())).is_ok());
        let err = key.check_value(&Value::Int(1)).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { expected: "mapping", .. }));
    }
}
