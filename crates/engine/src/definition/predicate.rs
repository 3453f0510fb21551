//! Predicate language for trigger filters and determinator steps
//!
//! Predicates are pure functions over a JSON document. Paths use a
//! `$.`-prefixed dotted syntax (`$.subject.vaccination.expires_at`);
//! a missing path resolves to `null`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A boolean condition over a JSON document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Value at `path` equals `value`
    Equals { path: String, value: Value },

    /// Value at `path` differs from `value`
    NotEquals { path: String, value: Value },

    /// Value at `path` is greater than `value` (numbers or RFC 3339 timestamps)
    GreaterThan { path: String, value: Value },

    /// Value at `path` is less than `value` (numbers or RFC 3339 timestamps)
    LessThan { path: String, value: Value },

    /// Value at `path` is present and not null
    Exists { path: String },

    /// Every nested predicate holds
    All { predicates: Vec<Predicate> },

    /// At least one nested predicate holds
    Any { predicates: Vec<Predicate> },

    /// The nested predicate does not hold
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    /// Shorthand for [`Predicate::Equals`]
    pub fn equals(path: impl Into<String>, value: Value) -> Self {
        Self::Equals {
            path: path.into(),
            value,
        }
    }

    /// Shorthand for [`Predicate::Exists`]
    pub fn exists(path: impl Into<String>) -> Self {
        Self::Exists { path: path.into() }
    }

    /// Evaluate against a document
    pub fn evaluate(&self, document: &Value) -> bool {
        match self {
            Self::Equals { path, value } => resolve_path(document, path) == Some(value),
            Self::NotEquals { path, value } => resolve_path(document, path) != Some(value),
            Self::GreaterThan { path, value } => {
                compare(resolve_path(document, path), value) == Some(std::cmp::Ordering::Greater)
            }
            Self::LessThan { path, value } => {
                compare(resolve_path(document, path), value) == Some(std::cmp::Ordering::Less)
            }
            Self::Exists { path } => {
                matches!(resolve_path(document, path), Some(v) if !v.is_null())
            }
            Self::All { predicates } => predicates.iter().all(|p| p.evaluate(document)),
            Self::Any { predicates } => predicates.iter().any(|p| p.evaluate(document)),
            Self::Not { predicate } => !predicate.evaluate(document),
        }
    }

    /// Every path referenced by this predicate
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Self::Equals { path, .. }
            | Self::NotEquals { path, .. }
            | Self::GreaterThan { path, .. }
            | Self::LessThan { path, .. }
            | Self::Exists { path } => vec![path.as_str()],
            Self::All { predicates } | Self::Any { predicates } => {
                predicates.iter().flat_map(|p| p.paths()).collect()
            }
            Self::Not { predicate } => predicate.paths(),
        }
    }
}

/// Resolve a `$.a.b.c` (or bare `a.b.c`) path
///
/// Numeric segments index into arrays.
pub fn resolve_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let trimmed = path.strip_prefix("$.").or_else(|| path.strip_prefix('$'));
    let trimmed = trimmed.unwrap_or(path);

    if trimmed.is_empty() {
        return Some(document);
    }

    trimmed.split('.').try_fold(document, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Interpret a JSON value as a timestamp (RFC 3339 string or epoch millis)
pub fn value_as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let actual = actual?;

    if let (Some(a), Some(e)) = (actual.as_f64(), expected.as_f64()) {
        return a.partial_cmp(&e);
    }

    if let (Value::String(_), Value::String(_)) = (actual, expected) {
        if let (Some(a), Some(e)) = (value_as_timestamp(actual), value_as_timestamp(expected)) {
            return Some(a.cmp(&e));
        }
    }

    None
}
