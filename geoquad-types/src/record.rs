use serde::{Deserialize, Serialize};
use std::fmt;

/// The declared type of a record's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryKeyKind {
    String,
    Integer,
}

/// A primary key value, either textual or integral.
///
/// Keys of different kinds never compare equal, even when their string forms
/// match (`PrimaryKey::Int(7)` is not `PrimaryKey::Str("7")`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimaryKey {
    Str(String),
    Int(i64),
}

impl PrimaryKey {
    /// The kind of this key.
    pub fn kind(&self) -> PrimaryKeyKind {
        match self {
            PrimaryKey::Str(_) => PrimaryKeyKind::String,
            PrimaryKey::Int(_) => PrimaryKeyKind::Integer,
        }
    }

    /// Rebuild a key from its string form and kind.
    ///
    /// Returns `None` when `kind` is `Integer` and `value` does not parse.
    pub fn parse(value: &str, kind: PrimaryKeyKind) -> Option<Self> {
        match kind {
            PrimaryKeyKind::String => Some(PrimaryKey::Str(value.to_string())),
            PrimaryKeyKind::Integer => value.parse().ok().map(PrimaryKey::Int),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Str(s) => write!(f, "{}", s),
            PrimaryKey::Int(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        PrimaryKey::Str(value.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(value: String) -> Self {
        PrimaryKey::Str(value)
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        PrimaryKey::Int(value)
    }
}

impl From<i32> for PrimaryKey {
    fn from(value: i32) -> Self {
        PrimaryKey::Int(i64::from(value))
    }
}

/// A typed scalar stored in a record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value. Integers widen to `f64`; everything else is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Text view of the value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(i64::from(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Identity of a persisted record: its entity class plus primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    /// Entity (class) name of the record
    pub entity_class: String,
    /// Primary key within that entity
    pub primary_key: PrimaryKey,
}

impl RecordId {
    pub fn new(entity_class: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
        Self {
            entity_class: entity_class.into(),
            primary_key: primary_key.into(),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_class, self.primary_key)
    }
}
