//! Extracted record types

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single extracted field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Number(f64),
    /// The selector matched but the transform rejected the raw text
    Unparsed(String),
    /// The selector matched nothing in the record container
    Missing,
}

impl FieldValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    pub fn is_unparsed(&self) -> bool {
        matches!(self, Self::Unparsed(_))
    }

    /// True for a value a transform accepted
    pub fn is_parsed(&self) -> bool {
        !self.is_missing() && !self.is_unparsed()
    }

    /// Stable, type-tagged text form used for identity keys and content hashes
    pub fn canonical(&self) -> String {
        match self {
            Self::Text(s) => format!("t:{}", s),
            Self::Integer(i) => format!("i:{}", i),
            Self::Number(n) => format!("n:{}", n),
            Self::Unparsed(raw) => format!("u:{}", raw),
            Self::Missing => "m:".to_string(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{}", s),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Number(n) => write!(f, "{}", n),
            Self::Unparsed(raw) => write!(f, "<unparsed: {}>", raw),
            Self::Missing => write!(f, "<missing>"),
        }
    }
}

/// Why a field ended up `Unparsed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiagnostic {
    pub field: String,
    pub raw: String,
    pub message: String,
}

/// One structured record pulled out of a page
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Deterministic fingerprint of the identity fields
    pub identity_key: String,

    /// Fingerprint of the tracked fields, compared to detect updates
    pub content_hash: String,

    /// Name of the mapping that produced the record
    pub mapping: String,

    pub fields: BTreeMap<String, FieldValue>,

    /// Fields compared for change detection
    pub tracked_fields: Vec<String>,

    pub source_url: String,
    pub extracted_at: DateTime<Utc>,
    pub diagnostics: Vec<FieldDiagnostic>,
}

impl Record {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}
