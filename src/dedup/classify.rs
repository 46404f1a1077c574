use serde::{Deserialize, Serialize};

use crate::extract::{FieldValue, Record};
use crate::storage::PersistedEntity;

/// A tracked field whose value differs from the stored entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: FieldValue,
    pub after: FieldValue,
}

/// Outcome of comparing a record against the stored entity with its key
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// No entity with this identity key exists yet
    New,

    /// Every tracked field equals the stored value
    Unchanged,

    /// At least one tracked field changed
    Updated {
        prior_version: u32,
        diff: Vec<FieldChange>,
    },
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Unchanged => "unchanged",
            Self::Updated { .. } => "updated",
        }
    }
}

/// Classifies `record` against `prior`, the stored entity sharing its key
///
/// Pure: the caller is responsible for reading `prior` inside the same
/// transaction that will write the result.
pub fn classify(prior: Option<&PersistedEntity>, record: &Record) -> Classification {
    let Some(prior) = prior else {
        return Classification::New;
    };

    if prior.content_hash == record.content_hash {
        return Classification::Unchanged;
    }

    Classification::Updated {
        prior_version: prior.version,
        diff: diff_tracked(prior, record),
    }
}

fn diff_tracked(prior: &PersistedEntity, record: &Record) -> Vec<FieldChange> {
    record
        .tracked_fields
        .iter()
        .filter_map(|name| {
            let before = prior.fields.get(name).cloned().unwrap_or(FieldValue::Missing);
            let after = record.fields.get(name).cloned().unwrap_or(FieldValue::Missing);
            (before != after).then(|| FieldChange {
                field: name.clone(),
                before,
                after,
            })
        })
        .collect()
}
