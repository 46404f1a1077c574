//! Storage module for persisting crawl output
//!
//! This module handles all database operations for the pipeline, including:
//! - SQLite schema management
//! - Atomic, classified upserts of extracted records
//! - Run tracking, frontier checkpoints and terminal task failures
//! - The read-only `EntityReader` surface for downstream consumers

mod pool;
mod schema;
mod sqlite;
mod traits;

pub use pool::StoragePool;
pub use sqlite::{CommitOutcome, SqliteStorage};
pub use traits::{EntityReader, StorageError, StorageResult};

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::crawler::AttemptRecord;
use crate::extract::FieldValue;

/// The durable row for one identity key
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEntity {
    pub identity_key: String,
    pub mapping: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub content_hash: String,
    pub source_url: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub version: u32,
}

/// Filters for `EntityReader::list_entities` and `count_entities`
#[derive(Debug, Clone, Default)]
pub struct EntityQuery {
    pub mapping: Option<String>,
    pub first_seen_after: Option<DateTime<Utc>>,
    pub last_seen_after: Option<DateTime<Utc>>,
    pub last_seen_before: Option<DateTime<Utc>>,
    pub min_version: Option<u32>,
    pub limit: Option<u32>,
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A non-terminal task saved to the frontier checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontierEntry {
    pub url: String,
    pub mapping: String,
    pub depth: u32,
    pub priority: u32,
    pub attempt_count: u32,
}

/// A task that ended in the Failed state
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub url: String,
    pub mapping: String,
    pub attempts: u32,
    pub last_error: String,
    pub history: Vec<AttemptRecord>,
    pub failed_at: DateTime<Utc>,
}

/// Formats a timestamp the way it is stored: fixed-width RFC 3339 in UTC,
/// so text comparison orders correctly
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a stored timestamp
pub fn parse_timestamp(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidData(format!("timestamp '{}': {}", s, e)))
}
