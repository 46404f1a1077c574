//! SQLite storage implementation
//!
//! All methods are synchronous; async callers go through `StoragePool`, which
//! runs them on the blocking thread pool.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{
    params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row, ToSql,
    TransactionBehavior,
};

use crate::dedup::{classify, Classification};
use crate::extract::Record;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{EntityReader, StorageResult};
use crate::storage::{
    format_timestamp, parse_timestamp, EntityQuery, FailureRecord, FrontierEntry,
    PersistedEntity, RunRecord, RunStatus,
};

const ENTITY_COLUMNS: &str =
    "identity_key, mapping, fields, content_hash, source_url, first_seen_at, last_seen_at, version";

/// Insert-or-update guarded by the identity key's unique constraint
///
/// Unchanged content only advances `last_seen_at`; changed content replaces the
/// fields and bumps the version. `first_seen_at` is never touched on conflict.
const UPSERT_SQL: &str = "
    INSERT INTO entities
        (identity_key, mapping, fields, content_hash, source_url, first_seen_at, last_seen_at, version)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 1)
    ON CONFLICT(identity_key) DO UPDATE SET
        fields = CASE WHEN entities.content_hash = excluded.content_hash
                      THEN entities.fields ELSE excluded.fields END,
        source_url = CASE WHEN entities.content_hash = excluded.content_hash
                          THEN entities.source_url ELSE excluded.source_url END,
        version = CASE WHEN entities.content_hash = excluded.content_hash
                       THEN entities.version ELSE entities.version + 1 END,
        content_hash = excluded.content_hash,
        last_seen_at = MAX(entities.last_seen_at, excluded.last_seen_at)
    RETURNING identity_key, mapping, fields, content_hash, source_url, first_seen_at, last_seen_at, version";

/// Result of committing one record
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub classification: Classification,
    pub entity: PersistedEntity,
}

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Opens (creating if needed) a read-write database
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    /// * `busy_timeout` - How long a statement waits on a locked database
    pub fn open(path: &Path, busy_timeout: Duration) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Opens an existing database without write access
    pub fn open_read_only(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self { conn })
    }

    /// Creates an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    // ===== Run Management =====

    pub fn create_run(&mut self, config_hash: &str) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![
                format_timestamp(Utc::now()),
                config_hash,
                RunStatus::Running.to_db_string()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.to_db_string(), format_timestamp(Utc::now()), run_id],
        )?;
        Ok(())
    }

    pub fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let run = self
            .conn
            .query_row(
                "SELECT id, started_at, finished_at, config_hash, status FROM runs ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok(RunRecord {
                        id: row.get(0)?,
                        started_at: row.get(1)?,
                        finished_at: row.get(2)?,
                        config_hash: row.get(3)?,
                        status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
                            .unwrap_or(RunStatus::Failed),
                    })
                },
            )
            .optional()?;

        Ok(run)
    }

    // ===== Entities =====

    /// Classifies and commits one record atomically
    ///
    /// The prior entity is read and the conditional upsert executed inside one
    /// IMMEDIATE transaction, so two writers racing on a new identity key
    /// cannot both classify it as `New`.
    pub fn upsert_record(
        &mut self,
        record: &Record,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<CommitOutcome> {
        let fields = serde_json::to_string(&record.fields)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let prior = tx
            .query_row(
                &format!("SELECT {} FROM entities WHERE identity_key = ?1", ENTITY_COLUMNS),
                params![record.identity_key],
                RawEntity::from_row,
            )
            .optional()?
            .map(RawEntity::into_entity)
            .transpose()?;

        let classification = classify(prior.as_ref(), record);

        let raw = tx.query_row(
            UPSERT_SQL,
            params![
                record.identity_key,
                record.mapping,
                fields,
                record.content_hash,
                record.source_url,
                format_timestamp(seen_at),
            ],
            RawEntity::from_row,
        )?;
        tx.commit()?;

        Ok(CommitOutcome {
            classification,
            entity: raw.into_entity()?,
        })
    }

    /// Entity counts per mapping, largest first
    pub fn mapping_counts(&self) -> StorageResult<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT mapping, COUNT(*) FROM entities GROUP BY mapping ORDER BY COUNT(*) DESC, mapping",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts
            .into_iter()
            .map(|(mapping, count)| (mapping, count as u64))
            .collect())
    }

    // ===== Frontier Checkpoint =====

    /// Replaces the checkpoint with `entries`
    pub fn save_checkpoint(&mut self, run_id: i64, entries: &[FrontierEntry]) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM frontier", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO frontier (url, mapping, depth, priority, attempt_count, run_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for entry in entries {
                stmt.execute(params![
                    entry.url,
                    entry.mapping,
                    entry.depth,
                    entry.priority,
                    entry.attempt_count,
                    run_id
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_checkpoint(&self) -> StorageResult<Vec<FrontierEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT url, mapping, depth, priority, attempt_count FROM frontier ORDER BY priority, rowid",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(FrontierEntry {
                    url: row.get(0)?,
                    mapping: row.get(1)?,
                    depth: row.get(2)?,
                    priority: row.get(3)?,
                    attempt_count: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn clear_checkpoint(&mut self) -> StorageResult<()> {
        self.conn.execute("DELETE FROM frontier", [])?;
        Ok(())
    }

    // ===== Task Failures =====

    pub fn record_failure(&mut self, run_id: i64, failure: &FailureRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO task_failures (run_id, url, mapping, attempts, last_error, history, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                failure.url,
                failure.mapping,
                failure.attempts,
                failure.last_error,
                serde_json::to_string(&failure.history)?,
                format_timestamp(failure.failed_at),
            ],
        )?;
        Ok(())
    }

    /// Most recent failures first
    pub fn list_failures(&self, limit: u32) -> StorageResult<Vec<FailureRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT url, mapping, attempts, last_error, history, failed_at
             FROM task_failures ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(url, mapping, attempts, last_error, history, failed_at)| {
                Ok(FailureRecord {
                    url,
                    mapping,
                    attempts,
                    last_error,
                    history: serde_json::from_str(&history)?,
                    failed_at: parse_timestamp(&failed_at)?,
                })
            })
            .collect()
    }

    pub fn count_failures(&self, run_id: Option<i64>) -> StorageResult<u64> {
        let count: i64 = match run_id {
            Some(run_id) => self.conn.query_row(
                "SELECT COUNT(*) FROM task_failures WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM task_failures", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }
}

impl EntityReader for SqliteStorage {
    fn get_entity(&self, identity_key: &str) -> StorageResult<Option<PersistedEntity>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM entities WHERE identity_key = ?1", ENTITY_COLUMNS),
                params![identity_key],
                RawEntity::from_row,
            )
            .optional()?
            .map(RawEntity::into_entity)
            .transpose()
    }

    fn list_entities(&self, query: &EntityQuery) -> StorageResult<Vec<PersistedEntity>> {
        let (clause, values) = filter_clause(query);
        let mut sql = format!(
            "SELECT {} FROM entities{} ORDER BY last_seen_at DESC, identity_key",
            ENTITY_COLUMNS, clause
        );
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params_from_iter(values.iter()), RawEntity::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        raws.into_iter().map(RawEntity::into_entity).collect()
    }

    fn count_entities(&self, query: &EntityQuery) -> StorageResult<u64> {
        let (clause, values) = filter_clause(query);
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM entities{}", clause),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

fn filter_clause(query: &EntityQuery) -> (String, Vec<Box<dyn ToSql>>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(mapping) = &query.mapping {
        values.push(Box::new(mapping.clone()));
        conditions.push(format!("mapping = ?{}", values.len()));
    }
    if let Some(after) = query.first_seen_after {
        values.push(Box::new(format_timestamp(after)));
        conditions.push(format!("first_seen_at >= ?{}", values.len()));
    }
    if let Some(after) = query.last_seen_after {
        values.push(Box::new(format_timestamp(after)));
        conditions.push(format!("last_seen_at >= ?{}", values.len()));
    }
    if let Some(before) = query.last_seen_before {
        values.push(Box::new(format_timestamp(before)));
        conditions.push(format!("last_seen_at < ?{}", values.len()));
    }
    if let Some(min_version) = query.min_version {
        values.push(Box::new(min_version));
        conditions.push(format!("version >= ?{}", values.len()));
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

/// Entity columns as stored, before JSON and timestamp decoding
struct RawEntity {
    identity_key: String,
    mapping: String,
    fields: String,
    content_hash: String,
    source_url: String,
    first_seen_at: String,
    last_seen_at: String,
    version: u32,
}

impl RawEntity {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            identity_key: row.get(0)?,
            mapping: row.get(1)?,
            fields: row.get(2)?,
            content_hash: row.get(3)?,
            source_url: row.get(4)?,
            first_seen_at: row.get(5)?,
            last_seen_at: row.get(6)?,
            version: row.get(7)?,
        })
    }

    fn into_entity(self) -> StorageResult<PersistedEntity> {
        Ok(PersistedEntity {
            identity_key: self.identity_key,
            mapping: self.mapping,
            fields: serde_json::from_str(&self.fields)?,
            content_hash: self.content_hash,
            source_url: self.source_url,
            first_seen_at: parse_timestamp(&self.first_seen_at)?,
            last_seen_at: parse_timestamp(&self.last_seen_at)?,
            version: self.version,
        })
    }
}
