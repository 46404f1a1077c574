//! Bounded connection pool with retry for connectivity loss
//!
//! A connection is acquired per commit and released as soon as the commit
//! finishes. Each operation runs on the blocking thread pool with the pooled
//! connection moved into it, so a cancelled caller never interrupts a write
//! halfway through.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use deadpool::unmanaged::{Object, Pool};

use crate::config::StorageConfig;
use crate::extract::Record;
use crate::storage::traits::{StorageError, StorageResult};
use crate::storage::{CommitOutcome, FailureRecord, FrontierEntry, RunStatus, SqliteStorage};

/// Shared handle to the pooled SQLite connections
#[derive(Clone)]
pub struct StoragePool {
    pool: Pool<SqliteStorage>,
    acquire_timeout: Duration,
    max_attempts: u32,
    base_backoff: Duration,
}

impl StoragePool {
    /// Opens `pool-size` connections to the configured database
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        let statement_timeout = Duration::from_millis(config.statement_timeout_ms);
        let path = Path::new(&config.database_path);

        let connections = (0..config.pool_size.max(1))
            .map(|_| SqliteStorage::open(path, statement_timeout))
            .collect::<StorageResult<Vec<_>>>()?;

        tracing::debug!(
            path = %config.database_path,
            connections = connections.len(),
            "Opened storage pool"
        );

        Ok(Self {
            pool: Pool::from(connections),
            acquire_timeout: statement_timeout,
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
        })
    }

    async fn acquire(&self) -> StorageResult<Object<SqliteStorage>> {
        match tokio::time::timeout(self.acquire_timeout, self.pool.get()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(StorageError::Pool(e.to_string())),
            Err(_) => Err(StorageError::PoolTimeout),
        }
    }

    /// Runs `op` once on a pooled connection
    pub async fn run<F, R>(&self, op: F) -> StorageResult<R>
    where
        F: FnOnce(&mut SqliteStorage) -> StorageResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let mut conn = self.acquire().await?;
        tokio::task::spawn_blocking(move || op(&mut *conn)).await?
    }

    /// Runs `op`, retrying transient failures with exponential backoff
    ///
    /// After `max-attempts` transient failures the error is surfaced as
    /// `StorageError::Exhausted`; non-transient errors are returned at once.
    pub async fn run_with_retry<F, R>(&self, what: &str, op: F) -> StorageResult<R>
    where
        F: Fn(&mut SqliteStorage) -> StorageResult<R> + Clone + Send + 'static,
        R: Send + 'static,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.run(op.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_for(attempt);
                    tracing::warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Storage operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(StorageError::Exhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.base_backoff.saturating_mul(factor)
    }

    /// Classifies and commits a record, stamping it as seen now
    pub async fn commit_record(&self, record: Record) -> StorageResult<CommitOutcome> {
        self.run_with_retry("commit_record", move |storage| {
            storage.upsert_record(&record, Utc::now())
        })
        .await
    }

    pub async fn create_run(&self, config_hash: String) -> StorageResult<i64> {
        self.run_with_retry("create_run", move |storage| storage.create_run(&config_hash))
            .await
    }

    pub async fn finish_run(&self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        self.run_with_retry("finish_run", move |storage| storage.finish_run(run_id, status))
            .await
    }

    pub async fn save_checkpoint(
        &self,
        run_id: i64,
        entries: Vec<FrontierEntry>,
    ) -> StorageResult<()> {
        self.run_with_retry("save_checkpoint", move |storage| {
            storage.save_checkpoint(run_id, &entries)
        })
        .await
    }

    pub async fn load_checkpoint(&self) -> StorageResult<Vec<FrontierEntry>> {
        self.run_with_retry("load_checkpoint", |storage| storage.load_checkpoint())
            .await
    }

    pub async fn clear_checkpoint(&self) -> StorageResult<()> {
        self.run_with_retry("clear_checkpoint", |storage| storage.clear_checkpoint())
            .await
    }

    pub async fn record_failure(&self, run_id: i64, failure: FailureRecord) -> StorageResult<()> {
        self.run_with_retry("record_failure", move |storage| {
            storage.record_failure(run_id, &failure)
        })
        .await
    }
}
