//! Statistics generation from the entity store
//!
//! This module provides functionality for extracting and displaying
//! entity and failure statistics from the storage layer.

use crate::storage::{
    EntityQuery, EntityReader, FailureRecord, RunRecord, SqliteStorage, StorageResult,
};

/// How many recent failures `--stats` lists
pub const RECENT_FAILURES: u32 = 10;

/// Entity store statistics summary
#[derive(Debug, Clone)]
pub struct CrawlStatistics {
    /// Total number of persisted entities
    pub total_entities: u64,

    /// Entity counts per mapping, largest first
    pub entities_by_mapping: Vec<(String, u64)>,

    /// Entities whose tracked fields changed at least once
    pub updated_entities: u64,

    /// The most recent run, if any
    pub latest_run: Option<RunRecord>,

    /// Terminal task failures across all runs
    pub total_failures: u64,

    /// Terminal task failures of the latest run
    pub latest_run_failures: u64,

    /// Most recent terminal failures, newest first
    pub recent_failures: Vec<FailureRecord>,
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The (read-only) store to query
///
/// # Returns
///
/// * `Ok(CrawlStatistics)` - Successfully loaded statistics
/// * `Err(StorageError)` - Failed to query statistics
pub fn load_statistics(storage: &SqliteStorage) -> StorageResult<CrawlStatistics> {
    let total_entities = storage.count_entities(&EntityQuery::default())?;

    let updated_entities = storage.count_entities(&EntityQuery {
        min_version: Some(2),
        ..Default::default()
    })?;

    let latest_run = storage.get_latest_run()?;
    let latest_run_failures = match &latest_run {
        Some(run) => storage.count_failures(Some(run.id))?,
        None => 0,
    };

    Ok(CrawlStatistics {
        total_entities,
        entities_by_mapping: storage.mapping_counts()?,
        updated_entities,
        latest_run,
        total_failures: storage.count_failures(None)?,
        latest_run_failures,
        recent_failures: storage.list_failures(RECENT_FAILURES)?,
    })
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &CrawlStatistics) {
    println!("=== Entity Statistics ===\n");

    println!("Overview:");
    println!("  Total entities: {}", stats.total_entities);
    println!("  Changed at least once: {}", stats.updated_entities);
    println!();

    if !stats.entities_by_mapping.is_empty() {
        println!("Entities by Mapping:");
        for (mapping, count) in &stats.entities_by_mapping {
            let percentage = if stats.total_entities > 0 {
                (*count as f64 / stats.total_entities as f64) * 100.0
            } else {
                0.0
            };
            println!("  {}: {} ({:.1}%)", mapping, count, percentage);
        }
        println!();
    }

    match &stats.latest_run {
        Some(run) => {
            println!("Latest Run:");
            println!("  Id: {}", run.id);
            println!("  Status: {}", run.status.to_db_string());
            println!("  Started: {}", run.started_at);
            if let Some(finished) = &run.finished_at {
                println!("  Finished: {}", finished);
            }
            println!("  Failed tasks: {}", stats.latest_run_failures);
        }
        None => println!("No runs recorded yet"),
    }
    println!();

    println!("Failed Tasks (all runs): {}", stats.total_failures);
    for failure in &stats.recent_failures {
        println!(
            "  - {} [{}] after {} attempt(s): {}",
            failure.url, failure.mapping, failure.attempts, failure.last_error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::{AttemptRecord, FailureKind};
    use crate::dedup::{compute_content_hash, compute_identity_key};
    use crate::extract::{FieldValue, Record};
    use crate::storage::RunStatus;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(mapping: &str, sku: &str, price: f64) -> Record {
        let mut fields = BTreeMap::new();
        fields.insert("sku".to_string(), FieldValue::Text(sku.to_string()));
        fields.insert("price".to_string(), FieldValue::Number(price));
        let tracked = vec!["sku".to_string(), "price".to_string()];

        Record {
            identity_key: compute_identity_key(&["sku".to_string()], &fields, None),
            content_hash: compute_content_hash(&tracked, &fields),
            mapping: mapping.to_string(),
            fields,
            tracked_fields: tracked,
            source_url: format!("https://shop.example/{}", sku),
            extracted_at: Utc::now(),
            diagnostics: Vec::new(),
        }
    }

    #[test]
    fn test_load_statistics_empty_store() {
        let storage = SqliteStorage::new_in_memory().unwrap();
        let stats = load_statistics(&storage).unwrap();

        assert_eq!(stats.total_entities, 0);
        assert!(stats.entities_by_mapping.is_empty());
        assert!(stats.latest_run.is_none());
        assert_eq!(stats.latest_run_failures, 0);
    }

    #[test]
    fn test_load_statistics_counts() {
        let mut storage = SqliteStorage::new_in_memory().unwrap();
        let run_id = storage.create_run("hash").unwrap();

        storage.upsert_record(&record("product", "A", 1.0), Utc::now()).unwrap();
        storage.upsert_record(&record("product", "A", 2.0), Utc::now()).unwrap();
        storage.upsert_record(&record("product", "B", 1.0), Utc::now()).unwrap();
        storage.upsert_record(&record("listing", "C", 1.0), Utc::now()).unwrap();

        storage
            .record_failure(
                run_id,
                &FailureRecord {
                    url: "https://shop.example/gone".to_string(),
                    mapping: "product".to_string(),
                    attempts: 1,
                    last_error: "HTTP 404".to_string(),
                    history: vec![AttemptRecord {
                        attempt: 1,
                        at: Utc::now(),
                        kind: FailureKind::Permanent,
                        message: "HTTP 404".to_string(),
                    }],
                    failed_at: Utc::now(),
                },
            )
            .unwrap();
        storage.finish_run(run_id, RunStatus::Completed).unwrap();

        let stats = load_statistics(&storage).unwrap();
        assert_eq!(stats.total_entities, 3);
        assert_eq!(stats.updated_entities, 1);
        assert_eq!(
            stats.entities_by_mapping,
            vec![("product".to_string(), 2), ("listing".to_string(), 1)]
        );
        assert_eq!(stats.latest_run.as_ref().map(|r| r.status), Some(RunStatus::Completed));
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.latest_run_failures, 1);
        assert_eq!(stats.recent_failures[0].last_error, "HTTP 404");
    }
}
