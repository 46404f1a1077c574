//! Integration tests for the crawl pipeline
//!
//! These tests use wiremock to create mock HTTP servers and drive full runs
//! (fetch, extract, dedup, persist) against a temporary SQLite database.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dredge::config::{parse_config, Config};
use dredge::crawler::{Coordinator, FetchError, ReadyCondition, RenderedPage, Renderer};
use dredge::storage::{EntityQuery, EntityReader, RunStatus, SqliteStorage};
use dredge::FieldValue;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PRODUCT_MAPPING: &str = r#"
[[mapping]]
name = "product"
identity-fields = ["sku"]
tracked-fields = ["price", "title"]

[[mapping.field]]
name = "sku"
selector = ".sku"

[[mapping.field]]
name = "title"
selector = "h1"

[[mapping.field]]
name = "price"
selector = ".price"
transform = "number"
"#;

/// Builds a config whose crawler section is tuned for fast tests
fn test_config(db: &Path, crawler_extra: &str, seeds: &[(&str, &str)], mappings: &str) -> Config {
    let seeds: String = seeds
        .iter()
        .map(|(url, mapping)| format!("[[seed]]\nurl = \"{}\"\nmapping = \"{}\"\n\n", url, mapping))
        .collect();

    parse_config(&format!(
        r#"
[crawler]
max-concurrent-fetches = 4
per-host-delay-ms = 0
timeout-ms = 2000
max-attempts = 3
base-backoff-ms = 10
max-backoff-ms = 40
{crawler_extra}

[user-agent]
crawler-name = "DredgeTest"
crawler-version = "0.1"
contact-url = "https://example.com/bot"
contact-email = "bot@example.com"

[storage]
database-path = "{db}"
base-backoff-ms = 5

{seeds}
{mappings}
"#,
        db = db.display(),
    ))
    .expect("test config should parse")
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html; charset=utf-8")
        .set_body_string(format!("<html><body>{}</body></html>", body))
}

fn product_page(sku: &str, title: &str, price: &str) -> ResponseTemplate {
    html(&format!(
        r#"<h1>{}</h1><span class="sku">{}</span><span class="price">{}</span>"#,
        title, sku, price
    ))
}

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("dredge.db")
}

fn reader(db: &Path) -> SqliteStorage {
    SqliteStorage::open_read_only(db).expect("database should exist after a run")
}

#[tokio::test]
async fn test_new_unchanged_updated_across_runs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/1"))
        .respond_with(product_page("SKU-1", "Kettle", "$19.99"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let seed = format!("{}/p/1", server.uri());
    let config = test_config(
        &db,
        "respect-robots = false",
        &[(&seed, "product")],
        PRODUCT_MAPPING,
    );

    // first sighting
    let first = Coordinator::new(config.clone(), "h", None)
        .unwrap()
        .run(true)
        .await
        .unwrap();
    assert_eq!(first.records_new, 1);
    assert_eq!(first.tasks_succeeded, 1);

    let entity = reader(&db)
        .list_entities(&EntityQuery::default())
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(entity.version, 1);
    assert_eq!(entity.fields.get("price"), Some(&FieldValue::Number(19.99)));
    let first_seen = entity.first_seen_at;

    // same content
    let second = Coordinator::new(config.clone(), "h", None)
        .unwrap()
        .run(true)
        .await
        .unwrap();
    assert_eq!(second.records_new, 0);
    assert_eq!(second.records_unchanged, 1);

    let entity = reader(&db).get_entity(&entity.identity_key).unwrap().unwrap();
    assert_eq!(entity.version, 1);
    assert_eq!(entity.first_seen_at, first_seen);

    // price change
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/p/1"))
        .respond_with(product_page("SKU-1", "Kettle", "$17.49"))
        .mount(&server)
        .await;

    let third = Coordinator::new(config, "h", None)
        .unwrap()
        .run(true)
        .await
        .unwrap();
    assert_eq!(third.records_updated, 1);

    let storage = reader(&db);
    let entity = storage.get_entity(&entity.identity_key).unwrap().unwrap();
    assert_eq!(entity.version, 2);
    assert_eq!(entity.first_seen_at, first_seen);
    assert!(entity.last_seen_at > first_seen);
    assert_eq!(entity.fields.get("price"), Some(&FieldValue::Number(17.49)));
    assert_eq!(storage.count_entities(&EntityQuery::default()).unwrap(), 1);
}

#[tokio::test]
async fn test_rate_limited_task_fails_after_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/busy"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let seed = format!("{}/p/busy", server.uri());
    let config = test_config(&db, "respect-robots = false", &[(&seed, "product")], PRODUCT_MAPPING);

    let summary = Coordinator::new(config, "h", None)
        .unwrap()
        .run(true)
        .await
        .unwrap();

    assert_eq!(summary.tasks_failed, 1);
    assert_eq!(summary.tasks_succeeded, 0);
    assert_eq!(summary.records_committed(), 0);

    let storage = reader(&db);
    assert_eq!(storage.count_entities(&EntityQuery::default()).unwrap(), 0);

    let failures = storage.list_failures(10).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].attempts, 3);
    assert_eq!(failures[0].history.len(), 3);
    assert_eq!(storage.get_latest_run().unwrap().unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn test_not_found_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let seed = format!("{}/p/gone", server.uri());
    let config = test_config(&db, "respect-robots = false", &[(&seed, "product")], PRODUCT_MAPPING);

    let summary = Coordinator::new(config, "h", None)
        .unwrap()
        .run(true)
        .await
        .unwrap();

    assert_eq!(summary.tasks_failed, 1);
    let failures = reader(&db).list_failures(10).unwrap();
    assert_eq!(failures[0].last_error, "HTTP 404");
}

#[tokio::test]
async fn test_transient_error_recovers_on_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/p/flaky"))
        .respond_with(product_page("SKU-F", "Fan", "30"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let seed = format!("{}/p/flaky", server.uri());
    let config = test_config(&db, "respect-robots = false", &[(&seed, "product")], PRODUCT_MAPPING);

    let summary = Coordinator::new(config, "h", None)
        .unwrap()
        .run(true)
        .await
        .unwrap();

    assert_eq!(summary.tasks_succeeded, 1);
    assert_eq!(summary.records_new, 1);
    assert_eq!(reader(&db).count_failures(None).unwrap(), 0);
}

#[tokio::test]
async fn test_missing_selectors_yield_no_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/about"))
        .respond_with(html("<p>Nothing to see here</p>"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let seed = format!("{}/about", server.uri());
    let config = test_config(&db, "respect-robots = false", &[(&seed, "product")], PRODUCT_MAPPING);

    let summary = Coordinator::new(config, "h", None)
        .unwrap()
        .run(true)
        .await
        .unwrap();

    assert_eq!(summary.tasks_succeeded, 1);
    assert_eq!(summary.records_committed(), 0);
    assert_eq!(reader(&db).count_entities(&EntityQuery::default()).unwrap(), 0);
}

#[tokio::test]
async fn test_listing_page_dedups_within_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(html(
            r#"
            <div class="item"><span class="sku">A</span><span class="price">1.00</span></div>
            <div class="item"><span class="sku">B</span><span class="price">2.00</span></div>
            <div class="item"><span class="sku">A</span><span class="price">1.00</span></div>
            <div class="item"><span class="note">ad slot</span></div>
            "#,
        ))
        .mount(&server)
        .await;

    let mappings = r#"
[[mapping]]
name = "listing"
record-selector = ".item"
identity-fields = ["sku"]

[[mapping.field]]
name = "sku"
selector = ".sku"

[[mapping.field]]
name = "price"
selector = ".price"
transform = "number"
"#;

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let seed = format!("{}/list", server.uri());
    let config = test_config(&db, "respect-robots = false", &[(&seed, "listing")], mappings);

    let summary = Coordinator::new(config, "h", None)
        .unwrap()
        .run(true)
        .await
        .unwrap();

    assert_eq!(summary.records_new, 2);
    assert_eq!(summary.records_unchanged, 1);
    assert_eq!(reader(&db).count_entities(&EntityQuery::default()).unwrap(), 2);
}

#[tokio::test]
async fn test_follow_links_respects_max_depth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(html(
            r#"<a class="product" href="/p/1">one</a>
               <a class="product" href="/p/2#reviews">two</a>
               <a class="product" href="/p/1">one again</a>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/p/1"))
        .respond_with(html(
            r#"<span class="sku">P1</span><span class="price">5</span>
               <a class="related" href="/p/3">three</a>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/p/2"))
        .respond_with(product_page("P2", "Two", "6"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/p/3"))
        .respond_with(product_page("P3", "Three", "7"))
        .expect(0)
        .mount(&server)
        .await;

    let mappings = format!(
        r#"
[[mapping]]
name = "listing"
identity-fields = ["heading"]

[[mapping.field]]
name = "heading"
selector = "h2"

[[mapping.follow]]
selector = "a.product"
mapping = "product"
priority = 1
{PRODUCT_MAPPING}
[[mapping.follow]]
selector = "a.related"
mapping = "product"
"#
    );

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let seed = format!("{}/list", server.uri());
    let config = test_config(
        &db,
        "respect-robots = false\nmax-depth = 1",
        &[(&seed, "listing")],
        &mappings,
    );

    let summary = Coordinator::new(config, "h", None)
        .unwrap()
        .run(true)
        .await
        .unwrap();

    assert_eq!(summary.tasks_succeeded, 3);
    assert_eq!(summary.records_new, 2);
}

#[tokio::test]
async fn test_robots_disallow_blocks_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/private/p/1"))
        .respond_with(product_page("X", "Secret", "1"))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/p/1"))
        .respond_with(product_page("Y", "Public", "2"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let private = format!("{}/private/p/1", server.uri());
    let public = format!("{}/p/1", server.uri());
    let config = test_config(
        &db,
        "respect-robots = true",
        &[(&private, "product"), (&public, "product")],
        PRODUCT_MAPPING,
    );

    let summary = Coordinator::new(config, "h", None)
        .unwrap()
        .run(true)
        .await
        .unwrap();

    assert_eq!(summary.tasks_succeeded, 1);
    assert_eq!(summary.tasks_failed, 1);
    assert_eq!(summary.records_new, 1);
}

struct FixedRenderer {
    html: String,
    status: u16,
    calls: AtomicU32,
}

impl FixedRenderer {
    fn new(html: &str, status: u16) -> Self {
        Self {
            html: html.to_string(),
            status,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Renderer for FixedRenderer {
    async fn render(
        &self,
        url: &Url,
        _ready: &ReadyCondition,
        _timeout: Duration,
    ) -> Result<RenderedPage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RenderedPage {
            final_url: url.clone(),
            status: Some(self.status),
            html: self.html.clone(),
        })
    }
}

fn rendered_product_mapping() -> String {
    PRODUCT_MAPPING.replace(
        "name = \"product\"",
        "name = \"product\"\nrender-mode = \"rendered\"\nready-selector = \".price\"",
    )
}

#[tokio::test]
async fn test_rendered_mapping_goes_through_renderer() {
    let server = MockServer::start().await;
    // the static path must never be used for a rendered mapping
    Mock::given(method("GET"))
        .and(path("/app/item"))
        .respond_with(html("<div id=\"root\"></div>"))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let seed = format!("{}/app/item", server.uri());
    let config = test_config(
        &db,
        "respect-robots = false",
        &[(&seed, "product")],
        &rendered_product_mapping(),
    );

    let renderer = Arc::new(FixedRenderer::new(
        r#"<h1>Lamp</h1><span class="sku">R-7</span><span class="price">€129.00</span>"#,
        200,
    ));

    let summary = Coordinator::new(config, "h", Some(renderer.clone() as Arc<dyn Renderer>))
        .unwrap()
        .run(true)
        .await
        .unwrap();

    assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(summary.records_new, 1);

    let entity = reader(&db)
        .list_entities(&EntityQuery::default())
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(entity.fields.get("sku"), Some(&FieldValue::Text("R-7".to_string())));
}

#[tokio::test]
async fn test_cancelled_run_resumes_from_checkpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/1"))
        .respond_with(product_page("SKU-1", "Kettle", "10"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let seed = format!("{}/p/1", server.uri());
    let config = test_config(&db, "respect-robots = false", &[(&seed, "product")], PRODUCT_MAPPING);

    let interrupted = Coordinator::new(config.clone(), "h", None).unwrap();
    interrupted.cancel_token().cancel();
    let summary = interrupted.run(false).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.tasks_not_attempted, 1);
    assert_eq!(reader(&db).load_checkpoint().unwrap().len(), 1);
    assert_eq!(reader(&db).get_latest_run().unwrap().unwrap().status, RunStatus::Interrupted);

    let resumed = Coordinator::new(config, "h", None)
        .unwrap()
        .run(false)
        .await
        .unwrap();
    assert!(!resumed.cancelled);
    assert_eq!(resumed.records_new, 1);
    assert!(reader(&db).load_checkpoint().unwrap().is_empty());
}

#[tokio::test]
async fn test_rendered_error_page_is_not_extracted() {
    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let config = test_config(
        &db,
        "respect-robots = false",
        &[("https://shop.invalid/gone", "product")],
        &rendered_product_mapping(),
    );

    let renderer = Arc::new(FixedRenderer::new(
        r#"<h1>Not found</h1><span class="sku">404</span><span class="price">0</span>"#,
        404,
    ));

    let summary = Coordinator::new(config, "h", Some(renderer.clone() as Arc<dyn Renderer>))
        .unwrap()
        .run(true)
        .await
        .unwrap();

    assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(summary.tasks_failed, 1);
    assert_eq!(summary.records_committed(), 0);

    let storage = reader(&db);
    assert_eq!(storage.count_entities(&EntityQuery::default()).unwrap(), 0);
    assert_eq!(storage.list_failures(10).unwrap()[0].last_error, "HTTP 404");
}

#[tokio::test]
async fn test_items_without_identity_are_not_merged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(html(
            r#"
            <li><span class="price">1</span></li>
            <li><span class="price">2</span></li>
            "#,
        ))
        .mount(&server)
        .await;

    let mappings = PRODUCT_MAPPING.replace(
        "identity-fields",
        "record-selector = \"li\"\nidentity-fields",
    );

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let seed = format!("{}/list", server.uri());
    let config = test_config(&db, "respect-robots = false", &[(&seed, "product")], &mappings);

    let summary = Coordinator::new(config, "h", None)
        .unwrap()
        .run(true)
        .await
        .unwrap();

    assert_eq!(summary.tasks_succeeded, 1);
    assert_eq!(summary.records_committed(), 0);
    assert_eq!(reader(&db).count_entities(&EntityQuery::default()).unwrap(), 0);
}

#[tokio::test]
async fn test_cancel_stops_fetch_waiting_for_host_slot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(product_page("SKU-1", "Kettle", "10"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let a = format!("{}/a", server.uri());
    let b = format!("{}/b", server.uri());
    let mut config = test_config(
        &db,
        "respect-robots = false",
        &[(&a, "product"), (&b, "product")],
        PRODUCT_MAPPING,
    );
    config.crawler.per_host_delay_ms = 2_000;
    config.crawler.max_concurrent_fetches = 1;

    let cancel = CancellationToken::new();
    let coordinator = Coordinator::new(config, "h", None)
        .unwrap()
        .with_cancel_token(cancel.clone());

    let started = Instant::now();
    let run = tokio::spawn(async move { coordinator.run(true).await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancelled run should stop promptly")
        .unwrap()
        .unwrap();

    assert!(summary.cancelled);
    assert!(started.elapsed() < Duration::from_millis(1_500));

    let paths: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert_eq!(paths, vec!["/a"]);

    let checkpoint = reader(&db).load_checkpoint().unwrap();
    assert_eq!(checkpoint.len(), 1);
    assert_eq!(checkpoint[0].url, b);
}

#[tokio::test]
async fn test_enormous_retry_after_does_not_hang_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/p/busy"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "18446744073709551615"))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let seed = format!("{}/p/busy", server.uri());
    let mut config = test_config(
        &db,
        "respect-robots = false\nmax-retry-after-secs = 1",
        &[(&seed, "product")],
        PRODUCT_MAPPING,
    );
    config.crawler.max_attempts = 2;
    config.crawler.max_concurrent_fetches = 2;

    let run = Coordinator::new(config, "h", None).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(10), run.run(true))
        .await
        .expect("run should finish")
        .unwrap();

    assert_eq!(summary.tasks_failed, 1);
    assert!(!summary.cancelled);
}

#[tokio::test]
async fn test_backed_off_host_does_not_stall_other_hosts() {
    let limited = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "4"))
        .mount(&limited)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(product_page("SKU-B", "Healthy", "3"))
        .mount(&healthy)
        .await;

    let limited_seeds: Vec<String> = (1..=5).map(|i| format!("{}/p/{}", limited.uri(), i)).collect();
    let healthy_seed = format!("{}/p/b", healthy.uri());
    let mut seeds: Vec<(&str, &str)> = limited_seeds.iter().map(|u| (u.as_str(), "product")).collect();
    seeds.push((&healthy_seed, "product"));

    let dir = TempDir::new().unwrap();
    let db = db_path(&dir);
    let mut config = test_config(&db, "respect-robots = false", &seeds, PRODUCT_MAPPING);
    config.crawler.max_concurrent_fetches = 2;
    config.seeds[5].priority = 5;

    let cancel = CancellationToken::new();
    let coordinator = Coordinator::new(config, "h", None)
        .unwrap()
        .with_cancel_token(cancel.clone());
    let run = tokio::spawn(async move { coordinator.run(true).await });

    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while healthy.received_requests().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;

    cancel.cancel();
    let summary = run.await.unwrap().unwrap();

    assert!(reached.is_ok(), "healthy host was starved by the backed-off one");
    assert_eq!(summary.records_new, 1);
    // only the first wave hit the limited host before its backoff took hold
    assert!(limited.received_requests().await.unwrap().len() <= 2);
}
