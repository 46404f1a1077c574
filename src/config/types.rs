use serde::Deserialize;

/// Main configuration structure for Dredge
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub render: RenderConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default, rename = "seed")]
    pub seeds: Vec<SeedEntry>,
    #[serde(default, rename = "mapping")]
    pub mappings: Vec<PageMapping>,
}

impl Config {
    /// Looks up a mapping by name
    pub fn mapping(&self, name: &str) -> Option<&PageMapping> {
        self.mappings.iter().find(|m| m.name == name)
    }
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// Global cap on simultaneous fetches (also the worker pool size)
    #[serde(rename = "max-concurrent-fetches")]
    pub max_concurrent_fetches: u32,

    /// Minimum spacing between two requests to the same host (milliseconds)
    #[serde(rename = "per-host-delay-ms")]
    pub per_host_delay_ms: u64,

    /// Per-request timeout (milliseconds)
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Attempts allowed per task before it becomes Failed
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    #[serde(rename = "base-backoff-ms")]
    pub base_backoff_ms: u64,

    #[serde(rename = "max-backoff-ms")]
    pub max_backoff_ms: u64,

    /// Ceiling on any delay a server asks for (`Retry-After`, `Crawl-delay`)
    #[serde(rename = "max-retry-after-secs", default = "default_max_retry_after")]
    pub max_retry_after_secs: u64,

    /// Random jitter added to retry delays, as a percentage of the delay
    #[serde(rename = "jitter-percent", default = "default_jitter_percent")]
    pub jitter_percent: u64,

    /// Seconds after which a finished URL may be enqueued again
    #[serde(rename = "re-crawl-interval-secs", default = "default_re_crawl_interval")]
    pub re_crawl_interval_secs: u64,

    /// Maximum link-following depth from the seeds
    #[serde(rename = "max-depth", default)]
    pub max_depth: u32,

    /// Whether robots.txt is fetched and honored
    #[serde(rename = "respect-robots", default = "default_true")]
    pub respect_robots: bool,
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    #[serde(rename = "contact-url")]
    pub contact_url: String,

    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Formats the header value: `Name/Version (+ContactURL; ContactEmail)`
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// Browser rendering configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RenderConfig {
    /// Upper bound for a full render including the readiness wait (milliseconds)
    #[serde(rename = "ready-timeout-ms", default = "default_ready_timeout")]
    pub ready_timeout_ms: u64,

    /// Quiet period after which the DOM counts as stable (milliseconds)
    #[serde(rename = "dom-stable-ms", default = "default_dom_stable")]
    pub dom_stable_ms: u64,

    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(rename = "chrome-executable", default)]
    pub chrome_executable: Option<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: default_ready_timeout(),
            dom_stable_ms: default_dom_stable(),
            headless: true,
            chrome_executable: None,
        }
    }
}

/// Relational store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Number of pooled connections
    #[serde(rename = "pool-size", default = "default_pool_size")]
    pub pool_size: u32,

    /// How long a statement may wait on a locked database (milliseconds)
    #[serde(rename = "statement-timeout-ms", default = "default_statement_timeout")]
    pub statement_timeout_ms: u64,

    /// Commit attempts per record before the record is given up
    #[serde(rename = "max-attempts", default = "default_storage_attempts")]
    pub max_attempts: u32,

    #[serde(rename = "base-backoff-ms", default = "default_storage_backoff")]
    pub base_backoff_ms: u64,

    /// Consecutive records lost to storage failures before the run aborts
    #[serde(rename = "max-consecutive-failures", default = "default_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

/// Whether identity keys include the site of origin
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityScope {
    /// Key derives from field content only
    #[default]
    Content,
    /// The source host is folded into the key
    Site,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub scope: IdentityScope,
}

/// A starting URL and the mapping used to extract it
#[derive(Debug, Clone, Deserialize)]
pub struct SeedEntry {
    pub url: String,
    pub mapping: String,
    #[serde(default)]
    pub priority: u32,
}

/// How a page is obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderMode {
    #[default]
    Static,
    Rendered,
}

impl RenderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Rendered => "rendered",
        }
    }
}

/// Declarative extraction rules for one page type
#[derive(Debug, Clone, Deserialize)]
pub struct PageMapping {
    pub name: String,

    #[serde(rename = "render-mode", default)]
    pub render_mode: RenderMode,

    /// Selector for repeated record containers; absent means one record per page
    #[serde(rename = "record-selector", default)]
    pub record_selector: Option<String>,

    /// Selector that must be present before a rendered page counts as ready
    #[serde(rename = "ready-selector", default)]
    pub ready_selector: Option<String>,

    /// Fields hashed into the identity key
    #[serde(rename = "identity-fields")]
    pub identity_fields: Vec<String>,

    /// Fields compared for change detection; empty means all fields
    #[serde(rename = "tracked-fields", default)]
    pub tracked_fields: Vec<String>,

    #[serde(rename = "field", default)]
    pub fields: Vec<FieldMapping>,

    #[serde(default)]
    pub follow: Vec<FollowRule>,
}

/// A single field extraction rule
#[derive(Debug, Clone, Deserialize)]
pub struct FieldMapping {
    pub name: String,
    pub selector: String,
    /// Read this attribute instead of the element text
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub transform: Option<TransformSpec>,
}

/// Value conversion applied after selection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformSpec {
    Text,
    Integer,
    Number,
    Lowercase,
    Url,
    Regex(String),
}

/// Links to enqueue from a page
#[derive(Debug, Clone, Deserialize)]
pub struct FollowRule {
    pub selector: String,
    pub mapping: String,
    #[serde(default)]
    pub priority: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_jitter_percent() -> u64 {
    10
}

fn default_max_retry_after() -> u64 {
    3_600
}

fn default_re_crawl_interval() -> u64 {
    86_400
}

fn default_ready_timeout() -> u64 {
    30_000
}

fn default_dom_stable() -> u64 {
    500
}

fn default_pool_size() -> u32 {
    4
}

fn default_statement_timeout() -> u64 {
    5_000
}

fn default_storage_attempts() -> u32 {
    5
}

fn default_storage_backoff() -> u64 {
    100
}

fn default_consecutive_failures() -> u32 {
    10
}
