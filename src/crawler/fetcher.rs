//! Page fetcher
//!
//! This module handles every outbound request, including:
//! - Building the HTTP client with the configured user agent
//! - robots.txt checks (cached per host)
//! - Per-host pacing through the shared `RateLimiter`
//! - The global concurrency cap
//! - Static GETs and bounded browser renders
//! - Classifying failures into transient, permanent and backoff

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{Config, RenderMode, UserAgentConfig};
use crate::crawler::render::{ReadyCondition, Renderer};
use crate::crawler::{BackoffReason, FetchError, RateLimiter};
use crate::robots::{fetch_robots, ParsedRobots, RobotsCache};
use crate::url::host_key;

/// Raw content retrieved for one URL
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Final URL after redirects
    pub url: Url,
    pub status_code: u16,
    pub raw_content: Vec<u8>,
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub render_mode: RenderMode,
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The user agent configuration
/// * `timeout` - Per-request timeout
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &UserAgentConfig, timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.header_value())
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Fetches pages under the configured rate limits
pub struct Fetcher {
    client: Client,
    limiter: Arc<RateLimiter>,
    permits: Arc<Semaphore>,
    renderer: Option<Arc<dyn Renderer>>,
    robots: Option<RobotsCache>,
    agent_token: String,
    timeout: Duration,
    render_timeout: Duration,
    dom_stable: Duration,
    /// Upper bound on delays requested by servers
    max_retry_after: Duration,
}

impl Fetcher {
    pub fn new(config: &Config, renderer: Option<Arc<dyn Renderer>>) -> Result<Self, reqwest::Error> {
        let timeout = Duration::from_millis(config.crawler.timeout_ms);

        Ok(Self {
            client: build_http_client(&config.user_agent, timeout)?,
            limiter: Arc::new(RateLimiter::new(Duration::from_millis(
                config.crawler.per_host_delay_ms,
            ))),
            permits: Arc::new(Semaphore::new(config.crawler.max_concurrent_fetches.max(1) as usize)),
            renderer,
            robots: config.crawler.respect_robots.then(RobotsCache::new),
            agent_token: config.user_agent.crawler_name.clone(),
            timeout,
            render_timeout: Duration::from_millis(config.render.ready_timeout_ms),
            dom_stable: Duration::from_millis(config.render.dom_stable_ms),
            max_retry_after: Duration::from_secs(config.crawler.max_retry_after_secs),
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Clamps a server-requested delay to the configured ceiling
    fn bounded_delay(&self, requested: Duration) -> Duration {
        requested.min(self.max_retry_after)
    }

    /// Readiness condition for a rendered page: the mapping's selector when it
    /// has one, DOM stability otherwise
    pub fn ready_condition(&self, ready_selector: Option<&str>) -> ReadyCondition {
        match ready_selector {
            Some(selector) => ReadyCondition::Selector(selector.to_string()),
            None => ReadyCondition::DomStable(self.dom_stable),
        }
    }

    /// Retrieves `url` statically or through the browser
    ///
    /// Never waits for a host: when its next slot is not open yet the call
    /// returns `HostBusy` at once and the caller reschedules the task.
    ///
    /// # Returns
    ///
    /// * `Ok(FetchResult)` - A 2xx response (or a completed render)
    /// * `Err(FetchError::Transient)` - Timeout, connection failure or 5xx
    /// * `Err(FetchError::Permanent)` - Other 4xx, unusable URL, no renderer
    /// * `Err(FetchError::Backoff)` - 429 or robots.txt disallow
    /// * `Err(FetchError::HostBusy)` - The host's slot opens later; nothing was sent
    /// * `Err(FetchError::Cancelled)` - `cancel` fired before the request went out
    pub async fn fetch(
        &self,
        url: &Url,
        mode: RenderMode,
        ready: &ReadyCondition,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, FetchError> {
        let host = host_key(url).ok_or_else(|| FetchError::permanent(url.as_str(), "URL has no host"))?;

        if cancel.is_cancelled() {
            return Err(FetchError::cancelled(url.as_str()));
        }

        if let Some(rules) = self.robots_for(url, &host, cancel).await? {
            if !rules.is_allowed(url.as_str(), &self.agent_token) {
                return Err(FetchError::Backoff {
                    url: url.to_string(),
                    reason: BackoffReason::RobotsDisallowed,
                    retry_after: None,
                });
            }
        }

        self.claim_slot(url, &host)?;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::cancelled(url.as_str())),
            permit = self.permits.acquire() => permit
                .map_err(|_| FetchError::transient(url.as_str(), "fetcher is shutting down"))?,
        };

        tracing::debug!(url = %url, mode = mode.as_str(), "Fetching");

        match mode {
            RenderMode::Static => self.fetch_static(url).await,
            RenderMode::Rendered => self.fetch_rendered(url, ready).await,
        }
    }

    fn claim_slot(&self, url: &Url, host: &str) -> Result<(), FetchError> {
        self.limiter
            .try_acquire(host, Instant::now())
            .map_err(|until| FetchError::HostBusy {
                url: url.to_string(),
                until,
            })
    }

    async fn fetch_static(&self, url: &Url) -> Result<FetchResult, FetchError> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url.as_str(), &e))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers(), Utc::now(), self.max_retry_after);
        check_status(url, status, retry_after)?;

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(url.as_str(), &e))?;

        Ok(FetchResult {
            url: final_url,
            status_code: status.as_u16(),
            raw_content: body.to_vec(),
            content_type,
            fetched_at: Utc::now(),
            render_mode: RenderMode::Static,
        })
    }

    async fn fetch_rendered(&self, url: &Url, ready: &ReadyCondition) -> Result<FetchResult, FetchError> {
        let renderer = self
            .renderer
            .as_ref()
            .ok_or_else(|| FetchError::permanent(url.as_str(), "no browser renderer available"))?;

        let page = renderer.render(url, ready, self.render_timeout).await?;

        // a page whose document status the browser did not report is taken as loaded
        let status = page
            .status
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::OK);
        check_status(url, status, None)?;

        Ok(FetchResult {
            url: page.final_url,
            status_code: status.as_u16(),
            raw_content: page.html.into_bytes(),
            content_type: Some("text/html".to_string()),
            fetched_at: Utc::now(),
            render_mode: RenderMode::Rendered,
        })
    }

    /// Rules for `host`, fetched on first use; None when robots are ignored
    async fn robots_for(
        &self,
        url: &Url,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ParsedRobots>, FetchError> {
        let Some(cache) = self.robots.as_ref() else {
            return Ok(None);
        };

        if let Some(rules) = cache.get(host) {
            return Ok(Some(rules));
        }

        self.claim_slot(url, host)?;
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::cancelled(url.as_str())),
            fetched = fetch_robots(&self.client, url, self.timeout) => fetched,
        };

        let Some(rules) = fetched else {
            cache.insert_unreachable(host);
            return Ok(Some(ParsedRobots::allow_all()));
        };

        if let Some(delay) = rules.crawl_delay(&self.agent_token) {
            if let Ok(delay) = Duration::try_from_secs_f64(delay) {
                if !delay.is_zero() {
                    let delay = self.bounded_delay(delay);
                    tracing::debug!(host, crawl_delay_ms = delay.as_millis() as u64, "Applying robots.txt crawl delay");
                    self.limiter.set_crawl_delay(host, delay);
                }
            }
        }

        cache.insert(host, rules.clone());
        Ok(Some(rules))
    }
}

/// Maps an HTTP status onto the failure taxonomy; 2xx passes
fn check_status(url: &Url, status: StatusCode, retry_after: Option<Duration>) -> Result<(), FetchError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::Backoff {
            url: url.to_string(),
            reason: BackoffReason::RateLimited,
            retry_after,
        });
    }
    if status.is_server_error() {
        return Err(FetchError::transient(url.as_str(), format!("HTTP {}", status.as_u16())));
    }
    if !status.is_success() {
        return Err(FetchError::permanent(url.as_str(), format!("HTTP {}", status.as_u16())));
    }
    Ok(())
}

/// Parses `Retry-After` as delta-seconds or an HTTP date, capped at `ceiling`
fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>, ceiling: Duration) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    let requested = match value.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => {
            let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
            (at - now).to_std().ok()?
        }
    };
    Some(requested.min(ceiling))
}
