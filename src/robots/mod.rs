//! Robots.txt handling
//!
//! Rules are fetched once per host, cached, and consulted before every
//! request when `respect-robots` is enabled.

mod cache;
mod parser;

pub use cache::RobotsCache;
pub use parser::ParsedRobots;

use std::time::Duration;

use url::Url;

/// Fetches robots.txt from the origin of `url`
///
/// A 4xx response means the site publishes no rules, which allows
/// everything. Returns None when the rules could not be determined (network
/// failure, 5xx, unreadable body) so the caller can retry soon.
pub async fn fetch_robots(client: &reqwest::Client, url: &Url, timeout: Duration) -> Option<ParsedRobots> {
    let mut robots_url = url.clone();
    robots_url.set_path("/robots.txt");
    robots_url.set_query(None);
    robots_url.set_fragment(None);

    let response = match client.get(robots_url.as_str()).timeout(timeout).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(url = %robots_url, error = %e, "robots.txt unreachable");
            return None;
        }
    };

    let status = response.status();
    if status.is_server_error() {
        tracing::debug!(url = %robots_url, status = %status, "robots.txt unavailable");
        return None;
    }
    if !status.is_success() {
        tracing::debug!(url = %robots_url, status = %status, "no robots.txt, allowing all");
        return Some(ParsedRobots::allow_all());
    }

    match response.text().await {
        Ok(body) => Some(ParsedRobots::from_content(&body)),
        Err(e) => {
            tracing::debug!(url = %robots_url, error = %e, "robots.txt body unreadable");
            None
        }
    }
}
