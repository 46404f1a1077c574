//! Browser rendering for pages that need script execution
//!
//! The fetcher talks to a `Renderer` trait object. Each render is bounded by
//! the configured readiness timeout, which the renderer enforces itself so it
//! can release the browser tab either way. The Chrome implementation is only
//! compiled with the `browser` feature.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::crawler::FetchError;

/// When a rendered page counts as ready for extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyCondition {
    /// An element matching this CSS selector exists
    Selector(String),
    /// The serialized DOM has not changed for this long
    DomStable(Duration),
}

/// Markup captured from a rendered page
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub final_url: Url,
    /// HTTP status of the document response, when the browser reported one
    pub status: Option<u16>,
    pub html: String,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Loads `url`, waits for `ready`, and returns the resulting DOM
    ///
    /// Implementations give up with `FetchError::Transient` once `timeout`
    /// has elapsed and clean up whatever they opened before returning.
    async fn render(
        &self,
        url: &Url,
        ready: &ReadyCondition,
        timeout: Duration,
    ) -> Result<RenderedPage, FetchError>;
}

/// Error for a render that did not become ready in time
#[cfg(any(feature = "browser", test))]
pub(crate) fn render_timed_out(url: &Url, timeout: Duration) -> FetchError {
    FetchError::transient(
        url.as_str(),
        format!("render not ready after {}ms", timeout.as_millis()),
    )
}

#[cfg(feature = "browser")]
pub use chrome::ChromeRenderer;

#[cfg(feature = "browser")]
mod chrome {
    use std::time::Duration;

    use async_trait::async_trait;
    use chromiumoxide::browser::{Browser, BrowserConfig};
    use chromiumoxide::cdp::browser_protocol::network::{EventResponseReceived, ResourceType};
    use chromiumoxide::listeners::EventStream;
    use chromiumoxide::Page;
    use futures::StreamExt;
    use tokio::task::JoinHandle;
    use url::Url;

    use super::{render_timed_out, ReadyCondition, RenderedPage, Renderer};
    use crate::config::RenderConfig;
    use crate::crawler::FetchError;

    const POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// How long to look for the document response once navigation finished
    const STATUS_WAIT: Duration = Duration::from_millis(500);

    /// Headless Chrome driven over the DevTools protocol
    pub struct ChromeRenderer {
        browser: Browser,
        user_agent: String,
        handler: JoinHandle<()>,
    }

    impl ChromeRenderer {
        pub async fn launch(config: &RenderConfig, user_agent: &str) -> Result<Self, String> {
            let mut builder = BrowserConfig::builder();
            if !config.headless {
                builder = builder.with_head();
            }
            if let Some(path) = &config.chrome_executable {
                builder = builder.chrome_executable(path);
            }
            let browser_config = builder.build()?;

            let (browser, mut handler) = Browser::launch(browser_config)
                .await
                .map_err(|e| e.to_string())?;

            let handler = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if let Err(e) = event {
                        tracing::debug!(error = %e, "Browser handler stopped");
                        break;
                    }
                }
            });

            tracing::info!("Launched headless browser");

            Ok(Self {
                browser,
                user_agent: user_agent.to_string(),
                handler,
            })
        }

        async fn render_page(
            &self,
            page: &Page,
            url: &Url,
            ready: &ReadyCondition,
        ) -> Result<RenderedPage, FetchError> {
            let fail = |e: chromiumoxide::error::CdpError| FetchError::transient(url.as_str(), e.to_string());

            let mut responses = page
                .event_listener::<EventResponseReceived>()
                .await
                .map_err(fail)?;

            page.set_user_agent(self.user_agent.as_str()).await.map_err(fail)?;
            page.goto(url.as_str()).await.map_err(fail)?;
            page.wait_for_navigation().await.map_err(fail)?;

            let status = document_status(&mut responses).await;

            let html = match ready {
                ReadyCondition::Selector(selector) => {
                    while page.find_element(selector.as_str()).await.is_err() {
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                    page.content().await.map_err(fail)?
                }
                ReadyCondition::DomStable(quiet) => {
                    let mut previous = page.content().await.map_err(fail)?;
                    loop {
                        tokio::time::sleep(*quiet).await;
                        let current = page.content().await.map_err(fail)?;
                        if current == previous {
                            break current;
                        }
                        previous = current;
                    }
                }
            };

            let final_url = page
                .url()
                .await
                .ok()
                .flatten()
                .and_then(|u| Url::parse(&u).ok())
                .unwrap_or_else(|| url.clone());

            Ok(RenderedPage {
                final_url,
                status,
                html,
            })
        }
    }

    /// Status of the first document response; redirects are not reported as
    /// responses, so this is the final page's status
    async fn document_status(responses: &mut EventStream<EventResponseReceived>) -> Option<u16> {
        loop {
            let event = tokio::time::timeout(STATUS_WAIT, responses.next()).await.ok()??;
            if event.r#type == ResourceType::Document {
                return u16::try_from(event.response.status).ok();
            }
        }
    }

    #[async_trait]
    impl Renderer for ChromeRenderer {
        async fn render(
            &self,
            url: &Url,
            ready: &ReadyCondition,
            timeout: Duration,
        ) -> Result<RenderedPage, FetchError> {
            let page = self
                .browser
                .new_page("about:blank")
                .await
                .map_err(|e| FetchError::transient(url.as_str(), e.to_string()))?;

            // the tab is closed on every path, including a timeout
            let result = tokio::time::timeout(timeout, self.render_page(&page, url, ready))
                .await
                .unwrap_or_else(|_| Err(render_timed_out(url, timeout)));

            if let Err(e) = page.close().await {
                tracing::debug!(url = %url, error = %e, "Failed to close browser page");
            }
            result
        }
    }

    impl Drop for ChromeRenderer {
        fn drop(&mut self) {
            self.handler.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves canned markup without a browser
    pub(crate) struct StaticRenderer {
        pub html: String,
        pub status: Option<u16>,
        pub delay: Duration,
        pub calls: AtomicU32,
    }

    impl StaticRenderer {
        pub fn serving(html: &str) -> Self {
            Self {
                html: html.to_string(),
                status: Some(200),
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Renderer for StaticRenderer {
        async fn render(
            &self,
            url: &Url,
            _ready: &ReadyCondition,
            timeout: Duration,
        ) -> Result<RenderedPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(render_timed_out(url, timeout));
            }
            tokio::time::sleep(self.delay).await;
            Ok(RenderedPage {
                final_url: url.clone(),
                status: self.status,
                html: self.html.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_static_renderer_returns_markup() {
        let renderer = StaticRenderer::serving("<p>hi</p>");
        let url = Url::parse("http://example.test/").unwrap();
        let page = renderer
            .render(&url, &ReadyCondition::Selector("p".into()), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(page.html, "<p>hi</p>");
        assert_eq!(page.status, Some(200));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    }
}
