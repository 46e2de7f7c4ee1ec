//! Outbound HTTP for the crawler: user agent, pacing, robots.txt precheck.
//!
//! Everything goes through the [`Fetch`] trait so the pipeline can be driven
//! by a scripted source in tests.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::Rng;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use super::config::CrawlerConfig;
use super::error::CrawlError;

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl FetchedPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into a (retryable) `HttpStatus` error.
    pub fn into_success(self) -> Result<Self, CrawlError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(CrawlError::HttpStatus {
                url: self.url,
                status: self.status,
            })
        }
    }
}

#[async_trait]
pub trait Fetch: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchedPage, CrawlError>;

    /// JSON POST, for GraphQL endpoints.
    async fn post_json(&self, url: &str, body: &Value) -> Result<FetchedPage, CrawlError>;
}

/// Fixed-window pacing plus a random jitter sleep before every request.
pub struct Pace {
    limiter: Option<DefaultDirectRateLimiter>,
    jitter_min: Duration,
    jitter_max: Duration,
}

impl Pace {
    pub fn new(window: Duration, jitter_min: Duration, jitter_max: Duration) -> Self {
        let limiter = Quota::with_period(window).map(RateLimiter::direct);
        Self {
            limiter,
            jitter_min,
            jitter_max: jitter_max.max(jitter_min),
        }
    }

    pub fn unpaced() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    pub async fn wait(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        let jitter = self.sample_jitter();
        if !jitter.is_zero() {
            debug!(jitter_ms = jitter.as_millis() as u64, "jitter delay");
            tokio::time::sleep(jitter).await;
        }
    }

    fn sample_jitter(&self) -> Duration {
        let lo = self.jitter_min.as_millis() as u64;
        let hi = self.jitter_max.as_millis() as u64;
        if hi <= lo {
            return self.jitter_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// reqwest-backed fetcher. The configured user agent is set on the client so
/// it rides on every request.
pub struct HttpFetcher {
    http: reqwest::Client,
    pace: Pace,
}

impl HttpFetcher {
    pub fn new(config: &CrawlerConfig, pace: Pace) -> Result<Self, CrawlError> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent.as_str());
        if let Some(timeout) = config.http_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| CrawlError::network("client-builder", e))?;
        Ok(Self { http, pace })
    }

    /// Fetcher for the listing/detail crawler: paced and jittered.
    pub fn for_listing(config: &CrawlerConfig) -> Result<Self, CrawlError> {
        Self::new(
            config,
            Pace::new(config.pace_window, config.jitter_min, config.jitter_max),
        )
    }

    /// Fetcher for API sources: optional pacing, no jitter.
    pub fn for_api(config: &CrawlerConfig) -> Result<Self, CrawlError> {
        Self::new(
            config,
            Pace::new(config.wikipedia_pace_window, Duration::ZERO, Duration::ZERO),
        )
    }

    pub fn for_bgg(config: &CrawlerConfig) -> Result<Self, CrawlError> {
        Self::new(config, Pace::new(config.bgg_pace_window, Duration::ZERO, Duration::ZERO))
    }

    async fn read(url: &str, resp: reqwest::Response) -> Result<FetchedPage, CrawlError> {
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| CrawlError::network(url, e))?;
        Ok(FetchedPage {
            url: url.to_string(),
            status,
            body,
        })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn get(&self, url: &str) -> Result<FetchedPage, CrawlError> {
        self.pace.wait().await;
        debug!(url, "GET");
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CrawlError::network(url, e))?;
        Self::read(url, resp).await
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<FetchedPage, CrawlError> {
        self.pace.wait().await;
        debug!(url, "POST");
        let resp = self
            .http
            .post(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| CrawlError::network(url, e))?;
        Self::read(url, resp).await
    }
}

/// Marker whose presence in robots.txt blocks the whole crawl batch.
pub const DISALLOW_MARKER: &str = "Disallow: /play";

/// Fetch robots.txt once per batch. A disallow for the crawl path aborts the
/// batch; a fetch failure is also batch-fatal since policy is unknown.
pub async fn ensure_crawl_allowed(fetcher: &dyn Fetch, robots_url: &str) -> Result<(), CrawlError> {
    let page = fetcher.get(robots_url).await?;
    if page.body.contains(DISALLOW_MARKER) {
        return Err(CrawlError::RobotsDisallowed(robots_url.to_string()));
    }
    info!(robots_url, "robots.txt permits crawl");
    Ok(())
}
