use std::time::Duration;

use crate::util::env::{env_opt, env_parse, env_parse_opt};

pub const DEFAULT_USER_AGENT: &str = "SolsticeGameCrawler/1.0";

/// Crawl knobs, read once from the environment.
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub user_agent: String,
    pub startplaying_base_url: String,
    pub startplaying_start_path: String,
    pub wikipedia_api_url: String,
    pub wikipedia_rest_url: String,
    /// BoardGameGeek XML API v2 root.
    pub bgg_api_url: String,
    /// One request per window for the listing/detail crawler.
    pub pace_window: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    /// Zero leaves the Wikipedia calls unpaced.
    pub wikipedia_pace_window: Duration,
    /// BGG throttles bursts with 429s.
    pub bgg_pace_window: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub http_timeout: Option<Duration>,
    pub asset_license: Option<String>,
    pub asset_license_url: Option<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            startplaying_base_url: "https://startplaying.games".to_string(),
            startplaying_start_path: "/play/game-systems".to_string(),
            wikipedia_api_url: "https://en.wikipedia.org/w/api.php".to_string(),
            wikipedia_rest_url: "https://en.wikipedia.org/api/rest_v1".to_string(),
            bgg_api_url: "https://boardgamegeek.com/xmlapi2".to_string(),
            pace_window: Duration::from_millis(2000),
            jitter_min: Duration::from_millis(100),
            jitter_max: Duration::from_millis(400),
            wikipedia_pace_window: Duration::ZERO,
            bgg_pace_window: Duration::from_millis(2000),
            max_attempts: 3,
            backoff_base: Duration::from_millis(1000),
            http_timeout: None,
            asset_license: None,
            asset_license_url: None,
        }
    }
}

impl CrawlerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let ms = |key: &str, fallback: Duration| {
            Duration::from_millis(env_parse(key, fallback.as_millis() as u64))
        };
        Self {
            user_agent: env_opt("CRAWLER_USER_AGENT").unwrap_or(d.user_agent),
            startplaying_base_url: env_opt("STARTPLAYING_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(d.startplaying_base_url),
            startplaying_start_path: env_opt("STARTPLAYING_START_PATH")
                .unwrap_or(d.startplaying_start_path),
            wikipedia_api_url: env_opt("WIKIPEDIA_API_URL").unwrap_or(d.wikipedia_api_url),
            wikipedia_rest_url: env_opt("WIKIPEDIA_REST_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(d.wikipedia_rest_url),
            bgg_api_url: env_opt("BGG_API_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(d.bgg_api_url),
            pace_window: ms("CRAWL_PACE_MS", d.pace_window),
            jitter_min: ms("CRAWL_JITTER_MIN_MS", d.jitter_min),
            jitter_max: ms("CRAWL_JITTER_MAX_MS", d.jitter_max),
            wikipedia_pace_window: ms("WIKIPEDIA_PACE_MS", d.wikipedia_pace_window),
            bgg_pace_window: ms("BGG_PACE_MS", d.bgg_pace_window),
            max_attempts: env_parse("CRAWL_MAX_ATTEMPTS", d.max_attempts).max(1),
            backoff_base: ms("CRAWL_BACKOFF_MS", d.backoff_base),
            http_timeout: env_parse_opt::<u64>("CRAWL_HTTP_TIMEOUT_SECS").map(Duration::from_secs),
            asset_license: env_opt("CRAWL_ASSET_LICENSE"),
            asset_license_url: env_opt("CRAWL_ASSET_LICENSE_URL"),
        }
    }

    pub fn start_url(&self) -> String {
        format!("{}{}", self.startplaying_base_url, self.startplaying_start_path)
    }

    pub fn robots_url(&self) -> String {
        format!("{}/robots.txt", self.startplaying_base_url)
    }

    pub fn graphql_url(&self) -> String {
        format!("{}/api/graphql", self.startplaying_base_url)
    }

    /// Settings for tests and dry runs: no pacing, no jitter, no backoff.
    pub fn unthrottled() -> Self {
        Self {
            pace_window: Duration::ZERO,
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
            bgg_pace_window: Duration::ZERO,
            backoff_base: Duration::ZERO,
            ..Self::default()
        }
    }
}
