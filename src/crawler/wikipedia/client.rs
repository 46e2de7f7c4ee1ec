use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::crawler::config::CrawlerConfig;
use crate::crawler::error::CrawlError;
use crate::crawler::fetch::Fetch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiSummary {
    pub title: String,
    pub extract: Option<String>,
    pub content_url: Option<String>,
}

#[derive(Deserialize)]
struct SummaryBody {
    title: String,
    #[serde(default)]
    extract: Option<String>,
    #[serde(default)]
    content_urls: Option<ContentUrls>,
}

#[derive(Deserialize)]
struct ContentUrls {
    #[serde(default)]
    desktop: Option<PageUrl>,
}

#[derive(Deserialize)]
struct PageUrl {
    #[serde(default)]
    page: Option<String>,
}

#[derive(Deserialize)]
struct ParseBody {
    #[serde(default)]
    parse: Option<ParsedPage>,
}

#[derive(Deserialize)]
struct ParsedPage {
    #[serde(default)]
    wikitext: Option<String>,
}

/// Action API and REST calls. A non-2xx answer means "not found" and yields
/// `None`; transport and decode failures are errors.
pub struct WikipediaClient {
    fetcher: Arc<dyn Fetch>,
    api_url: String,
    rest_url: String,
}

impl WikipediaClient {
    pub fn new(fetcher: Arc<dyn Fetch>, config: &CrawlerConfig) -> Self {
        Self {
            fetcher,
            api_url: config.wikipedia_api_url.clone(),
            rest_url: config.wikipedia_rest_url.trim_end_matches('/').to_string(),
        }
    }

    fn api(&self, params: &[(&str, &str)]) -> Result<String, CrawlError> {
        Url::parse_with_params(&self.api_url, params)
            .map(String::from)
            .map_err(|e| CrawlError::parse("wikipedia api url", e))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str, what: &'static str) -> Result<Option<T>, CrawlError> {
        let page = self.fetcher.get(url).await?;
        if !page.is_success() {
            debug!(url, status = page.status, "wikipedia returned non-success; treating as not found");
            return Ok(None);
        }
        serde_json::from_str(&page.body)
            .map(Some)
            .map_err(|e| CrawlError::parse(what, e))
    }

    /// Best opensearch hit for a free-text name.
    pub async fn resolve_page_title(&self, name: &str) -> Result<Option<String>, CrawlError> {
        let url = self.api(&[
            ("action", "opensearch"),
            ("search", name),
            ("namespace", "0"),
            ("redirects", "resolve"),
            ("limit", "1"),
            ("format", "json"),
        ])?;
        let body: Option<Value> = self.get_json(&url, "opensearch response").await?;
        Ok(body.and_then(|v| v.get(1)?.get(0)?.as_str().map(str::to_string)))
    }

    pub async fn fetch_summary(&self, title: &str) -> Result<Option<WikiSummary>, CrawlError> {
        let url = format!("{}/page/summary/{}", self.rest_url, urlencoding::encode(title));
        let body: Option<SummaryBody> = self.get_json(&url, "page summary").await?;
        Ok(body.map(|b| WikiSummary {
            title: b.title,
            extract: b.extract.filter(|e| !e.trim().is_empty()),
            content_url: b.content_urls.and_then(|c| c.desktop).and_then(|d| d.page),
        }))
    }

    pub async fn fetch_wikitext(&self, title: &str) -> Result<Option<String>, CrawlError> {
        let url = self.api(&[
            ("action", "parse"),
            ("page", title),
            ("prop", "wikitext"),
            ("format", "json"),
            ("formatversion", "2"),
        ])?;
        let body: Option<ParseBody> = self.get_json(&url, "parse response").await?;
        Ok(body.and_then(|b| b.parse).and_then(|p| p.wikitext))
    }
}
