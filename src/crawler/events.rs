use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// External source a catalog entry can be enriched from. Doubles as the key
/// in `external_refs` and as the `source` column of tag maps and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlSource {
    StartPlaying,
    Wikipedia,
    Bgg,
}

impl CrawlSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartPlaying => "startplaying",
            Self::Wikipedia => "wikipedia",
            Self::Bgg => "bgg",
        }
    }
}

impl fmt::Display for CrawlSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Success,
    Partial,
    Error,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }

    pub fn severity(&self) -> CrawlSeverity {
        match self {
            Self::Success => CrawlSeverity::Info,
            Self::Partial => CrawlSeverity::Warning,
            Self::Error => CrawlSeverity::Error,
        }
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlSeverity {
    Info,
    Warning,
    Error,
}

impl CrawlSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// One audit row per enrichment attempt. Written once, never updated.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCrawlEvent {
    pub catalog_entry_id: Option<i64>,
    pub target: String,
    pub source: CrawlSource,
    pub status: CrawlStatus,
    pub severity: CrawlSeverity,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub http_status: Option<i32>,
    pub error_message: Option<String>,
    pub details: Option<Value>,
}

impl NewCrawlEvent {
    pub fn new(
        source: CrawlSource,
        target: impl Into<String>,
        status: CrawlStatus,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            catalog_entry_id: None,
            target: target.into(),
            source,
            status,
            severity: status.severity(),
            started_at,
            finished_at: Utc::now(),
            http_status: None,
            error_message: None,
            details: None,
        }
    }

    pub fn for_entry(mut self, entry_id: Option<i64>) -> Self {
        self.catalog_entry_id = entry_id;
        self
    }

    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.error_message = message;
        self
    }

    pub fn with_http_status(mut self, status: Option<u16>) -> Self {
        self.http_status = status.map(i32::from);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Bookkeeping written back onto the catalog entry after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlOutcome {
    pub status: CrawlStatus,
    pub finished_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_follows_status() {
        let started = Utc::now();
        let ev = NewCrawlEvent::new(CrawlSource::Wikipedia, "catan", CrawlStatus::Partial, started);
        assert_eq!(ev.severity, CrawlSeverity::Warning);
        assert!(ev.finished_at >= ev.started_at);
        assert_eq!(CrawlStatus::Error.severity().as_str(), "error");
    }

    #[test]
    fn source_keys_match_external_ref_names() {
        assert_eq!(CrawlSource::StartPlaying.to_string(), "startplaying");
        assert_eq!(serde_json::to_value(CrawlSource::Bgg).unwrap(), serde_json::json!("bgg"));
        assert_eq!(
            serde_json::to_value(CrawlSource::Wikipedia).unwrap(),
            serde_json::json!("wikipedia")
        );
    }
}
