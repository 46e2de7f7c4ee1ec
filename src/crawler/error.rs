use thiserror::Error;

/// Failure taxonomy for a crawl run.
///
/// Scoped to the target being processed, where it ends up as an `error`
/// crawl event. The batch itself only aborts on a robots.txt disallow or an
/// index page that cannot be fetched.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("crawling disallowed by robots.txt ({0})")]
    RobotsDisallowed(String),

    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("failed to parse {what}: {message}")]
    Parse { what: &'static str, message: String },

    #[error("catalog entry {0} not found")]
    EntryNotFound(i64),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl CrawlError {
    pub fn network(url: &str, err: impl std::fmt::Display) -> Self {
        Self::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    pub fn parse(what: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Parse {
            what,
            message: err.to_string(),
        }
    }

    /// Whether another attempt at the same target could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::RobotsDisallowed(_) | Self::EntryNotFound(_))
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robots_and_missing_entries_are_not_retried() {
        assert!(!CrawlError::RobotsDisallowed("https://x/robots.txt".into()).is_retryable());
        assert!(!CrawlError::EntryNotFound(4).is_retryable());
        assert!(CrawlError::network("https://x", "connection reset").is_retryable());
        assert!(CrawlError::parse("summary", "eof").is_retryable());
    }

    #[test]
    fn http_status_is_exposed_for_audit() {
        let err = CrawlError::HttpStatus {
            url: "https://x/play/a".into(),
            status: 503,
        };
        assert_eq!(err.http_status(), Some(503));
        assert_eq!(CrawlError::EntryNotFound(1).http_status(), None);
    }
}
