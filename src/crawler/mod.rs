//! Enrichment pipeline: fetch, extract, reconcile, record one crawl event.

pub mod bgg;
pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod pipeline;
pub mod reconcile;
pub mod startplaying;
pub mod tags;
pub mod wikipedia;

#[cfg(test)]
pub mod testing;

use async_trait::async_trait;

use self::error::CrawlError;
use self::events::CrawlSource;
use self::reconcile::ReconcileReport;

/// How a target is named in logs and crawl events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRef {
    pub label: String,
    pub entry_id: Option<i64>,
    /// Lets a failed target be tied back to an existing catalog row.
    pub slug: Option<String>,
}

/// One external source. Each source brings its own target, raw document and
/// extracted record types; the pipeline only sequences the three steps.
#[async_trait]
pub trait Enricher: Send + Sync {
    type Target: Send + Sync;
    type Document: Send;
    type Record: Send;

    fn source(&self) -> CrawlSource;

    fn target_ref(&self, target: &Self::Target) -> TargetRef;

    async fn fetch(&self, target: &Self::Target) -> Result<Self::Document, CrawlError>;

    fn extract(&self, target: &Self::Target, document: Self::Document) -> Result<Self::Record, CrawlError>;

    async fn reconcile(&self, target: &Self::Target, record: Self::Record) -> Result<ReconcileReport, CrawlError>;
}
