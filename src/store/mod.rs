//! Catalog persistence: entry/publisher/media/tag/event rows behind one trait.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::crawler::events::{CrawlOutcome, CrawlSource, NewCrawlEvent};
use crate::crawler::tags::TagMaps;

pub mod memory;
pub mod postgres;

pub use memory::MemoryCatalogStore;
pub use postgres::PgCatalogStore;

/// Source name to source-specific identifier, e.g. `{"startplaying": "<slug>"}`.
/// Values are kept as stored; bindings written by other tools may be numbers
/// or objects and must survive a write-back.
pub type ExternalRefs = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogEntry {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub description_scraped: Option<String>,
    pub min_players: Option<i32>,
    pub max_players: Option<i32>,
    pub release_date: Option<NaiveDate>,
    pub year_released: Option<i32>,
    pub publisher_id: Option<i64>,
    pub publisher_url: Option<String>,
    pub hero_image_id: Option<i64>,
    pub external_refs: ExternalRefs,
    pub crawl_status: Option<String>,
    pub last_crawled_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl CatalogEntry {
    /// This source's binding as text. Numeric ids count; other shapes do not.
    pub fn external_ref(&self, source: CrawlSource) -> Option<String> {
        match self.external_refs.get(source.as_str())? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewCatalogEntry {
    pub slug: String,
    pub name: String,
    pub description_scraped: Option<String>,
    pub min_players: Option<i32>,
    pub max_players: Option<i32>,
    pub release_date: Option<NaiveDate>,
    pub year_released: Option<i32>,
    pub publisher_id: Option<i64>,
    pub publisher_url: Option<String>,
    pub external_refs: ExternalRefs,
}

/// Partial update; `None` leaves the column untouched. `external_refs` is
/// merged key by key over the stored object, never swapped in whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryUpdate {
    pub description_scraped: Option<String>,
    pub min_players: Option<i32>,
    pub max_players: Option<i32>,
    pub release_date: Option<NaiveDate>,
    pub year_released: Option<i32>,
    pub publisher_id: Option<i64>,
    pub publisher_url: Option<String>,
    pub external_refs: Option<ExternalRefs>,
}

impl EntryUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub(crate) fn apply_to(&self, entry: &mut CatalogEntry) {
        if let Some(v) = &self.description_scraped {
            entry.description_scraped = Some(v.clone());
        }
        if let Some(v) = self.min_players {
            entry.min_players = Some(v);
        }
        if let Some(v) = self.max_players {
            entry.max_players = Some(v);
        }
        if let Some(v) = self.release_date {
            entry.release_date = Some(v);
        }
        if let Some(v) = self.year_released {
            entry.year_released = Some(v);
        }
        if let Some(v) = self.publisher_id {
            entry.publisher_id = Some(v);
        }
        if let Some(v) = &self.publisher_url {
            entry.publisher_url = Some(v.clone());
        }
        if let Some(v) = &self.external_refs {
            entry
                .external_refs
                .extend(v.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publisher {
    pub id: i64,
    pub name: String,
    pub website_url: Option<String>,
    pub wikipedia_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewPublisher {
    pub name: String,
    pub website_url: Option<String>,
    pub wikipedia_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Hero,
    Gallery,
}

impl MediaKind {
    /// First image in extraction order is the hero candidate.
    pub fn for_index(index: usize) -> Self {
        if index == 0 {
            Self::Hero
        } else {
            Self::Gallery
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hero => "hero",
            Self::Gallery => "gallery",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMediaAsset {
    pub catalog_entry_id: i64,
    pub public_id: String,
    pub secure_url: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub format: Option<String>,
    pub license: Option<String>,
    pub license_url: Option<String>,
    pub kind: MediaKind,
    pub order_index: i32,
    pub moderated: bool,
    pub checksum: String,
}

#[async_trait::async_trait]
pub trait CatalogStore: Send + Sync {
    async fn entry_by_id(&self, id: i64) -> Result<Option<CatalogEntry>>;
    async fn entry_by_slug(&self, slug: &str) -> Result<Option<CatalogEntry>>;
    async fn entry_by_name(&self, name: &str) -> Result<Option<CatalogEntry>>;
    /// Entries to enrich from `source`, by id. `only_missing` skips entries
    /// already bound to the source in `external_refs`.
    async fn entries_for_enrichment(
        &self,
        source: CrawlSource,
        only_missing: bool,
        limit: Option<i64>,
    ) -> Result<Vec<CatalogEntry>>;
    async fn insert_entry(&self, entry: &NewCatalogEntry) -> Result<i64>;
    async fn update_entry(&self, id: i64, update: &EntryUpdate) -> Result<()>;
    /// Claims the hero slot only when it is empty; returns whether it did.
    async fn set_hero_if_unset(&self, entry_id: i64, asset_id: i64) -> Result<bool>;
    async fn record_crawl_outcome(&self, entry_id: i64, outcome: &CrawlOutcome) -> Result<()>;

    async fn publisher_by_name(&self, name: &str) -> Result<Option<Publisher>>;
    async fn publisher_by_id(&self, id: i64) -> Result<Option<Publisher>>;
    /// `None` when a row with the same name already exists.
    async fn insert_publisher_ignore_conflict(&self, publisher: &NewPublisher) -> Result<Option<Publisher>>;
    async fn set_publisher_website(&self, id: i64, url: &str) -> Result<()>;

    async fn tag_maps(&self, source: CrawlSource) -> Result<TagMaps>;
    /// Idempotent; returns the number of newly created links.
    async fn link_categories(&self, entry_id: i64, category_ids: &[i64]) -> Result<usize>;
    async fn link_mechanics(&self, entry_id: i64, mechanic_ids: &[i64]) -> Result<usize>;

    async fn media_checksums(&self, entry_id: i64) -> Result<HashSet<String>>;
    async fn insert_media_asset(&self, asset: &NewMediaAsset) -> Result<i64>;

    async fn insert_crawl_event(&self, event: &NewCrawlEvent) -> Result<i64>;
}

pub type SharedStore = Arc<dyn CatalogStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_update_is_detected() {
        assert!(EntryUpdate::default().is_empty());
        let update = EntryUpdate {
            min_players: Some(2),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }

    #[test]
    fn update_only_touches_provided_fields() {
        let mut entry = CatalogEntry {
            id: 1,
            slug: "blades".into(),
            name: "Blades in the Dark".into(),
            description_scraped: Some("heists".into()),
            ..Default::default()
        };
        EntryUpdate {
            max_players: Some(5),
            ..Default::default()
        }
        .apply_to(&mut entry);
        assert_eq!(entry.description_scraped.as_deref(), Some("heists"));
        assert_eq!(entry.max_players, Some(5));
        assert_eq!(entry.min_players, None);
    }

    #[test]
    fn external_refs_update_merges_over_stored_keys() {
        let mut entry = CatalogEntry {
            external_refs: [
                ("bgg".to_string(), serde_json::json!(12345)),
                ("legacy".to_string(), serde_json::json!({"id": 7})),
            ]
            .into(),
            ..Default::default()
        };
        EntryUpdate {
            external_refs: Some([("wikipedia".to_string(), Value::from("D&D"))].into()),
            ..Default::default()
        }
        .apply_to(&mut entry);
        assert_eq!(entry.external_refs.len(), 3);
        assert_eq!(entry.external_refs["legacy"], serde_json::json!({"id": 7}));
        assert_eq!(entry.external_ref(CrawlSource::Bgg).as_deref(), Some("12345"));
        assert_eq!(entry.external_ref(CrawlSource::Wikipedia).as_deref(), Some("D&D"));
        assert_eq!(entry.external_ref(CrawlSource::StartPlaying), None);
    }

    #[test]
    fn first_image_is_hero() {
        assert_eq!(MediaKind::for_index(0), MediaKind::Hero);
        assert_eq!(MediaKind::for_index(3).as_str(), "gallery");
    }
}
