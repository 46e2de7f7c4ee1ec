//! In-process `CatalogStore` for dry runs and tests. Same conflict semantics
//! as the Postgres store: unique slugs and publisher names, idempotent links.

use anyhow::{bail, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{
    CatalogEntry, CatalogStore, EntryUpdate, NewCatalogEntry, NewMediaAsset, NewPublisher,
    Publisher,
};
use crate::crawler::events::{CrawlOutcome, CrawlSource, CrawlStatus, NewCrawlEvent};
use crate::crawler::tags::TagMaps;

#[derive(Default)]
struct State {
    next_id: i64,
    entries: BTreeMap<i64, CatalogEntry>,
    publishers: BTreeMap<i64, Publisher>,
    category_maps: Vec<(CrawlSource, String, i64)>,
    mechanic_maps: Vec<(CrawlSource, String, i64)>,
    entry_categories: BTreeSet<(i64, i64)>,
    entry_mechanics: BTreeSet<(i64, i64)>,
    media: Vec<(i64, NewMediaAsset)>,
    events: Vec<NewCrawlEvent>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryCatalogStore {
    state: Mutex<State>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed an entry as-is (id is assigned here).
    pub fn seed_entry(&self, mut entry: CatalogEntry) -> i64 {
        let mut state = self.lock();
        let id = state.next_id();
        entry.id = id;
        state.entries.insert(id, entry);
        id
    }

    pub fn seed_publisher(&self, name: &str) -> i64 {
        let mut state = self.lock();
        let id = state.next_id();
        state.publishers.insert(
            id,
            Publisher {
                id,
                name: name.to_string(),
                website_url: None,
                wikipedia_url: None,
            },
        );
        id
    }

    pub fn seed_category_mapping(&self, source: CrawlSource, tag: &str, category_id: i64) {
        self.lock().category_maps.push((source, tag.to_string(), category_id));
    }

    pub fn seed_mechanic_mapping(&self, source: CrawlSource, tag: &str, mechanic_id: i64) {
        self.lock().mechanic_maps.push((source, tag.to_string(), mechanic_id));
    }

    pub fn entries(&self) -> Vec<CatalogEntry> {
        self.lock().entries.values().cloned().collect()
    }

    pub fn publishers(&self) -> Vec<Publisher> {
        self.lock().publishers.values().cloned().collect()
    }

    pub fn events(&self) -> Vec<NewCrawlEvent> {
        self.lock().events.clone()
    }

    pub fn media(&self, entry_id: i64) -> Vec<(i64, NewMediaAsset)> {
        self.lock()
            .media
            .iter()
            .filter(|(_, m)| m.catalog_entry_id == entry_id)
            .cloned()
            .collect()
    }

    pub fn category_links(&self, entry_id: i64) -> Vec<i64> {
        self.lock()
            .entry_categories
            .iter()
            .filter(|(e, _)| *e == entry_id)
            .map(|(_, c)| *c)
            .collect()
    }

    pub fn mechanic_links(&self, entry_id: i64) -> Vec<i64> {
        self.lock()
            .entry_mechanics
            .iter()
            .filter(|(e, _)| *e == entry_id)
            .map(|(_, m)| *m)
            .collect()
    }
}

#[async_trait::async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn entry_by_id(&self, id: i64) -> Result<Option<CatalogEntry>> {
        Ok(self.lock().entries.get(&id).cloned())
    }

    async fn entry_by_slug(&self, slug: &str) -> Result<Option<CatalogEntry>> {
        Ok(self.lock().entries.values().find(|e| e.slug == slug).cloned())
    }

    async fn entry_by_name(&self, name: &str) -> Result<Option<CatalogEntry>> {
        Ok(self.lock().entries.values().find(|e| e.name == name).cloned())
    }

    async fn entries_for_enrichment(
        &self,
        source: CrawlSource,
        only_missing: bool,
        limit: Option<i64>,
    ) -> Result<Vec<CatalogEntry>> {
        let state = self.lock();
        let take = limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        Ok(state
            .entries
            .values()
            .filter(|e| !only_missing || !e.external_refs.contains_key(source.as_str()))
            .take(take)
            .cloned()
            .collect())
    }

    async fn insert_entry(&self, entry: &NewCatalogEntry) -> Result<i64> {
        let mut state = self.lock();
        if state.entries.values().any(|e| e.slug == entry.slug) {
            bail!("duplicate key value violates unique constraint on slug {}", entry.slug);
        }
        let id = state.next_id();
        state.entries.insert(
            id,
            CatalogEntry {
                id,
                slug: entry.slug.clone(),
                name: entry.name.clone(),
                description_scraped: entry.description_scraped.clone(),
                min_players: entry.min_players,
                max_players: entry.max_players,
                release_date: entry.release_date,
                year_released: entry.year_released,
                publisher_id: entry.publisher_id,
                publisher_url: entry.publisher_url.clone(),
                external_refs: entry.external_refs.clone(),
                ..Default::default()
            },
        );
        Ok(id)
    }

    async fn update_entry(&self, id: i64, update: &EntryUpdate) -> Result<()> {
        let mut state = self.lock();
        match state.entries.get_mut(&id) {
            Some(entry) => {
                update.apply_to(entry);
                Ok(())
            }
            None => bail!("catalog entry {id} does not exist"),
        }
    }

    async fn set_hero_if_unset(&self, entry_id: i64, asset_id: i64) -> Result<bool> {
        let mut state = self.lock();
        match state.entries.get_mut(&entry_id) {
            Some(entry) if entry.hero_image_id.is_none() => {
                entry.hero_image_id = Some(asset_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_crawl_outcome(&self, entry_id: i64, outcome: &CrawlOutcome) -> Result<()> {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(&entry_id) {
            entry.crawl_status = Some(outcome.status.as_str().to_string());
            entry.last_crawled_at = Some(outcome.finished_at);
            if outcome.status == CrawlStatus::Success {
                entry.last_success_at = Some(outcome.finished_at);
            }
            entry.error_message = outcome.error_message.clone();
        }
        Ok(())
    }

    async fn publisher_by_name(&self, name: &str) -> Result<Option<Publisher>> {
        Ok(self.lock().publishers.values().find(|p| p.name == name).cloned())
    }

    async fn publisher_by_id(&self, id: i64) -> Result<Option<Publisher>> {
        Ok(self.lock().publishers.get(&id).cloned())
    }

    async fn insert_publisher_ignore_conflict(&self, publisher: &NewPublisher) -> Result<Option<Publisher>> {
        let mut state = self.lock();
        if state.publishers.values().any(|p| p.name == publisher.name) {
            return Ok(None);
        }
        let id = state.next_id();
        let row = Publisher {
            id,
            name: publisher.name.clone(),
            website_url: publisher.website_url.clone(),
            wikipedia_url: publisher.wikipedia_url.clone(),
        };
        state.publishers.insert(id, row.clone());
        Ok(Some(row))
    }

    async fn set_publisher_website(&self, id: i64, url: &str) -> Result<()> {
        if let Some(p) = self.lock().publishers.get_mut(&id) {
            p.website_url = Some(url.to_string());
        }
        Ok(())
    }

    async fn tag_maps(&self, source: CrawlSource) -> Result<TagMaps> {
        let state = self.lock();
        let pick = |rows: &[(CrawlSource, String, i64)]| {
            rows.iter()
                .filter(|(s, _, _)| *s == source)
                .map(|(_, tag, id)| (tag.clone(), *id))
                .collect::<Vec<_>>()
        };
        Ok(TagMaps::from_rows(
            pick(&state.category_maps),
            pick(&state.mechanic_maps),
        ))
    }

    async fn link_categories(&self, entry_id: i64, category_ids: &[i64]) -> Result<usize> {
        let mut state = self.lock();
        Ok(category_ids
            .iter()
            .filter(|id| state.entry_categories.insert((entry_id, **id)))
            .count())
    }

    async fn link_mechanics(&self, entry_id: i64, mechanic_ids: &[i64]) -> Result<usize> {
        let mut state = self.lock();
        Ok(mechanic_ids
            .iter()
            .filter(|id| state.entry_mechanics.insert((entry_id, **id)))
            .count())
    }

    async fn media_checksums(&self, entry_id: i64) -> Result<HashSet<String>> {
        Ok(self
            .lock()
            .media
            .iter()
            .filter(|(_, m)| m.catalog_entry_id == entry_id)
            .map(|(_, m)| m.checksum.clone())
            .collect())
    }

    async fn insert_media_asset(&self, asset: &NewMediaAsset) -> Result<i64> {
        let mut state = self.lock();
        let id = state.next_id();
        state.media.push((id, asset.clone()));
        Ok(id)
    }

    async fn insert_crawl_event(&self, event: &NewCrawlEvent) -> Result<i64> {
        let mut state = self.lock();
        state.events.push(event.clone());
        Ok(state.events.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publisher_insert_ignores_duplicates() {
        let store = MemoryCatalogStore::new();
        let first = store
            .insert_publisher_ignore_conflict(&NewPublisher {
                name: "Evil Hat".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(first.is_some());
        let second = store
            .insert_publisher_ignore_conflict(&NewPublisher {
                name: "Evil Hat".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(store.publishers().len(), 1);
    }

    #[tokio::test]
    async fn links_are_idempotent() {
        let store = MemoryCatalogStore::new();
        assert_eq!(store.link_categories(1, &[4, 5]).await.unwrap(), 2);
        assert_eq!(store.link_categories(1, &[5, 6]).await.unwrap(), 1);
        assert_eq!(store.category_links(1), vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn hero_is_claimed_once() {
        let store = MemoryCatalogStore::new();
        let id = store.seed_entry(CatalogEntry {
            slug: "mothership".into(),
            name: "Mothership".into(),
            ..Default::default()
        });
        assert!(store.set_hero_if_unset(id, 70).await.unwrap());
        assert!(!store.set_hero_if_unset(id, 71).await.unwrap());
        assert_eq!(store.entries()[0].hero_image_id, Some(70));
    }

    #[tokio::test]
    async fn only_missing_filters_bound_entries() {
        let store = MemoryCatalogStore::new();
        store.seed_entry(CatalogEntry {
            slug: "a".into(),
            name: "A".into(),
            external_refs: [("wikipedia".to_string(), serde_json::Value::from("A (game)"))].into(),
            ..Default::default()
        });
        store.seed_entry(CatalogEntry {
            slug: "b".into(),
            name: "B".into(),
            ..Default::default()
        });
        let missing = store
            .entries_for_enrichment(CrawlSource::Wikipedia, true, None)
            .await
            .unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].slug, "b");
        let all = store
            .entries_for_enrichment(CrawlSource::Wikipedia, false, Some(1))
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }
}
