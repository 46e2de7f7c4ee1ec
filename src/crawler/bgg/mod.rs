//! BoardGameGeek enrichment of existing catalog entries: year, player counts,
//! description, publisher, typed tags and images from the XML API.

pub mod xml;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use self::xml::{parse_search, parse_thing, BggThing};
use super::config::CrawlerConfig;
use super::error::CrawlError;
use super::events::CrawlSource;
use super::fetch::Fetch;
use super::pipeline::{Pipeline, RetryPolicy, RunSummary};
use super::reconcile::{
    attach_media, link_tags, merge_external_refs, resolve_publisher, EnrichableField, MergeLog,
    ReconcileReport,
};
use super::tags::{partition_typed_tags, TagMaps};
use super::{Enricher, TargetRef};
use crate::media::AssetService;
use crate::store::{CatalogEntry, EntryUpdate, NewPublisher, SharedStore};

pub const NO_MATCH_MESSAGE: &str = "No BGG match found";

/// HTTP side of the XML API.
#[derive(Clone)]
pub struct BggClient {
    fetcher: Arc<dyn Fetch>,
    api_url: String,
}

impl BggClient {
    pub fn new(fetcher: Arc<dyn Fetch>, config: &CrawlerConfig) -> Self {
        Self {
            fetcher,
            api_url: config.bgg_api_url.clone(),
        }
    }

    async fn get_xml(&self, url: &str) -> Result<String, CrawlError> {
        let page = self.fetcher.get(url).await?;
        // 202 means the response is still being prepared upstream
        if page.status == 202 {
            return Err(CrawlError::HttpStatus {
                url: page.url,
                status: page.status,
            });
        }
        Ok(page.into_success()?.body)
    }

    pub async fn search_id(&self, name: &str) -> Result<Option<u64>, CrawlError> {
        let url = format!(
            "{}/search?type=boardgame&query={}",
            self.api_url,
            urlencoding::encode(name)
        );
        parse_search(&self.get_xml(&url).await?, name)
    }

    pub async fn fetch_thing(&self, id: u64) -> Result<String, CrawlError> {
        self.get_xml(&format!("{}/thing?id={id}&stats=1", self.api_url)).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BggDocument {
    Unmatched,
    Thing { id: u64, xml: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BggRecord {
    Unmatched,
    Matched { id: u64, thing: BggThing },
}

pub struct BggEnricher {
    store: SharedStore,
    client: BggClient,
    assets: Arc<dyn AssetService>,
    tag_maps: TagMaps,
}

impl BggEnricher {
    pub fn new(store: SharedStore, client: BggClient, assets: Arc<dyn AssetService>, tag_maps: TagMaps) -> Self {
        Self {
            store,
            client,
            assets,
            tag_maps,
        }
    }

    #[instrument(skip_all, fields(entry_id = entry_id))]
    pub async fn apply(&self, entry_id: i64, record: BggRecord) -> Result<ReconcileReport, CrawlError> {
        let entry = self
            .store
            .entry_by_id(entry_id)
            .await?
            .ok_or(CrawlError::EntryNotFound(entry_id))?;

        let (bgg_id, thing) = match record {
            BggRecord::Unmatched => return Ok(ReconcileReport::unmatched(entry.id, NO_MATCH_MESSAGE)),
            BggRecord::Matched { id, thing } => (id, thing),
        };

        // BGG only knows the year; a stored date in that year already agrees
        let release = thing
            .year_published
            .filter(|year| entry.release_date.map(|d| d.year()) != Some(*year))
            .and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1));

        let mut log = MergeLog::default();
        let mut update = EntryUpdate {
            external_refs: merge_external_refs(&entry.external_refs, CrawlSource::Bgg, &bgg_id.to_string()),
            description_scraped: log.guarded(
                EnrichableField::Description,
                entry.description_scraped.as_ref(),
                thing.description.as_ref(),
            ),
            min_players: log.guarded(
                EnrichableField::MinPlayers,
                entry.min_players.as_ref(),
                thing.min_players.as_ref(),
            ),
            max_players: log.guarded(
                EnrichableField::MaxPlayers,
                entry.max_players.as_ref(),
                thing.max_players.as_ref(),
            ),
            release_date: log.guarded(EnrichableField::ReleaseDate, entry.release_date.as_ref(), release.as_ref()),
            year_released: log.fill_only(
                "yearReleased",
                entry.year_released.as_ref(),
                thing.year_published.as_ref(),
            ),
            ..Default::default()
        };
        if update.external_refs.is_some() {
            log.updated("externalRefs");
        }

        // BGG lists every edition's publisher, so a stored one is never contradicted
        if entry.publisher_id.is_none() {
            if let Some(name) = thing.named_publishers().next() {
                let candidate = NewPublisher {
                    name: name.to_string(),
                    ..Default::default()
                };
                if let Some(publisher) = resolve_publisher(self.store.as_ref(), candidate).await? {
                    update.publisher_id = log.fill_only("publisherId", None, Some(&publisher.id));
                }
            }
        }

        self.store.update_entry(entry.id, &update).await?;
        let mut report = ReconcileReport::for_entry(entry.id);
        report.absorb(log);

        let tags = partition_typed_tags(&thing.categories, &thing.mechanics, &self.tag_maps);
        let (categories, mechanics) = link_tags(self.store.as_ref(), entry.id, &tags).await?;
        report.linked_categories = categories;
        report.linked_mechanics = mechanics;
        report.unmapped = tags.unmapped;
        report.uploaded_assets =
            attach_media(self.store.as_ref(), self.assets.as_ref(), entry.id, &thing.image_urls()).await?;
        Ok(report)
    }
}

#[async_trait]
impl Enricher for BggEnricher {
    type Target = CatalogEntry;
    type Document = BggDocument;
    type Record = BggRecord;

    fn source(&self) -> CrawlSource {
        CrawlSource::Bgg
    }

    fn target_ref(&self, entry: &CatalogEntry) -> TargetRef {
        TargetRef {
            label: entry.slug.clone(),
            entry_id: Some(entry.id),
            slug: Some(entry.slug.clone()),
        }
    }

    /// A bound item id is reused; otherwise the name goes through search.
    async fn fetch(&self, entry: &CatalogEntry) -> Result<BggDocument, CrawlError> {
        let bound = entry
            .external_ref(CrawlSource::Bgg)
            .and_then(|id| id.trim().parse::<u64>().ok());
        let id = match bound {
            Some(id) => Some(id),
            None => self.client.search_id(&entry.name).await?,
        };
        let Some(id) = id else {
            return Ok(BggDocument::Unmatched);
        };
        let xml = self.client.fetch_thing(id).await?;
        Ok(BggDocument::Thing { id, xml })
    }

    fn extract(&self, entry: &CatalogEntry, document: BggDocument) -> Result<BggRecord, CrawlError> {
        let (id, xml) = match document {
            BggDocument::Unmatched => return Ok(BggRecord::Unmatched),
            BggDocument::Thing { id, xml } => (id, xml),
        };
        let Some(thing) = parse_thing(&xml)? else {
            warn!(slug = %entry.slug, bgg_id = id, "bgg item has no data");
            return Ok(BggRecord::Unmatched);
        };
        info!(
            slug = %entry.slug,
            bgg_id = id,
            name = thing.name.as_deref().unwrap_or("-"),
            year = ?thing.year_published,
            categories = thing.categories.len(),
            mechanics = thing.mechanics.len(),
            publishers = thing.publishers.len(),
            "parsed bgg item"
        );
        Ok(BggRecord::Matched { id, thing })
    }

    async fn reconcile(&self, entry: &CatalogEntry, record: BggRecord) -> Result<ReconcileReport, CrawlError> {
        self.apply(entry.id, record).await
    }
}

pub struct BggCrawler {
    store: SharedStore,
    client: BggClient,
    assets: Arc<dyn AssetService>,
    pipeline: Pipeline,
}

impl BggCrawler {
    pub fn new(
        config: &CrawlerConfig,
        store: SharedStore,
        fetcher: Arc<dyn Fetch>,
        assets: Arc<dyn AssetService>,
    ) -> Self {
        Self {
            client: BggClient::new(fetcher, config),
            assets,
            pipeline: Pipeline::new(store.clone(), RetryPolicy::from_config(config)),
            store,
        }
    }

    /// Tag maps are read per run so edits to the `bgg` mappings apply next time.
    async fn enricher(&self) -> Result<BggEnricher, CrawlError> {
        let tag_maps = self.store.tag_maps(CrawlSource::Bgg).await?;
        Ok(BggEnricher::new(
            self.store.clone(),
            self.client.clone(),
            self.assets.clone(),
            tag_maps,
        ))
    }

    /// Single entry; the failure is recorded as an event and also returned.
    pub async fn enrich_entry(&self, entry_id: i64) -> Result<ReconcileReport, CrawlError> {
        let entry = self
            .store
            .entry_by_id(entry_id)
            .await?
            .ok_or(CrawlError::EntryNotFound(entry_id))?;
        let enricher = self.enricher().await?;
        self.pipeline.run_target(&enricher, &entry).await
    }

    #[instrument(skip(self))]
    pub async fn enrich_batch(&self, only_missing: bool, limit: Option<i64>) -> Result<RunSummary, CrawlError> {
        let enricher = self.enricher().await?;
        let entries = self
            .store
            .entries_for_enrichment(CrawlSource::Bgg, only_missing, limit)
            .await?;
        let mut summary = RunSummary {
            discovered: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            let result = self.pipeline.run_target(&enricher, entry).await;
            summary.tally(&result);
        }
        if !summary.unmapped.is_empty() {
            warn!(
                distinct = summary.unmapped.iter().count(),
                total = summary.unmapped.total(),
                top = ?summary.unmapped.top(20),
                "unmapped bgg tags"
            );
        }
        info!(
            candidates = summary.discovered,
            succeeded = summary.succeeded,
            partial = summary.partial,
            failed = summary.failed,
            "bgg enrichment finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::events::CrawlStatus;
    use crate::crawler::testing::ScriptedFetcher;
    use crate::media::DirectLinkAssets;
    use crate::store::MemoryCatalogStore;
    use serde_json::json;

    const SEARCH: &str = r#"<items total="2" termsofuse="x">
  <item type="boardgame" id="27710"><name type="primary" value="Catan Dice Game"/></item>
  <item type="boardgame" id="13"><name type="primary" value="Catan"/></item>
</items>"#;

    const THING: &str = r#"<items termsofuse="x">
  <item type="boardgame" id="13">
    <thumbnail>https://cf.geekdo-images.com/catan__thumb.jpg</thumbnail>
    <image>https://cf.geekdo-images.com/catan__original.jpg</image>
    <name type="primary" sortindex="1" value="Catan"/>
    <description>Trade, build and settle.</description>
    <yearpublished value="1995"/>
    <minplayers value="3"/>
    <maxplayers value="4"/>
    <link type="boardgamecategory" id="1026" value="Negotiation"/>
    <link type="boardgamecategory" id="1021" value="Economic"/>
    <link type="boardgamemechanic" id="2072" value="Dice Rolling"/>
    <link type="boardgamepublisher" id="8" value="(Unknown)"/>
    <link type="boardgamepublisher" id="37" value="KOSMOS"/>
  </item>
</items>"#;

    fn catan_routes() -> ScriptedFetcher {
        ScriptedFetcher::new()
            .page("/search?type=boardgame&query=Catan", 200, SEARCH)
            .page("/thing?id=13&stats=1", 200, THING)
    }

    fn crawler(store: &Arc<MemoryCatalogStore>, fetcher: ScriptedFetcher) -> (Arc<ScriptedFetcher>, BggCrawler) {
        let fetcher = Arc::new(fetcher);
        let crawler = BggCrawler::new(
            &CrawlerConfig::unthrottled(),
            store.clone(),
            fetcher.clone(),
            Arc::new(DirectLinkAssets::default()),
        );
        (fetcher, crawler)
    }

    fn seed_catan(store: &MemoryCatalogStore, entry: CatalogEntry) -> i64 {
        store.seed_entry(CatalogEntry {
            slug: "catan".into(),
            name: "Catan".into(),
            ..entry
        })
    }

    #[tokio::test]
    async fn fills_empty_fields_tags_and_images() {
        let store = Arc::new(MemoryCatalogStore::new());
        store.seed_category_mapping(CrawlSource::Bgg, "Negotiation", 5);
        store.seed_mechanic_mapping(CrawlSource::Bgg, "dice rolling", 30);
        // a startplaying mapping must not leak into bgg tags
        store.seed_category_mapping(CrawlSource::StartPlaying, "Economic", 6);
        let id = seed_catan(&store, CatalogEntry::default());
        let (_, crawler) = crawler(&store, catan_routes());

        let report = crawler.enrich_entry(id).await.unwrap();
        assert_eq!(report.status(), CrawlStatus::Success);
        assert_eq!(report.linked_categories, 1);
        assert_eq!(report.linked_mechanics, 1);
        assert_eq!(report.unmapped.get("economic"), 1);
        assert_eq!(report.uploaded_assets, 2);

        let entry = store.entries().into_iter().find(|e| e.id == id).unwrap();
        assert_eq!(entry.external_ref(CrawlSource::Bgg).as_deref(), Some("13"));
        assert_eq!(entry.release_date, NaiveDate::from_ymd_opt(1995, 1, 1));
        assert_eq!(entry.year_released, Some(1995));
        assert_eq!((entry.min_players, entry.max_players), (Some(3), Some(4)));
        assert_eq!(entry.description_scraped.as_deref(), Some("Trade, build and settle."));
        assert_eq!(store.category_links(id), vec![5]);
        assert_eq!(store.mechanic_links(id), vec![30]);

        let publishers = store.publishers();
        assert_eq!(publishers.len(), 1);
        assert_eq!(publishers[0].name, "KOSMOS");
        assert_eq!(entry.publisher_id, Some(publishers[0].id));

        let media = store.media(id);
        assert!(media[0].1.secure_url.ends_with("catan__original.jpg"));
        assert_eq!(entry.hero_image_id, Some(media[0].0));

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, CrawlSource::Bgg);
        assert_eq!(events[0].status, CrawlStatus::Success);
    }

    #[tokio::test]
    async fn bound_id_skips_search_and_conflicts_are_stable() {
        let store = Arc::new(MemoryCatalogStore::new());
        let kosmos = store.seed_publisher("Catan Studio");
        let id = seed_catan(
            &store,
            CatalogEntry {
                min_players: Some(2),
                publisher_id: Some(kosmos),
                release_date: NaiveDate::from_ymd_opt(1995, 8, 1),
                external_refs: [("bgg".to_string(), json!(13))].into(),
                ..Default::default()
            },
        );
        let (fetcher, crawler) = crawler(&store, catan_routes());

        for _ in 0..2 {
            let report = crawler.enrich_entry(id).await.unwrap();
            assert_eq!(report.status(), CrawlStatus::Partial);
            assert_eq!(report.conflicts, vec!["min_players_conflict".to_string()]);
        }
        assert_eq!(fetcher.request_count("/search"), 0);

        let entry = store.entries().into_iter().find(|e| e.id == id).unwrap();
        assert_eq!(entry.min_players, Some(2));
        assert_eq!(entry.max_players, Some(4));
        assert_eq!(entry.publisher_id, Some(kosmos));
        assert_eq!(entry.release_date, NaiveDate::from_ymd_opt(1995, 8, 1));
        // the numeric binding was already the same item
        assert_eq!(entry.external_refs["bgg"], json!(13));

        let events = store.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].details.as_ref().unwrap()["noop"], true);
        assert_eq!(events[1].error_message.as_deref(), Some("min_players_conflict"));
    }

    #[tokio::test]
    async fn empty_search_is_partial_not_error() {
        let store = Arc::new(MemoryCatalogStore::new());
        let id = seed_catan(&store, CatalogEntry::default());
        let (fetcher, crawler) = crawler(
            &store,
            ScriptedFetcher::new().page("/search", 200, r#"<items total="0" termsofuse="x"></items>"#),
        );

        let report = crawler.enrich_entry(id).await.unwrap();
        assert_eq!(report.status(), CrawlStatus::Partial);
        assert_eq!(report.error_message().as_deref(), Some(NO_MATCH_MESSAGE));
        assert_eq!(fetcher.request_count("/thing"), 0);
        assert_eq!(store.events()[0].error_message.as_deref(), Some(NO_MATCH_MESSAGE));
    }

    #[tokio::test]
    async fn queued_response_is_retried() {
        let store = Arc::new(MemoryCatalogStore::new());
        let id = seed_catan(&store, CatalogEntry::default());
        let fetcher = ScriptedFetcher::new()
            .page("/search", 200, SEARCH)
            .page("/thing?id=13", 202, "")
            .page("/thing?id=13", 200, THING);
        let (fetcher, crawler) = crawler(&store, fetcher);

        let report = crawler.enrich_entry(id).await.unwrap();
        assert_eq!(report.status(), CrawlStatus::Success);
        assert_eq!(fetcher.request_count("/thing?id=13"), 2);
        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].details.as_ref().unwrap()["attempts"], 2);
    }

    #[tokio::test]
    async fn batch_continues_past_failures() {
        let store = Arc::new(MemoryCatalogStore::new());
        seed_catan(&store, CatalogEntry::default());
        store.seed_entry(CatalogEntry {
            slug: "broken".into(),
            name: "Broken".into(),
            ..Default::default()
        });
        let fetcher = ScriptedFetcher::new()
            .page("query=Broken", 200, "<items><item")
            .page("/search?type=boardgame&query=Catan", 200, SEARCH)
            .page("/thing?id=13&stats=1", 200, THING);
        let (_, crawler) = crawler(&store, fetcher);

        let summary = crawler.enrich_batch(false, None).await.unwrap();
        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        let events = store.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| e.status == CrawlStatus::Error && e.target == "broken"));
    }
}
