//! Wikipedia enrichment of catalog entries that already exist: summary text,
//! infobox release date and publisher.

pub mod client;
pub mod wikitext;

use async_trait::async_trait;
use chrono::Datelike;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use self::client::{WikiSummary, WikipediaClient};
use self::wikitext::{extract_infobox, Infobox};
use super::config::CrawlerConfig;
use super::error::CrawlError;
use super::events::CrawlSource;
use super::fetch::Fetch;
use super::pipeline::{Pipeline, RetryPolicy, RunSummary};
use super::reconcile::{merge_external_refs, resolve_publisher, EnrichableField, MergeLog, ReconcileReport};
use super::{Enricher, TargetRef};
use crate::store::{CatalogEntry, EntryUpdate, NewPublisher, SharedStore};

pub const NO_MATCH_MESSAGE: &str = "No Wikipedia match found";
const UNPARSED_RELEASE: &str = "release_date_unparsed";

#[derive(Debug, Clone, PartialEq)]
pub enum WikiDocument {
    Unmatched,
    Page {
        title: String,
        summary: Option<WikiSummary>,
        wikitext: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WikiRecord {
    Unmatched,
    Matched {
        title: String,
        summary: Option<WikiSummary>,
        infobox: Infobox,
    },
}

pub struct WikipediaEnricher {
    store: SharedStore,
    client: WikipediaClient,
}

impl WikipediaEnricher {
    pub fn new(store: SharedStore, client: WikipediaClient) -> Self {
        Self { store, client }
    }

    /// Publisher columns. A stored publisher is only compared by name so a
    /// repeated run reports the same conflict instead of a new row.
    async fn merge_publisher(
        &self,
        entry: &CatalogEntry,
        infobox: &Infobox,
        content_url: Option<&String>,
        log: &mut MergeLog,
        update: &mut EntryUpdate,
    ) -> Result<(), CrawlError> {
        let Some(first) = infobox.publisher_names.first() else {
            update.publisher_url = log.fill_only("publisherUrl", entry.publisher_url.as_ref(), content_url);
            return Ok(());
        };

        match entry.publisher_id {
            None => {
                let publisher = resolve_publisher(
                    self.store.as_ref(),
                    NewPublisher {
                        name: first.clone(),
                        website_url: None,
                        wikipedia_url: content_url.cloned(),
                    },
                )
                .await?;
                if let Some(publisher) = publisher {
                    update.publisher_id =
                        log.guarded(EnrichableField::Publisher, None, Some(&publisher.id));
                    let url = content_url.cloned().or(publisher.wikipedia_url);
                    update.publisher_url = log.fill_only("publisherUrl", entry.publisher_url.as_ref(), url.as_ref());
                }
            }
            Some(publisher_id) => {
                let stored = self.store.publisher_by_id(publisher_id).await?;
                let same = stored
                    .as_ref()
                    .is_some_and(|p| p.name.trim().eq_ignore_ascii_case(first.trim()));
                if !same {
                    warn!(
                        slug = %entry.slug,
                        stored = stored.as_ref().map(|p| p.name.as_str()).unwrap_or("<missing>"),
                        extracted = %first,
                        "publisher differs from wikipedia infobox"
                    );
                    log.conflict(EnrichableField::Publisher.conflict_marker());
                }
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(entry_id = entry_id))]
    pub async fn apply(&self, entry_id: i64, record: WikiRecord) -> Result<ReconcileReport, CrawlError> {
        let entry = self
            .store
            .entry_by_id(entry_id)
            .await?
            .ok_or(CrawlError::EntryNotFound(entry_id))?;

        let (title, summary, infobox) = match record {
            WikiRecord::Unmatched => return Ok(ReconcileReport::unmatched(entry.id, NO_MATCH_MESSAGE)),
            WikiRecord::Matched { title, summary, infobox } => (title, summary, infobox),
        };
        let content_url = summary.as_ref().and_then(|s| s.content_url.clone());

        let mut log = MergeLog::default();
        let mut update = EntryUpdate {
            external_refs: merge_external_refs(&entry.external_refs, CrawlSource::Wikipedia, &title),
            description_scraped: log.guarded(
                EnrichableField::Description,
                entry.description_scraped.as_ref(),
                summary.as_ref().and_then(|s| s.extract.as_ref()),
            ),
            ..Default::default()
        };
        if update.external_refs.is_some() {
            log.updated("externalRefs");
        }

        match (infobox.release_date, infobox.release_raw.as_deref()) {
            (Some(date), _) => {
                update.release_date = log.guarded(EnrichableField::ReleaseDate, entry.release_date.as_ref(), Some(&date));
                update.year_released = log.fill_only("yearReleased", entry.year_released.as_ref(), Some(&date.year()));
            }
            (None, Some(raw)) => {
                warn!(slug = %entry.slug, raw, "could not parse infobox release date");
                log.conflict(UNPARSED_RELEASE);
            }
            (None, None) => {}
        }

        self.merge_publisher(&entry, &infobox, content_url.as_ref(), &mut log, &mut update)
            .await?;

        self.store.update_entry(entry.id, &update).await?;
        let mut report = ReconcileReport::for_entry(entry.id);
        report.absorb(log);
        Ok(report)
    }
}

#[async_trait]
impl Enricher for WikipediaEnricher {
    type Target = CatalogEntry;
    type Document = WikiDocument;
    type Record = WikiRecord;

    fn source(&self) -> CrawlSource {
        CrawlSource::Wikipedia
    }

    fn target_ref(&self, entry: &CatalogEntry) -> TargetRef {
        TargetRef {
            label: entry.slug.clone(),
            entry_id: Some(entry.id),
            slug: Some(entry.slug.clone()),
        }
    }

    /// A page bound earlier is reused; otherwise the name goes through search.
    async fn fetch(&self, entry: &CatalogEntry) -> Result<WikiDocument, CrawlError> {
        let bound = entry.external_ref(CrawlSource::Wikipedia);
        let title = match bound {
            Some(title) => Some(title),
            None => self.client.resolve_page_title(&entry.name).await?,
        };
        let Some(title) = title else {
            return Ok(WikiDocument::Unmatched);
        };
        let summary = self.client.fetch_summary(&title).await?;
        let wikitext = self.client.fetch_wikitext(&title).await?;
        Ok(WikiDocument::Page { title, summary, wikitext })
    }

    fn extract(&self, entry: &CatalogEntry, document: WikiDocument) -> Result<WikiRecord, CrawlError> {
        Ok(match document {
            WikiDocument::Unmatched => WikiRecord::Unmatched,
            WikiDocument::Page { title, summary, wikitext } => {
                let infobox = wikitext.as_deref().map(extract_infobox).unwrap_or_default();
                info!(
                    slug = %entry.slug,
                    title = %title,
                    has_summary = summary.is_some(),
                    publishers = infobox.publisher_names.len(),
                    release_date = ?infobox.release_date,
                    "parsed wikipedia page"
                );
                WikiRecord::Matched { title, summary, infobox }
            }
        })
    }

    async fn reconcile(&self, entry: &CatalogEntry, record: WikiRecord) -> Result<ReconcileReport, CrawlError> {
        self.apply(entry.id, record).await
    }
}

pub struct WikipediaCrawler {
    store: SharedStore,
    enricher: WikipediaEnricher,
    pipeline: Pipeline,
}

impl WikipediaCrawler {
    pub fn new(config: &CrawlerConfig, store: SharedStore, fetcher: Arc<dyn Fetch>) -> Self {
        let client = WikipediaClient::new(fetcher, config);
        Self {
            enricher: WikipediaEnricher::new(store.clone(), client),
            pipeline: Pipeline::new(store.clone(), RetryPolicy::from_config(config)),
            store,
        }
    }

    /// Single entry; the failure is recorded as an event and also returned.
    pub async fn enrich_entry(&self, entry_id: i64) -> Result<ReconcileReport, CrawlError> {
        let entry = self
            .store
            .entry_by_id(entry_id)
            .await?
            .ok_or(CrawlError::EntryNotFound(entry_id))?;
        self.pipeline.run_target(&self.enricher, &entry).await
    }

    /// Every candidate in id order; a failing entry does not stop the batch.
    #[instrument(skip(self))]
    pub async fn enrich_batch(&self, only_missing: bool, limit: Option<i64>) -> Result<RunSummary, CrawlError> {
        let entries = self
            .store
            .entries_for_enrichment(CrawlSource::Wikipedia, only_missing, limit)
            .await?;
        let mut summary = RunSummary {
            discovered: entries.len(),
            ..Default::default()
        };
        for entry in &entries {
            let result = self.pipeline.run_target(&self.enricher, entry).await;
            summary.tally(&result);
        }
        info!(
            candidates = summary.discovered,
            succeeded = summary.succeeded,
            partial = summary.partial,
            failed = summary.failed,
            "wikipedia enrichment finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::events::CrawlStatus;
    use crate::crawler::testing::ScriptedFetcher;
    use crate::store::MemoryCatalogStore;
    use chrono::NaiveDate;
    use serde_json::json;

    const DND_URL: &str = "https://en.wikipedia.org/wiki/Dungeons_%26_Dragons";

    fn opensearch(title: &str) -> String {
        json!([title, [title], [""], [DND_URL]]).to_string()
    }

    fn summary(title: &str, extract: &str) -> String {
        json!({
            "title": title,
            "extract": extract,
            "content_urls": { "desktop": { "page": DND_URL } }
        })
        .to_string()
    }

    fn parse(wikitext: &str) -> String {
        json!({ "parse": { "title": "x", "wikitext": wikitext } }).to_string()
    }

    fn dnd_page(publisher: &str, release: &str) -> ScriptedFetcher {
        with_dnd_routes(ScriptedFetcher::new(), publisher, release)
    }

    fn with_dnd_routes(fetcher: ScriptedFetcher, publisher: &str, release: &str) -> ScriptedFetcher {
        let wikitext = format!(
            "{{{{Infobox game\n| name = Dungeons & Dragons\n| publisher = {publisher}\n| release_date = {release}\n}}}}\n'''D&D''' is..."
        );
        fetcher
            .page("action=opensearch", 200, &opensearch("Dungeons & Dragons"))
            .page("/page/summary/", 200, &summary("Dungeons & Dragons", "A fantasy tabletop role-playing game."))
            .page("action=parse", 200, &parse(&wikitext))
    }

    fn crawler(store: &Arc<MemoryCatalogStore>, fetcher: ScriptedFetcher) -> (Arc<ScriptedFetcher>, WikipediaCrawler) {
        let fetcher = Arc::new(fetcher);
        let crawler = WikipediaCrawler::new(&CrawlerConfig::unthrottled(), store.clone(), fetcher.clone());
        (fetcher, crawler)
    }

    fn seed_dnd(store: &MemoryCatalogStore, publisher_id: Option<i64>) -> i64 {
        store.seed_entry(CatalogEntry {
            slug: "dungeons-and-dragons".into(),
            name: "Dungeons & Dragons".into(),
            publisher_id,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn fills_empty_fields() {
        let store = Arc::new(MemoryCatalogStore::new());
        let id = seed_dnd(&store, None);
        let (_, crawler) = crawler(&store, dnd_page("[[TSR, Inc.|TSR]]", "{{Start date|1974|01|26}}"));

        let report = crawler.enrich_entry(id).await.unwrap();
        assert_eq!(report.status(), CrawlStatus::Success);
        assert!(report.conflicts.is_empty());

        let entry = store.entries().into_iter().find(|e| e.id == id).unwrap();
        assert_eq!(entry.description_scraped.as_deref(), Some("A fantasy tabletop role-playing game."));
        assert_eq!(entry.release_date, NaiveDate::from_ymd_opt(1974, 1, 26));
        assert_eq!(entry.year_released, Some(1974));
        assert_eq!(entry.external_ref(CrawlSource::Wikipedia).as_deref(), Some("Dungeons & Dragons"));
        assert_eq!(entry.publisher_url.as_deref(), Some(DND_URL));

        let publishers = store.publishers();
        assert_eq!(publishers.len(), 1);
        assert_eq!(publishers[0].name, "TSR");
        assert_eq!(entry.publisher_id, Some(publishers[0].id));

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, CrawlSource::Wikipedia);
        assert_eq!(events[0].catalog_entry_id, Some(id));
        assert_eq!(entry.crawl_status.as_deref(), Some("success"));
    }

    #[tokio::test]
    async fn differing_publisher_is_a_stable_conflict() {
        let store = Arc::new(MemoryCatalogStore::new());
        let wotc = store.seed_publisher("Wizards of the Coast");
        let id = seed_dnd(&store, Some(wotc));
        let (_, crawler) = crawler(&store, dnd_page("[[Hasbro]]", "1974"));

        for _ in 0..2 {
            let report = crawler.enrich_entry(id).await.unwrap();
            assert_eq!(report.status(), CrawlStatus::Partial);
            assert_eq!(report.conflicts, vec!["publisher_conflict".to_string()]);
        }

        let entry = store.entries().into_iter().find(|e| e.id == id).unwrap();
        assert_eq!(entry.publisher_id, Some(wotc));
        assert_eq!(store.publishers().len(), 1);
        let events = store.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.status == CrawlStatus::Partial));
        assert_eq!(events[1].error_message.as_deref(), Some("publisher_conflict"));
        // second pass has nothing left to fill
        assert_eq!(events[1].details.as_ref().unwrap()["noop"], true);
    }

    #[tokio::test]
    async fn same_publisher_name_is_not_a_conflict() {
        let store = Arc::new(MemoryCatalogStore::new());
        let wotc = store.seed_publisher("Wizards of the Coast");
        let id = seed_dnd(&store, Some(wotc));
        let (_, crawler) = crawler(&store, dnd_page("[[Wizards of the Coast]], [[Hasbro]]", "2014"));

        let report = crawler.enrich_entry(id).await.unwrap();
        assert_eq!(report.status(), CrawlStatus::Success);
    }

    #[tokio::test]
    async fn existing_release_date_conflicts_without_overwrite() {
        let store = Arc::new(MemoryCatalogStore::new());
        let id = store.seed_entry(CatalogEntry {
            slug: "dungeons-and-dragons".into(),
            name: "Dungeons & Dragons".into(),
            release_date: NaiveDate::from_ymd_opt(2000, 1, 1),
            description_scraped: Some("Our own blurb.".into()),
            ..Default::default()
        });
        let (_, crawler) = crawler(&store, dnd_page("TSR", "January 1974"));

        let report = crawler.enrich_entry(id).await.unwrap();
        assert!(report.conflicts.contains(&"release_date_conflict".to_string()));
        assert!(report.conflicts.contains(&"description_conflict".to_string()));
        let entry = store.entries().into_iter().find(|e| e.id == id).unwrap();
        assert_eq!(entry.release_date, NaiveDate::from_ymd_opt(2000, 1, 1));
        assert_eq!(entry.description_scraped.as_deref(), Some("Our own blurb."));
        // the year column was empty, so it is still filled
        assert_eq!(entry.year_released, Some(1974));
    }

    #[tokio::test]
    async fn unparsed_release_is_flagged() {
        let store = Arc::new(MemoryCatalogStore::new());
        let id = seed_dnd(&store, None);
        let (_, crawler) = crawler(&store, dnd_page("TSR", "Unknown"));

        let report = crawler.enrich_entry(id).await.unwrap();
        assert_eq!(report.conflicts, vec!["release_date_unparsed".to_string()]);
        let entry = store.entries().into_iter().find(|e| e.id == id).unwrap();
        assert!(entry.release_date.is_none());
    }

    #[tokio::test]
    async fn no_search_hit_is_partial_not_error() {
        let store = Arc::new(MemoryCatalogStore::new());
        let id = seed_dnd(&store, None);
        let (fetcher, crawler) = crawler(
            &store,
            ScriptedFetcher::new().page("action=opensearch", 200, r#"["Dungeons & Dragons",[],[],[]]"#),
        );

        let report = crawler.enrich_entry(id).await.unwrap();
        assert_eq!(report.status(), CrawlStatus::Partial);
        assert_eq!(report.error_message().as_deref(), Some(NO_MATCH_MESSAGE));
        assert_eq!(fetcher.request_count("/page/summary/"), 0);
        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error_message.as_deref(), Some(NO_MATCH_MESSAGE));
    }

    #[tokio::test]
    async fn bound_title_skips_search() {
        let store = Arc::new(MemoryCatalogStore::new());
        let mut entry = CatalogEntry {
            slug: "dungeons-and-dragons".into(),
            name: "D&D".into(),
            ..Default::default()
        };
        entry
            .external_refs
            .insert("wikipedia".into(), serde_json::Value::from("Dungeons & Dragons"));
        let id = store.seed_entry(entry);
        let (fetcher, crawler) = crawler(&store, dnd_page("TSR", "1974"));

        let report = crawler.enrich_entry(id).await.unwrap();
        assert!(!report.updated_fields.contains(&"externalRefs".to_string()));
        assert_eq!(fetcher.request_count("action=opensearch"), 0);
    }

    #[tokio::test]
    async fn network_failure_is_recorded_and_returned() {
        let store = Arc::new(MemoryCatalogStore::new());
        let id = seed_dnd(&store, None);
        let (fetcher, crawler) = crawler(&store, ScriptedFetcher::new().fail("action=opensearch", 10));

        let err = crawler.enrich_entry(id).await.unwrap_err();
        assert!(matches!(err, CrawlError::Network { .. }));
        assert_eq!(fetcher.request_count("action=opensearch"), 3);
        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, CrawlStatus::Error);
        assert_eq!(events[0].catalog_entry_id, Some(id));
    }

    #[tokio::test]
    async fn missing_entry_is_not_found() {
        let store = Arc::new(MemoryCatalogStore::new());
        let (_, crawler) = crawler(&store, ScriptedFetcher::new());
        let err = crawler.enrich_entry(99).await.unwrap_err();
        assert!(matches!(err, CrawlError::EntryNotFound(99)));
        assert!(store.events().is_empty());
    }

    #[tokio::test]
    async fn batch_continues_past_failures() {
        let store = Arc::new(MemoryCatalogStore::new());
        seed_dnd(&store, None);
        store.seed_entry(CatalogEntry {
            slug: "nothing".into(),
            name: "Nothing At All".into(),
            ..Default::default()
        });
        // registered first so it wins over the generic opensearch route
        let fetcher = with_dnd_routes(ScriptedFetcher::new().fail("search=Nothing", 10), "TSR", "1974");
        let (_, crawler) = crawler(&store, fetcher);

        let summary = crawler.enrich_batch(false, None).await.unwrap();
        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(store.events().len(), 2);
    }
}
