//! StartPlaying game-system crawler: index page, then one detail page per system.

pub mod extract;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use url::Url;

use self::extract::{
    parse_detail_page, parse_index_page, parse_seo_page_links, seo_pages_request, slug_from_url, SystemDetail,
};
use super::config::CrawlerConfig;
use super::error::CrawlError;
use super::events::CrawlSource;
use super::fetch::{ensure_crawl_allowed, Fetch, FetchedPage};
use super::pipeline::{with_retries, Pipeline, RetryPolicy, RunSummary};
use super::reconcile::{
    attach_media, link_tags, merge_external_refs, resolve_publisher, EnrichableField, MergeLog,
    ReconcileReport,
};
use super::tags::{partition_tags, TagMaps};
use super::{Enricher, TargetRef};
use crate::media::AssetService;
use crate::store::{CatalogEntry, EntryUpdate, ExternalRefs, NewCatalogEntry, NewPublisher, Publisher, SharedStore};

pub struct StartPlayingEnricher {
    store: SharedStore,
    fetcher: Arc<dyn Fetch>,
    assets: Arc<dyn AssetService>,
    tag_maps: TagMaps,
}

impl StartPlayingEnricher {
    pub fn new(store: SharedStore, fetcher: Arc<dyn Fetch>, assets: Arc<dyn AssetService>, tag_maps: TagMaps) -> Self {
        Self {
            store,
            fetcher,
            assets,
            tag_maps,
        }
    }

    /// Slug first; a name match is accepted as a fallback.
    async fn find_existing(&self, detail: &SystemDetail) -> anyhow::Result<Option<CatalogEntry>> {
        if let Some(found) = self.store.entry_by_slug(&detail.slug).await? {
            return Ok(Some(found));
        }
        if detail.name.is_empty() {
            return Ok(None);
        }
        let by_name = self.store.entry_by_name(&detail.name).await?;
        if let Some(entry) = &by_name {
            warn!(name = %detail.name, existing_slug = %entry.slug, "matched existing system by name");
        }
        Ok(by_name)
    }

    async fn resolve_detail_publisher(&self, detail: &SystemDetail) -> anyhow::Result<Option<Publisher>> {
        let Some(name) = detail.publisher_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let publisher = resolve_publisher(
            self.store.as_ref(),
            NewPublisher {
                name: name.to_string(),
                website_url: detail.publisher_url.clone(),
                wikipedia_url: None,
            },
        )
        .await?;
        match (publisher, &detail.publisher_url) {
            (Some(mut p), Some(url)) if p.website_url.is_none() => {
                self.store.set_publisher_website(p.id, url).await?;
                p.website_url = Some(url.clone());
                Ok(Some(p))
            }
            (p, _) => Ok(p),
        }
    }

    /// Create or gap-fill the catalog entry, then tags and images.
    #[instrument(skip_all, fields(slug = %detail.slug))]
    pub async fn upsert_detail(&self, detail: &SystemDetail) -> anyhow::Result<ReconcileReport> {
        let existing = self.find_existing(detail).await?;
        let publisher = self.resolve_detail_publisher(detail).await?;
        let publisher_url = detail
            .publisher_url
            .clone()
            .or_else(|| publisher.as_ref().and_then(|p| p.website_url.clone()));
        let release_date = detail.release_date();

        let mut report = match existing {
            None => {
                let mut refs = ExternalRefs::new();
                refs.insert(CrawlSource::StartPlaying.as_str().to_string(), detail.slug.clone().into());
                let id = self
                    .store
                    .insert_entry(&NewCatalogEntry {
                        slug: detail.slug.clone(),
                        name: detail.name.clone(),
                        description_scraped: detail.description.clone(),
                        min_players: detail.min_players,
                        max_players: detail.max_players,
                        release_date,
                        year_released: detail.release_year,
                        publisher_id: publisher.as_ref().map(|p| p.id),
                        publisher_url,
                        external_refs: refs,
                    })
                    .await?;
                ReconcileReport {
                    created: true,
                    ..ReconcileReport::for_entry(id)
                }
            }
            Some(entry) => {
                let mut log = MergeLog::default();
                let update = EntryUpdate {
                    description_scraped: log.guarded(
                        EnrichableField::Description,
                        entry.description_scraped.as_ref(),
                        detail.description.as_ref(),
                    ),
                    min_players: log.guarded(
                        EnrichableField::MinPlayers,
                        entry.min_players.as_ref(),
                        detail.min_players.as_ref(),
                    ),
                    max_players: log.guarded(
                        EnrichableField::MaxPlayers,
                        entry.max_players.as_ref(),
                        detail.max_players.as_ref(),
                    ),
                    release_date: log.guarded(
                        EnrichableField::ReleaseDate,
                        entry.release_date.as_ref(),
                        release_date.as_ref(),
                    ),
                    year_released: log.fill_only(
                        "yearReleased",
                        entry.year_released.as_ref(),
                        detail.release_year.as_ref(),
                    ),
                    publisher_id: log.guarded(
                        EnrichableField::Publisher,
                        entry.publisher_id.as_ref(),
                        publisher.as_ref().map(|p| &p.id),
                    ),
                    publisher_url: log.fill_only("publisherUrl", entry.publisher_url.as_ref(), publisher_url.as_ref()),
                    external_refs: merge_external_refs(&entry.external_refs, CrawlSource::StartPlaying, &detail.slug),
                };
                if update.external_refs.is_some() {
                    log.updated("externalRefs");
                }
                self.store.update_entry(entry.id, &update).await?;
                let mut report = ReconcileReport::for_entry(entry.id);
                report.absorb(log);
                report
            }
        };

        let tags = partition_tags(&detail.tags, &self.tag_maps);
        let (categories, mechanics) = link_tags(self.store.as_ref(), report.entry_id, &tags).await?;
        report.linked_categories = categories;
        report.linked_mechanics = mechanics;
        report.unmapped = tags.unmapped;
        report.uploaded_assets =
            attach_media(self.store.as_ref(), self.assets.as_ref(), report.entry_id, &detail.image_urls).await?;
        Ok(report)
    }
}

#[async_trait]
impl Enricher for StartPlayingEnricher {
    type Target = String;
    type Document = FetchedPage;
    type Record = SystemDetail;

    fn source(&self) -> CrawlSource {
        CrawlSource::StartPlaying
    }

    fn target_ref(&self, url: &String) -> TargetRef {
        TargetRef {
            label: url.clone(),
            entry_id: None,
            slug: slug_from_url(url),
        }
    }

    async fn fetch(&self, url: &String) -> Result<FetchedPage, CrawlError> {
        self.fetcher.get(url).await?.into_success()
    }

    fn extract(&self, url: &String, page: FetchedPage) -> Result<SystemDetail, CrawlError> {
        let detail = parse_detail_page(&page.body, url)?;
        let o = &detail.origins;
        info!(
            slug = %detail.slug,
            name = %detail.name,
            name_from = %o.name,
            description_from = %o.description,
            players_from = %o.players,
            tags_from = %o.tags,
            images_from = %o.images,
            publisher_url_from = %o.publisher_url,
            release_year_from = %o.release_year,
            tags = detail.tags.len(),
            images = detail.image_urls.len(),
            "parsed detail page"
        );
        Ok(detail)
    }

    async fn reconcile(&self, _url: &String, detail: SystemDetail) -> Result<ReconcileReport, CrawlError> {
        Ok(self.upsert_detail(&detail).await?)
    }
}

pub struct StartPlayingCrawler {
    config: CrawlerConfig,
    store: SharedStore,
    fetcher: Arc<dyn Fetch>,
    assets: Arc<dyn AssetService>,
}

impl StartPlayingCrawler {
    pub fn new(config: CrawlerConfig, store: SharedStore, fetcher: Arc<dyn Fetch>, assets: Arc<dyn AssetService>) -> Self {
        Self {
            config,
            store,
            fetcher,
            assets,
        }
    }

    /// Last resort when the index page has no links: the site's GraphQL SEO
    /// listing. Any failure here just means no links.
    async fn recover_links_from_seo_pages(&self, base: &Url) -> Vec<String> {
        let url = self.config.graphql_url();
        let page = match self.fetcher.post_json(&url, &seo_pages_request()).await {
            Ok(page) if page.is_success() => page,
            Ok(page) => {
                warn!(url = %url, status = page.status, "seo pages request rejected");
                return Vec::new();
            }
            Err(e) => {
                warn!(url = %url, error = %e, "seo pages request failed");
                return Vec::new();
            }
        };
        match parse_seo_page_links(&page.body, base) {
            Ok(links) => links,
            Err(e) => {
                warn!(url = %url, error = %e, "seo pages response unusable");
                Vec::new()
            }
        }
    }

    /// One sequential crawl batch. Only the robots.txt precheck and an
    /// unreachable index abort the batch; detail failures are recorded and
    /// skipped.
    #[instrument(skip(self))]
    pub async fn run(&self, start_url: Option<&str>) -> Result<RunSummary, CrawlError> {
        let default_start = self.config.start_url();
        let start_url = start_url.unwrap_or(&default_start);
        let base = Url::parse(start_url).map_err(|e| CrawlError::parse("start url", e))?;

        ensure_crawl_allowed(self.fetcher.as_ref(), &self.config.robots_url()).await?;
        let tag_maps = self.store.tag_maps(CrawlSource::StartPlaying).await?;
        let retry = RetryPolicy::from_config(&self.config);

        let fetcher = self.fetcher.as_ref();
        let (index, _) = with_retries(retry, start_url, |_| async move {
            fetcher.get(start_url).await?.into_success()
        })
        .await;
        let index = index?;
        let mut links = parse_index_page(&index.body, &base);
        if links.is_empty() {
            warn!(start_url, "index page yielded no system links");
            links = self.recover_links_from_seo_pages(&base).await;
            if !links.is_empty() {
                info!(count = links.len(), "graphql recovered system links");
            }
        } else {
            let sample: Vec<&str> = links
                .iter()
                .take(5)
                .map(|l| l.strip_prefix(self.config.startplaying_base_url.as_str()).unwrap_or(l))
                .collect();
            info!(count = links.len(), first = ?sample, "index page yielded candidate system links");
        }

        let enricher = StartPlayingEnricher::new(self.store.clone(), self.fetcher.clone(), self.assets.clone(), tag_maps);
        let pipeline = Pipeline::new(self.store.clone(), retry);
        let mut summary = RunSummary {
            discovered: links.len(),
            ..Default::default()
        };
        for link in &links {
            let result = pipeline.run_target(&enricher, link).await;
            summary.tally(&result);
        }

        if !summary.unmapped.is_empty() {
            warn!(
                distinct = summary.unmapped.iter().count(),
                total = summary.unmapped.total(),
                top = ?summary.unmapped.top(20),
                "unmapped tags"
            );
        }
        info!(
            discovered = summary.discovered,
            succeeded = summary.succeeded,
            partial = summary.partial,
            failed = summary.failed,
            "startplaying crawl finished"
        );
        Ok(summary)
    }
}
