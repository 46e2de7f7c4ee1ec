use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use systems_crawler::crawler::bgg::BggCrawler;
use systems_crawler::crawler::events::CrawlSource;
use systems_crawler::crawler::fetch::HttpFetcher;
use systems_crawler::crawler::pipeline::RunSummary;
use systems_crawler::crawler::startplaying::StartPlayingCrawler;
use systems_crawler::crawler::wikipedia::WikipediaCrawler;
use systems_crawler::media::DirectLinkAssets;
use systems_crawler::store::{CatalogEntry, CatalogStore, MemoryCatalogStore, PgCatalogStore, SharedStore};
use systems_crawler::telemetry::{init_tracing, DEFAULT_FILTER};
use systems_crawler::util::db::Db;
use systems_crawler::util::env as env_util;
use systems_crawler::{CrawlerConfig, ReconcileReport};

#[derive(Parser, Debug)]
#[command(name = "syscrawl", version, about = "Game-system catalog crawler and enricher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl the StartPlaying game-systems index and every linked detail page
    CrawlStartplaying(CrawlArgs),
    /// Enrich existing catalog entries from Wikipedia
    EnrichWikipedia(EnrichArgs),
    /// Enrich existing catalog entries from BoardGameGeek
    EnrichBgg(EnrichArgs),
    /// Apply pending SQL migrations
    Migrate,
}

#[derive(Debug, Args)]
struct CrawlArgs {
    /// Index page to start from (defaults to STARTPLAYING_BASE_URL + STARTPLAYING_START_PATH)
    #[arg(long)]
    start_url: Option<String>,
    /// Write into an in-memory catalog instead of Postgres
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct EnrichArgs {
    /// Enrich a single entry by id
    #[arg(long)]
    id: Option<i64>,
    /// Cap the number of entries in a batch run
    #[arg(long)]
    limit: Option<i64>,
    /// Skip entries already bound to the source
    #[arg(long, action = ArgAction::SetTrue)]
    only_missing: bool,
    /// Read targets from Postgres but write into an in-memory copy
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
}

async fn connect() -> Result<Db> {
    let url = env_util::db_url()?;
    let max_conns: u32 = env_util::env_parse("DB_MAX_CONNS", 5u32);
    Db::connect(&url, max_conns).await.context("connect to catalog database")
}

fn log_summary(kind: &str, summary: &RunSummary) {
    info!(
        kind,
        discovered = summary.discovered,
        succeeded = summary.succeeded,
        partial = summary.partial,
        failed = summary.failed,
        unmapped = summary.unmapped.total(),
        "run complete"
    );
}

/// Tag mappings from Postgres, when one is configured, so a dry run reports
/// the same unmapped tags a real run would.
async fn dry_run_store_for_crawl() -> Result<Arc<MemoryCatalogStore>> {
    let memory = Arc::new(MemoryCatalogStore::new());
    if env_util::db_url().is_err() {
        warn!("no database configured; dry run starts from an empty catalog");
        return Ok(memory);
    }
    let pg = PgCatalogStore::new(connect().await?);
    let maps = pg.tag_maps(CrawlSource::StartPlaying).await?;
    for (tag, id) in &maps.categories {
        memory.seed_category_mapping(CrawlSource::StartPlaying, tag, *id);
    }
    for (tag, id) in &maps.mechanics {
        memory.seed_mechanic_mapping(CrawlSource::StartPlaying, tag, *id);
    }
    Ok(memory)
}

/// Copies the target entries, their publishers and the source's tag maps
/// into memory. Ids are reassigned on the way in.
async fn dry_run_copy(
    pg: &PgCatalogStore,
    source: CrawlSource,
    targets: Vec<CatalogEntry>,
) -> Result<Arc<MemoryCatalogStore>> {
    let memory = Arc::new(MemoryCatalogStore::new());
    let maps = pg.tag_maps(source).await?;
    for (tag, id) in &maps.categories {
        memory.seed_category_mapping(source, tag, *id);
    }
    for (tag, id) in &maps.mechanics {
        memory.seed_mechanic_mapping(source, tag, *id);
    }
    let mut publishers: HashMap<i64, i64> = HashMap::new();
    for mut entry in targets {
        if let Some(pid) = entry.publisher_id {
            let copied = match publishers.get(&pid) {
                Some(id) => Some(*id),
                None => match pg.publisher_by_id(pid).await? {
                    Some(p) => {
                        let id = memory.seed_publisher(&p.name);
                        publishers.insert(pid, id);
                        Some(id)
                    }
                    None => None,
                },
            };
            entry.publisher_id = copied;
        }
        memory.seed_entry(entry);
    }
    Ok(memory)
}

async fn crawl_startplaying(config: CrawlerConfig, args: CrawlArgs) -> Result<()> {
    let store: SharedStore = if args.dry_run {
        info!("dry run: writing into an in-memory catalog");
        dry_run_store_for_crawl().await?
    } else {
        Arc::new(PgCatalogStore::new(connect().await?))
    };
    let fetcher = Arc::new(HttpFetcher::for_listing(&config)?);
    let assets = Arc::new(DirectLinkAssets::new(&config));
    let crawler = StartPlayingCrawler::new(config, store, fetcher, assets);
    let summary = crawler
        .run(args.start_url.as_deref())
        .await
        .context("startplaying crawl aborted")?;
    log_summary("startplaying", &summary);
    Ok(())
}

/// Dry-run store for an enrichment command: the selected targets, copied.
async fn dry_run_targets(pg: &PgCatalogStore, source: CrawlSource, args: &EnrichArgs) -> Result<Arc<MemoryCatalogStore>> {
    info!(%source, "dry run: enriching an in-memory copy of the targets");
    let targets = match args.id {
        Some(id) => pg.entry_by_id(id).await?.into_iter().collect(),
        None => pg.entries_for_enrichment(source, args.only_missing, args.limit).await?,
    };
    if targets.is_empty() {
        anyhow::bail!("no catalog entries to enrich");
    }
    dry_run_copy(pg, source, targets).await
}

fn log_dry_run_results(memory: &MemoryCatalogStore) {
    for entry in memory.entries() {
        info!(
            slug = %entry.slug,
            status = entry.crawl_status.as_deref().unwrap_or("-"),
            message = entry.error_message.as_deref().unwrap_or(""),
            "dry run result"
        );
    }
}

fn log_entry_report(report: &ReconcileReport) {
    info!(
        entry_id = report.entry_id,
        status = %report.status(),
        updated = %report.updated_fields.join(","),
        conflicts = %report.conflicts.join(","),
        "entry enriched"
    );
}

async fn enrich_wikipedia(config: CrawlerConfig, args: EnrichArgs) -> Result<()> {
    let fetcher = Arc::new(HttpFetcher::for_api(&config)?);
    let pg = PgCatalogStore::new(connect().await?);

    if args.dry_run {
        let memory = dry_run_targets(&pg, CrawlSource::Wikipedia, &args).await?;
        let crawler = WikipediaCrawler::new(&config, memory.clone(), fetcher);
        let summary = crawler.enrich_batch(false, None).await?;
        log_summary("wikipedia", &summary);
        log_dry_run_results(&memory);
        return Ok(());
    }

    let crawler = WikipediaCrawler::new(&config, Arc::new(pg), fetcher);
    match args.id {
        Some(id) => {
            let report = crawler
                .enrich_entry(id)
                .await
                .with_context(|| format!("wikipedia enrichment failed for entry {id}"))?;
            log_entry_report(&report);
        }
        None => {
            let summary = crawler.enrich_batch(args.only_missing, args.limit).await?;
            log_summary("wikipedia", &summary);
        }
    }
    Ok(())
}

async fn enrich_bgg(config: CrawlerConfig, args: EnrichArgs) -> Result<()> {
    let fetcher = Arc::new(HttpFetcher::for_bgg(&config)?);
    let assets = Arc::new(DirectLinkAssets::new(&config));
    let pg = PgCatalogStore::new(connect().await?);

    if args.dry_run {
        let memory = dry_run_targets(&pg, CrawlSource::Bgg, &args).await?;
        let crawler = BggCrawler::new(&config, memory.clone(), fetcher, assets);
        let summary = crawler.enrich_batch(false, None).await?;
        log_summary("bgg", &summary);
        log_dry_run_results(&memory);
        return Ok(());
    }

    let crawler = BggCrawler::new(&config, Arc::new(pg), fetcher, assets);
    match args.id {
        Some(id) => {
            let report = crawler
                .enrich_entry(id)
                .await
                .with_context(|| format!("bgg enrichment failed for entry {id}"))?;
            log_entry_report(&report);
        }
        None => {
            let summary = crawler.enrich_batch(args.only_missing, args.limit).await?;
            log_summary("bgg", &summary);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing(DEFAULT_FILTER)?;
    let cli = Cli::parse();

    env_util::preflight_check(
        "syscrawl",
        &[],
        &[
            "DATABASE_URL",
            "DB_HOST",
            "DB_MAX_CONNS",
            "AUTO_MIGRATE",
            "CRAWLER_USER_AGENT",
            "STARTPLAYING_BASE_URL",
            "CRAWL_PACE_MS",
            "CRAWL_MAX_ATTEMPTS",
            "WIKIPEDIA_PACE_MS",
            "BGG_API_URL",
            "BGG_PACE_MS",
        ],
    )?;
    let config = CrawlerConfig::from_env();

    let result = match cli.command {
        Command::CrawlStartplaying(args) => crawl_startplaying(config, args).await,
        Command::EnrichWikipedia(args) => enrich_wikipedia(config, args).await,
        Command::EnrichBgg(args) => enrich_bgg(config, args).await,
        Command::Migrate => {
            let db = connect().await?;
            db.run_migrations().await
        }
    };
    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "command failed");
    }
    result
}
