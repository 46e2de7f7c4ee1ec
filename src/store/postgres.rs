use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{postgres::PgRow, types::Json, Postgres, QueryBuilder, Row};
use std::collections::HashSet;
use tracing::debug;

use super::{
    CatalogEntry, CatalogStore, EntryUpdate, ExternalRefs, NewCatalogEntry, NewMediaAsset,
    NewPublisher, Publisher,
};
use crate::crawler::events::{CrawlOutcome, CrawlSource, NewCrawlEvent};
use crate::crawler::tags::TagMaps;
use crate::util::db::Db;

const ENTRY_COLUMNS: &str = "id, slug, name, description_scraped, min_players, max_players, \
     release_date, year_released, publisher_id, publisher_url, hero_image_id, external_refs, \
     crawl_status, last_crawled_at, last_success_at, error_message";

const PUBLISHER_COLUMNS: &str = "id, name, website_url, wikipedia_url";

pub struct PgCatalogStore {
    db: Db,
}

impl PgCatalogStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn entry_where(&self, clause: &str, bind: impl ToString) -> Result<Option<CatalogEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM catalog_entries WHERE {clause} ORDER BY id LIMIT 1");
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(bind.to_string())
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }
}

/// Every key is kept as stored so an update cannot drop bindings it does
/// not understand. A non-object column reads as empty.
fn refs_from_json(value: Value) -> ExternalRefs {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => ExternalRefs::new(),
    }
}

fn entry_from_row(r: &PgRow) -> Result<CatalogEntry> {
    Ok(CatalogEntry {
        id: r.try_get("id")?,
        slug: r.try_get("slug")?,
        name: r.try_get("name")?,
        description_scraped: r.try_get("description_scraped")?,
        min_players: r.try_get("min_players")?,
        max_players: r.try_get("max_players")?,
        release_date: r.try_get("release_date")?,
        year_released: r.try_get("year_released")?,
        publisher_id: r.try_get("publisher_id")?,
        publisher_url: r.try_get("publisher_url")?,
        hero_image_id: r.try_get("hero_image_id")?,
        external_refs: refs_from_json(r.try_get::<Value, _>("external_refs")?),
        crawl_status: r.try_get("crawl_status")?,
        last_crawled_at: r.try_get("last_crawled_at")?,
        last_success_at: r.try_get("last_success_at")?,
        error_message: r.try_get("error_message")?,
    })
}

fn publisher_from_row(r: &PgRow) -> Result<Publisher> {
    Ok(Publisher {
        id: r.try_get("id")?,
        name: r.try_get("name")?,
        website_url: r.try_get("website_url")?,
        wikipedia_url: r.try_get("wikipedia_url")?,
    })
}

#[async_trait::async_trait]
impl CatalogStore for PgCatalogStore {
    async fn entry_by_id(&self, id: i64) -> Result<Option<CatalogEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM catalog_entries WHERE id = $1");
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn entry_by_slug(&self, slug: &str) -> Result<Option<CatalogEntry>> {
        self.entry_where("slug = $1", slug).await
    }

    async fn entry_by_name(&self, name: &str) -> Result<Option<CatalogEntry>> {
        self.entry_where("name = $1", name).await
    }

    async fn entries_for_enrichment(
        &self,
        source: CrawlSource,
        only_missing: bool,
        limit: Option<i64>,
    ) -> Result<Vec<CatalogEntry>> {
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {ENTRY_COLUMNS} FROM catalog_entries"));
        if only_missing {
            qb.push(" WHERE external_refs ->> ")
                .push_bind(source.as_str())
                .push(" IS NULL");
        }
        qb.push(" ORDER BY id");
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit.max(0));
        }
        let rows = qb.build().persistent(false).fetch_all(&self.db.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn insert_entry(&self, entry: &NewCatalogEntry) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO catalog_entries (slug, name, description_scraped, min_players, max_players, \
             release_date, year_released, publisher_id, publisher_url, external_refs) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
        )
        .persistent(false)
        .bind(&entry.slug)
        .bind(&entry.name)
        .bind(&entry.description_scraped)
        .bind(entry.min_players)
        .bind(entry.max_players)
        .bind(entry.release_date)
        .bind(entry.year_released)
        .bind(entry.publisher_id)
        .bind(&entry.publisher_url)
        .bind(Json(&entry.external_refs))
        .fetch_one(&self.db.pool)
        .await
        .with_context(|| format!("insert catalog entry {}", entry.slug))?;
        debug!(entry_id = id, slug = %entry.slug, "catalog entry inserted");
        Ok(id)
    }

    async fn update_entry(&self, id: i64, update: &EntryUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("UPDATE catalog_entries SET updated_at = now()");
        if let Some(v) = &update.description_scraped {
            qb.push(", description_scraped = ").push_bind(v.clone());
        }
        if let Some(v) = update.min_players {
            qb.push(", min_players = ").push_bind(v);
        }
        if let Some(v) = update.max_players {
            qb.push(", max_players = ").push_bind(v);
        }
        if let Some(v) = update.release_date {
            qb.push(", release_date = ").push_bind(v);
        }
        if let Some(v) = update.year_released {
            qb.push(", year_released = ").push_bind(v);
        }
        if let Some(v) = update.publisher_id {
            qb.push(", publisher_id = ").push_bind(v);
        }
        if let Some(v) = &update.publisher_url {
            qb.push(", publisher_url = ").push_bind(v.clone());
        }
        if let Some(v) = &update.external_refs {
            // jsonb `||` keeps keys written since the row was read
            qb.push(", external_refs = COALESCE(external_refs, '{}'::jsonb) || ")
                .push_bind(Json(v.clone()))
                .push("::jsonb");
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.build()
            .persistent(false)
            .execute(&self.db.pool)
            .await
            .with_context(|| format!("update catalog entry {id}"))?;
        Ok(())
    }

    async fn set_hero_if_unset(&self, entry_id: i64, asset_id: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE catalog_entries SET hero_image_id = $2, updated_at = now() \
             WHERE id = $1 AND hero_image_id IS NULL",
        )
        .persistent(false)
        .bind(entry_id)
        .bind(asset_id)
        .execute(&self.db.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn record_crawl_outcome(&self, entry_id: i64, outcome: &CrawlOutcome) -> Result<()> {
        sqlx::query(
            "UPDATE catalog_entries SET crawl_status = $2, last_crawled_at = $3, \
             last_success_at = CASE WHEN $2 = 'success' THEN $3 ELSE last_success_at END, \
             error_message = $4, updated_at = now() WHERE id = $1",
        )
        .persistent(false)
        .bind(entry_id)
        .bind(outcome.status.as_str())
        .bind(outcome.finished_at)
        .bind(&outcome.error_message)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn publisher_by_name(&self, name: &str) -> Result<Option<Publisher>> {
        let sql = format!("SELECT {PUBLISHER_COLUMNS} FROM publishers WHERE name = $1");
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(name)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(publisher_from_row).transpose()
    }

    async fn publisher_by_id(&self, id: i64) -> Result<Option<Publisher>> {
        let sql = format!("SELECT {PUBLISHER_COLUMNS} FROM publishers WHERE id = $1");
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(publisher_from_row).transpose()
    }

    async fn insert_publisher_ignore_conflict(&self, publisher: &NewPublisher) -> Result<Option<Publisher>> {
        let sql = format!(
            "INSERT INTO publishers (name, website_url, wikipedia_url) VALUES ($1, $2, $3) \
             ON CONFLICT (name) DO NOTHING RETURNING {PUBLISHER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(&publisher.name)
            .bind(&publisher.website_url)
            .bind(&publisher.wikipedia_url)
            .fetch_optional(&self.db.pool)
            .await
            .with_context(|| format!("insert publisher {}", publisher.name))?;
        row.as_ref().map(publisher_from_row).transpose()
    }

    async fn set_publisher_website(&self, id: i64, url: &str) -> Result<()> {
        sqlx::query("UPDATE publishers SET website_url = $2 WHERE id = $1")
            .persistent(false)
            .bind(id)
            .bind(url)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    async fn tag_maps(&self, source: CrawlSource) -> Result<TagMaps> {
        let categories: Vec<(String, i64)> = sqlx::query(
            "SELECT external_tag, category_id FROM external_category_map WHERE source = $1",
        )
        .persistent(false)
        .bind(source.as_str())
        .fetch_all(&self.db.pool)
        .await?
        .into_iter()
        .map(|r| (r.get::<String, _>("external_tag"), r.get::<i64, _>("category_id")))
        .collect();
        let mechanics: Vec<(String, i64)> = sqlx::query(
            "SELECT external_tag, mechanic_id FROM external_mechanic_map WHERE source = $1",
        )
        .persistent(false)
        .bind(source.as_str())
        .fetch_all(&self.db.pool)
        .await?
        .into_iter()
        .map(|r| (r.get::<String, _>("external_tag"), r.get::<i64, _>("mechanic_id")))
        .collect();
        debug!(%source, categories = categories.len(), mechanics = mechanics.len(), "tag maps loaded");
        Ok(TagMaps::from_rows(categories, mechanics))
    }

    async fn link_categories(&self, entry_id: i64, category_ids: &[i64]) -> Result<usize> {
        if category_ids.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("INSERT INTO catalog_entry_categories (catalog_entry_id, category_id) ");
        qb.push_values(category_ids.iter(), |mut b, id| {
            b.push_bind(entry_id).push_bind(*id);
        });
        qb.push(" ON CONFLICT DO NOTHING RETURNING category_id");
        let rows = qb.build().persistent(false).fetch_all(&self.db.pool).await?;
        Ok(rows.len())
    }

    async fn link_mechanics(&self, entry_id: i64, mechanic_ids: &[i64]) -> Result<usize> {
        if mechanic_ids.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("INSERT INTO catalog_entry_mechanics (catalog_entry_id, mechanic_id) ");
        qb.push_values(mechanic_ids.iter(), |mut b, id| {
            b.push_bind(entry_id).push_bind(*id);
        });
        qb.push(" ON CONFLICT DO NOTHING RETURNING mechanic_id");
        let rows = qb.build().persistent(false).fetch_all(&self.db.pool).await?;
        Ok(rows.len())
    }

    async fn media_checksums(&self, entry_id: i64) -> Result<HashSet<String>> {
        let sums: Vec<String> =
            sqlx::query_scalar("SELECT checksum FROM media_assets WHERE catalog_entry_id = $1")
                .persistent(false)
                .bind(entry_id)
                .fetch_all(&self.db.pool)
                .await?;
        Ok(sums.into_iter().collect())
    }

    async fn insert_media_asset(&self, asset: &NewMediaAsset) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO media_assets (catalog_entry_id, public_id, secure_url, width, height, format, \
             license, license_url, kind, order_index, moderated, checksum) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) RETURNING id",
        )
        .persistent(false)
        .bind(asset.catalog_entry_id)
        .bind(&asset.public_id)
        .bind(&asset.secure_url)
        .bind(asset.width)
        .bind(asset.height)
        .bind(&asset.format)
        .bind(&asset.license)
        .bind(&asset.license_url)
        .bind(asset.kind.as_str())
        .bind(asset.order_index)
        .bind(asset.moderated)
        .bind(&asset.checksum)
        .fetch_one(&self.db.pool)
        .await
        .context("insert media asset")?;
        Ok(id)
    }

    async fn insert_crawl_event(&self, event: &NewCrawlEvent) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO crawl_events (catalog_entry_id, target, source, status, severity, \
             started_at, finished_at, http_status, error_message, details) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
        )
        .persistent(false)
        .bind(event.catalog_entry_id)
        .bind(&event.target)
        .bind(event.source.as_str())
        .bind(event.status.as_str())
        .bind(event.severity.as_str())
        .bind(event.started_at)
        .bind(event.finished_at)
        .bind(event.http_status)
        .bind(&event.error_message)
        .bind(&event.details)
        .fetch_one(&self.db.pool)
        .await
        .context("insert crawl event")?;
        Ok(id)
    }
}
