//! Merge rules shared by every source.
//!
//! An enrichable field that is already populated is never overwritten: a
//! differing value only leaves a `<field>_conflict` marker and downgrades the
//! attempt to `partial`. Empty fields are filled and listed in
//! `updatedFields`.

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::events::{CrawlSource, CrawlStatus};
use super::tags::{TagPartition, UnmappedTags};
use crate::media::{AssetService, UploadOptions};
use crate::store::{CatalogStore, ExternalRefs, MediaKind, NewMediaAsset, NewPublisher, Publisher};

#[derive(Debug, Clone, PartialEq)]
pub enum FieldMerge<T> {
    /// Extractor found nothing.
    Absent,
    Unchanged,
    Fill(T),
    Conflict,
}

pub fn merge_field<T: PartialEq + Clone>(current: Option<&T>, incoming: Option<&T>) -> FieldMerge<T> {
    match (current, incoming) {
        (_, None) => FieldMerge::Absent,
        (None, Some(new)) => FieldMerge::Fill(new.clone()),
        (Some(old), Some(new)) if old == new => FieldMerge::Unchanged,
        (Some(_), Some(_)) => FieldMerge::Conflict,
    }
}

/// Fields covered by the fill-but-never-overwrite rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichableField {
    Description,
    ReleaseDate,
    Publisher,
    MinPlayers,
    MaxPlayers,
}

impl EnrichableField {
    /// Name reported in `updatedFields`.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Description => "descriptionScraped",
            Self::ReleaseDate => "releaseDate",
            Self::Publisher => "publisherId",
            Self::MinPlayers => "minPlayers",
            Self::MaxPlayers => "maxPlayers",
        }
    }

    pub fn conflict_marker(&self) -> &'static str {
        match self {
            Self::Description => "description_conflict",
            Self::ReleaseDate => "release_date_conflict",
            Self::Publisher => "publisher_conflict",
            Self::MinPlayers => "min_players_conflict",
            Self::MaxPlayers => "max_players_conflict",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeLog {
    pub updated_fields: Vec<String>,
    pub conflicts: Vec<String>,
}

impl MergeLog {
    /// Returns the value to write, if any.
    pub fn guarded<T: PartialEq + Clone>(
        &mut self,
        field: EnrichableField,
        current: Option<&T>,
        incoming: Option<&T>,
    ) -> Option<T> {
        match merge_field(current, incoming) {
            FieldMerge::Fill(value) => {
                self.updated(field.field_name());
                Some(value)
            }
            FieldMerge::Conflict => {
                self.conflict(field.conflict_marker());
                None
            }
            FieldMerge::Absent | FieldMerge::Unchanged => None,
        }
    }

    /// Fill an empty column; a differing populated value is left alone silently.
    pub fn fill_only<T: PartialEq + Clone>(
        &mut self,
        field: &'static str,
        current: Option<&T>,
        incoming: Option<&T>,
    ) -> Option<T> {
        match merge_field(current, incoming) {
            FieldMerge::Fill(value) => {
                self.updated(field);
                Some(value)
            }
            _ => None,
        }
    }

    pub fn updated(&mut self, field: &str) {
        if !self.updated_fields.iter().any(|f| f == field) {
            self.updated_fields.push(field.to_string());
        }
    }

    pub fn conflict(&mut self, marker: &str) {
        if !self.conflicts.iter().any(|c| c == marker) {
            self.conflicts.push(marker.to_string());
        }
    }
}

/// Spread the existing refs and set this source's key. Other keys are
/// carried over whatever their JSON shape. `None` when nothing changes.
pub fn merge_external_refs(current: &ExternalRefs, source: CrawlSource, value: &str) -> Option<ExternalRefs> {
    let same = match current.get(source.as_str()) {
        Some(Value::String(s)) => s == value,
        Some(Value::Number(n)) => n.to_string() == value,
        _ => false,
    };
    if same {
        return None;
    }
    let mut merged = current.clone();
    merged.insert(source.as_str().to_string(), Value::from(value));
    Some(merged)
}

/// Find by exact name, else insert ignoring a name conflict, else re-read the
/// row a concurrent run inserted first.
pub async fn resolve_publisher(store: &dyn CatalogStore, candidate: NewPublisher) -> Result<Option<Publisher>> {
    if let Some(existing) = store.publisher_by_name(&candidate.name).await? {
        return Ok(Some(existing));
    }
    if let Some(inserted) = store.insert_publisher_ignore_conflict(&candidate).await? {
        debug!(publisher = %inserted.name, publisher_id = inserted.id, "publisher created");
        return Ok(Some(inserted));
    }
    store.publisher_by_name(&candidate.name).await
}

pub async fn link_tags(store: &dyn CatalogStore, entry_id: i64, tags: &TagPartition) -> Result<(usize, usize)> {
    let categories = store.link_categories(entry_id, &tags.category_ids).await?;
    let mechanics = store.link_mechanics(entry_id, &tags.mechanic_ids).await?;
    Ok((categories, mechanics))
}

/// Register images in extraction order, skipping checksums the entry already
/// has. The first new asset claims the hero slot only if it is empty.
pub async fn attach_media(
    store: &dyn CatalogStore,
    assets: &dyn AssetService,
    entry_id: i64,
    image_urls: &[String],
) -> Result<usize> {
    if image_urls.is_empty() {
        return Ok(0);
    }
    let mut known = store.media_checksums(entry_id).await?;
    let mut uploaded: Vec<i64> = Vec::new();
    for (index, url) in image_urls.iter().enumerate() {
        let checksum = assets.compute_checksum(url);
        if known.contains(&checksum) {
            continue;
        }
        let kind = MediaKind::for_index(index);
        let asset = match assets
            .upload_image(
                url,
                UploadOptions {
                    checksum: checksum.clone(),
                    kind,
                    moderated: false,
                },
            )
            .await
        {
            Ok(asset) => asset,
            Err(e) => {
                warn!(entry_id, url = %url, error = %e, "image upload failed; skipping");
                continue;
            }
        };
        let id = store
            .insert_media_asset(&NewMediaAsset {
                catalog_entry_id: entry_id,
                public_id: asset.public_id,
                secure_url: asset.secure_url,
                width: asset.width,
                height: asset.height,
                format: asset.format,
                license: asset.license,
                license_url: asset.license_url,
                kind: asset.kind,
                order_index: index as i32,
                moderated: asset.moderated,
                checksum: asset.checksum.clone(),
            })
            .await?;
        uploaded.push(id);
        known.insert(asset.checksum);
    }
    if let Some(first) = uploaded.first() {
        if store.set_hero_if_unset(entry_id, *first).await? {
            debug!(entry_id, asset_id = *first, "hero image assigned");
        }
    }
    Ok(uploaded.len())
}

/// Outcome of one reconcile step, before it becomes a crawl event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub entry_id: i64,
    pub created: bool,
    pub updated_fields: Vec<String>,
    pub conflicts: Vec<String>,
    pub uploaded_assets: usize,
    pub linked_categories: usize,
    pub linked_mechanics: usize,
    pub unmapped: UnmappedTags,
    /// Set when the source had nothing to match this entry against.
    pub unmatched: Option<String>,
}

impl ReconcileReport {
    pub fn for_entry(entry_id: i64) -> Self {
        Self {
            entry_id,
            ..Default::default()
        }
    }

    pub fn unmatched(entry_id: i64, message: impl Into<String>) -> Self {
        Self {
            entry_id,
            unmatched: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn absorb(&mut self, log: MergeLog) {
        for field in log.updated_fields {
            if !self.updated_fields.contains(&field) {
                self.updated_fields.push(field);
            }
        }
        for marker in log.conflicts {
            if !self.conflicts.contains(&marker) {
                self.conflicts.push(marker);
            }
        }
    }

    pub fn status(&self) -> CrawlStatus {
        if self.unmatched.is_some() || !self.conflicts.is_empty() {
            CrawlStatus::Partial
        } else {
            CrawlStatus::Success
        }
    }

    pub fn error_message(&self) -> Option<String> {
        if let Some(msg) = &self.unmatched {
            return Some(msg.clone());
        }
        (!self.conflicts.is_empty()).then(|| self.conflicts.join(","))
    }

    pub fn is_noop(&self) -> bool {
        !self.created
            && self.updated_fields.is_empty()
            && self.uploaded_assets == 0
            && self.linked_categories == 0
            && self.linked_mechanics == 0
    }

    pub fn details(&self, attempts: u32) -> Value {
        let mut details = json!({
            "created": self.created,
            "updatedFields": self.updated_fields,
            "conflicts": self.conflicts,
            "uploadedAssets": self.uploaded_assets,
            "linkedCategories": self.linked_categories,
            "linkedMechanics": self.linked_mechanics,
            "noop": self.is_noop(),
            "attempts": attempts,
        });
        if !self.unmapped.is_empty() {
            details["unmapped"] = self.unmapped.to_json();
        }
        details
    }
}
