//! Pure parsing of StartPlaying index and detail pages.
//!
//! Detail pages embed a Next.js payload whose SEO hero section carries most
//! fields; the CSS conventions (`h1`, `.description`, `.players`, `img`,
//! `.tag`, `a.publisher`) fill whatever the payload lacks.

use chrono::NaiveDate;
use itertools::Itertools;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;
use url::Url;

use crate::crawler::error::CrawlError;

static NEXT_DATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<script[^>]*id="__NEXT_DATA__"[^>]*>(.*?)</script>"#).expect("static regex")
});
static PLAY_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^/play/([a-z0-9-]+)$").expect("static regex"));
static PLAYERS_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b\d+\s*-\s*\d+\s*Players\b").expect("static regex"));
static RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*[-–]\s*(\d+)").expect("static regex"));
static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:19|20)\d{2}").expect("static regex"));
static TAG_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[•|/,]|\s{2,}").expect("static regex"));
static RELEASE_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)release").expect("static regex"));

fn selector(css: &'static str) -> Selector {
    Selector::parse(css).expect("static CSS selector is valid")
}

static H1: LazyLock<Selector> = LazyLock::new(|| selector("h1"));
static DESCRIPTION: LazyLock<Selector> = LazyLock::new(|| selector(".description"));
static PLAYERS: LazyLock<Selector> = LazyLock::new(|| selector(".players"));
static IMG: LazyLock<Selector> = LazyLock::new(|| selector("img"));
static TAG: LazyLock<Selector> = LazyLock::new(|| selector(".tag"));
static PUBLISHER_LINK: LazyLock<Selector> = LazyLock::new(|| selector("a.publisher"));
static PLAY_LINK: LazyLock<Selector> = LazyLock::new(|| selector("a[href^='/play/']"));
static TEXT_BLOCKS: LazyLock<Selector> = LazyLock::new(|| selector("span, div, p"));

const HERO_TAG_SECTIONS: [&str; 5] = ["Themes", "Tags", "Genres", "Mechanics", "Game Mechanics"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldOrigin {
    Hero,
    Dom,
    #[default]
    Missing,
}

impl fmt::Display for FieldOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hero => "hero",
            Self::Dom => "dom",
            Self::Missing => "missing",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldOrigins {
    pub name: FieldOrigin,
    pub description: FieldOrigin,
    pub players: FieldOrigin,
    pub tags: FieldOrigin,
    pub images: FieldOrigin,
    pub publisher_url: FieldOrigin,
    pub release_year: FieldOrigin,
}

/// One game system as the detail page describes it. Every optional field is
/// `None` when the page did not carry it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemDetail {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub min_players: Option<i32>,
    pub max_players: Option<i32>,
    pub image_urls: Vec<String>,
    pub tags: Vec<String>,
    pub publisher_url: Option<String>,
    pub publisher_name: Option<String>,
    pub release_year: Option<i32>,
    pub origins: FieldOrigins,
}

impl SystemDetail {
    /// Only a year is known, so the date is pinned to January 1st.
    pub fn release_date(&self) -> Option<NaiveDate> {
        self.release_year.and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1))
    }

    fn add_tags(&mut self, origin: FieldOrigin, values: impl IntoIterator<Item = String>) {
        let before = self.tags.len();
        let mut seen: HashSet<String> = self.tags.iter().cloned().collect();
        for value in values {
            let value = value.trim().to_string();
            if !value.is_empty() && seen.insert(value.clone()) {
                self.tags.push(value);
            }
        }
        if self.tags.len() > before {
            self.origins.tags = origin;
        }
    }
}

pub fn next_data(html: &str) -> Option<Value> {
    let payload = NEXT_DATA_RE.captures(html)?.get(1)?.as_str();
    match serde_json::from_str(payload) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse __NEXT_DATA__ payload");
            None
        }
    }
}

/// `props.pageProps.initialCache.*` entry typed `SeoPage`, if any.
pub fn hero_section(next_data: &Value) -> Option<&Map<String, Value>> {
    let cache = next_data
        .get("props")?
        .get("pageProps")?
        .get("initialCache")?
        .as_object()?;
    cache.values().find_map(|v| {
        if v.get("__typename")?.as_str()? == "SeoPage" {
            v.get("heroSection")?.as_object()
        } else {
            None
        }
    })
}

fn hero_metadata_items<'a>(hero: &'a Map<String, Value>, title: &str) -> Vec<&'a Map<String, Value>> {
    let wanted = title.trim().to_lowercase();
    let Some(metadata) = hero.get("metadata").and_then(Value::as_array) else {
        return Vec::new();
    };
    for meta in metadata {
        let Some(meta) = meta.as_object() else { continue };
        if meta.get("__typename").and_then(Value::as_str) != Some("SeoPageHeroSectionMetadata") {
            continue;
        }
        let meta_title = meta.get("title").and_then(Value::as_str).unwrap_or("");
        if meta_title.trim().to_lowercase() != wanted {
            continue;
        }
        return meta
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .filter(|item| {
                        item.get("__typename").and_then(Value::as_str)
                            == Some("SeoPageHeroSectionMetadataItem")
                    })
                    .collect()
            })
            .unwrap_or_default();
    }
    Vec::new()
}

fn item_text(item: &Map<String, Value>) -> Option<&str> {
    item.get("text")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Image URL from a string or from `url`/`src`/`href`, then nested
/// `image`/`sources`/`images`.
pub fn hero_image(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Object(obj) => {
            for key in ["url", "src", "href"] {
                if let Some(s) = obj.get(key).and_then(Value::as_str).map(str::trim) {
                    if !s.is_empty() {
                        return Some(s.to_string());
                    }
                }
            }
            if let Some(found) = obj.get("image").and_then(hero_image) {
                return Some(found);
            }
            ["sources", "images"].iter().find_map(|key| {
                obj.get(*key)
                    .and_then(Value::as_array)
                    .and_then(|list| list.iter().find_map(hero_image))
            })
        }
        _ => None,
    }
}

/// Resolve against `base`, keeping only http(s) results.
pub fn absolute_url(base: &Url, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let resolved = base.join(raw).ok()?;
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

pub fn parse_tag_values(raw: &str) -> Vec<String> {
    TAG_SPLIT_RE
        .split(raw)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn players_range(text: &str) -> Option<(i32, i32)> {
    let caps = RANGE_RE.captures(text)?;
    let min = caps.get(1)?.as_str().parse().ok()?;
    let max = caps.get(2)?.as_str().parse().ok()?;
    Some((min, max))
}

/// Year nearest the end of the text wins (no digits after it); otherwise the
/// first 19xx/20xx.
pub fn release_year_from_text(text: &str) -> Option<i32> {
    let found: Vec<_> = YEAR_RE.find_iter(text).collect();
    let last = found.last()?;
    if !text[last.end()..].bytes().any(|b| b.is_ascii_digit()) {
        return last.as_str().parse().ok();
    }
    found.first()?.as_str().parse().ok()
}

fn release_year_from_items(items: &[&Map<String, Value>]) -> Option<i32> {
    let mut fallback = None;
    for text in items.iter().filter_map(|i| item_text(i)) {
        let found: Vec<_> = YEAR_RE.find_iter(text).collect();
        if let Some(last) = found.last() {
            if !text[last.end()..].bytes().any(|b| b.is_ascii_digit()) {
                return last.as_str().parse().ok();
            }
        }
        if fallback.is_none() {
            fallback = found.first().and_then(|m| m.as_str().parse().ok());
        }
    }
    fallback
}

/// ASCII-only slug: lowercase alphanumerics joined by single dashes, at most 80 chars.
pub fn slugify(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    let cut: String = trimmed.chars().take(80).collect();
    cut.trim_end_matches('-').to_string()
}

/// Last non-empty path segment, lowercased.
pub fn slug_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_text(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .next()
        .map(element_text)
        .filter(|s| !s.is_empty())
}

fn collect_play_links(value: &Value, base: &Url, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Some(caps) = PLAY_PATH_RE.captures(s) {
                let slug = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
                if !slug.starts_with("game-systems") {
                    if let Some(abs) = absolute_url(base, s) {
                        out.push(abs);
                    }
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_play_links(v, base, out)),
        Value::Object(map) => map.values().for_each(|v| collect_play_links(v, base, out)),
        _ => {}
    }
}

fn dedup_preserving_order(links: Vec<String>) -> Vec<String> {
    links.into_iter().unique().collect()
}

/// Detail-page links from the game-systems index, absolute and deduplicated.
pub fn parse_index_page(html: &str, base: &Url) -> Vec<String> {
    let doc = Html::parse_document(html);
    let mut links: Vec<String> = doc
        .select(&PLAY_LINK)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| !href.starts_with("/play/game-systems"))
        .filter_map(|href| absolute_url(base, href))
        .collect();
    if links.is_empty() {
        if let Some(data) = next_data(html) {
            collect_play_links(&data, base, &mut links);
            if !links.is_empty() {
                tracing::info!(count = links.len(), "recovered links via __NEXT_DATA__ traversal");
            }
        }
    }
    dedup_preserving_order(links)
}

/// Persisted `GetSeoPages` query listing game-system SEO pages, most games first.
pub fn seo_pages_request() -> Value {
    json!({
        "operationName": "GetSeoPages",
        "variables": {
            "includeSeoPage": true,
            "seoPageFilter": {
                "seoEntityPrimary": { "slug": { "eq": "game-systems" } },
                "seoEntitySecondary": null
            },
            "filter": {
                "seoEntityPrimary": { "type": { "eq": "GAME_SYSTEM" } },
                "seoEntitySecondary": null
            },
            "sort": { "key": "gameCount", "sortOrder": "DESCENDING" },
            "limit": 500
        },
        "extensions": {
            "persistedQuery": {
                "version": 1,
                "sha256Hash": "8c89dfb373162dd4c01a622975a4d35df0c84158a4dc3884dc98e9a34dc9df4c"
            }
        }
    })
}

/// Detail links from a `GetSeoPages` response. Canonical paths are put under
/// `/play/` when they are not already.
pub fn parse_seo_page_links(body: &str, base: &Url) -> Result<Vec<String>, CrawlError> {
    let data: Value = serde_json::from_str(body).map_err(|e| CrawlError::parse("seo pages response", e))?;
    let edges = data
        .pointer("/data/seoPages/edges")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let links = edges
        .iter()
        .filter_map(|edge| edge.pointer("/node/canonicalUrl").and_then(Value::as_str))
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(|path| {
            if path.starts_with("/play/") {
                path.to_string()
            } else {
                format!("/play/{}", path.trim_start_matches('/'))
            }
        })
        .filter_map(|path| absolute_url(base, &path))
        .collect();
    Ok(dedup_preserving_order(links))
}

fn apply_hero(detail: &mut SystemDetail, hero: &Map<String, Value>, base: &Url) {
    if let Some(title) = hero.get("title").and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty()) {
        detail.name = title.to_string();
        detail.origins.name = FieldOrigin::Hero;
    }
    if let Some(desc) = hero
        .get("descriptionPrimary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        detail.description = Some(desc.to_string());
        detail.origins.description = FieldOrigin::Hero;
    }
    if let Some(img) = hero.get("image").and_then(hero_image) {
        detail.image_urls = vec![img];
        detail.origins.images = FieldOrigin::Hero;
    }

    let details_items = hero_metadata_items(hero, "Details");
    if let Some((min, max)) = details_items
        .iter()
        .filter_map(|i| item_text(i))
        .find(|t| PLAYERS_LABEL_RE.is_match(t))
        .and_then(players_range)
    {
        detail.min_players = Some(min);
        detail.max_players = Some(max);
        detail.origins.players = FieldOrigin::Hero;
    }
    let detail_tags: Vec<String> = details_items
        .iter()
        .filter_map(|i| item_text(i))
        .filter(|t| !PLAYERS_LABEL_RE.is_match(t))
        .flat_map(parse_tag_values)
        .collect();
    detail.add_tags(FieldOrigin::Hero, detail_tags);

    for title in HERO_TAG_SECTIONS {
        let heading = title.to_lowercase();
        let values: Vec<String> = hero_metadata_items(hero, title)
            .iter()
            .filter_map(|i| item_text(i))
            .flat_map(parse_tag_values)
            .filter(|v| v.to_lowercase() != heading)
            .collect();
        detail.add_tags(FieldOrigin::Hero, values);
    }

    let publisher = hero_metadata_items(hero, "Publisher").into_iter().find_map(|item| {
        let name = item_text(item)?;
        let url = item.get("url").and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())?;
        Some((name.to_string(), url.to_string()))
    });
    if let Some((name, url)) = publisher {
        detail.publisher_name = Some(name);
        if let Some(abs) = absolute_url(base, &url) {
            detail.publisher_url = Some(abs);
            detail.origins.publisher_url = FieldOrigin::Hero;
        }
    }

    if let Some(year) = release_year_from_items(&hero_metadata_items(hero, "Release Date")) {
        detail.release_year = Some(year);
        detail.origins.release_year = FieldOrigin::Hero;
    }
}

fn apply_dom(detail: &mut SystemDetail, doc: &Html, base: &Url) {
    if detail.name.is_empty() {
        if let Some(name) = first_text(doc, &H1) {
            detail.name = name;
            detail.origins.name = FieldOrigin::Dom;
        }
    }
    if detail.description.is_none() {
        if let Some(desc) = first_text(doc, &DESCRIPTION) {
            detail.description = Some(desc);
            detail.origins.description = FieldOrigin::Dom;
        }
    }
    if detail.min_players.is_none() && detail.max_players.is_none() {
        if let Some((min, max)) = first_text(doc, &PLAYERS).as_deref().and_then(players_range) {
            detail.min_players = Some(min);
            detail.max_players = Some(max);
            detail.origins.players = FieldOrigin::Dom;
        }
    }
    if detail.image_urls.is_empty() {
        let images: Vec<String> = doc
            .select(&IMG)
            .filter_map(|img| img.value().attr("src"))
            .map(str::trim)
            .filter(|src| {
                let lower = src.to_ascii_lowercase();
                lower.starts_with("http:") || lower.starts_with("https:")
            })
            .map(str::to_string)
            .collect();
        let images = dedup_preserving_order(images);
        if !images.is_empty() {
            detail.image_urls = images;
            detail.origins.images = FieldOrigin::Dom;
        }
    }
    let dom_tags: Vec<String> = doc
        .select(&TAG)
        .map(element_text)
        .flat_map(|t| parse_tag_values(&t))
        .collect();
    detail.add_tags(FieldOrigin::Dom, dom_tags);

    if detail.publisher_name.is_none() || detail.publisher_url.is_none() {
        if let Some(a) = doc.select(&PUBLISHER_LINK).next() {
            let name = element_text(a);
            if detail.publisher_name.is_none() && !name.is_empty() {
                detail.publisher_name = Some(name);
            }
            if detail.publisher_url.is_none() {
                if let Some(abs) = a.value().attr("href").and_then(|h| absolute_url(base, h)) {
                    detail.publisher_url = Some(abs);
                    detail.origins.publisher_url = FieldOrigin::Dom;
                }
            }
        }
    }

    if detail.release_year.is_none() {
        // innermost block mentioning a release and a year
        let year = doc
            .select(&TEXT_BLOCKS)
            .map(element_text)
            .filter(|t| RELEASE_WORD_RE.is_match(t) && YEAR_RE.is_match(t))
            .min_by_key(|t| t.len())
            .and_then(|t| release_year_from_text(&t));
        if let Some(year) = year {
            detail.release_year = Some(year);
            detail.origins.release_year = FieldOrigin::Dom;
        }
    }
}

pub fn parse_detail_page(html: &str, url: &str) -> Result<SystemDetail, CrawlError> {
    let base = Url::parse(url).map_err(|e| CrawlError::parse("detail url", e))?;
    let mut detail = SystemDetail::default();

    if let Some(data) = next_data(html) {
        if let Some(hero) = hero_section(&data) {
            apply_hero(&mut detail, hero, &base);
        }
    }
    let doc = Html::parse_document(html);
    apply_dom(&mut detail, &doc, &base);

    let url_slug = slug_from_url(url);
    if detail.name.is_empty() {
        detail.name = url_slug.clone().unwrap_or_default();
    }
    detail.slug = url_slug.unwrap_or_else(|| slugify(&detail.name));
    if detail.slug.is_empty() {
        return Err(CrawlError::parse("detail page", format!("no slug or name for {url}")));
    }
    Ok(detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://startplaying.games/play/game-systems").unwrap()
    }

    fn hero_page() -> String {
        let payload = serde_json::json!({
            "props": {"pageProps": {"initialCache": {
                "SeoPage:1": {
                    "__typename": "SeoPage",
                    "heroSection": {
                        "title": "Blades in the Dark",
                        "descriptionPrimary": "  Daring scoundrels in a haunted city. ",
                        "image": {"sources": [{"src": "https://cdn.sp.games/blades.jpg"}]},
                        "metadata": [
                            {"__typename": "SeoPageHeroSectionMetadata", "title": "Details", "items": [
                                {"__typename": "SeoPageHeroSectionMetadataItem", "text": "2-6 Players"},
                                {"__typename": "SeoPageHeroSectionMetadataItem", "text": "Heist • Dark Fantasy"}
                            ]},
                            {"__typename": "SeoPageHeroSectionMetadata", "title": "Themes", "items": [
                                {"__typename": "SeoPageHeroSectionMetadataItem", "text": "Themes"},
                                {"__typename": "SeoPageHeroSectionMetadataItem", "text": "Horror / Heist"}
                            ]},
                            {"__typename": "SeoPageHeroSectionMetadata", "title": "Publisher", "items": [
                                {"__typename": "SeoPageHeroSectionMetadataItem", "text": "Evil Hat", "url": "/publishers/evil-hat"}
                            ]},
                            {"__typename": "SeoPageHeroSectionMetadata", "title": "Release Date", "items": [
                                {"__typename": "SeoPageHeroSectionMetadataItem", "text": "First printed 2015, reissued 2017"}
                            ]}
                        ]
                    }
                }
            }}}
        });
        format!(
            r#"<html><head><script id="__NEXT_DATA__" type="application/json">{payload}</script></head>
            <body><h1>Ignored Title</h1><div class="description">DOM description</div></body></html>"#
        )
    }

    #[test]
    fn hero_section_is_preferred() {
        let d = parse_detail_page(&hero_page(), "https://startplaying.games/play/Blades-In-The-Dark").unwrap();
        assert_eq!(d.slug, "blades-in-the-dark");
        assert_eq!(d.name, "Blades in the Dark");
        assert_eq!(d.description.as_deref(), Some("Daring scoundrels in a haunted city."));
        assert_eq!((d.min_players, d.max_players), (Some(2), Some(6)));
        assert_eq!(d.image_urls, vec!["https://cdn.sp.games/blades.jpg"]);
        assert_eq!(d.tags, vec!["Heist", "Dark Fantasy", "Horror"]);
        assert_eq!(d.publisher_name.as_deref(), Some("Evil Hat"));
        assert_eq!(d.publisher_url.as_deref(), Some("https://startplaying.games/publishers/evil-hat"));
        assert_eq!(d.release_year, Some(2017));
        assert_eq!(d.release_date(), NaiveDate::from_ymd_opt(2017, 1, 1));
        assert_eq!(d.origins.name, FieldOrigin::Hero);
        assert_eq!(d.origins.tags, FieldOrigin::Hero);
    }

    #[test]
    fn css_conventions_fill_missing_fields() {
        let html = r#"<html><body>
            <h1> Mothership </h1>
            <p class="description">Sci-fi horror.</p>
            <span class="players">1 - 5 players</span>
            <img src="https://cdn.example.com/m1.png"><img src="/relative.png"><img src="https://cdn.example.com/m1.png">
            <span class="tag">Horror</span><span class="tag">Sci-Fi, Survival</span>
            <a class="publisher" href="https://tuesdayknightgames.com">Tuesday Knight Games</a>
            <div><span>Release: 2018</span></div>
        </body></html>"#;
        let d = parse_detail_page(html, "https://startplaying.games/play/mothership").unwrap();
        assert_eq!(d.name, "Mothership");
        assert_eq!(d.description.as_deref(), Some("Sci-fi horror."));
        assert_eq!((d.min_players, d.max_players), (Some(1), Some(5)));
        assert_eq!(d.image_urls, vec!["https://cdn.example.com/m1.png"]);
        assert_eq!(d.tags, vec!["Horror", "Sci-Fi", "Survival"]);
        assert_eq!(d.publisher_url.as_deref(), Some("https://tuesdayknightgames.com/"));
        assert_eq!(d.publisher_name.as_deref(), Some("Tuesday Knight Games"));
        assert_eq!(d.release_year, Some(2018));
        assert_eq!(d.origins.images, FieldOrigin::Dom);
    }

    #[test]
    fn absent_fields_stay_none() {
        let d = parse_detail_page("<html><body></body></html>", "https://startplaying.games/play/cairn").unwrap();
        assert_eq!(d.name, "cairn");
        assert!(d.description.is_none());
        assert!(d.min_players.is_none() && d.max_players.is_none());
        assert!(d.publisher_url.is_none());
        assert!(d.release_year.is_none());
        assert!(d.tags.is_empty() && d.image_urls.is_empty());
        assert_eq!(d.origins.description, FieldOrigin::Missing);
    }

    #[test]
    fn index_links_are_absolute_and_deduplicated() {
        let html = r#"<a href="/play/game-systems">all</a><a href="/play/game-systems?page=2">next</a>
            <a href="/play/dnd-5e">D&D</a><a href="/play/pathfinder-2e">PF2</a><a href="/play/dnd-5e">again</a>"#;
        assert_eq!(
            parse_index_page(html, &base()),
            vec![
                "https://startplaying.games/play/dnd-5e",
                "https://startplaying.games/play/pathfinder-2e"
            ]
        );
    }

    #[test]
    fn index_falls_back_to_next_data_traversal() {
        let payload = serde_json::json!({"props": {"links": ["/play/call-of-cthulhu", "/play/game-systems-x", {"href": "/play/cypher"}, "/elsewhere"]}});
        let html = format!(r#"<script id="__NEXT_DATA__" type="application/json">{payload}</script>"#);
        assert_eq!(
            parse_index_page(&html, &base()),
            vec![
                "https://startplaying.games/play/call-of-cthulhu",
                "https://startplaying.games/play/cypher"
            ]
        );
    }

    #[test]
    fn seo_pages_become_play_links() {
        let body = json!({
            "data": { "seoPages": { "edges": [
                { "node": { "canonicalUrl": "/play/mothership" } },
                { "node": { "canonicalUrl": "blades-in-the-dark" } },
                { "node": { "canonicalUrl": "/cairn" } },
                { "node": {} },
                { "node": { "canonicalUrl": "/play/mothership" } }
            ] } }
        })
        .to_string();
        let links = parse_seo_page_links(&body, &base()).unwrap();
        assert_eq!(
            links,
            vec![
                "https://startplaying.games/play/mothership",
                "https://startplaying.games/play/blades-in-the-dark",
                "https://startplaying.games/play/cairn",
            ]
        );
        assert!(parse_seo_page_links(r#"{"data":null}"#, &base()).unwrap().is_empty());
        assert!(parse_seo_page_links("<html>", &base()).is_err());
        assert_eq!(seo_pages_request()["operationName"], "GetSeoPages");
    }

    #[test]
    fn small_helpers() {
        assert_eq!(parse_tag_values("A • B | C/D,  E   F"), vec!["A", "B", "C", "D", "E", "F"]);
        assert_eq!(players_range("3–7 players"), Some((3, 7)));
        assert_eq!(players_range("solo"), None);
        assert_eq!(release_year_from_text("Released 1999 (2nd ed. 2004)"), Some(2004));
        assert_eq!(release_year_from_text("1999 edition, 3 books"), Some(1999));
        assert_eq!(release_year_from_text("unknown"), None);
        assert_eq!(slugify("  Vampire: The Masquerade (5th) "), "vampire-the-masquerade-5th");
        assert_eq!(slugify(&"x".repeat(100)).len(), 80);
        assert_eq!(slug_from_url("https://startplaying.games/play/Dnd-5e/").as_deref(), Some("dnd-5e"));
        assert_eq!(
            hero_image(&serde_json::json!({"image": {"url": " https://a/b.png "}})).as_deref(),
            Some("https://a/b.png")
        );
        assert_eq!(absolute_url(&base(), "mailto:x@y.z"), None);
    }
}
