//! BoardGameGeek XML API v2 payloads: `search` and `thing?stats=1`.

use roxmltree::{Document, Node};

use crate::crawler::error::CrawlError;

/// Fields read from a `thing` item. Player counts and the year are `None`
/// when BGG reports them as `0`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BggThing {
    pub name: Option<String>,
    pub year_published: Option<i32>,
    pub min_players: Option<i32>,
    pub max_players: Option<i32>,
    pub publishers: Vec<String>,
    pub categories: Vec<String>,
    pub mechanics: Vec<String>,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    pub image: Option<String>,
}

impl BggThing {
    /// Publishers that name a company; BGG lists placeholders such as
    /// `(Unknown)` or `(Self-Published)` in parentheses.
    pub fn named_publishers(&self) -> impl Iterator<Item = &str> {
        self.publishers
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty() && !p.starts_with('('))
    }

    /// Full image first so it is the hero candidate; the thumbnail only when it differs.
    pub fn image_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for url in [&self.image, &self.thumbnail].into_iter().flatten() {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }
}

fn child<'a, 'i>(node: Node<'a, 'i>, tag: &str) -> Option<Node<'a, 'i>> {
    node.children().find(|c| c.has_tag_name(tag))
}

fn value_of<'a>(node: Node<'a, '_>, tag: &str) -> Option<&'a str> {
    child(node, tag)?.attribute("value")
}

fn positive(node: Node<'_, '_>, tag: &str) -> Option<i32> {
    value_of(node, tag)?.trim().parse().ok().filter(|v| *v > 0)
}

fn text_of(node: Node<'_, '_>, tag: &str) -> Option<String> {
    child(node, tag)?
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Image hosts sometimes come back protocol-relative.
fn image_url(node: Node<'_, '_>, tag: &str) -> Option<String> {
    text_of(node, tag).map(|url| match url.strip_prefix("//") {
        Some(rest) => format!("https://{rest}"),
        None => url,
    })
}

/// Item id for `name`: the first result whose name matches case-insensitively,
/// else the first result. `None` when the search came back empty.
pub fn parse_search(xml: &str, name: &str) -> Result<Option<u64>, CrawlError> {
    let doc = Document::parse(xml).map_err(|e| CrawlError::parse("bgg search response", e))?;
    let wanted = name.trim().to_lowercase();
    let items: Vec<(u64, Option<&str>)> = doc
        .descendants()
        .filter(|n| n.has_tag_name("item"))
        .filter_map(|item| {
            let id = item.attribute("id")?.trim().parse().ok()?;
            Some((id, value_of(item, "name")))
        })
        .collect();
    let chosen = items
        .iter()
        .find(|(_, n)| n.is_some_and(|n| n.trim().to_lowercase() == wanted))
        .or(items.first());
    Ok(chosen.map(|(id, _)| *id))
}

/// The first item of a `thing` response; `None` when the id matched nothing.
pub fn parse_thing(xml: &str) -> Result<Option<BggThing>, CrawlError> {
    let doc = Document::parse(xml).map_err(|e| CrawlError::parse("bgg thing response", e))?;
    let Some(item) = doc.descendants().find(|n| n.has_tag_name("item")) else {
        return Ok(None);
    };

    let links = |kind: &str| -> Vec<String> {
        item.children()
            .filter(|c| c.has_tag_name("link") && c.attribute("type") == Some(kind))
            .filter_map(|c| c.attribute("value"))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    };
    let name = item
        .children()
        .find(|c| c.has_tag_name("name") && c.attribute("type") == Some("primary"))
        .and_then(|c| c.attribute("value"))
        .map(str::to_string);

    Ok(Some(BggThing {
        name,
        year_published: positive(item, "yearpublished"),
        min_players: positive(item, "minplayers"),
        max_players: positive(item, "maxplayers"),
        publishers: links("boardgamepublisher"),
        categories: links("boardgamecategory"),
        mechanics: links("boardgamemechanic"),
        description: text_of(item, "description"),
        thumbnail: image_url(item, "thumbnail"),
        image: image_url(item, "image"),
    }))
}
