use itertools::Itertools;
use std::collections::{BTreeMap, HashMap};

/// External tag (lowercased) to internal id, for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMaps {
    pub categories: HashMap<String, i64>,
    pub mechanics: HashMap<String, i64>,
}

impl TagMaps {
    pub fn from_rows(
        categories: impl IntoIterator<Item = (String, i64)>,
        mechanics: impl IntoIterator<Item = (String, i64)>,
    ) -> Self {
        Self {
            categories: categories
                .into_iter()
                .map(|(tag, id)| (tag.to_lowercase(), id))
                .collect(),
            mechanics: mechanics
                .into_iter()
                .map(|(tag, id)| (tag.to_lowercase(), id))
                .collect(),
        }
    }
}

/// Counts of tags that matched no mapping, keyed by lowercased tag text.
///
/// Kept per run and handed back to the caller; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnmappedTags(BTreeMap<String, u32>);

impl UnmappedTags {
    pub fn record(&mut self, tag: &str) {
        *self.0.entry(tag.to_string()).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &UnmappedTags) {
        for (tag, count) in &other.0 {
            *self.0.entry(tag.clone()).or_insert(0) += count;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }

    pub fn get(&self, tag: &str) -> u32 {
        self.0.get(tag).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Most frequent first, for the end-of-run warning.
    pub fn top(&self, n: usize) -> Vec<(&str, u32)> {
        self.iter()
            .sorted_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)))
            .take(n)
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.0).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagPartition {
    pub category_ids: Vec<i64>,
    pub mechanic_ids: Vec<i64>,
    pub unmapped: UnmappedTags,
}

impl TagPartition {
    pub fn matched(&self) -> usize {
        self.category_ids.len() + self.mechanic_ids.len()
    }
}

/// Every tag lands in exactly one bucket; category mappings win over
/// mechanic mappings for the same text.
pub fn partition_tags(tags: &[String], maps: &TagMaps) -> TagPartition {
    let mut out = TagPartition::default();
    for raw in tags {
        let tag = raw.to_lowercase();
        if let Some(id) = maps.categories.get(&tag) {
            out.category_ids.push(*id);
        } else if let Some(id) = maps.mechanics.get(&tag) {
            out.mechanic_ids.push(*id);
        } else {
            out.unmapped.record(&tag);
        }
    }
    out
}

/// For sources that already type their tags: a category only consults the
/// category map and a mechanic only the mechanic map.
pub fn partition_typed_tags(categories: &[String], mechanics: &[String], maps: &TagMaps) -> TagPartition {
    let mut out = TagPartition::default();
    for raw in categories {
        let tag = raw.to_lowercase();
        match maps.categories.get(&tag) {
            Some(id) => out.category_ids.push(*id),
            None => out.unmapped.record(&tag),
        }
    }
    for raw in mechanics {
        let tag = raw.to_lowercase();
        match maps.mechanics.get(&tag) {
            Some(id) => out.mechanic_ids.push(*id),
            None => out.unmapped.record(&tag),
        }
    }
    out
}
