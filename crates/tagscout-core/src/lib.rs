//! Core domain model for tagscout: tags, media records, and the two in-memory stores
//! the discovery loop grows cycle after cycle.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tagscout-core";

/// Everything from this marker onward in a JPEG display URL is query noise.
pub const QUERY_SEPARATOR_MARKER: &str = ".jpg?";

/// CDN size-suffix marker embedded in display URL paths.
pub const SIZE_SUFFIX_MARKER: &str = "e35";

/// One observed media item keyed by the identifier derived from its display URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaRecord {
    pub identifier: String,
    pub popularity_count: u64,
}

impl MediaRecord {
    pub fn new(identifier: impl Into<String>, popularity_count: u64) -> Self {
        Self {
            identifier: identifier.into(),
            popularity_count,
        }
    }
}

/// Trim a raw tag token. Blank tokens are not tags.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Derive the natural key of a media item from its canonical display URL.
///
/// Strips everything from [`QUERY_SEPARATOR_MARKER`] onward (or from the first `?`
/// when the URL is not a `.jpg`), keeps only the text after the last
/// [`SIZE_SUFFIX_MARKER`], then takes the final path segment.
pub fn media_identifier_from_url(display_url: &str) -> Option<String> {
    let query_start = display_url
        .find(QUERY_SEPARATOR_MARKER)
        .or_else(|| display_url.find('?'))
        .unwrap_or(display_url.len());
    let without_query = &display_url[..query_start];
    let without_size = without_query
        .rsplit(SIZE_SUFFIX_MARKER)
        .next()
        .unwrap_or_default();
    let identifier = without_size.rsplit('/').next().unwrap_or_default().trim();
    if identifier.is_empty() {
        None
    } else {
        Some(identifier.to_string())
    }
}

/// Ordered, deduplicated tag vocabulary. Insertion order is first-seen order and
/// tags are never removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagRegistry {
    tags: Vec<String>,
    seen: HashSet<String>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::new();
        registry.extend(tags);
        registry
    }

    /// Append a tag if it is not already present (exact, case-sensitive match).
    /// Returns `true` when the registry grew.
    pub fn insert(&mut self, raw: &str) -> bool {
        let Some(tag) = normalize_tag(raw) else {
            return false;
        };
        if self.seen.contains(&tag) {
            return false;
        }
        self.seen.insert(tag.clone());
        self.tags.push(tag);
        true
    }

    /// Insert every tag in order, returning how many were new.
    pub fn extend<I, S>(&mut self, tags: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tags.into_iter()
            .filter(|tag| self.insert(tag.as_ref()))
            .count()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.seen.contains(tag)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.tags.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.tags
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }
}

/// Deduplicated table of observed media, one record per identifier, kept in
/// first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInventory {
    records: Vec<MediaRecord>,
    index: HashMap<String, usize>,
}

impl MediaInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an inventory from rows that may repeat identifiers; the last row wins.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = MediaRecord>,
    {
        let mut inventory = Self::new();
        for record in records {
            inventory.upsert(record);
        }
        inventory
    }

    /// Insert a record only when its identifier is unseen. Returns `true` on insert.
    pub fn insert_if_absent(&mut self, record: MediaRecord) -> bool {
        if self.index.contains_key(&record.identifier) {
            return false;
        }
        self.index
            .insert(record.identifier.clone(), self.records.len());
        self.records.push(record);
        true
    }

    /// Insert or overwrite the popularity count in place. Returns `true` on insert.
    pub fn upsert(&mut self, record: MediaRecord) -> bool {
        match self.index.get(&record.identifier) {
            Some(&position) => {
                self.records[position].popularity_count = record.popularity_count;
                false
            }
            None => self.insert_if_absent(record),
        }
    }

    pub fn get(&self, identifier: &str) -> Option<&MediaRecord> {
        self.index
            .get(identifier)
            .map(|&position| &self.records[position])
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.index.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[MediaRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &MediaRecord> {
        self.records.iter()
    }
}
