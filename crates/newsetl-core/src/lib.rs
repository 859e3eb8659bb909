//! Core article record model shared by every newsetl stage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "newsetl-core";

/// Version of the [`TransformedRecord`] shape as persisted by the store.
///
/// Bump whenever a field is added, removed or changes type. The store compares
/// this against its stored marker and rebuilds the table on mismatch.
pub const SCHEMA_VERSION: i32 = 2;

/// Persisted column set, in table order. Must stay in step with [`PersistedRecord`].
pub const ARTICLE_COLUMNS: &[&str] = &[
    "id",
    "title",
    "url",
    "domain",
    "word_count",
    "title_length",
    "category",
    "is_tech",
    "processed_at",
];

/// Extract handoff: one item as seen on the source page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Tech,
    Blog,
    Video,
    Other,
}

impl Category {
    pub const ALL: [Category; 4] = [Category::Tech, Category::Blog, Category::Video, Category::Other];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Tech => "tech",
            Category::Blog => "blog",
            Category::Video => "video",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCategory(pub String);

impl fmt::Display for UnknownCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown category label `{}`", self.0)
    }
}

impl std::error::Error for UnknownCategory {}

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// Transform output. `id` is the natural key carried over from the [`RawRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformedRecord {
    pub id: String,
    pub title: String,
    pub url: String,
    pub domain: String,
    pub word_count: u32,
    pub title_length: u32,
    pub category: Category,
    pub is_tech: bool,
}

impl TransformedRecord {
    pub fn into_persisted(self, processed_at: DateTime<Utc>) -> PersistedRecord {
        PersistedRecord {
            id: self.id,
            title: self.title,
            url: self.url,
            domain: self.domain,
            word_count: self.word_count,
            title_length: self.title_length,
            category: self.category,
            is_tech: self.is_tech,
            processed_at,
        }
    }
}

/// Stored article as served by the read API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: String,
    pub title: String,
    pub url: String,
    pub domain: String,
    pub word_count: u32,
    pub title_length: u32,
    pub category: Category,
    pub is_tech: bool,
    pub processed_at: DateTime<Utc>,
}

/// First id that appears more than once in `ids`, if any.
pub fn first_duplicate_id<'a>(ids: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().find(|id| !seen.insert(*id))
}
