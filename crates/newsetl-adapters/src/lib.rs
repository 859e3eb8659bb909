//! Extract/Transform contracts + the Hacker News extractor and rule-based article transformer.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsetl_core::{first_duplicate_id, Category, RawRecord, TransformedRecord};
use newsetl_storage::{FetchError, HttpFetcher, RetryDisposition};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsetl-adapters";

pub const DEFAULT_SOURCE_URL: &str = "https://news.ycombinator.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("source unreachable: {0}")]
    Fetch(#[from] FetchError),
    #[error("malformed source page: {0}")]
    Malformed(String),
    #[error("reading raw batch {path}: {message}")]
    Fixture { path: String, message: String },
}

impl ExtractionError {
    pub fn is_transient(&self) -> bool {
        match self {
            ExtractionError::Fetch(err) => err.disposition() == RetryDisposition::Retryable,
            ExtractionError::Malformed(_) | ExtractionError::Fixture { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransformationError {
    #[error("duplicate article id {0} in raw batch")]
    DuplicateId(String),
    #[error("article {id} has an empty title")]
    EmptyTitle { id: String },
    #[error("article {id} has an invalid url `{url}`: {reason}")]
    InvalidUrl { id: String, url: String, reason: String },
}

/// Produces a fresh raw batch on every call. Errors are never partial results.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, ctx: &ExtractContext) -> Result<Vec<RawRecord>, ExtractionError>;
}

/// Pure function of its input batch: one output per input, ids preserved, or an error.
pub trait Transformer: Send + Sync {
    fn transform(&self, raw: &[RawRecord]) -> Result<Vec<TransformedRecord>, TransformationError>;
}

/// Scrapes the front page listing (`tr.athing` rows).
pub struct HackerNewsExtractor {
    http: HttpFetcher,
    source_url: String,
}

impl HackerNewsExtractor {
    pub fn new(http: HttpFetcher, source_url: impl Into<String>) -> Self {
        Self {
            http,
            source_url: source_url.into(),
        }
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }
}

#[async_trait]
impl Extractor for HackerNewsExtractor {
    fn name(&self) -> &str {
        "hacker-news"
    }

    async fn extract(&self, ctx: &ExtractContext) -> Result<Vec<RawRecord>, ExtractionError> {
        let page = self.http.fetch_text(ctx.run_id, &self.source_url).await?;
        let records = parse_front_page(&page.body, &page.final_url)?;
        debug!(count = records.len(), url = %page.final_url, "parsed front page");
        Ok(records)
    }
}

fn selector(css: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|e| ExtractionError::Malformed(format!("selector {css}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Stable id for rows the page did not give one to.
pub fn deterministic_id_for_url(url: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes()).to_string()
}

/// Parse a front-page listing into raw records, resolving relative links against `base_url`.
///
/// A page without the listing container is malformed; a listing with no rows is an empty batch.
pub fn parse_front_page(html: &str, base_url: &str) -> Result<Vec<RawRecord>, ExtractionError> {
    let base = Url::parse(base_url)
        .map_err(|e| ExtractionError::Malformed(format!("base url {base_url}: {e}")))?;
    let document = Html::parse_document(html);
    let rows_sel = selector("tr.athing")?;
    let link_sel = selector(".titleline > a")?;
    let container_sel = selector("#hnmain")?;

    let rows = document.select(&rows_sel).collect::<Vec<ElementRef<'_>>>();
    if rows.is_empty() {
        return if document.select(&container_sel).next().is_some() {
            Ok(Vec::new())
        } else {
            Err(ExtractionError::Malformed("page has no item listing".into()))
        };
    }

    let mut out = Vec::with_capacity(rows.len());
    for (idx, row) in rows.into_iter().enumerate() {
        let link = row
            .select(&link_sel)
            .next()
            .ok_or_else(|| ExtractionError::Malformed(format!("row {idx} has no title link")))?;
        let title = text_or_none(link.text().collect::<String>())
            .ok_or_else(|| ExtractionError::Malformed(format!("row {idx} has an empty title")))?;
        let href = link
            .value()
            .attr("href")
            .and_then(|h| text_or_none(h.to_string()))
            .ok_or_else(|| ExtractionError::Malformed(format!("row {idx} has no href")))?;
        let url = base
            .join(&href)
            .map_err(|e| ExtractionError::Malformed(format!("row {idx} href {href}: {e}")))?
            .to_string();
        let id = row
            .value()
            .attr("id")
            .and_then(|v| text_or_none(v.to_string()))
            .unwrap_or_else(|| deterministic_id_for_url(&url));
        out.push(RawRecord { id, title, url });
    }
    Ok(out)
}

/// Reads a JSON array of raw records (the `raw_data.json` interchange file).
pub struct FixtureExtractor {
    path: PathBuf,
}

impl FixtureExtractor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Extractor for FixtureExtractor {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn extract(&self, _ctx: &ExtractContext) -> Result<Vec<RawRecord>, ExtractionError> {
        load_raw_batch(&self.path).map_err(|err| ExtractionError::Fixture {
            path: self.path.display().to_string(),
            message: format!("{err:#}"),
        })
    }
}

pub fn load_raw_batch(path: impl AsRef<Path>) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: Category,
    #[serde(default)]
    pub domains_any: Vec<String>,
    #[serde(default)]
    pub title_contains_any: Vec<String>,
}

/// Ordered classification rules; the first matching rule wins, otherwise `other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRules {
    pub version: u32,
    #[serde(default)]
    pub tech_keywords: Vec<String>,
    #[serde(default)]
    pub rules: Vec<CategoryRule>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for CategoryRules {
    fn default() -> Self {
        Self {
            version: 1,
            tech_keywords: strings(&[
                "rust", "python", "javascript", "typescript", "golang", "linux", "kernel", "compiler",
                "database", "postgres", "sql", "api", "cpu", "gpu", "llm", "ai", "programming",
                "software", "open source", "algorithm", "cryptography", "security", "wasm",
            ]),
            rules: vec![
                CategoryRule {
                    category: Category::Video,
                    domains_any: strings(&["youtube.com", "youtu.be", "vimeo.com", "twitch.tv"]),
                    title_contains_any: strings(&["[video]", "video"]),
                },
                CategoryRule {
                    category: Category::Tech,
                    domains_any: strings(&["github.com", "gitlab.com", "arxiv.org", "docs.rs", "lwn.net"]),
                    title_contains_any: strings(&["show hn", "rust", "linux", "compiler", "database", "llm"]),
                },
                CategoryRule {
                    category: Category::Blog,
                    domains_any: strings(&["medium.com", "substack.com", "dev.to", "wordpress.com", "blogspot.com"]),
                    title_contains_any: strings(&["blog", "my experience", "why i"]),
                },
            ],
        }
    }
}

impl CategoryRules {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn classify(&self, domain: &str, title: &TitleTerms) -> Category {
        self.rules
            .iter()
            .find(|rule| {
                rule.domains_any.iter().any(|d| domain_matches(domain, d))
                    || rule.title_contains_any.iter().any(|needle| title.mentions(needle))
            })
            .map(|rule| rule.category)
            .unwrap_or(Category::Other)
    }

    pub fn is_technical(&self, category: Category, title: &TitleTerms) -> bool {
        category == Category::Tech || self.tech_keywords.iter().any(|k| title.mentions(k))
    }
}

fn domain_matches(domain: &str, rule_domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();
    let rule_domain = rule_domain.trim().to_ascii_lowercase();
    !rule_domain.is_empty()
        && (domain == rule_domain || domain.ends_with(&format!(".{rule_domain}")))
}

/// Lowercased title plus its alphanumeric tokens, for keyword matching.
#[derive(Debug, Clone)]
pub struct TitleTerms {
    lowered: String,
    tokens: HashSet<String>,
}

impl TitleTerms {
    pub fn new(title: &str) -> Self {
        let lowered = title.to_lowercase();
        let tokens = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect();
        Self { lowered, tokens }
    }

    /// Single words match whole tokens; phrases and bracketed tags match as substrings.
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return false;
        }
        if needle.chars().all(char::is_alphanumeric) {
            self.tokens.contains(&needle)
        } else {
            self.lowered.contains(&needle)
        }
    }

    pub fn lowered(&self) -> &str {
        &self.lowered
    }
}

/// Lowercases titles, derives domain/word count/title length, classifies by rules.
#[derive(Debug, Clone, Default)]
pub struct ArticleTransformer {
    rules: CategoryRules,
}

impl ArticleTransformer {
    pub fn new(rules: CategoryRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &CategoryRules {
        &self.rules
    }

    fn transform_one(&self, raw: &RawRecord) -> Result<TransformedRecord, TransformationError> {
        let title = raw.title.trim();
        if title.is_empty() {
            return Err(TransformationError::EmptyTitle { id: raw.id.clone() });
        }
        let domain = extract_domain(&raw.url).map_err(|reason| TransformationError::InvalidUrl {
            id: raw.id.clone(),
            url: raw.url.clone(),
            reason,
        })?;
        let terms = TitleTerms::new(title);
        let category = self.rules.classify(&domain, &terms);
        let is_tech = self.rules.is_technical(category, &terms);
        let word_count = terms.lowered().split_whitespace().count();
        let title_length = terms.lowered().chars().count();

        Ok(TransformedRecord {
            id: raw.id.clone(),
            title: terms.lowered().to_string(),
            url: raw.url.clone(),
            domain,
            word_count: u32::try_from(word_count).unwrap_or(u32::MAX),
            title_length: u32::try_from(title_length).unwrap_or(u32::MAX),
            category,
            is_tech,
        })
    }
}

impl Transformer for ArticleTransformer {
    fn transform(&self, raw: &[RawRecord]) -> Result<Vec<TransformedRecord>, TransformationError> {
        if let Some(dup) = first_duplicate_id(raw.iter().map(|r| r.id.as_str())) {
            return Err(TransformationError::DuplicateId(dup.to_string()));
        }
        raw.iter().map(|r| self.transform_one(r)).collect()
    }
}

/// Network location of `url`: host, plus port when one is given explicitly.
pub fn extract_domain(url: &str) -> std::result::Result<String, String> {
    let parsed = Url::parse(url).map_err(|e| e.to_string())?;
    let host = parsed
        .host_str()
        .ok_or_else(|| "url has no host".to_string())?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
