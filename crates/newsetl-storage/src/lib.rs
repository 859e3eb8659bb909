//! Article record store, per-run batch archive and HTTP fetch utilities for newsetl.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsetl_core::{Category, PersistedRecord};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsetl-storage";

pub const NAMESPACE: &str = "etl_data";
pub const ARTICLES_TABLE: &str = "articles";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("schema setup failed: {0}")]
    Schema(#[source] sqlx::Error),
    #[error("table etl_data.articles does not exist; run ensure_schema first")]
    MissingTable,
    #[error("write rejected for article {id}: {source}")]
    Write {
        id: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("write rejected for article {id}: {reason}")]
    Rejected { id: String, reason: String },
    #[error("read failed: {0}")]
    Read(#[source] sqlx::Error),
    #[error("stored row {id} is not a valid article: {reason}")]
    Decode { id: String, reason: String },
}

impl StoreError {
    /// Connection-level failures that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Connection(_) | StoreError::Unavailable(_) => true,
            StoreError::Schema(err) | StoreError::Read(err) | StoreError::Write { source: err, .. } => {
                sqlx_is_transient(err)
            }
            StoreError::MissingTable | StoreError::Rejected { .. } | StoreError::Decode { .. } => false,
        }
    }
}

fn sqlx_is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOutcome {
    /// Marker matched and the table was present; nothing touched.
    Unchanged,
    /// No prior table; created fresh.
    Created,
    /// Marker differed; the table was dropped and recreated empty.
    Rebuilt { from: Option<i32> },
}

/// Result of applying a batch of upserts one record at a time.
///
/// The batch stops at the first failed write. Records before it stay written.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub applied: usize,
    pub not_attempted: usize,
    pub first_error: Option<StoreError>,
}

impl BatchOutcome {
    pub fn failed(&self) -> usize {
        usize::from(self.first_error.is_some())
    }

    pub fn is_complete(&self) -> bool {
        self.first_error.is_none()
    }
}

/// Storage contract for persisted articles.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn RecordStore>`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Make sure the namespace and table exist for `version`.
    ///
    /// Rebuilds the table only when the stored version marker differs.
    async fn ensure_schema(&self, version: i32) -> Result<SchemaOutcome, StoreError>;

    /// Insert or overwrite one article keyed by id. Atomic per record.
    async fn upsert(&self, record: &PersistedRecord) -> Result<(), StoreError>;

    /// Not transactional across records.
    async fn upsert_batch(&self, records: &[PersistedRecord]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for (idx, record) in records.iter().enumerate() {
            match self.upsert(record).await {
                Ok(()) => outcome.applied += 1,
                Err(err) => {
                    outcome.not_attempted = records.len() - idx - 1;
                    outcome.first_error = Some(err);
                    break;
                }
            }
        }
        outcome
    }

    async fn read_all(&self) -> Result<Vec<PersistedRecord>, StoreError>;
}

const CREATE_NAMESPACE: &str = "CREATE SCHEMA IF NOT EXISTS etl_data";

const CREATE_SCHEMA_META: &str = r#"
CREATE TABLE IF NOT EXISTS etl_data.schema_meta (
    table_name TEXT PRIMARY KEY,
    version INTEGER NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const SELECT_VERSION: &str = "SELECT version FROM etl_data.schema_meta WHERE table_name = $1";

const ARTICLES_EXISTS: &str = "SELECT to_regclass('etl_data.articles') IS NOT NULL";

const DROP_ARTICLES: &str = "DROP TABLE IF EXISTS etl_data.articles";

const CREATE_ARTICLES: &str = r#"
CREATE TABLE IF NOT EXISTS etl_data.articles (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    url TEXT NOT NULL,
    domain TEXT NOT NULL,
    word_count BIGINT NOT NULL,
    title_length BIGINT NOT NULL,
    category TEXT NOT NULL,
    is_tech BOOLEAN NOT NULL,
    processed_at TIMESTAMPTZ NOT NULL
)
"#;

const UPSERT_VERSION: &str = r#"
INSERT INTO etl_data.schema_meta (table_name, version, updated_at)
VALUES ($1, $2, NOW())
ON CONFLICT (table_name)
DO UPDATE SET version = EXCLUDED.version, updated_at = EXCLUDED.updated_at
"#;

const UPSERT_ARTICLE: &str = r#"
INSERT INTO etl_data.articles
    (id, title, url, domain, word_count, title_length, category, is_tech, processed_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
ON CONFLICT (id) DO UPDATE SET
    title = EXCLUDED.title,
    url = EXCLUDED.url,
    domain = EXCLUDED.domain,
    word_count = EXCLUDED.word_count,
    title_length = EXCLUDED.title_length,
    category = EXCLUDED.category,
    is_tech = EXCLUDED.is_tech,
    processed_at = EXCLUDED.processed_at
"#;

const SELECT_ARTICLES: &str = r#"
SELECT id, title, url, domain, word_count, title_length, category, is_tech, processed_at
  FROM etl_data.articles
 ORDER BY processed_at DESC, id
"#;

#[derive(Debug, sqlx::FromRow)]
struct ArticleRow {
    id: String,
    title: String,
    url: String,
    domain: String,
    word_count: i64,
    title_length: i64,
    category: String,
    is_tech: bool,
    processed_at: DateTime<Utc>,
}

impl TryFrom<ArticleRow> for PersistedRecord {
    type Error = StoreError;

    fn try_from(row: ArticleRow) -> Result<Self, Self::Error> {
        let decode = |reason: String| StoreError::Decode {
            id: row.id.clone(),
            reason,
        };
        let word_count = u32::try_from(row.word_count)
            .map_err(|_| decode(format!("word_count {} out of range", row.word_count)))?;
        let title_length = u32::try_from(row.title_length)
            .map_err(|_| decode(format!("title_length {} out of range", row.title_length)))?;
        let category = row
            .category
            .parse::<Category>()
            .map_err(|err| decode(err.to_string()))?;
        Ok(PersistedRecord {
            id: row.id,
            title: row.title,
            url: row.url,
            domain: row.domain,
            word_count,
            title_length,
            category,
            is_tech: row.is_tech,
            processed_at: row.processed_at,
        })
    }
}

/// Postgres-backed article store (`etl_data.articles`).
///
/// Schema changes take the write half of an in-process lock; upserts and
/// reads take the read half, so a rebuild never interleaves with a write.
#[derive(Debug)]
pub struct PgRecordStore {
    pool: PgPool,
    schema_lock: RwLock<()>,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(StoreError::Connection)?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_lock: RwLock::new(()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn ensure_schema(&self, version: i32) -> Result<SchemaOutcome, StoreError> {
        let _exclusive = self.schema_lock.write().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::Connection)?;

        sqlx::query(CREATE_NAMESPACE)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Schema)?;
        sqlx::query(CREATE_SCHEMA_META)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Schema)?;

        let current: Option<i32> = sqlx::query_scalar(SELECT_VERSION)
            .bind(ARTICLES_TABLE)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::Schema)?;
        let table_exists: bool = sqlx::query_scalar(ARTICLES_EXISTS)
            .fetch_one(&mut *tx)
            .await
            .map_err(StoreError::Schema)?;

        let outcome = match (current, table_exists) {
            (Some(v), true) if v == version => SchemaOutcome::Unchanged,
            (Some(v), false) if v == version => SchemaOutcome::Created,
            (None, false) => SchemaOutcome::Created,
            (from, _) => SchemaOutcome::Rebuilt { from },
        };

        if outcome != SchemaOutcome::Unchanged {
            if matches!(outcome, SchemaOutcome::Rebuilt { .. }) {
                sqlx::query(DROP_ARTICLES)
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::Schema)?;
            }
            sqlx::query(CREATE_ARTICLES)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Schema)?;
            sqlx::query(UPSERT_VERSION)
                .bind(ARTICLES_TABLE)
                .bind(version)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Schema)?;
        }

        tx.commit().await.map_err(StoreError::Schema)?;
        match outcome {
            SchemaOutcome::Unchanged => info!(version, "article schema up to date"),
            SchemaOutcome::Created => info!(version, "created article table"),
            SchemaOutcome::Rebuilt { from } => {
                warn!(version, ?from, "schema version changed; article table rebuilt empty")
            }
        }
        Ok(outcome)
    }

    async fn upsert(&self, record: &PersistedRecord) -> Result<(), StoreError> {
        let _shared = self.schema_lock.read().await;
        sqlx::query(UPSERT_ARTICLE)
            .bind(&record.id)
            .bind(&record.title)
            .bind(&record.url)
            .bind(&record.domain)
            .bind(i64::from(record.word_count))
            .bind(i64::from(record.title_length))
            .bind(record.category.as_str())
            .bind(record.is_tech)
            .bind(record.processed_at)
            .execute(&self.pool)
            .await
            .map_err(|source| StoreError::Write {
                id: record.id.clone(),
                source,
            })?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<PersistedRecord>, StoreError> {
        let _shared = self.schema_lock.read().await;
        let rows = sqlx::query_as::<_, ArticleRow>(SELECT_ARTICLES)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Read)?;
        rows.into_iter().map(PersistedRecord::try_from).collect()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    version: Option<i32>,
    table: Option<BTreeMap<String, PersistedRecord>>,
    failing_ids: HashSet<String>,
    unavailable: bool,
    writes: usize,
}

/// In-process store with the same version-marker semantics as [`PgRecordStore`].
///
/// Used for local runs without Postgres and as the test double for the pipeline.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: RwLock<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later write of `id` fail with [`StoreError::Rejected`].
    pub async fn fail_writes_for(&self, id: impl Into<String>) {
        self.state.write().await.failing_ids.insert(id.into());
    }

    pub async fn clear_write_failures(&self) {
        self.state.write().await.failing_ids.clear();
    }

    /// Simulate a lost connection for every operation.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    /// Successful upserts since creation.
    pub async fn write_count(&self) -> usize {
        self.state.read().await.writes
    }

    pub async fn schema_version(&self) -> Option<i32> {
        self.state.read().await.version
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn ensure_schema(&self, version: i32) -> Result<SchemaOutcome, StoreError> {
        let mut state = self.state.write().await;
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        let outcome = match (state.version, state.table.is_some()) {
            (Some(v), true) if v == version => SchemaOutcome::Unchanged,
            (Some(v), false) if v == version => SchemaOutcome::Created,
            (None, false) => SchemaOutcome::Created,
            (from, _) => SchemaOutcome::Rebuilt { from },
        };
        if outcome != SchemaOutcome::Unchanged {
            state.table = Some(BTreeMap::new());
        }
        state.version = Some(version);
        Ok(outcome)
    }

    async fn upsert(&self, record: &PersistedRecord) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        if state.failing_ids.contains(&record.id) {
            return Err(StoreError::Rejected {
                id: record.id.clone(),
                reason: "write rejected by store".into(),
            });
        }
        let table = state.table.as_mut().ok_or(StoreError::MissingTable)?;
        table.insert(record.id.clone(), record.clone());
        state.writes += 1;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<PersistedRecord>, StoreError> {
        let state = self.state.read().await;
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        let table = state.table.as_ref().ok_or(StoreError::MissingTable)?;
        let mut rows = table.values().cloned().collect::<Vec<_>>();
        rows.sort_by(|a, b| b.processed_at.cmp(&a.processed_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchivedBatch {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Per-run copies of the raw and transformed batches, one directory per run id.
#[derive(Debug, Clone)]
pub struct RunArchive {
    root: PathBuf,
}

impl RunArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn batch_relative_path(&self, run_id: Uuid, name: &str) -> PathBuf {
        let name = name.trim_end_matches(".json").trim();
        let name = if name.is_empty() { "batch" } else { name };
        PathBuf::from(run_id.to_string()).join(format!("{name}.json"))
    }

    /// Serialize `value` as pretty JSON and publish it with a temp-file rename.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        run_id: Uuid,
        name: &str,
        value: &T,
    ) -> anyhow::Result<ArchivedBatch> {
        let bytes = serde_json::to_vec_pretty(value).with_context(|| format!("serializing {name}"))?;
        let relative_path = self.batch_relative_path(run_id, name);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp archive {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(ArchivedBatch {
            content_hash: Self::sha256_hex(&bytes),
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Capped exponential backoff shared by HTTP fetches and stage retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url` as text, retrying 5xx/429 and transport errors with backoff.
    pub async fn fetch_text(&self, run_id: Uuid, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_text_inner(url).instrument(span).await
    }

    async fn fetch_text_inner(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying fetch after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying fetch after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use newsetl_core::{TransformedRecord, ARTICLE_COLUMNS, SCHEMA_VERSION};
    use tempfile::tempdir;

    fn record(id: &str, title: &str) -> PersistedRecord {
        TransformedRecord {
            id: id.to_string(),
            title: title.to_string(),
            url: format!("https://example.com/{id}"),
            domain: "example.com".into(),
            word_count: title.split_whitespace().count() as u32,
            title_length: title.chars().count() as u32,
            category: Category::Other,
            is_tech: false,
        }
        .into_persisted(Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).single().unwrap())
    }

    #[test]
    fn sql_covers_every_article_column() {
        for column in ARTICLE_COLUMNS {
            assert!(CREATE_ARTICLES.contains(column), "CREATE missing {column}");
            assert!(UPSERT_ARTICLE.contains(column), "UPSERT missing {column}");
            assert!(SELECT_ARTICLES.contains(column), "SELECT missing {column}");
        }
    }

    #[tokio::test]
    async fn ensure_schema_creates_then_is_a_noop_for_same_version() {
        let store = MemoryRecordStore::new();
        assert_eq!(store.ensure_schema(SCHEMA_VERSION).await.unwrap(), SchemaOutcome::Created);
        store.upsert(&record("a", "kept across restarts")).await.unwrap();

        assert_eq!(store.ensure_schema(SCHEMA_VERSION).await.unwrap(), SchemaOutcome::Unchanged);
        assert_eq!(store.read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn version_bump_rebuilds_table_empty() {
        let store = MemoryRecordStore::new();
        store.ensure_schema(1).await.unwrap();
        store.upsert(&record("a", "old shape")).await.unwrap();

        let outcome = store.ensure_schema(2).await.unwrap();
        assert_eq!(outcome, SchemaOutcome::Rebuilt { from: Some(1) });
        assert!(store.read_all().await.unwrap().is_empty());
        assert_eq!(store.schema_version().await, Some(2));
        assert_eq!(store.ensure_schema(2).await.unwrap(), SchemaOutcome::Unchanged);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_last_write_wins() {
        let store = MemoryRecordStore::new();
        store.ensure_schema(SCHEMA_VERSION).await.unwrap();
        let first = record("a", "first title");
        store.upsert(&first).await.unwrap();
        store.upsert(&first).await.unwrap();
        assert_eq!(store.read_all().await.unwrap(), vec![first]);

        let second = record("a", "second title");
        store.upsert(&second).await.unwrap();
        assert_eq!(store.read_all().await.unwrap(), vec![second]);
    }

    #[tokio::test]
    async fn batch_stops_at_first_failure_without_rollback() {
        let store = MemoryRecordStore::new();
        store.ensure_schema(SCHEMA_VERSION).await.unwrap();
        store.fail_writes_for("b").await;

        let batch = vec![record("a", "one"), record("b", "two"), record("c", "three")];
        let outcome = store.upsert_batch(&batch).await;

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.failed(), 1);
        assert_eq!(outcome.not_attempted, 1);
        assert!(matches!(outcome.first_error, Some(StoreError::Rejected { ref id, .. }) if id == "b"));
        let ids = store
            .read_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn writes_before_schema_fail_with_missing_table() {
        let store = MemoryRecordStore::new();
        let err = store.upsert(&record("a", "early")).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingTable));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unavailable_store_reports_transient_errors() {
        let store = MemoryRecordStore::new();
        store.set_unavailable(true).await;
        let err = store.read_all().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn postgres_store_round_trip_when_configured() {
        let Ok(url) = std::env::var("NEWSETL_TEST_DATABASE_URL") else {
            return;
        };
        let store = PgRecordStore::connect(&url).await.expect("connect");
        sqlx::query(DROP_ARTICLES).execute(store.pool()).await.expect("drop");
        sqlx::query("DELETE FROM etl_data.schema_meta WHERE table_name = 'articles'")
            .execute(store.pool())
            .await
            .ok();

        assert_eq!(store.ensure_schema(SCHEMA_VERSION).await.unwrap(), SchemaOutcome::Created);
        let a = record("a", "postgres row");
        store.upsert(&a).await.unwrap();
        store.upsert(&a).await.unwrap();
        assert_eq!(store.read_all().await.unwrap(), vec![a]);

        assert_eq!(store.ensure_schema(SCHEMA_VERSION).await.unwrap(), SchemaOutcome::Unchanged);
        assert_eq!(store.read_all().await.unwrap().len(), 1);

        let rebuilt = store.ensure_schema(SCHEMA_VERSION + 1).await.unwrap();
        assert_eq!(rebuilt, SchemaOutcome::Rebuilt { from: Some(SCHEMA_VERSION) });
        assert!(store.read_all().await.unwrap().is_empty());
    }

    #[test]
    fn archive_hashing_is_stable() {
        let hash = RunArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archive_writes_batch_under_run_directory() {
        let dir = tempdir().expect("tempdir");
        let archive = RunArchive::new(dir.path());
        let run_id = Uuid::new_v4();

        let written = archive
            .write_json(run_id, "raw_batch", &vec![record("a", "archived")])
            .await
            .expect("write");

        assert_eq!(written.relative_path, PathBuf::from(run_id.to_string()).join("raw_batch.json"));
        let bytes = std::fs::read(&written.absolute_path).expect("read back");
        assert_eq!(RunArchive::sha256_hex(&bytes), written.content_hash);
        let leftovers = std::fs::read_dir(dir.path().join(run_id.to_string()))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn huge_attempt_indexes_saturate_instead_of_wrapping() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        let wraps_to_zero = usize::try_from(1u64 << 32).unwrap();
        assert_eq!(policy.delay_for_attempt(wraps_to_zero), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn only_connect_and_timeout_request_errors_are_retryable() {
        let client = reqwest::Client::new();

        let bad_url = client.get("http://exa mple.invalid/").send().await.unwrap_err();
        assert_eq!(classify_reqwest_error(&bad_url), RetryDisposition::NonRetryable);

        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let refused = client
            .get(format!("http://127.0.0.1:{port}/"))
            .send()
            .await
            .unwrap_err();
        assert!(refused.is_connect());
        assert_eq!(classify_reqwest_error(&refused), RetryDisposition::Retryable);
    }

    #[test]
    fn http_status_errors_classify_by_code() {
        let busy = FetchError::HttpStatus { status: 503, url: "https://x".into() };
        let gone = FetchError::HttpStatus { status: 404, url: "https://x".into() };
        assert_eq!(busy.disposition(), RetryDisposition::Retryable);
        assert_eq!(gone.disposition(), RetryDisposition::NonRetryable);
    }
}
