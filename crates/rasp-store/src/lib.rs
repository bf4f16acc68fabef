//! Remote review datastore: scoped existing-id reads and idempotent upserts.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use rasp_core::ReviewRecord;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder, Row};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "rasp-store";

// Postgres caps bind parameters at 65535; at 12 columns per row, inserts
// must stay well under ~5400 rows per statement.
const MAX_ROWS_PER_UPSERT: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
}

/// The two datastore operations the pipeline depends on.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// IDs of reviews already stored for `app_id`. A failure here is fatal
    /// for the run; the caller must not proceed without the set.
    async fn existing_ids(&self, app_id: &str) -> Result<HashSet<String>, StoreError>;

    /// Upsert fully classified records keyed by review id, returning the
    /// number of rows the store reports as written.
    async fn upsert_reviews(&self, records: &[ReviewRecord]) -> Result<u64, StoreError>;
}

/// Postgres-backed store over the `raw_reviews` table.
#[derive(Debug, Clone)]
pub struct PgReviewStore {
    pool: PgPool,
}

impl PgReviewStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ReviewStore for PgReviewStore {
    async fn existing_ids(&self, app_id: &str) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT id FROM raw_reviews WHERE app_id = $1")
            .bind(app_id)
            .fetch_all(&self.pool)
            .await?;
        let mut ids = HashSet::with_capacity(rows.len());
        for row in rows {
            ids.insert(row.try_get::<String, _>("id")?);
        }
        debug!(app_id, existing = ids.len(), "loaded existing review ids");
        Ok(ids)
    }

    async fn upsert_reviews(&self, records: &[ReviewRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut written = 0u64;
        for batch in records.chunks(MAX_ROWS_PER_UPSERT) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO raw_reviews \
                 (id, store, app_id, user_name, review_date, review_time, rating, \
                  review_text, source_url, created_at, topic, sentiment) ",
            );
            builder.push_values(batch, |mut row, record| {
                row.push_bind(&record.id)
                    .push_bind(record.store.display_name())
                    .push_bind(&record.app_id)
                    .push_bind(&record.username)
                    .push_bind(record.posted_at.date_naive())
                    .push_bind(record.posted_at.time())
                    .push_bind(record.rating)
                    .push_bind(&record.text)
                    .push_bind(&record.source_url)
                    .push_bind(record.posted_at)
                    .push_bind(&record.topic)
                    .push_bind(&record.sentiment);
            });
            builder.push(
                " ON CONFLICT (id) DO UPDATE SET \
                 topic = EXCLUDED.topic, \
                 sentiment = EXCLUDED.sentiment, \
                 review_text = EXCLUDED.review_text",
            );
            written += builder.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(written)
    }
}

/// In-memory store used by tests and offline development. Failure injection
/// mimics the two datastore error classes the pipeline must handle.
#[derive(Debug, Default)]
pub struct MemoryReviewStore {
    rows: Mutex<HashMap<String, ReviewRecord>>,
    fail_reads: bool,
    fail_writes: bool,
}

impl MemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_existing(records: impl IntoIterator<Item = ReviewRecord>) -> Self {
        let store = Self::new();
        {
            let mut rows = store.rows.lock().expect("memory store poisoned");
            for record in records {
                rows.insert(record.id.clone(), record);
            }
        }
        store
    }

    pub fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn rows(&self) -> Vec<ReviewRecord> {
        self.rows
            .lock()
            .expect("memory store poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ReviewStore for MemoryReviewStore {
    async fn existing_ids(&self, app_id: &str) -> Result<HashSet<String>, StoreError> {
        if self.fail_reads {
            return Err(StoreError::Unavailable("simulated read outage".into()));
        }
        Ok(self
            .rows
            .lock()
            .expect("memory store poisoned")
            .values()
            .filter(|r| r.app_id == app_id)
            .map(|r| r.id.clone())
            .collect())
    }

    async fn upsert_reviews(&self, records: &[ReviewRecord]) -> Result<u64, StoreError> {
        if self.fail_writes {
            return Err(StoreError::Unavailable("simulated write outage".into()));
        }
        let mut rows = self.rows.lock().expect("memory store poisoned");
        for record in records {
            rows.insert(record.id.clone(), record.clone());
        }
        Ok(records.len() as u64)
    }
}
