//! SQLite-backed record store.
//!
//! One `events` table keyed by the canonical event id. The upsert runs
//! in a transaction and pre-checks existence per id so the outcome can
//! distinguish genuinely new rows from refreshes, which is what the
//! broadcast path keys off.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::{RecordStore, StoreError, UpsertOutcome};
use crate::types::Event;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id          TEXT PRIMARY KEY,
    provider    TEXT NOT NULL,
    category    TEXT NOT NULL,
    title       TEXT NOT NULL,
    starts_at   TEXT NOT NULL,
    importance  REAL NOT NULL,
    link        TEXT,
    attributes  TEXT NOT NULL,
    first_seen  TEXT NOT NULL,
    last_seen   TEXT NOT NULL
)
"#;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        // The write rate is a handful of rows per tick; one connection
        // keeps SQLite's locking out of the picture.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        debug!(path, "Event store opened");
        Ok(Self { pool })
    }

    /// Read one event back, mostly for tests and tooling.
    pub async fn get(&self, id: &str) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_event).transpose()
    }
}

fn row_to_event(row: SqliteRow) -> Result<Event, StoreError> {
    let starts_at: String = row.get("starts_at");
    let attributes: String = row.get("attributes");
    let starts_at = DateTime::parse_from_rfc3339(&starts_at)
        .map_err(|e| {
            StoreError::Serialization(serde::de::Error::custom(format!("starts_at: {e}")))
        })?
        .with_timezone(&Utc);
    let attributes: BTreeMap<String, serde_json::Value> = serde_json::from_str(&attributes)?;
    Ok(Event {
        id: row.get("id"),
        provider: row.get("provider"),
        category: row.get("category"),
        title: row.get("title"),
        starts_at,
        importance_score: row.get("importance"),
        link: row.get("link"),
        attributes,
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn upsert_events(&self, events: &[Event]) -> Result<UpsertOutcome, StoreError> {
        let mut outcome = UpsertOutcome::default();
        if events.is_empty() {
            return Ok(outcome);
        }
        let mut seen_in_batch: HashSet<&str> = HashSet::new();
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        for event in events {
            let existed = sqlx::query("SELECT 1 FROM events WHERE id = ?1")
                .bind(&event.id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();

            sqlx::query(
                r#"
                INSERT INTO events
                    (id, provider, category, title, starts_at, importance,
                     link, attributes, first_seen, last_seen)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                ON CONFLICT(id) DO UPDATE SET
                    provider = excluded.provider,
                    category = excluded.category,
                    title = excluded.title,
                    starts_at = excluded.starts_at,
                    importance = excluded.importance,
                    link = excluded.link,
                    attributes = excluded.attributes,
                    last_seen = excluded.last_seen
                "#,
            )
            .bind(&event.id)
            .bind(&event.provider)
            .bind(&event.category)
            .bind(&event.title)
            .bind(event.starts_at.to_rfc3339())
            .bind(event.importance_score)
            .bind(event.link.as_deref())
            .bind(serde_json::to_string(&event.attributes)?)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

            if existed && !seen_in_batch.contains(event.id.as_str()) {
                outcome.updated.insert(event.id.clone());
            } else if !existed {
                outcome.inserted.insert(event.id.clone());
            }
            seen_in_batch.insert(&event.id);
        }

        tx.commit().await?;
        debug!(
            inserted = outcome.inserted.len(),
            updated = outcome.updated.len(),
            "Batch upserted"
        );
        Ok(outcome)
    }

    async fn contains(&self, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM events WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
