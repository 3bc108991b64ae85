//! Persistence layer.
//!
//! The record store is the dedup authority: events are upserted by id,
//! and the outcome tells the caller which ids were genuinely new. Only
//! those flow on to the event stream, so replaying a fetch is harmless.
//!
//! Two implementations: `MemoryStore` for tests and dry runs, and the
//! SQLite-backed `SqliteStore` in the `sqlite` submodule.

pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::types::Event;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Which ids an upsert inserted versus merely refreshed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: HashSet<String>,
    pub updated: HashSet<String>,
}

/// Idempotent event storage keyed by canonical event id.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert-or-update each event by id. Re-upserting an existing id
    /// refreshes the row and reports it under `updated`.
    async fn upsert_events(&self, events: &[Event]) -> Result<UpsertOutcome, StoreError>;

    async fn contains(&self, id: &str) -> Result<bool, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// HashMap-backed store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<HashMap<String, Event>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read access for assertions.
    pub fn get(&self, id: &str) -> Option<Event> {
        self.events.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_events(&self, events: &[Event]) -> Result<UpsertOutcome, StoreError> {
        let mut map = self.events.lock().unwrap();
        let mut outcome = UpsertOutcome::default();
        for event in events {
            let existed_before_batch =
                map.contains_key(&event.id) && !outcome.inserted.contains(&event.id);
            map.insert(event.id.clone(), event.clone());
            if existed_before_batch {
                outcome.updated.insert(event.id.clone());
            } else {
                // Repeats of an id first seen in this batch stay
                // "inserted": the event is new to the store either way.
                outcome.inserted.insert(event.id.clone());
            }
        }
        Ok(outcome)
    }

    async fn contains(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.events.lock().unwrap().contains_key(id))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.events.lock().unwrap().len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_reports_inserted_then_updated() {
        let store = MemoryStore::new();
        let batch = vec![Event::sample("a"), Event::sample("b")];

        let first = store.upsert_events(&batch).await.unwrap();
        assert_eq!(first.inserted.len(), 2);
        assert!(first.updated.is_empty());

        let second = store.upsert_events(&batch).await.unwrap();
        assert!(second.inserted.is_empty());
        assert_eq!(second.updated.len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_refreshes_fields() {
        let store = MemoryStore::new();
        let mut event = Event::sample("a");
        store.upsert_events(&[event.clone()]).await.unwrap();

        event.title = "Revised title".to_string();
        store.upsert_events(&[event.clone()]).await.unwrap();

        assert_eq!(store.get("a").unwrap().title, "Revised title");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_contains_and_count() {
        let store = MemoryStore::new();
        assert!(!store.contains("a").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);

        store.upsert_events(&[Event::sample("a")]).await.unwrap();
        assert!(store.contains("a").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_within_batch_counts_once() {
        let store = MemoryStore::new();
        let outcome = store
            .upsert_events(&[Event::sample("a"), Event::sample("a")])
            .await
            .unwrap();
        // The id was new to the store, so it is inserted exactly once
        // even though the batch repeated it.
        assert_eq!(outcome.inserted.len(), 1);
        assert!(outcome.updated.is_empty());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let store = MemoryStore::new();
        let outcome = store.upsert_events(&[]).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::default());
    }
}
