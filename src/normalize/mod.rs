//! Event normalization.
//!
//! Converts raw adapter payloads into canonical `Event` records and
//! suppresses duplicates through the record store. Normalization is
//! deterministic: the same payload always yields the same ids in the
//! same order, which is what makes upsert-based dedup sound.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::providers::ProviderAdapter;
use crate::storage::{RecordStore, StoreError};
use crate::types::Event;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    /// The payload is not item-shaped at all. Treated as a permanent
    /// provider failure by the scheduler.
    #[error("malformed payload from {provider}: {detail}")]
    MalformedPayload { provider: String, detail: String },
}

// ---------------------------------------------------------------------------
// Persist report
// ---------------------------------------------------------------------------

/// Outcome of persisting one normalized batch.
#[derive(Debug, Default)]
pub struct PersistReport {
    /// Events newly inserted into the record store, in batch order.
    /// Only these are eligible for broadcast.
    pub inserted: Vec<Event>,
    /// Ids that were already present and got refreshed in place.
    pub updated: Vec<String>,
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

pub struct EventNormalizer {
    store: Arc<dyn RecordStore>,
}

impl EventNormalizer {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Convert a raw payload into canonical events.
    ///
    /// Accepted payload shapes: a JSON array of items, an object whose
    /// `items` or `events` field is such an array, or `null` (empty).
    /// Items missing a title or a parsable timestamp are skipped with a
    /// warning; a payload of the wrong shape entirely is an error.
    pub fn normalize(
        &self,
        provider: &str,
        category: &str,
        payload: &serde_json::Value,
        adapter: &dyn ProviderAdapter,
    ) -> Result<Vec<Event>, NormalizeError> {
        let items = payload_items(provider, payload)?;
        let mut events = Vec::with_capacity(items.len());
        let mut skipped = 0usize;

        for item in items {
            match normalize_item(provider, category, item, adapter) {
                Some(event) => events.push(event),
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!(provider, category, skipped, "Skipped unusable payload items");
        }
        debug!(provider, category, count = events.len(), "Payload normalized");
        Ok(events)
    }

    /// Upsert a batch and split it into newly-inserted events versus
    /// in-place updates. Updates never broadcast, so replays are silent.
    pub async fn persist(&self, events: Vec<Event>) -> Result<PersistReport, StoreError> {
        let outcome = self.store.upsert_events(&events).await?;
        let mut report = PersistReport::default();
        let mut seen = std::collections::HashSet::new();
        for event in events {
            if !seen.insert(event.id.clone()) {
                continue;
            }
            if outcome.inserted.contains(&event.id) {
                report.inserted.push(event);
            } else if outcome.updated.contains(&event.id) {
                report.updated.push(event.id);
            }
        }
        Ok(report)
    }
}

fn payload_items<'a>(
    provider: &str,
    payload: &'a serde_json::Value,
) -> Result<&'a [serde_json::Value], NormalizeError> {
    match payload {
        serde_json::Value::Null => Ok(&[]),
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(map) => match map.get("items").or_else(|| map.get("events")) {
            Some(serde_json::Value::Array(items)) => Ok(items),
            _ => Err(NormalizeError::MalformedPayload {
                provider: provider.to_string(),
                detail: "object payload without an items/events array".to_string(),
            }),
        },
        other => Err(NormalizeError::MalformedPayload {
            provider: provider.to_string(),
            detail: format!("expected array or object, got {other}"),
        }),
    }
}

fn normalize_item(
    provider: &str,
    category: &str,
    item: &serde_json::Value,
    adapter: &dyn ProviderAdapter,
) -> Option<Event> {
    let obj = item.as_object()?;

    let title = field_str(obj, &["title", "name"])?;
    let starts_at = ["starts_at", "date", "timestamp"]
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(parse_when)?;

    let importance = obj
        .get("importance")
        .or_else(|| obj.get("score"))
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(0.0);
    let importance = if importance.is_finite() {
        importance.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let link = field_str(obj, &["link", "url"]);

    // Whatever was not mapped onto a canonical field rides along as-is.
    const CONSUMED: &[&str] = &[
        "title", "name", "starts_at", "date", "timestamp", "importance", "score", "link", "url",
    ];
    let attributes: BTreeMap<String, serde_json::Value> = obj
        .iter()
        .filter(|(k, _)| !CONSUMED.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut key = adapter.natural_key(provider, item);
    if key.is_empty() {
        key = vec![title.clone(), starts_at.to_rfc3339()];
    }

    Some(Event {
        id: event_id(provider, &key),
        provider: provider.to_string(),
        category: category.to_string(),
        title,
        starts_at,
        importance_score: importance,
        link,
        attributes,
    })
}

fn field_str(
    obj: &serde_json::Map<String, serde_json::Value>,
    names: &[&str],
) -> Option<String> {
    names
        .iter()
        .find_map(|n| obj.get(*n))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

/// Parse an item timestamp. RFC 3339 keeps its offset and is converted
/// to UTC; naive datetimes and bare dates are interpreted as UTC by
/// policy; integers are Unix seconds.
fn parse_when(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        serde_json::Value::Number(n) => {
            let secs = n.as_i64()?;
            Utc.timestamp_opt(secs, 0).single()
        }
        _ => None,
    }
}

/// Stable event id: SHA-256 over the provider id and the natural-key
/// fields, unit-separated so field boundaries cannot collide.
fn event_id(provider: &str, key_fields: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    for field in key_fields {
        hasher.update([0x1f]);
        hasher.update(field.as_bytes());
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
