//! Shared types for the PULSE ingestion engine.
//!
//! These types form the data model used across all modules. They are
//! designed to be stable so that the limiter, scheduler, normalizer,
//! stream, and storage modules can depend on them without circular
//! references.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A canonical event produced by the normalizer.
///
/// `id` is a stable hash of the provider id and the item's natural key,
/// so re-fetching the same upstream item always yields the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// Provider that produced the event (e.g. "coinmarketcal").
    pub provider: String,
    /// Category the provider was polled under (e.g. "crypto").
    pub category: String,
    pub title: String,
    /// When the event happens, always UTC.
    pub starts_at: DateTime<Utc>,
    /// Relevance score, clamped into [0, 1].
    pub importance_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// Provider-specific attributes with no canonical field.
    /// A BTreeMap keeps serialization order deterministic.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {} @ {} (score: {:.2})",
            self.category,
            self.provider,
            self.title,
            self.starts_at.format("%Y-%m-%d %H:%M UTC"),
            self.importance_score,
        )
    }
}

impl Event {
    /// Whether the event started more than `cutoff` before `now`.
    /// Ancient events are persisted but filtered from broadcast.
    pub fn is_ancient(&self, now: DateTime<Utc>, cutoff: Duration) -> bool {
        now - self.starts_at > cutoff
    }

    /// Helper to build a test event with sensible defaults.
    #[cfg(test)]
    pub fn sample(id: &str) -> Self {
        Event {
            id: id.to_string(),
            provider: "finnhub".to_string(),
            category: "markets".to_string(),
            title: "FOMC rate decision".to_string(),
            starts_at: Utc::now() + Duration::days(3),
            importance_score: 0.9,
            link: Some("https://example.com/fomc".to_string()),
            attributes: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Event kind
// ---------------------------------------------------------------------------

/// What a stream frame announces about an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    New,
    Updated,
    Removed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::New => write!(f, "new"),
            EventKind::Updated => write!(f, "updated"),
            EventKind::Removed => write!(f, "removed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter failures
// ---------------------------------------------------------------------------

/// Errors surfaced by a provider adapter's `fetch`.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Retriable on the next tick: timeouts, 5xx, upstream 429.
    #[error("transient failure ({provider}): {message}")]
    Transient { provider: String, message: String },

    /// Not expected to recover: auth failures, malformed responses.
    #[error("permanent failure ({provider}): {message}")]
    Permanent { provider: String, message: String },

    /// The scheduler's fetch ceiling elapsed. Classified as transient.
    #[error("fetch timed out after {seconds}s ({provider})")]
    Timeout { provider: String, seconds: u64 },
}

impl AdapterError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AdapterError::Transient { .. } => FailureKind::Transient,
            AdapterError::Permanent { .. } => FailureKind::Permanent,
            AdapterError::Timeout { .. } => FailureKind::Timeout,
        }
    }

    /// Permanent failures may disable the provider for the process
    /// lifetime, depending on scheduler policy.
    pub fn is_permanent(&self) -> bool {
        matches!(self, AdapterError::Permanent { .. })
    }
}

/// Loggable classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Permanent,
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
            FailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let event = Event::sample("abc");
        let display = format!("{event}");
        assert!(display.contains("markets"));
        assert!(display.contains("finnhub"));
        assert!(display.contains("FOMC"));
    }

    #[test]
    fn test_event_serialization_roundtrip() {
        let mut event = Event::sample("abc");
        event
            .attributes
            .insert("country".to_string(), serde_json::json!("US"));
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_event_link_omitted_when_absent() {
        let mut event = Event::sample("abc");
        event.link = None;
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("\"link\""));
    }

    #[test]
    fn test_event_is_ancient() {
        let now = Utc::now();
        let mut event = Event::sample("abc");
        event.starts_at = now - Duration::days(31);
        assert!(event.is_ancient(now, Duration::days(30)));

        event.starts_at = now - Duration::days(29);
        assert!(!event.is_ancient(now, Duration::days(30)));

        // Future events are never ancient.
        event.starts_at = now + Duration::days(5);
        assert!(!event.is_ancient(now, Duration::days(30)));
    }

    #[test]
    fn test_event_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&EventKind::New).unwrap(), "\"new\"");
        assert_eq!(
            serde_json::to_string(&EventKind::Updated).unwrap(),
            "\"updated\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::Removed).unwrap(),
            "\"removed\""
        );
    }

    #[test]
    fn test_event_kind_display_matches_wire_form() {
        for kind in [EventKind::New, EventKind::Updated, EventKind::Removed] {
            let wire = serde_json::to_string(&kind).unwrap();
            assert_eq!(wire, format!("\"{kind}\""));
        }
    }

    #[test]
    fn test_adapter_error_kinds() {
        let transient = AdapterError::Transient {
            provider: "finnhub".into(),
            message: "503".into(),
        };
        let permanent = AdapterError::Permanent {
            provider: "finnhub".into(),
            message: "401 unauthorized".into(),
        };
        let timeout = AdapterError::Timeout {
            provider: "finnhub".into(),
            seconds: 30,
        };

        assert_eq!(transient.kind(), FailureKind::Transient);
        assert_eq!(permanent.kind(), FailureKind::Permanent);
        assert_eq!(timeout.kind(), FailureKind::Timeout);

        assert!(!transient.is_permanent());
        assert!(permanent.is_permanent());
        assert!(!timeout.is_permanent());
    }

    #[test]
    fn test_adapter_error_display() {
        let e = AdapterError::Timeout {
            provider: "coingecko".into(),
            seconds: 30,
        };
        assert_eq!(format!("{e}"), "fetch timed out after 30s (coingecko)");
    }
}
