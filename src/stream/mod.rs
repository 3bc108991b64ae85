//! Event stream — fan-out of fresh events to connected subscribers.
//!
//! Subscribers are capabilities: an opaque id plus a `ConnectionHandle`
//! that can push one frame. The stream enforces a per-subscriber
//! cool-down between successful pushes; frames suppressed by the
//! cool-down are dropped, never queued. A failing or slow handle gets
//! its subscriber detached on the spot, and the stream never retries.
//! Callers wanting at-least-once delivery persist events before
//! broadcasting, which the normalizer already does.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::types::EventKind;

/// Per-subscriber minimum interval between successful pushes.
pub const DEFAULT_MIN_INTERVAL_SECS: u64 = 30;

/// Ceiling on a single handle send before the subscriber is dropped.
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 2;

/// A subscriber counts as active if it received a frame this recently.
const ACTIVE_WINDOW_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// The transport-neutral frame pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// Capability to push one frame to a subscriber. Implementations must
/// not block the stream; the concrete transport is the embedder's
/// concern. Any error is treated as a permanent failure for that
/// subscriber.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    async fn send(&self, frame: &StreamFrame) -> anyhow::Result<()>;
}

struct Subscription {
    handle: Box<dyn ConnectionHandle>,
    /// Starts at the Unix epoch so a fresh subscriber is always
    /// eligible for its first frame.
    last_delivery_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Reports & stats
// ---------------------------------------------------------------------------

/// What happened to one broadcast call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Dropped by the cool-down, not queued.
    pub suppressed: usize,
    /// Subscribers detached because their handle failed or timed out.
    pub detached: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStats {
    pub attached: usize,
    /// Received a frame within the last minute.
    pub active: usize,
    pub idle: usize,
    pub cooldown_secs: u64,
}

// ---------------------------------------------------------------------------
// EventStream
// ---------------------------------------------------------------------------

pub struct EventStream {
    subscribers: HashMap<String, Subscription>,
    min_interval: Duration,
    send_timeout: std::time::Duration,
}

impl EventStream {
    pub fn new(min_interval_secs: u64, send_timeout_secs: u64) -> Self {
        Self {
            subscribers: HashMap::new(),
            min_interval: Duration::seconds(min_interval_secs as i64),
            send_timeout: std::time::Duration::from_secs(send_timeout_secs),
        }
    }

    /// Register a subscriber. Re-attaching an existing id replaces its
    /// handle and resets the cool-down clock to "immediately eligible".
    pub fn attach(&mut self, subscriber_id: impl Into<String>, handle: Box<dyn ConnectionHandle>) {
        let id = subscriber_id.into();
        info!(subscriber = %id, "Subscriber attached");
        self.subscribers.insert(
            id,
            Subscription {
                handle,
                last_delivery_at: DateTime::<Utc>::UNIX_EPOCH,
            },
        );
    }

    /// Remove a subscriber, releasing its handle. Returns whether it
    /// was attached.
    pub fn detach(&mut self, subscriber_id: &str) -> bool {
        let removed = self.subscribers.remove(subscriber_id).is_some();
        if removed {
            info!(subscriber = subscriber_id, "Subscriber detached");
        }
        removed
    }

    pub fn is_attached(&self, subscriber_id: &str) -> bool {
        self.subscribers.contains_key(subscriber_id)
    }

    /// Fan a frame out to `targets`, or to every attached subscriber
    /// when `targets` is `None`. Unknown target ids are ignored.
    pub async fn broadcast(
        &mut self,
        kind: EventKind,
        payload: &serde_json::Value,
        targets: Option<&[String]>,
    ) -> BroadcastReport {
        self.broadcast_at(Utc::now(), kind, payload, targets).await
    }

    pub async fn broadcast_at(
        &mut self,
        now: DateTime<Utc>,
        kind: EventKind,
        payload: &serde_json::Value,
        targets: Option<&[String]>,
    ) -> BroadcastReport {
        let ids: Vec<String> = match targets {
            Some(ids) => ids
                .iter()
                .filter(|id| self.subscribers.contains_key(*id))
                .cloned()
                .collect(),
            None => self.subscribers.keys().cloned().collect(),
        };

        let frame = StreamFrame { kind, data: payload.clone(), timestamp: now };
        let mut report = BroadcastReport::default();

        for id in ids {
            match self.deliver(&id, now, &frame).await {
                Delivery::Sent => report.delivered += 1,
                Delivery::Suppressed => report.suppressed += 1,
                Delivery::Failed => report.detached.push(id),
            }
        }

        for id in &report.detached {
            self.subscribers.remove(id);
        }
        debug!(
            kind = %kind,
            delivered = report.delivered,
            suppressed = report.suppressed,
            detached = report.detached.len(),
            "Broadcast complete"
        );
        report
    }

    /// Single-target push. Returns true iff the frame went out; false
    /// when suppressed by the cool-down, unknown, or failed (the last
    /// also detaches the subscriber).
    pub async fn push(
        &mut self,
        subscriber_id: &str,
        kind: EventKind,
        payload: &serde_json::Value,
    ) -> bool {
        self.push_at(Utc::now(), subscriber_id, kind, payload).await
    }

    pub async fn push_at(
        &mut self,
        now: DateTime<Utc>,
        subscriber_id: &str,
        kind: EventKind,
        payload: &serde_json::Value,
    ) -> bool {
        if !self.subscribers.contains_key(subscriber_id) {
            return false;
        }
        let frame = StreamFrame { kind, data: payload.clone(), timestamp: now };
        match self.deliver(subscriber_id, now, &frame).await {
            Delivery::Sent => true,
            Delivery::Suppressed => false,
            Delivery::Failed => {
                self.subscribers.remove(subscriber_id);
                false
            }
        }
    }

    async fn deliver(&mut self, id: &str, now: DateTime<Utc>, frame: &StreamFrame) -> Delivery {
        let Some(sub) = self.subscribers.get_mut(id) else {
            return Delivery::Suppressed;
        };
        if now - sub.last_delivery_at < self.min_interval {
            return Delivery::Suppressed;
        }
        match tokio::time::timeout(self.send_timeout, sub.handle.send(frame)).await {
            Ok(Ok(())) => {
                sub.last_delivery_at = now;
                Delivery::Sent
            }
            Ok(Err(e)) => {
                warn!(subscriber = id, error = %e, "Subscriber send failed, detaching");
                Delivery::Failed
            }
            Err(_) => {
                warn!(
                    subscriber = id,
                    timeout_secs = self.send_timeout.as_secs(),
                    "Subscriber send timed out, detaching"
                );
                Delivery::Failed
            }
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> StreamStats {
        let active = self
            .subscribers
            .values()
            .filter(|s| now - s.last_delivery_at <= Duration::seconds(ACTIVE_WINDOW_SECS))
            .count();
        StreamStats {
            attached: self.subscribers.len(),
            active,
            idle: self.subscribers.len() - active,
            cooldown_secs: self.min_interval.num_seconds() as u64,
        }
    }
}

enum Delivery {
    Sent,
    Suppressed,
    Failed,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
