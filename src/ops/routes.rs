//! Ops API route handlers.
//!
//! All endpoints return JSON snapshots. The scheduler loop pushes fresh
//! state in after every tick; handlers only ever read, so a slow or
//! absent poller can never stall ingestion.

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::limiter::LimiterStats;
use crate::scheduler::{ScheduleSnapshot, TickReport};
use crate::stream::StreamStats;

/// How many tick reports the ops API keeps.
const TICK_LOG_CAP: usize = 100;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Snapshots shared between the scheduler loop (writer) and the route
/// handlers (readers).
#[derive(Default)]
pub struct OpsState {
    schedule: RwLock<ScheduleSnapshot>,
    limits: RwLock<LimiterStats>,
    stream: RwLock<StreamStats>,
    ticks: RwLock<Vec<TickReport>>,
}

impl OpsState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_schedule(&self, snapshot: ScheduleSnapshot) {
        *self.schedule.write().await = snapshot;
    }

    pub async fn set_limits(&self, stats: LimiterStats) {
        *self.limits.write().await = stats;
    }

    pub async fn set_stream(&self, stats: StreamStats) {
        *self.stream.write().await = stats;
    }

    pub async fn record_tick(&self, report: TickReport) {
        let mut ticks = self.ticks.write().await;
        ticks.push(report);
        if ticks.len() > TICK_LOG_CAP {
            let excess = ticks.len() - TICK_LOG_CAP;
            ticks.drain(..excess);
        }
    }
}

pub type AppState = Arc<OpsState>;

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/schedule
pub async fn get_schedule(State(state): State<AppState>) -> Json<ScheduleSnapshot> {
    Json(state.schedule.read().await.clone())
}

/// GET /api/limits
pub async fn get_limits(State(state): State<AppState>) -> Json<LimiterStats> {
    Json(state.limits.read().await.clone())
}

/// GET /api/stream
pub async fn get_stream(State(state): State<AppState>) -> Json<StreamStats> {
    Json(state.stream.read().await.clone())
}

/// GET /api/ticks
pub async fn get_ticks(State(state): State<AppState>) -> Json<Vec<TickReport>> {
    Json(state.ticks.read().await.clone())
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ProviderOutcome;
    use chrono::Utc;

    fn tick(category: &str) -> TickReport {
        TickReport {
            category: category.to_string(),
            started_at: Utc::now(),
            outcomes: vec![ProviderOutcome::Deferred {
                provider: "finnhub".to_string(),
                wait_seconds: 7,
            }],
        }
    }

    #[tokio::test]
    async fn test_tick_log_capped_at_hundred() {
        let state = OpsState::new();
        for i in 0..150 {
            state.record_tick(tick(&format!("c{i}"))).await;
        }
        let ticks = state.ticks.read().await;
        assert_eq!(ticks.len(), 100);
        // Oldest entries were dropped.
        assert_eq!(ticks[0].category, "c50");
        assert_eq!(ticks[99].category, "c149");
    }

    #[tokio::test]
    async fn test_handlers_serve_pushed_state() {
        let state = Arc::new(OpsState::new());
        state.record_tick(tick("markets")).await;

        let Json(ticks) = get_ticks(State(state.clone())).await;
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].category, "markets");

        let Json(schedule) = get_schedule(State(state.clone())).await;
        assert!(schedule.categories.is_empty());

        let Json(stream) = get_stream(State(state)).await;
        assert_eq!(stream.attached, 0);
    }

    #[test]
    fn test_tick_report_serializes_with_outcome_tag() {
        let json = serde_json::to_value(tick("markets")).unwrap();
        assert_eq!(json["category"], "markets");
        assert_eq!(json["outcomes"][0]["outcome"], "deferred");
        assert_eq!(json["outcomes"][0]["wait_seconds"], 7);
    }
}
