//! Category scheduler — the main poll → normalize → persist → broadcast
//! loop.
//!
//! Each category owns a polling interval and an ordered provider list.
//! On a tick the scheduler walks that list in declaration order, letting
//! the rate limiter gate each fetch, and turns whatever happened into a
//! `ProviderOutcome` so the loop body is a single match. The loop is a
//! firewall: no adapter, normalizer, store, or stream failure escapes a
//! tick.
//!
//! Timing rule: a tick that overruns its interval never creates debt.
//! The next run is scheduled at most one interval ahead of now, missed
//! ticks are skipped, and there is no burst catch-up.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::limiter::{LimiterError, RateLimiter};
use crate::normalize::EventNormalizer;
use crate::ops::OpsState;
use crate::providers::ProviderAdapter;
use crate::storage::RecordStore;
use crate::stream::EventStream;
use crate::types::{AdapterError, EventKind, FailureKind};

// ---------------------------------------------------------------------------
// Schedule model
// ---------------------------------------------------------------------------

/// One category's polling schedule, immutable at runtime.
#[derive(Debug, Clone)]
pub struct CategorySchedule {
    pub id: String,
    pub interval: Duration,
    /// Providers polled each tick, in declaration order.
    pub providers: Vec<String>,
}

/// Compute the next due time after a tick. Skips missed ticks: when the
/// previous tick overran by more than one interval, the next run lands a
/// single interval ahead of now instead of bursting to catch up.
pub fn advance_due(
    prev_due: DateTime<Utc>,
    interval: Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let next = prev_due + interval;
    if next + interval <= now {
        now + interval
    } else {
        next
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What happened to one provider within one tick.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProviderOutcome {
    /// The provider produced a payload that flowed through normalize,
    /// persist, and broadcast.
    Delivered {
        provider: String,
        fetched: usize,
        inserted: usize,
        updated: usize,
        broadcast: usize,
        /// Served from the response cache; no request was issued.
        cached: bool,
    },
    /// The rate limiter denied the fetch; retry no earlier than `wait`.
    Deferred { provider: String, wait_seconds: i64 },
    /// The fetch or a downstream stage failed; the batch was dropped.
    Failed {
        provider: String,
        kind: FailureKind,
        message: String,
    },
    /// The provider is disabled for the remainder of the process.
    Disabled { provider: String },
}

/// Summary of one category tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub category: String,
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<ProviderOutcome>,
}

// ---------------------------------------------------------------------------
// Ops snapshot
// ---------------------------------------------------------------------------

/// Point-in-time schedule view served by the ops API and the CLI.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleSnapshot {
    pub categories: Vec<CategoryStatus>,
    pub provider_failures: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryStatus {
    pub id: String,
    pub interval_seconds: i64,
    pub providers: Vec<String>,
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_due_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    categories: Vec<CategorySchedule>,
    limiter: RateLimiter,
    adapter: Box<dyn ProviderAdapter>,
    normalizer: EventNormalizer,
    stream: EventStream,
    fetch_timeout: std::time::Duration,
    disable_on_permanent: bool,
    ancient_cutoff: Duration,
    disabled_categories: HashSet<String>,
    disabled_providers: HashSet<String>,
    failures: HashMap<String, u64>,
    ops: Option<Arc<OpsState>>,
}

impl Scheduler {
    pub fn new(
        cfg: &AppConfig,
        adapter: Box<dyn ProviderAdapter>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let categories = cfg
            .categories
            .iter()
            .map(|(id, c)| CategorySchedule {
                id: id.clone(),
                interval: Duration::seconds(c.interval_seconds as i64),
                providers: c.providers.clone(),
            })
            .collect();
        Self {
            categories,
            limiter: RateLimiter::new(cfg.quotas()),
            adapter,
            normalizer: EventNormalizer::new(store),
            stream: EventStream::new(cfg.stream.min_interval_secs, cfg.stream.send_timeout_secs),
            fetch_timeout: std::time::Duration::from_secs(cfg.scheduler.fetch_timeout_secs),
            disable_on_permanent: cfg.scheduler.disable_on_permanent,
            ancient_cutoff: Duration::days(cfg.scheduler.ancient_days as i64),
            disabled_categories: HashSet::new(),
            disabled_providers: HashSet::new(),
            failures: HashMap::new(),
            ops: None,
        }
    }

    /// Publish snapshots and tick reports to an ops state after each tick.
    pub fn with_ops(mut self, ops: Arc<OpsState>) -> Self {
        self.ops = Some(ops);
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn limiter_mut(&mut self) -> &mut RateLimiter {
        &mut self.limiter
    }

    pub fn stream(&self) -> &EventStream {
        &self.stream
    }

    /// Subscribers are attached and detached through here.
    pub fn stream_mut(&mut self) -> &mut EventStream {
        &mut self.stream
    }

    pub fn schedule_snapshot(
        &self,
        next_due: Option<&BTreeMap<String, DateTime<Utc>>>,
    ) -> ScheduleSnapshot {
        ScheduleSnapshot {
            categories: self
                .categories
                .iter()
                .map(|c| CategoryStatus {
                    id: c.id.clone(),
                    interval_seconds: c.interval.num_seconds(),
                    providers: c.providers.clone(),
                    disabled: self.disabled_categories.contains(&c.id),
                    next_due_at: next_due.and_then(|m| m.get(&c.id).copied()),
                })
                .collect(),
            provider_failures: self.failures.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }

    // -- Single pass --------------------------------------------------------

    /// Run one pass over one category, or all of them. `force` bypasses
    /// the rate-limit gate; issued requests are still recorded.
    pub async fn run_once(&mut self, category: Option<&str>, force: bool) -> Result<Vec<TickReport>> {
        let selected: Vec<CategorySchedule> = match category {
            Some(id) => {
                let cat = self
                    .categories
                    .iter()
                    .find(|c| c.id == id)
                    .with_context(|| format!("unknown category: {id}"))?;
                vec![cat.clone()]
            }
            None => self.categories.clone(),
        };

        let mut reports = Vec::with_capacity(selected.len());
        for cat in &selected {
            if self.disabled_categories.contains(&cat.id) {
                warn!(category = %cat.id, "Category disabled, skipping");
                continue;
            }
            reports.push(self.run_category(cat, force).await);
        }
        Ok(reports)
    }

    async fn run_category(&mut self, cat: &CategorySchedule, force: bool) -> TickReport {
        let started_at = Utc::now();
        debug!(category = %cat.id, providers = cat.providers.len(), "Tick started");

        let mut outcomes = Vec::with_capacity(cat.providers.len());
        for provider in &cat.providers {
            // A limiter misconfiguration mid-tick kills the category.
            if self.disabled_categories.contains(&cat.id) {
                break;
            }
            let outcome = self.run_provider(cat, provider, force).await;
            self.log_outcome(&cat.id, &outcome);
            outcomes.push(outcome);
        }

        TickReport {
            category: cat.id.clone(),
            started_at,
            outcomes,
        }
    }

    async fn run_provider(
        &mut self,
        cat: &CategorySchedule,
        provider: &str,
        force: bool,
    ) -> ProviderOutcome {
        if self.disabled_providers.contains(provider) {
            return ProviderOutcome::Disabled {
                provider: provider.to_string(),
            };
        }

        // A forced run is a request to really poll: skip the cache read.
        let cache_key = format!("{}:latest", cat.id);
        let cached = if force {
            None
        } else {
            match self.limiter.get_cached(provider, &cache_key) {
                Ok(cached) => cached,
                Err(e) => {
                    self.disable_category(&cat.id, provider, &e);
                    return ProviderOutcome::Disabled {
                        provider: provider.to_string(),
                    };
                }
            }
        };

        // A fresh cached payload bypasses the gate entirely: no allow
        // check, no record, no request issued.
        if let Some(payload) = cached {
            return self.process_payload(cat, provider, payload, true).await;
        }

        if !force {
            match self.limiter.allow(provider) {
                Ok(true) => {}
                Ok(false) => {
                    let wait = self
                        .limiter
                        .wait_time(provider)
                        .unwrap_or_else(|_| Duration::zero());
                    return ProviderOutcome::Deferred {
                        provider: provider.to_string(),
                        wait_seconds: wait.num_seconds(),
                    };
                }
                Err(e) => {
                    self.disable_category(&cat.id, provider, &e);
                    return ProviderOutcome::Disabled {
                        provider: provider.to_string(),
                    };
                }
            }
        }

        let fetched = match tokio::time::timeout(self.fetch_timeout, self.adapter.fetch(provider))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout {
                provider: provider.to_string(),
                seconds: self.fetch_timeout.as_secs(),
            }),
        };

        // The request counts against the budget regardless of outcome.
        if let Err(e) = self.limiter.record(provider) {
            self.disable_category(&cat.id, provider, &e);
            return ProviderOutcome::Disabled {
                provider: provider.to_string(),
            };
        }

        match fetched {
            Ok(payload) => {
                if let Err(e) = self.limiter.set_cache(provider, &cache_key, payload.clone()) {
                    // Unknown provider was already caught above; log and
                    // carry on with the live payload.
                    warn!(provider, error = %e, "Failed to cache payload");
                }
                self.process_payload(cat, provider, payload, false).await
            }
            Err(err) => self.provider_failure(provider, err),
        }
    }

    async fn process_payload(
        &mut self,
        cat: &CategorySchedule,
        provider: &str,
        payload: serde_json::Value,
        cached: bool,
    ) -> ProviderOutcome {
        let events = match self
            .normalizer
            .normalize(provider, &cat.id, &payload, self.adapter.as_ref())
        {
            Ok(events) => events,
            Err(e) => {
                return self.provider_failure(
                    provider,
                    AdapterError::Permanent {
                        provider: provider.to_string(),
                        message: e.to_string(),
                    },
                )
            }
        };
        let fetched = events.len();

        let report = match self.normalizer.persist(events).await {
            Ok(report) => report,
            Err(e) => {
                // The batch is dropped, not broadcast; the next cycle
                // re-fetches and the idempotent upsert heals the gap.
                error!(provider, error = %e, "Record store failure, batch dropped");
                return ProviderOutcome::Failed {
                    provider: provider.to_string(),
                    kind: FailureKind::Transient,
                    message: format!("record store: {e}"),
                };
            }
        };

        let now = Utc::now();
        let mut broadcast = 0usize;
        for event in &report.inserted {
            if event.is_ancient(now, self.ancient_cutoff) {
                debug!(event = %event.id, "Ancient event persisted but not broadcast");
                continue;
            }
            match serde_json::to_value(event) {
                Ok(data) => {
                    self.stream.broadcast(EventKind::New, &data, None).await;
                    broadcast += 1;
                }
                Err(e) => warn!(event = %event.id, error = %e, "Event not serializable"),
            }
        }

        ProviderOutcome::Delivered {
            provider: provider.to_string(),
            fetched,
            inserted: report.inserted.len(),
            updated: report.updated.len(),
            broadcast,
            cached,
        }
    }

    fn provider_failure(&mut self, provider: &str, err: AdapterError) -> ProviderOutcome {
        *self.failures.entry(provider.to_string()).or_insert(0) += 1;
        if err.is_permanent() && self.disable_on_permanent {
            warn!(provider, "Provider disabled for the remainder of the process");
            self.disabled_providers.insert(provider.to_string());
        }
        ProviderOutcome::Failed {
            provider: provider.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    fn disable_category(&mut self, category: &str, provider: &str, err: &LimiterError) {
        error!(
            category,
            provider,
            error = %err,
            "Limiter misconfiguration, disabling category"
        );
        self.disabled_categories.insert(category.to_string());
    }

    fn log_outcome(&self, category: &str, outcome: &ProviderOutcome) {
        match outcome {
            ProviderOutcome::Delivered {
                provider,
                fetched,
                inserted,
                updated,
                broadcast,
                cached,
            } => info!(
                category,
                provider,
                fetched,
                inserted,
                updated,
                broadcast,
                cached,
                "Provider delivered"
            ),
            ProviderOutcome::Deferred { provider, wait_seconds } => {
                info!(category, provider, wait_seconds, "Provider deferred by quota")
            }
            ProviderOutcome::Failed { provider, kind, message } => {
                warn!(category, provider, kind = %kind, message, "Provider failed")
            }
            ProviderOutcome::Disabled { provider } => {
                warn!(category, provider, "Provider disabled")
            }
        }
    }

    // -- Long-running loop ---------------------------------------------------

    /// Drive all categories until cancelled. Sleeps to the earliest due
    /// category, ticks it, then reschedules it without accumulating debt.
    pub async fn run(&mut self) -> Result<()> {
        let now = Utc::now();
        let mut next_due: BTreeMap<String, DateTime<Utc>> = self
            .categories
            .iter()
            .map(|c| (c.id.clone(), now))
            .collect();
        info!(categories = next_due.len(), "Scheduler loop starting");

        loop {
            let due = next_due
                .iter()
                .filter(|(id, _)| !self.disabled_categories.contains(*id))
                .min_by_key(|(_, due)| **due)
                .map(|(id, due)| (id.clone(), *due));
            let Some((cat_id, due_at)) = due else {
                bail!("all categories are disabled");
            };

            let now = Utc::now();
            if due_at > now {
                tokio::time::sleep((due_at - now).to_std().unwrap_or_default()).await;
            }

            let Some(cat) = self.categories.iter().find(|c| c.id == cat_id).cloned() else {
                continue;
            };
            let report = self.run_category(&cat, false).await;

            let now = Utc::now();
            if let Some(due) = next_due.get_mut(&cat_id) {
                *due = advance_due(*due, cat.interval, now);
            }
            self.publish(&next_due, report).await;
        }
    }

    async fn publish(&self, next_due: &BTreeMap<String, DateTime<Utc>>, report: TickReport) {
        let Some(ops) = &self.ops else { return };
        ops.set_schedule(self.schedule_snapshot(Some(next_due))).await;
        ops.set_limits(self.limiter.stats()).await;
        ops.set_stream(self.stream.stats()).await;
        ops.record_tick(report).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
