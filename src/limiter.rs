//! Per-provider quota accounting and response caching.
//!
//! The limiter keeps one sliding-window ledger of request timestamps per
//! provider and answers two questions: may a request be issued now, and
//! if not, how long until one may. It also doubles as a read-through
//! response cache keyed by provider plus a caller-chosen key, so repeat
//! polls inside the TTL never touch the quota at all.
//!
//! The check-and-record sequence is deliberately split: callers gate with
//! `allow`, perform their request, then charge the quota with `record`.
//! All mutation is expected to happen from the scheduler task.
//!
//! Every time-dependent operation has an `_at(now)` twin; the plain
//! variants are thin wrappers over `Utc::now()` so tests can drive a
//! synthetic clock.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
    /// The provider id is not part of the loaded configuration. A
    /// configuration error: callers must not fall back to "allow".
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

// ---------------------------------------------------------------------------
// Quota configuration
// ---------------------------------------------------------------------------

/// Immutable per-provider quota parameters, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ProviderQuota {
    /// Requests permitted inside one sliding window. Zero is legal and
    /// means "deny all".
    pub max_requests: u32,
    /// Sliding-window length.
    pub period: Duration,
    /// How long a cached response stays fresh. Zero disables caching.
    pub cache_ttl: Duration,
}

impl ProviderQuota {
    pub fn new(max_requests: u32, period_seconds: u64, cache_ttl_seconds: u64) -> Self {
        Self {
            max_requests,
            period: Duration::seconds(period_seconds as i64),
            cache_ttl: Duration::seconds(cache_ttl_seconds as i64),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    stored_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Stats snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of one provider's quota state.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    /// Requests recorded inside the current window.
    pub requests_in_window: usize,
    pub max_requests: u32,
    pub period_seconds: i64,
    pub cache_ttl_seconds: i64,
    /// Cumulative count of gate checks that came back denied.
    pub rejections: u64,
    /// Minimum sleep before a request becomes permissible, in seconds.
    pub wait_seconds: i64,
    /// Whether a request would be permitted right now.
    pub permitted: bool,
    /// Cache entries currently fresh for this provider.
    pub cached_entries: usize,
}

/// Per-provider stats, ordered by provider id for stable display.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LimiterStats {
    pub providers: BTreeMap<String, ProviderStats>,
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Sliding-window quota accountant plus TTL response cache.
pub struct RateLimiter {
    quotas: HashMap<String, ProviderQuota>,
    /// FIFO of request timestamps per provider, oldest at the front.
    /// Entries are garbage-collected from the head on every access, so
    /// each timestamp is pushed and popped exactly once.
    ledgers: HashMap<String, VecDeque<DateTime<Utc>>>,
    caches: HashMap<String, HashMap<String, CacheEntry>>,
    rejections: HashMap<String, u64>,
}

impl RateLimiter {
    pub fn new(quotas: HashMap<String, ProviderQuota>) -> Self {
        Self {
            quotas,
            ledgers: HashMap::new(),
            caches: HashMap::new(),
            rejections: HashMap::new(),
        }
    }

    /// Provider ids known to this limiter, sorted.
    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.quotas.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn quota(&self, provider: &str) -> Result<&ProviderQuota, LimiterError> {
        self.quotas
            .get(provider)
            .ok_or_else(|| LimiterError::UnknownProvider(provider.to_string()))
    }

    /// Drop ledger entries whose age reached the window length. An entry
    /// recorded at exactly `now - period` is already outside the window.
    fn gc(ledger: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, period: Duration) {
        while let Some(&oldest) = ledger.front() {
            if now - oldest >= period {
                ledger.pop_front();
            } else {
                break;
            }
        }
    }

    // -- Gate --------------------------------------------------------------

    /// Whether a request may be issued now. Does not record anything
    /// except the cumulative rejection counter.
    pub fn allow(&mut self, provider: &str) -> Result<bool, LimiterError> {
        self.allow_at(provider, Utc::now())
    }

    pub fn allow_at(&mut self, provider: &str, now: DateTime<Utc>) -> Result<bool, LimiterError> {
        let quota = self.quota(provider)?.clone();
        let ledger = self.ledgers.entry(provider.to_string()).or_default();
        Self::gc(ledger, now, quota.period);
        let allowed = ledger.len() < quota.max_requests as usize;
        if !allowed {
            *self.rejections.entry(provider.to_string()).or_insert(0) += 1;
        }
        Ok(allowed)
    }

    /// Charge the quota. Callers invoke this once per issued request,
    /// immediately after the request returns, success or failure.
    pub fn record(&mut self, provider: &str) -> Result<(), LimiterError> {
        self.record_at(provider, Utc::now())
    }

    pub fn record_at(&mut self, provider: &str, now: DateTime<Utc>) -> Result<(), LimiterError> {
        let period = self.quota(provider)?.period;
        let ledger = self.ledgers.entry(provider.to_string()).or_default();
        Self::gc(ledger, now, period);
        ledger.push_back(now);
        Ok(())
    }

    /// Minimum sleep before `allow` can come back true, assuming no
    /// further requests are recorded in the meantime. Zero when a request
    /// is currently permitted; the full period when the quota is zero.
    pub fn wait_time(&mut self, provider: &str) -> Result<Duration, LimiterError> {
        self.wait_time_at(provider, Utc::now())
    }

    pub fn wait_time_at(
        &mut self,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<Duration, LimiterError> {
        let quota = self.quota(provider)?.clone();
        let ledger = self.ledgers.entry(provider.to_string()).or_default();
        Self::gc(ledger, now, quota.period);
        if ledger.len() < quota.max_requests as usize {
            return Ok(Duration::zero());
        }
        match ledger.front() {
            Some(&oldest) => {
                let wait = quota.period - (now - oldest);
                Ok(wait.max(Duration::zero()))
            }
            // Empty ledger yet denied: max_requests is zero. Nothing will
            // ever expire, so report the full period.
            None => Ok(quota.period),
        }
    }

    // -- Response cache ----------------------------------------------------

    /// Fresh cached payload for `(provider, key)`, if any. Stale entries
    /// are removed as a side effect. Cache reads never touch the ledger.
    pub fn get_cached(
        &mut self,
        provider: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, LimiterError> {
        self.get_cached_at(provider, key, Utc::now())
    }

    pub fn get_cached_at(
        &mut self,
        provider: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<serde_json::Value>, LimiterError> {
        let ttl = self.quota(provider)?.cache_ttl;
        if ttl <= Duration::zero() {
            return Ok(None);
        }
        let Some(cache) = self.caches.get_mut(provider) else {
            return Ok(None);
        };
        match cache.get(key) {
            Some(entry) if now - entry.stored_at < ttl => Ok(Some(entry.value.clone())),
            Some(_) => {
                cache.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Store a payload under `(provider, key)`. Overwrites any existing
    /// entry. A zero TTL makes this a no-op.
    pub fn set_cache(
        &mut self,
        provider: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), LimiterError> {
        self.set_cache_at(provider, key, value, Utc::now())
    }

    pub fn set_cache_at(
        &mut self,
        provider: &str,
        key: &str,
        value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), LimiterError> {
        let ttl = self.quota(provider)?.cache_ttl;
        if ttl <= Duration::zero() {
            return Ok(());
        }
        self.caches
            .entry(provider.to_string())
            .or_default()
            .insert(key.to_string(), CacheEntry { value, stored_at: now });
        Ok(())
    }

    /// Flush cached responses for one provider, or every provider when
    /// `provider` is `None`. The request ledgers are untouched.
    pub fn clear_cache(&mut self, provider: Option<&str>) -> Result<(), LimiterError> {
        match provider {
            Some(id) => {
                self.quota(id)?;
                self.caches.remove(id);
            }
            None => self.caches.clear(),
        }
        Ok(())
    }

    // -- Stats -------------------------------------------------------------

    pub fn stats(&self) -> LimiterStats {
        self.stats_at(Utc::now())
    }

    /// Non-mutating snapshot: in-window counts are computed by filtering
    /// rather than collecting garbage, so a shared reference suffices.
    pub fn stats_at(&self, now: DateTime<Utc>) -> LimiterStats {
        let mut providers = BTreeMap::new();
        for (id, quota) in &self.quotas {
            let in_window = self
                .ledgers
                .get(id)
                .map(|l| l.iter().filter(|&&ts| now - ts < quota.period).count())
                .unwrap_or(0);
            let permitted = in_window < quota.max_requests as usize;
            let wait = if permitted {
                Duration::zero()
            } else {
                self.ledgers
                    .get(id)
                    .and_then(|l| l.iter().find(|&&ts| now - ts < quota.period))
                    .map(|&oldest| (quota.period - (now - oldest)).max(Duration::zero()))
                    .unwrap_or(quota.period)
            };
            let cached_entries = self
                .caches
                .get(id)
                .map(|c| {
                    c.values()
                        .filter(|e| now - e.stored_at < quota.cache_ttl)
                        .count()
                })
                .unwrap_or(0);
            providers.insert(
                id.clone(),
                ProviderStats {
                    requests_in_window: in_window,
                    max_requests: quota.max_requests,
                    period_seconds: quota.period.num_seconds(),
                    cache_ttl_seconds: quota.cache_ttl.num_seconds(),
                    rejections: self.rejections.get(id).copied().unwrap_or(0),
                    wait_seconds: wait.num_seconds(),
                    permitted,
                    cached_entries,
                },
            );
        }
        LimiterStats { providers }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn limiter(max: u32, period: u64, ttl: u64) -> RateLimiter {
        let mut quotas = HashMap::new();
        quotas.insert("x".to_string(), ProviderQuota::new(max, period, ttl));
        RateLimiter::new(quotas)
    }

    #[test]
    fn test_allow_under_quota() {
        let mut rl = limiter(3, 10, 0);
        assert!(rl.allow_at("x", t(0)).unwrap());
        rl.record_at("x", t(0)).unwrap();
        assert!(rl.allow_at("x", t(1)).unwrap());
        rl.record_at("x", t(1)).unwrap();
        assert!(rl.allow_at("x", t(2)).unwrap());
        rl.record_at("x", t(2)).unwrap();
        assert!(!rl.allow_at("x", t(3)).unwrap());
    }

    #[test]
    fn test_wait_time_counts_down_from_oldest_entry() {
        let mut rl = limiter(3, 10, 0);
        for s in 0..3 {
            rl.record_at("x", t(s)).unwrap();
        }
        // Oldest at t=0, window 10s: free again at t=10.
        assert_eq!(rl.wait_time_at("x", t(3)).unwrap(), Duration::seconds(7));
        assert_eq!(rl.wait_time_at("x", t(9)).unwrap(), Duration::seconds(1));
    }

    #[test]
    fn test_window_reopens_after_period() {
        let mut rl = limiter(3, 10, 0);
        for s in 0..3 {
            rl.record_at("x", t(s)).unwrap();
        }
        assert!(!rl.allow_at("x", t(9)).unwrap());
        assert!(rl.allow_at("x", t(11)).unwrap());
    }

    #[test]
    fn test_entry_at_exact_window_edge_is_outside() {
        let mut rl = limiter(1, 60, 0);
        rl.record_at("x", t(0)).unwrap();
        // Age is exactly the period: the entry no longer counts.
        assert!(rl.allow_at("x", t(60)).unwrap());
        // One second earlier it still does.
        let mut rl = limiter(1, 60, 0);
        rl.record_at("x", t(0)).unwrap();
        assert!(!rl.allow_at("x", t(59)).unwrap());
    }

    #[test]
    fn test_one_per_minute_reenables_on_61st_second() {
        let mut rl = limiter(1, 60, 0);
        assert!(rl.allow_at("x", t(0)).unwrap());
        rl.record_at("x", t(0)).unwrap();
        assert!(!rl.allow_at("x", t(30)).unwrap());
        assert!(rl.allow_at("x", t(61)).unwrap());
    }

    #[test]
    fn test_zero_quota_denies_forever() {
        let mut rl = limiter(0, 10, 0);
        assert!(!rl.allow_at("x", t(0)).unwrap());
        assert!(!rl.allow_at("x", t(1_000_000)).unwrap());
        // Nothing can expire, so the wait is the full period.
        assert_eq!(rl.wait_time_at("x", t(0)).unwrap(), Duration::seconds(10));
    }

    #[test]
    fn test_wait_time_zero_when_permitted() {
        let mut rl = limiter(2, 10, 0);
        assert_eq!(rl.wait_time_at("x", t(0)).unwrap(), Duration::zero());
        rl.record_at("x", t(0)).unwrap();
        assert_eq!(rl.wait_time_at("x", t(1)).unwrap(), Duration::zero());
    }

    #[test]
    fn test_rejections_accumulate() {
        let mut rl = limiter(1, 10, 0);
        rl.record_at("x", t(0)).unwrap();
        assert!(!rl.allow_at("x", t(1)).unwrap());
        assert!(!rl.allow_at("x", t(2)).unwrap());
        // wait_time checks must not inflate the counter.
        rl.wait_time_at("x", t(3)).unwrap();
        assert_eq!(rl.stats_at(t(3)).providers["x"].rejections, 2);
    }

    #[test]
    fn test_unknown_provider_rejected_everywhere() {
        let mut rl = limiter(1, 10, 60);
        let err = LimiterError::UnknownProvider("nope".to_string());
        assert_eq!(rl.allow_at("nope", t(0)).unwrap_err(), err);
        assert_eq!(rl.record_at("nope", t(0)).unwrap_err(), err);
        assert_eq!(rl.wait_time_at("nope", t(0)).unwrap_err(), err);
        assert_eq!(rl.get_cached_at("nope", "k", t(0)).unwrap_err(), err);
        assert_eq!(
            rl.set_cache_at("nope", "k", serde_json::json!(1), t(0))
                .unwrap_err(),
            err
        );
        assert_eq!(rl.clear_cache(Some("nope")).unwrap_err(), err);
    }

    #[test]
    fn test_cache_hit_within_ttl() {
        let mut rl = limiter(1, 10, 60);
        rl.set_cache_at("x", "k", serde_json::json!("v"), t(0)).unwrap();
        assert_eq!(
            rl.get_cached_at("x", "k", t(59)).unwrap(),
            Some(serde_json::json!("v"))
        );
    }

    #[test]
    fn test_cache_stale_at_exact_ttl() {
        let mut rl = limiter(1, 10, 60);
        rl.set_cache_at("x", "k", serde_json::json!("v"), t(0)).unwrap();
        assert_eq!(rl.get_cached_at("x", "k", t(60)).unwrap(), None);
        // The stale entry was removed, not just hidden.
        assert_eq!(rl.stats_at(t(60)).providers["x"].cached_entries, 0);
    }

    #[test]
    fn test_cache_disabled_when_ttl_zero() {
        let mut rl = limiter(1, 10, 0);
        rl.set_cache_at("x", "k", serde_json::json!("v"), t(0)).unwrap();
        assert_eq!(rl.get_cached_at("x", "k", t(0)).unwrap(), None);
    }

    #[test]
    fn test_cache_overwrite() {
        let mut rl = limiter(1, 10, 60);
        rl.set_cache_at("x", "k", serde_json::json!(1), t(0)).unwrap();
        rl.set_cache_at("x", "k", serde_json::json!(2), t(5)).unwrap();
        assert_eq!(
            rl.get_cached_at("x", "k", t(10)).unwrap(),
            Some(serde_json::json!(2))
        );
    }

    #[test]
    fn test_cache_reads_never_touch_ledger() {
        let mut rl = limiter(0, 10, 60);
        rl.set_cache_at("x", "k", serde_json::json!("v"), t(0)).unwrap();
        assert_eq!(
            rl.get_cached_at("x", "k", t(1)).unwrap(),
            Some(serde_json::json!("v"))
        );
        // Deny-all quota stays denied and the ledger stays empty.
        assert!(!rl.allow_at("x", t(1)).unwrap());
        assert_eq!(rl.stats_at(t(1)).providers["x"].requests_in_window, 0);
    }

    #[test]
    fn test_clear_cache_single_and_all() {
        let mut quotas = HashMap::new();
        quotas.insert("a".to_string(), ProviderQuota::new(1, 10, 60));
        quotas.insert("b".to_string(), ProviderQuota::new(1, 10, 60));
        let mut rl = RateLimiter::new(quotas);
        rl.set_cache_at("a", "k", serde_json::json!(1), t(0)).unwrap();
        rl.set_cache_at("b", "k", serde_json::json!(2), t(0)).unwrap();
        rl.record_at("a", t(0)).unwrap();

        rl.clear_cache(Some("a")).unwrap();
        assert_eq!(rl.get_cached_at("a", "k", t(1)).unwrap(), None);
        assert!(rl.get_cached_at("b", "k", t(1)).unwrap().is_some());
        // Ledger untouched by cache flushes.
        assert_eq!(rl.stats_at(t(1)).providers["a"].requests_in_window, 1);

        rl.clear_cache(None).unwrap();
        assert_eq!(rl.get_cached_at("b", "k", t(1)).unwrap(), None);
    }

    #[test]
    fn test_stats_snapshot_fields() {
        let mut rl = limiter(3, 10, 60);
        rl.record_at("x", t(0)).unwrap();
        rl.record_at("x", t(1)).unwrap();
        rl.set_cache_at("x", "k", serde_json::json!("v"), t(1)).unwrap();

        let stats = rl.stats_at(t(2));
        let s = &stats.providers["x"];
        assert_eq!(s.requests_in_window, 2);
        assert_eq!(s.max_requests, 3);
        assert_eq!(s.period_seconds, 10);
        assert_eq!(s.cache_ttl_seconds, 60);
        assert!(s.permitted);
        assert_eq!(s.wait_seconds, 0);
        assert_eq!(s.cached_entries, 1);
    }

    #[test]
    fn test_stats_wait_when_exhausted() {
        let mut rl = limiter(1, 10, 0);
        rl.record_at("x", t(0)).unwrap();
        let stats = rl.stats_at(t(4));
        let s = &stats.providers["x"];
        assert!(!s.permitted);
        assert_eq!(s.wait_seconds, 6);
    }

    #[test]
    fn test_provider_ids_sorted() {
        let mut quotas = HashMap::new();
        quotas.insert("zeta".to_string(), ProviderQuota::new(1, 10, 0));
        quotas.insert("alpha".to_string(), ProviderQuota::new(1, 10, 0));
        let rl = RateLimiter::new(quotas);
        assert_eq!(rl.provider_ids(), vec!["alpha", "zeta"]);
    }
}
