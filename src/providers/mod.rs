//! Provider adapters.
//!
//! Defines the `ProviderAdapter` trait the scheduler drives, plus the
//! catalog of canonical provider quotas. Concrete HTTP adapters for the
//! upstream APIs live outside this crate; the bundled implementations
//! (`FixtureAdapter`, `NoopAdapter`) exist so the engine can run end to
//! end without network access.

pub mod fixture;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::limiter::ProviderQuota;
use crate::types::AdapterError;

/// Abstraction over upstream event sources.
///
/// One adapter instance serves every configured provider; `fetch` is
/// dispatched with the provider id so implementations can route
/// internally. Implementations own their HTTP concerns (auth, retries
/// within a call, per-request timeouts below the scheduler's ceiling).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Fetch the latest raw payload for a provider. The scheduler charges
    /// the provider's quota as soon as this returns, success or failure.
    async fn fetch(&self, provider_id: &str) -> Result<serde_json::Value, AdapterError>;

    /// The fields identifying one raw item uniquely within a provider.
    /// Combined with the provider id they form the canonical event id.
    /// An empty key tells the normalizer to fall back to title + time.
    fn natural_key(&self, provider_id: &str, raw_item: &serde_json::Value) -> Vec<String>;

    /// Adapter name for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Canonical provider catalog
// ---------------------------------------------------------------------------

/// The canonical provider set with documented request quotas:
/// `(id, max_requests, period_seconds, cache_ttl_seconds)`. These are
/// data; `config.toml` carries the same values and wins when present.
pub const PROVIDER_CATALOG: &[(&str, u32, u64, u64)] = &[
    ("coinmarketcal", 10, 3600, 1800),
    ("coindar", 30, 3600, 1800),
    ("coingecko", 30, 60, 300),
    ("cryptopanic", 5, 60, 600),
    ("finnhub", 60, 60, 60),
    ("fmp", 10, 3600, 900),
    ("alphavantage", 5, 60, 300),
    ("football_data", 10, 60, 600),
    ("api_sports", 10, 60, 600),
    ("github_releases", 60, 3600, 900),
    ("fred", 120, 60, 3600),
    ("tradingeconomics", 50, 3600, 3600),
];

/// The catalog in the limiter's native form.
pub fn default_quotas() -> HashMap<String, ProviderQuota> {
    PROVIDER_CATALOG
        .iter()
        .map(|&(id, max, period, ttl)| (id.to_string(), ProviderQuota::new(max, period, ttl)))
        .collect()
}

// ---------------------------------------------------------------------------
// No-op adapter
// ---------------------------------------------------------------------------

/// Wiring placeholder: every fetch yields an empty payload.
pub struct NoopAdapter;

#[async_trait]
impl ProviderAdapter for NoopAdapter {
    async fn fetch(&self, _provider_id: &str) -> Result<serde_json::Value, AdapterError> {
        Ok(serde_json::json!([]))
    }

    fn natural_key(&self, _provider_id: &str, _raw_item: &serde_json::Value) -> Vec<String> {
        Vec::new()
    }

    fn name(&self) -> &str {
        "noop"
    }
}
