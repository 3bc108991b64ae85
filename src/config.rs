//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Provider quotas and category schedules are data, not code; the full
//! set lives in the config file and is immutable once loaded. The
//! `validate` pass turns configuration mistakes into startup failures so
//! a misconfigured process refuses to run at all.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;

use crate::limiter::ProviderQuota;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub service: ServiceConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ops: OpsConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    /// Provider id -> quota parameters.
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Category id -> polling schedule. BTreeMap keeps full-pass runs in
    /// a stable order.
    pub categories: BTreeMap<String, CategoryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Ceiling on a single adapter fetch, in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    /// Whether a permanent provider failure disables the provider for
    /// the remainder of the process lifetime.
    #[serde(default)]
    pub disable_on_permanent: bool,
    /// Events starting further in the past than this are persisted but
    /// not broadcast.
    #[serde(default = "default_ancient_days")]
    pub ancient_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout(),
            disable_on_permanent: false,
            ancient_days: default_ancient_days(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    /// Minimum interval between two successful pushes to one subscriber.
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
    /// Deadline for a single subscriber send before it counts as failed.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval(),
            send_timeout_secs: default_send_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// SQLite database path for the bundled record store.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ops_port")]
    pub port: u16,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self { enabled: false, port: default_ops_port() }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdapterConfig {
    /// Directory of `<provider>.json` fixture payloads. When unset, the
    /// process runs with the no-op adapter and real adapters are expected
    /// to be wired in by the embedding application.
    #[serde(default)]
    pub fixtures_dir: Option<String>,
}

/// Quota parameters for one provider.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Maximum requests per sliding window. Zero means "deny all".
    pub max_requests: u32,
    pub period_seconds: u64,
    /// Zero disables response caching for this provider.
    #[serde(default)]
    pub cache_ttl_seconds: u64,
}

/// Polling schedule for one category of providers.
#[derive(Debug, Deserialize, Clone)]
pub struct CategoryConfig {
    pub interval_seconds: u64,
    /// Providers polled on each tick, in declaration order.
    pub providers: Vec<String>,
}

fn default_fetch_timeout() -> u64 {
    30
}
fn default_ancient_days() -> u32 {
    30
}
fn default_min_interval() -> u64 {
    30
}
fn default_send_timeout() -> u64 {
    2
}
fn default_db_path() -> String {
    "pulse.db".to_string()
}
fn default_ops_port() -> u16 {
    8090
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot honor. Called from
    /// `load`; exposed for tests and embedders building configs in code.
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            bail!("configuration has no providers");
        }
        if self.categories.is_empty() {
            bail!("configuration has no categories");
        }
        for (id, p) in &self.providers {
            // max_requests == 0 is legal deny-all config; a zero period
            // would make the window meaningless.
            if p.period_seconds == 0 {
                bail!("provider '{id}': period_seconds must be positive");
            }
        }
        for (id, c) in &self.categories {
            if c.interval_seconds == 0 {
                bail!("category '{id}': interval_seconds must be positive");
            }
            if c.providers.is_empty() {
                bail!("category '{id}': provider list is empty");
            }
            for p in &c.providers {
                if !self.providers.contains_key(p) {
                    bail!("category '{id}': unknown provider '{p}'");
                }
            }
        }
        Ok(())
    }

    /// Provider quotas in the limiter's native form.
    pub fn quotas(&self) -> HashMap<String, ProviderQuota> {
        self.providers
            .iter()
            .map(|(id, p)| {
                (
                    id.clone(),
                    ProviderQuota::new(p.max_requests, p.period_seconds, p.cache_ttl_seconds),
                )
            })
            .collect()
    }
}
