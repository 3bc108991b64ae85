//! Fixture-backed adapter.
//!
//! Reads `<dir>/<provider>.json` on every fetch, so operators can drive
//! the full pipeline from files on disk: drop a payload in, watch it
//! flow through normalize, persist, and broadcast. A missing file is an
//! empty payload, not an error, which makes partial fixture sets useful.

use async_trait::async_trait;
use std::path::PathBuf;

use super::ProviderAdapter;
use crate::types::AdapterError;

pub struct FixtureAdapter {
    dir: PathBuf,
}

impl FixtureAdapter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ProviderAdapter for FixtureAdapter {
    async fn fetch(&self, provider_id: &str) -> Result<serde_json::Value, AdapterError> {
        let path = self.dir.join(format!("{provider_id}.json"));
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(serde_json::json!([]));
            }
            Err(e) => {
                return Err(AdapterError::Transient {
                    provider: provider_id.to_string(),
                    message: format!("read {}: {e}", path.display()),
                });
            }
        };
        // A file that exists but does not parse is a broken fixture, not
        // something a retry will fix.
        serde_json::from_str(&raw).map_err(|e| AdapterError::Permanent {
            provider: provider_id.to_string(),
            message: format!("parse {}: {e}", path.display()),
        })
    }

    fn natural_key(&self, _provider_id: &str, raw_item: &serde_json::Value) -> Vec<String> {
        match raw_item.get("id") {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Number(n)) => vec![n.to_string()],
            _ => Vec::new(),
        }
    }

    fn name(&self) -> &str {
        "fixture"
    }
}
