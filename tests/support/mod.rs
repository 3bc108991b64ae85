#![allow(dead_code)] // not every test binary uses every double

//! Deterministic test doubles for end-to-end scenarios.
//!
//! Everything is in-memory and scriptable from test code: adapters with
//! per-provider payloads or failures, connection handles that record
//! frames and can be flipped into failure, and config built from TOML
//! literals.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pulse::config::AppConfig;
use pulse::providers::ProviderAdapter;
use pulse::stream::{ConnectionHandle, StreamFrame};
use pulse::types::AdapterError;

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// What a scripted provider does when fetched.
#[derive(Clone)]
pub enum Script {
    Payload(serde_json::Value),
    Transient(&'static str),
    Permanent(&'static str),
}

/// Adapter returning scripted responses per provider id. Natural keys
/// come from each item's `"id"` field. Fetch counts are observable.
pub struct ScriptedAdapter {
    scripts: HashMap<String, Script>,
    calls: Arc<Mutex<HashMap<String, usize>>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with(mut self, provider: &str, script: Script) -> Self {
        self.scripts.insert(provider.to_string(), script);
        self
    }

    /// Shared view of per-provider fetch counts.
    pub fn call_counts(&self) -> Arc<Mutex<HashMap<String, usize>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn fetch(&self, provider_id: &str) -> Result<serde_json::Value, AdapterError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(provider_id.to_string())
            .or_insert(0) += 1;
        match self.scripts.get(provider_id) {
            Some(Script::Payload(payload)) => Ok(payload.clone()),
            Some(Script::Transient(msg)) => Err(AdapterError::Transient {
                provider: provider_id.to_string(),
                message: msg.to_string(),
            }),
            Some(Script::Permanent(msg)) => Err(AdapterError::Permanent {
                provider: provider_id.to_string(),
                message: msg.to_string(),
            }),
            None => Ok(serde_json::json!([])),
        }
    }

    fn natural_key(&self, _provider_id: &str, raw_item: &serde_json::Value) -> Vec<String> {
        raw_item
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map(|s| vec![s.to_string()])
            .unwrap_or_default()
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// Handle recording every frame; can be flipped into failure mode.
pub struct RecordingHandle {
    frames: Arc<Mutex<Vec<StreamFrame>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingHandle {
    #[allow(clippy::type_complexity)]
    pub fn new() -> (Box<Self>, Arc<Mutex<Vec<StreamFrame>>>, Arc<AtomicBool>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        (
            Box::new(Self {
                frames: frames.clone(),
                fail: fail.clone(),
            }),
            frames,
            fail,
        )
    }
}

#[async_trait]
impl ConnectionHandle for RecordingHandle {
    async fn send(&self, frame: &StreamFrame) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection reset by peer");
        }
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

pub fn config_from(toml: &str) -> AppConfig {
    let cfg: AppConfig = toml::from_str(toml).expect("test config parses");
    cfg.validate().expect("test config validates");
    cfg
}
