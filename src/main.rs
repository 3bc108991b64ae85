//! PULSE — Multi-provider event ingestion engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! wires the limiter, store, adapter, and stream into the scheduler,
//! and runs the polling loop with graceful shutdown. A few operator
//! flags run one-shot actions instead of the loop.

use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::{error, info};

use pulse::config::AppConfig;
use pulse::ops::{self, OpsState};
use pulse::providers::{fixture::FixtureAdapter, NoopAdapter, ProviderAdapter};
use pulse::scheduler::Scheduler;
use pulse::storage::{RecordStore, SqliteStore};

const BANNER: &str = r#"
 ____  _   _ _     ____  _____
|  _ \| | | | |   / ___|| ____|
| |_) | | | | |   \___ \|  _|
|  __/| |_| | |___ ___) | |___
|_|    \___/|_____|____/|_____|

  Provider-Unified Live Scheduling Engine
  v0.1.0 — Event Ingestion Core
"#;

/// Operator flags. Hand-parsed: the surface is four flags and a value.
#[derive(Debug, Default)]
struct CliArgs {
    config_path: Option<String>,
    show_schedule: bool,
    category: Option<String>,
    force: bool,
    /// `Some(None)` clears every provider, `Some(Some(id))` just one.
    clear_cache: Option<Option<String>>,
}

fn parse_args(argv: &[String]) -> Result<CliArgs> {
    let mut args = CliArgs::default();
    let mut iter = argv.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let Some(path) = iter.next() else {
                    bail!("--config requires a path");
                };
                args.config_path = Some(path.clone());
            }
            "--show-schedule" => args.show_schedule = true,
            "--category" => {
                let Some(id) = iter.next() else {
                    bail!("--category requires a category id");
                };
                args.category = Some(id.clone());
            }
            "--force" => args.force = true,
            "--clear-cache" => {
                // The provider id is optional and must not be a flag.
                let provider = match iter.peek() {
                    Some(next) if !next.starts_with("--") => iter.next().cloned(),
                    _ => None,
                };
                args.clear_cache = Some(provider);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&argv)?;

    // Load configuration; validation failures refuse to start.
    let config_path = args.config_path.as_deref().unwrap_or("config.toml");
    let cfg = AppConfig::load(config_path)?;

    init_logging();

    // -- One-shot operator actions ----------------------------------------

    if args.show_schedule {
        print_schedule(&cfg);
        return Ok(());
    }

    if let Some(provider) = &args.clear_cache {
        let mut scheduler = build_scheduler(&cfg).await?;
        scheduler.limiter_mut().clear_cache(provider.as_deref())?;
        match provider {
            Some(id) => info!(provider = %id, "Cache cleared"),
            None => info!("Cache cleared for all providers"),
        }
        return Ok(());
    }

    if let Some(category) = &args.category {
        let mut scheduler = build_scheduler(&cfg).await?;
        let reports = scheduler.run_once(Some(category), args.force).await?;
        for report in &reports {
            for outcome in &report.outcomes {
                println!("{}", serde_json::to_string(outcome)?);
            }
        }
        return Ok(());
    }

    // -- Long-running mode -------------------------------------------------

    println!("{BANNER}");
    info!(
        service = %cfg.service.name,
        providers = cfg.providers.len(),
        categories = cfg.categories.len(),
        "PULSE starting up"
    );

    let mut scheduler = build_scheduler(&cfg).await?;
    if cfg.ops.enabled {
        let ops_state = Arc::new(OpsState::new());
        ops::spawn_ops(ops_state.clone(), cfg.ops.port);
        scheduler = scheduler.with_ops(ops_state);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Entering scheduler loop. Press Ctrl+C to stop.");
    tokio::select! {
        result = scheduler.run() => {
            if let Err(e) = result {
                error!(error = %e, "Scheduler loop exited");
                return Err(e);
            }
        }
        _ = &mut shutdown => {
            info!("Shutdown signal received.");
        }
    }

    info!("PULSE shut down cleanly.");
    Ok(())
}

/// Wire limiter, store, adapter, and stream into a scheduler.
async fn build_scheduler(cfg: &AppConfig) -> Result<Scheduler> {
    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(&cfg.storage.path).await?);
    let adapter: Box<dyn ProviderAdapter> = match &cfg.adapter.fixtures_dir {
        Some(dir) => {
            info!(dir = %dir, "Using fixture adapter");
            Box::new(FixtureAdapter::new(dir))
        }
        None => {
            info!("No adapter configured; running with the no-op adapter");
            Box::new(NoopAdapter)
        }
    };
    Ok(Scheduler::new(cfg, adapter, store))
}

/// Print the configured categories, intervals, providers, and limits.
fn print_schedule(cfg: &AppConfig) {
    println!("Categories:");
    for (id, cat) in &cfg.categories {
        println!(
            "  {id:<12} every {:>5}s  providers: {}",
            cat.interval_seconds,
            cat.providers.join(", ")
        );
    }
    println!("Providers:");
    for (id, p) in &cfg.providers {
        println!(
            "  {id:<18} {:>4} req / {:>5}s  cache ttl {:>5}s",
            p.max_requests, p.period_seconds, p.cache_ttl_seconds
        );
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pulse=info"));

    let json_logging = std::env::var("PULSE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
