//! agripulsed: agripulse prefetch daemon.
//!
//! Keeps the configured prefetch keys warm and reports their state, or
//! performs a one-shot read for a single key.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use agripulse::config::{Config, Secrets};
use agripulse::{CacheError, Key, SnapshotCache};

/// Agripulse daemon: background prefetch for agriculture data.
#[derive(Parser)]
#[command(name = "agripulsed")]
#[command(version)]
#[command(about = "Agripulse snapshot cache daemon")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "AGRIPULSE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Warm the prefetch keys and keep them fresh until Ctrl-C
    Run,

    /// Fetch one key and print its payload
    Get {
        /// Cache key, e.g. "weather:indore" or "mandi:wheat:indore"
        key: String,
        /// How long to wait for the first snapshot
        #[arg(long, default_value_t = 10_000)]
        deadline_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    let secrets = Secrets::load()?;
    let cache = SnapshotCache::builder()
        .config(config.cache_config())
        .fetchers(config.fetchers(&secrets)?)
        .build()?;

    let code = match args.command {
        Command::Run => {
            run(&cache, &config).await?;
            ExitCode::SUCCESS
        }
        Command::Get { key, deadline_ms } => {
            get(&cache, &key, Duration::from_millis(deadline_ms)).await?
        }
    };

    cache.shutdown().await;
    Ok(code)
}

async fn run(cache: &SnapshotCache, config: &Config) -> agripulse::Result<()> {
    let keys = config.prefetch_keys()?;
    info!(version = env!("CARGO_PKG_VERSION"), keys = keys.len(), "agripulsed starting");
    cache.warm(keys.iter().cloned());

    let every = Duration::from_secs(config.cache.tick_interval_secs.max(1));
    let mut report = tokio::time::interval(every);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("interrupt received, shutting down");
                return Ok(());
            }
            _ = report.tick() => {
                for key in &keys {
                    report_status(cache, key);
                }
            }
        }
    }
}

fn report_status(cache: &SnapshotCache, key: &Key) {
    let Some(status) = cache.status(key) else {
        warn!(key = %key, "prefetch key no longer tracked");
        return;
    };
    info!(
        key = %key,
        state = ?status.state,
        has_snapshot = status.has_snapshot,
        age_secs = status.age.map(|a| a.as_secs()),
        stale = status.stale,
        next_due_in_secs = status.next_due_in.as_secs(),
        failures = status.consecutive_failures,
        last_error = ?status.last_error,
        "status"
    );
}

async fn get(cache: &SnapshotCache, raw: &str, deadline: Duration) -> agripulse::Result<ExitCode> {
    let key = Key::parse(raw)?;
    match cache.get_within(&key, deadline).await {
        Ok(snapshot) => {
            let pretty = serde_json::to_string_pretty(snapshot.payload())
                .map_err(|e| CacheError::Configuration(format!("cannot render payload: {e}")))?;
            println!("{pretty}");
            Ok(ExitCode::SUCCESS)
        }
        Err(CacheError::NotYetAvailable { key }) => {
            let last_error = cache
                .status(&Key::parse(&key)?)
                .and_then(|s| s.last_error)
                .map(|e| e.to_string())
                .unwrap_or_else(|| "deadline elapsed".to_string());
            eprintln!("no snapshot for {key}: {last_error}");
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e),
    }
}
