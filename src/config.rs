//! Configuration loading for agripulsed.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.agripulse/config.toml` (user)
//! 3. `/etc/agripulse/config.toml` (system)
//!
//! When no file is found the defaults apply. An explicit path that does not
//! exist is an error.
//!
//! Secrets are loaded separately with mandatory permission checks:
//! 1. `~/.agripulse/secrets.toml` (user, must be 0600)
//! 2. `/etc/agripulse/secrets.toml` (system, must be 0600)

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::backoff::BackoffConfig;
use crate::cache::CacheConfig;
use crate::fetch::{
    CommodityFetcher, DEFAULT_DATAGOV_URL, DEFAULT_WEATHER_URL, DataGovClient, FetchPolicy,
    FetcherRegistry, MandiPriceFetcher, WeatherApiFetcher,
};
use crate::key::{Key, Source};
use crate::{CacheError, Result};

/// Daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    #[serde(default)]
    pub sources: SourcesSection,
    #[serde(default)]
    pub prefetch: PrefetchSection,
}

/// Scheduler and read-path tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub tick_interval_secs: u64,
    pub workers: usize,
    pub queue_depth: usize,
    pub request_deadline_ms: u64,
    pub refresh_ratio: f64,
    pub idle_evict_after_secs: Option<u64>,
    pub drain_timeout_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            workers: 4,
            queue_depth: 64,
            request_deadline_ms: 2000,
            refresh_ratio: 1.0,
            idle_evict_after_secs: None,
            drain_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_ms: 60_000,
        }
    }
}

/// Per-source settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcesSection {
    #[serde(default)]
    pub weather: SourceConfig,
    #[serde(default)]
    pub mandi: SourceConfig,
    #[serde(default)]
    pub commodity: SourceConfig,
}

impl SourcesSection {
    pub fn get(&self, source: Source) -> &SourceConfig {
        match source {
            Source::Weather => &self.weather,
            Source::Mandi => &self.mandi,
            Source::Commodity => &self.commodity,
        }
    }
}

/// Settings for one upstream. Unset fields take the source's default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceConfig {
    /// Snapshot TTL (default: 300 for weather, 900 for mandi and commodity).
    pub ttl_secs: Option<u64>,
    /// Per-attempt timeout (default: 10).
    pub timeout_secs: Option<u64>,
    /// Extra attempts for transient failures (default: 1).
    pub max_retries: Option<u32>,
    /// Upstream base URL.
    pub base_url: Option<String>,
}

impl SourceConfig {
    pub fn ttl(&self, source: Source) -> Duration {
        let default = match source {
            Source::Weather => 300,
            Source::Mandi | Source::Commodity => 900,
        };
        Duration::from_secs(self.ttl_secs.unwrap_or(default))
    }

    pub fn policy(&self) -> FetchPolicy {
        let defaults = FetchPolicy::default();
        FetchPolicy::new()
            .timeout(
                self.timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.timeout),
            )
            .max_retries(self.max_retries.unwrap_or(defaults.max_retries))
    }

    pub fn base_url(&self, source: Source) -> &str {
        self.base_url.as_deref().unwrap_or(match source {
            Source::Weather => DEFAULT_WEATHER_URL,
            Source::Mandi | Source::Commodity => DEFAULT_DATAGOV_URL,
        })
    }
}

/// Keys warmed at startup and kept fresh by the tick.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetchSection {
    pub keys: Vec<String>,
}

impl Default for PrefetchSection {
    fn default() -> Self {
        Self {
            keys: [
                "weather:indore",
                "commodity:wheat",
                "commodity:rice",
                "commodity:maize",
                "commodity:soybean",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Secrets configuration (API keys).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub weather: Option<ApiKeySecret>,
    #[serde(default)]
    pub datagov: Option<ApiKeySecret>,
}

/// A single API key secret.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeySecret {
    pub api_key: String,
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided, must exist)
    /// 2. `~/.agripulse/config.toml`
    /// 3. `/etc/agripulse/config.toml`
    /// 4. Built-in defaults
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = match explicit_path {
            Some(path) if path.exists() => Some(path.to_path_buf()),
            Some(path) => {
                return Err(CacheError::Configuration(format!(
                    "Config file not found: {path:?}"
                )));
            }
            None => search("config.toml"),
        };
        match path {
            Some(path) => Self::load_from_file(&path),
            None => {
                info!("no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let config = read_toml(path, "config")?;
        info!(path = ?path, "loaded config");
        Ok(config)
    }

    /// Cache tuning from the `[cache]` and `[backoff]` sections.
    pub fn cache_config(&self) -> CacheConfig {
        let c = &self.cache;
        let mut config = CacheConfig::new()
            .tick_interval(Duration::from_secs(c.tick_interval_secs))
            .workers(c.workers)
            .queue_depth(c.queue_depth)
            .request_deadline(Duration::from_millis(c.request_deadline_ms))
            .refresh_ratio(c.refresh_ratio)
            .drain_timeout(Duration::from_secs(c.drain_timeout_secs))
            .backoff(
                BackoffConfig::new()
                    .base(Duration::from_millis(self.backoff.base_ms))
                    .max(Duration::from_millis(self.backoff.max_ms)),
            );
        if let Some(secs) = c.idle_evict_after_secs {
            config = config.idle_evict_after(Duration::from_secs(secs));
        }
        config
    }

    /// Build the fetchers for every source whose API key is available.
    ///
    /// Sources without a key are skipped with a warning.
    pub fn fetchers(&self, secrets: &Secrets) -> Result<FetcherRegistry> {
        let mut registry = FetcherRegistry::new();

        match secrets.api_key(Source::Weather) {
            Some(key) => {
                let source = &self.sources.weather;
                let fetcher = WeatherApiFetcher::with_base_url(
                    key,
                    source.base_url(Source::Weather),
                    source.ttl(Source::Weather),
                )?;
                registry.insert(Source::Weather, Arc::new(fetcher), source.policy());
            }
            None => warn!("no weather API key, weather keys disabled"),
        }

        match secrets.api_key(Source::Mandi) {
            Some(key) => {
                let mandi = &self.sources.mandi;
                let client = DataGovClient::with_url(key.clone(), mandi.base_url(Source::Mandi))?;
                registry.insert(
                    Source::Mandi,
                    Arc::new(MandiPriceFetcher::new(client, mandi.ttl(Source::Mandi))),
                    mandi.policy(),
                );

                let commodity = &self.sources.commodity;
                let client = DataGovClient::with_url(key, commodity.base_url(Source::Commodity))?;
                registry.insert(
                    Source::Commodity,
                    Arc::new(CommodityFetcher::new(client, commodity.ttl(Source::Commodity))),
                    commodity.policy(),
                );
            }
            None => warn!("no data.gov.in API key, mandi and commodity keys disabled"),
        }

        Ok(registry)
    }

    /// Parsed `[prefetch] keys`.
    pub fn prefetch_keys(&self) -> Result<Vec<Key>> {
        self.prefetch.keys.iter().map(|k| Key::parse(k)).collect()
    }
}

impl Secrets {
    /// Load `secrets.toml` from `~/.agripulse` or `/etc/agripulse`.
    ///
    /// A missing file yields empty secrets; keys then come from the
    /// environment.
    pub fn load() -> Result<Self> {
        match search("secrets.toml") {
            Some(path) => Self::load_checked(&path),
            None => Ok(Secrets::default()),
        }
    }

    /// Load a secrets file, refusing it unless only the owner can read it.
    pub fn load_checked(path: &Path) -> Result<Self> {
        ensure_private(path)?;
        read_toml(path, "secrets")
    }

    /// API key for `source`. Mandi and commodity share the data.gov.in key.
    /// Falls back to `WEATHER_API_KEY` / `DATA_GOV_API_KEY`.
    pub fn api_key(&self, source: Source) -> Option<String> {
        let (secret, env_var) = match source {
            Source::Weather => (&self.weather, "WEATHER_API_KEY"),
            Source::Mandi | Source::Commodity => (&self.datagov, "DATA_GOV_API_KEY"),
        };
        secret
            .as_ref()
            .map(|s| s.api_key.clone())
            .or_else(|| std::env::var(env_var).ok())
            .filter(|key| !key.is_empty())
    }
}

/// First existing `<file>` under `~/.agripulse` then `/etc/agripulse`.
fn search(file: &str) -> Option<PathBuf> {
    let user = dirs::home_dir().map(|home| home.join(".agripulse").join(file));
    let system = Path::new("/etc/agripulse").join(file);
    user.into_iter().chain([system]).find(|path| path.exists())
}

fn read_toml<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| {
        CacheError::Configuration(format!("Failed to read {what} file {path:?}: {e}"))
    })?;
    toml::from_str(&content).map_err(|e| {
        CacheError::Configuration(format!("Failed to parse {what} file {path:?}: {e}"))
    })
}

/// Reject files readable or writable by group or others.
#[cfg(unix)]
fn ensure_private(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = fs::metadata(path)
        .map_err(|e| CacheError::Configuration(format!("Failed to stat {path:?}: {e}")))?
        .permissions()
        .mode();
    if mode & 0o077 != 0 {
        return Err(CacheError::Configuration(format!(
            "{path:?} is accessible to other users (mode {:o}), chmod 600 it",
            mode & 0o777
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_private(_path: &Path) -> Result<()> {
    Ok(())
}
