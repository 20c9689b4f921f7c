//! Fetcher adapters for upstream data sources.
//!
//! Every upstream (weather API, mandi price API, commodity analytics) is
//! wrapped behind the [`Fetcher`] trait. Fetchers only perform I/O and
//! return a [`Snapshot`]; they never touch the store. The refresh scheduler
//! owns the state transitions.
//!
//! Fetchers are registered per [`Source`] in a [`FetcherRegistry`], which
//! always wraps them in a [`RetryingFetcher`] so every call is time-bounded
//! and transient failures get their bounded retry.

mod commodity;
mod datagov;
mod http;
mod mandi;
pub mod retry;
mod weather;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::key::{Key, Source};
use crate::snapshot::Snapshot;

pub use commodity::CommodityFetcher;
pub use datagov::{DEFAULT_DATAGOV_URL, DataGovClient, MandiRecord};
pub use mandi::MandiPriceFetcher;
pub use retry::{FetchPolicy, RetryingFetcher};
pub use weather::{DEFAULT_WEATHER_URL, WeatherApiFetcher};

/// Result type for fetcher calls.
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Adapter for one upstream source.
///
/// Implementations perform the network call for `key` and return a fresh
/// snapshot stamped with the source's TTL.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetcher name for logging/debugging.
    fn name(&self) -> &str;

    /// Fetch the current payload for `key`.
    async fn fetch(&self, key: &Key) -> FetchResult<Snapshot>;
}

/// Routes keys to the fetcher registered for their source.
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    fetchers: HashMap<Source, Arc<dyn Fetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fetcher` for `source`, bounded by `policy`.
    ///
    /// Replaces any fetcher previously registered for the source.
    pub fn insert(&mut self, source: Source, fetcher: Arc<dyn Fetcher>, policy: FetchPolicy) {
        let wrapped: Arc<dyn Fetcher> = Arc::new(RetryingFetcher::new(fetcher, policy));
        self.fetchers.insert(source, wrapped);
    }

    /// Fetcher for `source`, if one is registered.
    pub fn get(&self, source: Source) -> Option<Arc<dyn Fetcher>> {
        self.fetchers.get(&source).cloned()
    }

    /// Sources with a registered fetcher.
    pub fn sources(&self) -> Vec<Source> {
        Source::ALL
            .into_iter()
            .filter(|s| self.fetchers.contains_key(s))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }
}
