//! Agripulse - real-time snapshot cache for agriculture data sources
//!
//! This crate keeps the latest weather, mandi price and commodity analytics
//! snapshots in memory and refreshes them in the background, so request
//! handlers read cached data instead of waiting on slow or rate-limited
//! upstream APIs.
//!
//! - Reads of a key that has a snapshot never block on upstream I/O. A
//!   stale snapshot is served as-is while a refresh runs
//!   (stale-while-revalidate).
//! - At most one refresh per key is in flight at any time.
//! - Snapshots only move forward: an older result never replaces a newer
//!   one.
//! - Failing keys back off exponentially, honouring upstream
//!   `Retry-After` hints.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use agripulse::{DataGovClient, FetchPolicy, Key, MandiPriceFetcher, SnapshotCache, Source};
//!
//! #[tokio::main]
//! async fn main() -> agripulse::Result<()> {
//!     let client = DataGovClient::new("your-data-gov-key")?;
//!     let cache = SnapshotCache::builder()
//!         .fetcher(
//!             Source::Mandi,
//!             Arc::new(MandiPriceFetcher::new(client, Duration::from_secs(900))),
//!             FetchPolicy::new(),
//!         )
//!         .build()?;
//!
//!     let prices = cache.get(&Key::mandi("wheat", "indore")?).await?;
//!     println!("{}", prices.payload());
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod key;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod telemetry;

pub use backoff::BackoffConfig;
pub use cache::{CacheConfig, SnapshotCache, SnapshotCacheBuilder};
pub use config::{Config, Secrets};
pub use error::{CacheError, FetchError, Result};
pub use fetch::{
    CommodityFetcher, DataGovClient, FetchPolicy, FetchResult, Fetcher, FetcherRegistry,
    MandiPriceFetcher, MandiRecord, RetryingFetcher, WeatherApiFetcher,
};
pub use key::{Key, Source};
pub use scheduler::{Dispatch, RefreshScheduler};
pub use snapshot::Snapshot;
pub use store::{CommitOutcome, EntryStatus, Lookup, RefreshState, SnapshotStore};
