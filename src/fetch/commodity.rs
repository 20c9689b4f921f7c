//! Commodity analytics fetcher for `commodity:<symbol>` keys.
//!
//! Pulls the nationwide price records for a commodity and condenses them
//! into the price summary the trade-signal engine consumes. The engine
//! itself lives outside this crate.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::datagov::{DataGovClient, MandiRecord, upstream_name};
use super::{FetchResult, Fetcher};
use crate::error::FetchError;
use crate::key::{Key, Source};
use crate::snapshot::Snapshot;

/// Records requested per commodity.
const DEFAULT_LIMIT: u32 = 200;

/// Nationwide price summary for one commodity.
#[derive(Clone)]
pub struct CommodityFetcher {
    client: DataGovClient,
    ttl: Duration,
    limit: u32,
}

impl CommodityFetcher {
    pub fn new(client: DataGovClient, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            limit: DEFAULT_LIMIT,
        }
    }

    /// Set how many records to request per fetch.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Serialize)]
struct PriceSummary {
    commodity: String,
    average_price: f64,
    highest_price: f64,
    lowest_price: f64,
    market_count: usize,
}

#[derive(Serialize)]
struct CommodityAnalytics {
    commodity: String,
    summary: PriceSummary,
    market_data: Vec<MandiRecord>,
}

/// Average (rounded to paise), max and min of the modal prices.
///
/// `None` when no record carries a modal price.
fn summarize(commodity: &str, records: &[MandiRecord]) -> Option<PriceSummary> {
    let prices: Vec<f64> = records.iter().filter_map(|r| r.modal_price).collect();
    if prices.is_empty() {
        return None;
    }
    let mean = prices.iter().sum::<f64>() / prices.len() as f64;
    Some(PriceSummary {
        commodity: commodity.to_string(),
        average_price: (mean * 100.0).round() / 100.0,
        highest_price: prices.iter().copied().fold(f64::MIN, f64::max),
        lowest_price: prices.iter().copied().fold(f64::MAX, f64::min),
        market_count: records.len(),
    })
}

#[async_trait]
impl Fetcher for CommodityFetcher {
    fn name(&self) -> &str {
        "datagov-commodity"
    }

    async fn fetch(&self, key: &Key) -> FetchResult<Snapshot> {
        let symbol = match (key.source(), key.segments().as_slice()) {
            (Source::Commodity, [symbol]) => symbol.to_string(),
            _ => return Err(FetchError::Malformed(format!("not a commodity key: {key}"))),
        };

        let records = self.client.records(&symbol, None, self.limit).await?;
        let commodity = upstream_name(&symbol);
        let summary = summarize(&commodity, &records).ok_or_else(|| {
            FetchError::Malformed(format!("no priced records for {commodity}"))
        })?;

        let analytics = CommodityAnalytics {
            commodity,
            summary,
            market_data: records,
        };
        Ok(Snapshot::new(serde_json::to_value(analytics)?, self.ttl))
    }
}
