//! Mandi price fetcher for `mandi:<commodity>:<market>` keys.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::datagov::DataGovClient;
use super::{FetchResult, Fetcher};
use crate::error::FetchError;
use crate::key::{Key, Source};
use crate::snapshot::Snapshot;

/// Records requested per market.
const DEFAULT_LIMIT: u32 = 50;

/// Latest price records for one commodity in one market.
#[derive(Clone)]
pub struct MandiPriceFetcher {
    client: DataGovClient,
    ttl: Duration,
    limit: u32,
}

impl MandiPriceFetcher {
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

#[async_trait]
impl Fetcher for MandiPriceFetcher {
    fn name(&self) -> &str {
        "datagov-mandi"
    }

    async fn fetch(&self, key: &Key) -> FetchResult<Snapshot> {
        let (commodity, market) = match (key.source(), key.segments().as_slice()) {
            (Source::Mandi, [commodity, market]) => (commodity.to_string(), market.to_string()),
            _ => return Err(FetchError::Malformed(format!("not a mandi key: {key}"))),
        };

        let records = self
            .client
            .records(&commodity, Some(&market), self.limit)
            .await?;
        if records.is_empty() {
            return Err(FetchError::Malformed(format!(
                "no mandi records for {commodity} in {market}"
            )));
        }

        let payload = json!({
            "commodity": commodity,
            "market": market,
            "records": records,
        });
        Ok(Snapshot::new(payload, self.ttl))
    }
}
