//! data.gov.in client for daily mandi price records.
//!
//! Both the mandi price fetcher and the commodity analytics fetcher read the
//! same "current daily price of various commodities" resource; they differ
//! only in filters and in what they build from the records.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::FetchResult;
use super::http::{build_client, check_status, read_json};
use crate::error::CacheError;

/// Default URL of the daily mandi price resource on data.gov.in.
pub const DEFAULT_DATAGOV_URL: &str =
    "https://api.data.gov.in/resource/9ef84268-d588-465a-a308-a864a43d0070";

const DEFAULT_UNIT: &str = "Rs/Quintal";

/// Thin client over the data.gov.in records API.
#[derive(Clone)]
pub struct DataGovClient {
    api_key: String,
    http: Client,
    url: String,
}

impl DataGovClient {
    /// Create a client against the public resource URL.
    pub fn new(api_key: impl Into<String>) -> Result<Self, CacheError> {
        Self::with_url(api_key, DEFAULT_DATAGOV_URL)
    }

    /// Create a client with a custom resource URL (for testing with wiremock).
    pub fn with_url(api_key: impl Into<String>, url: impl Into<String>) -> Result<Self, CacheError> {
        Ok(Self {
            api_key: api_key.into(),
            http: build_client(Duration::from_secs(30))?,
            url: url.into(),
        })
    }

    /// Fetch up to `limit` records matching the commodity (and optionally
    /// the market), normalised.
    pub async fn records(
        &self,
        commodity: &str,
        market: Option<&str>,
        limit: u32,
    ) -> FetchResult<Vec<MandiRecord>> {
        let commodity = upstream_name(commodity);
        let limit = limit.to_string();
        let mut query: Vec<(&str, String)> = vec![
            ("api-key", self.api_key.clone()),
            ("format", "json".to_string()),
            ("limit", limit),
            ("filters[commodity]", commodity.clone()),
        ];
        if let Some(market) = market {
            query.push(("filters[market]", upstream_name(market)));
        }

        let response = self.http.get(&self.url).query(&query).send().await?;
        let page: RawPage = read_json(check_status(response, "data.gov.in")?).await?;

        Ok(page
            .records
            .into_iter()
            .map(|r| MandiRecord::from_raw(r, &commodity))
            .collect())
    }
}

/// One normalised mandi price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MandiRecord {
    pub state: String,
    pub district: String,
    pub market: String,
    pub commodity: String,
    pub variety: String,
    pub arrival_date: String,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub modal_price: Option<f64>,
    pub unit: String,
}

impl MandiRecord {
    fn from_raw(raw: RawRecord, commodity: &str) -> Self {
        Self {
            state: raw.state.or(raw.state_name).unwrap_or_default(),
            district: raw.district.unwrap_or_default(),
            market: raw.market.or(raw.market_name).unwrap_or_default(),
            commodity: commodity.to_string(),
            variety: raw.variety.unwrap_or_default(),
            arrival_date: raw.arrival_date.unwrap_or_default(),
            min_price: raw.min_price.and_then(PriceField::value),
            max_price: raw.max_price.and_then(PriceField::value),
            modal_price: raw.modal_price.and_then(PriceField::value),
            unit: raw.price_unit.unwrap_or_else(|| DEFAULT_UNIT.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct RawPage {
    #[serde(default)]
    records: Vec<RawRecord>,
}

#[derive(Deserialize)]
struct RawRecord {
    state: Option<String>,
    state_name: Option<String>,
    district: Option<String>,
    market: Option<String>,
    market_name: Option<String>,
    variety: Option<String>,
    arrival_date: Option<String>,
    min_price: Option<PriceField>,
    max_price: Option<PriceField>,
    modal_price: Option<PriceField>,
    price_unit: Option<String>,
}

/// data.gov.in serves prices as strings on some resources and numbers on
/// others.
#[derive(Deserialize)]
#[serde(untagged)]
enum PriceField {
    Number(f64),
    Text(String),
}

impl PriceField {
    fn value(self) -> Option<f64> {
        let value = match self {
            PriceField::Number(n) => Some(n),
            PriceField::Text(s) => s.trim().parse::<f64>().ok(),
        };
        value.filter(|v| v.is_finite())
    }
}

/// Spell a lowercased key segment the way data.gov.in lists names: every
/// alphabetic run starts upper case, so `paddy(dhan)(common)` becomes
/// `Paddy(Dhan)(Common)`. The filters are case-sensitive and keys are
/// lowercase, so names with acronyms (`Ujjain APMC`) cannot be matched.
pub(crate) fn upstream_name(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut word_start = true;
    for c in segment.chars() {
        if c.is_alphabetic() {
            if word_start {
                out.extend(c.to_uppercase());
            } else {
                out.push(c);
            }
            word_start = false;
        } else {
            out.push(c);
            word_start = true;
        }
    }
    out
}
