//! weatherapi.com forecast fetcher for `weather:<location>` keys.
//!
//! See: <https://www.weatherapi.com/docs/>

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::http::{build_client, check_status, read_json};
use super::{FetchResult, Fetcher};
use crate::error::{CacheError, FetchError};
use crate::key::{Key, Source};
use crate::snapshot::Snapshot;

/// Default base URL for weatherapi.com
pub const DEFAULT_WEATHER_URL: &str = "http://api.weatherapi.com/v1";

/// Days of forecast requested.
const FORECAST_DAYS: u8 = 7;

/// Fetcher for current conditions plus a daily forecast.
#[derive(Clone)]
pub struct WeatherApiFetcher {
    api_key: String,
    http: Client,
    base_url: String,
    ttl: Duration,
}

impl WeatherApiFetcher {
    /// Create a fetcher against the public weatherapi.com endpoint.
    pub fn new(api_key: impl Into<String>, ttl: Duration) -> Result<Self, CacheError> {
        Self::with_base_url(api_key, DEFAULT_WEATHER_URL, ttl)
    }

    /// Create a fetcher with a custom base URL (for testing with wiremock).
    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, CacheError> {
        Ok(Self {
            api_key: api_key.into(),
            http: build_client(Duration::from_secs(30))?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ttl,
        })
    }
}

#[async_trait]
impl Fetcher for WeatherApiFetcher {
    fn name(&self) -> &str {
        "weatherapi"
    }

    async fn fetch(&self, key: &Key) -> FetchResult<Snapshot> {
        if key.source() != Source::Weather {
            return Err(FetchError::Malformed(format!("not a weather key: {key}")));
        }
        let location = key.segments().join(":");
        let days = FORECAST_DAYS.to_string();

        let response = self
            .http
            .get(format!("{}/forecast.json", self.base_url))
            .query(&[
                ("key", self.api_key.as_str()),
                ("q", location.as_str()),
                ("days", days.as_str()),
                ("aqi", "no"),
                ("alerts", "no"),
            ])
            .send()
            .await?;
        let raw: RawForecast = read_json(check_status(response, "weatherapi")?).await?;

        let report = WeatherReport::from_raw(raw, &location);
        Ok(Snapshot::new(serde_json::to_value(report)?, self.ttl))
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Deserialize)]
struct RawForecast {
    #[serde(default)]
    location: Option<RawLocation>,
    current: RawCurrent,
    #[serde(default)]
    forecast: Option<RawForecastDays>,
}

#[derive(Deserialize)]
struct RawLocation {
    name: Option<String>,
    country: Option<String>,
}

#[derive(Deserialize)]
struct RawCondition {
    text: Option<String>,
    icon: Option<String>,
}

#[derive(Deserialize)]
struct RawCurrent {
    temp_c: Option<f64>,
    condition: Option<RawCondition>,
    humidity: Option<f64>,
    wind_kph: Option<f64>,
    precip_mm: Option<f64>,
}

#[derive(Deserialize)]
struct RawForecastDays {
    #[serde(default)]
    forecastday: Vec<RawForecastDay>,
}

#[derive(Deserialize)]
struct RawForecastDay {
    date: String,
    day: RawDay,
    #[serde(default)]
    astro: Option<RawAstro>,
}

#[derive(Deserialize)]
struct RawDay {
    avgtemp_c: Option<f64>,
    totalprecip_mm: Option<f64>,
    avghumidity: Option<f64>,
    daily_chance_of_rain: Option<f64>,
    condition: Option<RawCondition>,
}

#[derive(Deserialize)]
struct RawAstro {
    sunrise: Option<String>,
    sunset: Option<String>,
}

// ============================================================================
// Normalised payload
// ============================================================================

#[derive(Serialize)]
struct WeatherReport {
    location: String,
    country: String,
    current: CurrentConditions,
    astro: Astro,
    forecast: Vec<ForecastDay>,
}

#[derive(Serialize)]
struct CurrentConditions {
    temp_c: Option<f64>,
    condition: Option<String>,
    icon: Option<String>,
    humidity: Option<f64>,
    wind_kph: Option<f64>,
    precip_mm: Option<f64>,
}

#[derive(Serialize, Default)]
struct Astro {
    sunrise: String,
    sunset: String,
}

#[derive(Serialize)]
struct ForecastDay {
    date: String,
    avgtemp_c: Option<f64>,
    totalprecip_mm: Option<f64>,
    avghumidity: Option<f64>,
    condition: Option<String>,
    icon: Option<String>,
    daily_chance_of_rain: Option<f64>,
}

impl WeatherReport {
    fn from_raw(raw: RawForecast, requested: &str) -> Self {
        let days = raw.forecast.map(|f| f.forecastday).unwrap_or_default();
        let astro = days
            .first()
            .and_then(|d| d.astro.as_ref())
            .map(|a| Astro {
                sunrise: a.sunrise.clone().unwrap_or_default(),
                sunset: a.sunset.clone().unwrap_or_default(),
            })
            .unwrap_or_default();
        let (location, country) = match raw.location {
            Some(loc) => (loc.name, loc.country),
            None => (None, None),
        };
        let (condition, icon) = split_condition(raw.current.condition);

        Self {
            location: location.unwrap_or_else(|| requested.to_string()),
            country: country.unwrap_or_else(|| "India".to_string()),
            current: CurrentConditions {
                temp_c: raw.current.temp_c,
                condition,
                icon,
                humidity: raw.current.humidity,
                wind_kph: raw.current.wind_kph,
                precip_mm: raw.current.precip_mm,
            },
            astro,
            forecast: days
                .into_iter()
                .map(|d| {
                    let (condition, icon) = split_condition(d.day.condition);
                    ForecastDay {
                        date: d.date,
                        avgtemp_c: d.day.avgtemp_c,
                        totalprecip_mm: d.day.totalprecip_mm,
                        avghumidity: d.day.avghumidity,
                        condition,
                        icon,
                        daily_chance_of_rain: d.day.daily_chance_of_rain,
                    }
                })
                .collect(),
        }
    }
}

fn split_condition(condition: Option<RawCondition>) -> (Option<String>, Option<String>) {
    condition.map(|c| (c.text, c.icon)).unwrap_or_default()
}
