//! Shared HTTP plumbing for the reqwest-based fetchers.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::FetchResult;
use crate::error::{CacheError, FetchError};

/// Build the HTTP client used by a fetcher.
///
/// The client-level timeout is a backstop; the per-attempt bound comes from
/// the registry's [`FetchPolicy`](super::FetchPolicy).
pub(crate) fn build_client(timeout: Duration) -> Result<Client, CacheError> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("agripulse/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| CacheError::Configuration(format!("failed to build HTTP client: {e}")))
}

/// Map non-success statuses onto the fetch error taxonomy.
pub(crate) fn check_status(response: Response, upstream: &str) -> FetchResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            Err(FetchError::RateLimited { retry_after })
        }
        code => Err(FetchError::Upstream(format!("{upstream} returned HTTP {code}"))),
    }
}

/// Read the body and decode it as JSON. Undecodable bodies are `Malformed`.
pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> FetchResult<T> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(FetchError::from)
}
