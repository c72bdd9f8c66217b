//! HTTP client for the OpenAQ v3 API.
//!
//! Every request goes through the rate budget first. Transient failures are
//! retried with exponential backoff; 429 responses wait out the reported
//! reset without consuming the retry budget; 404 is an expected "no data"
//! outcome, not an error. Callers that receive `None` decide for themselves
//! whether absence is fatal.

use crate::openaq::errors::OpenAqError;
use crate::openaq::json::parse_json_with_path;
use crate::openaq::models::{LocationData, Page, RawMeasurement};
use crate::openaq::rate_limit::RateBudget;
use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra wait on top of the server-reported rate-limit reset.
const RATE_RESET_MARGIN: Duration = Duration::from_secs(1);

/// Base delay for exponential backoff; doubles per failed attempt.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Page size for the historical measurements endpoint.
const HISTORY_PAGE_SIZE: u64 = 1000;

pub struct OpenAqApi {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    budget: Mutex<RateBudget>,
}

impl OpenAqApi {
    pub fn new(base_url: String, api_key: String) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            budget: Mutex::new(RateBudget::new()),
        })
    }

    /// Fetch one page of the location catalog, filtered by country and
    /// sorted by id ascending for stable pagination.
    pub async fn list_locations(
        &self,
        country_id: i64,
        page: u32,
        limit: u32,
    ) -> Result<Option<Page<LocationData>>, OpenAqError> {
        self.fetch(
            "/locations",
            &[
                ("countries_id", country_id.to_string()),
                ("limit", limit.to_string()),
                ("page", page.to_string()),
                ("sort", "id".to_string()),
                ("order", "asc".to_string()),
            ],
        )
        .await
    }

    /// Fetch the most recent reading per sensor for a location. A location
    /// with no live sensors comes back as an empty list.
    pub async fn latest_for_location(
        &self,
        location_openaq_id: i64,
    ) -> Result<Vec<RawMeasurement>, OpenAqError> {
        let page: Option<Page<RawMeasurement>> = self
            .fetch(&format!("/locations/{location_openaq_id}/latest"), &[])
            .await?;
        Ok(page.map(|p| p.results).unwrap_or_default())
    }

    /// Fetch historical measurements for a (location, parameter) pair since
    /// `date_from`, walking every page.
    pub async fn location_measurements(
        &self,
        location_openaq_id: i64,
        parameter: &str,
        date_from: DateTime<Utc>,
    ) -> Result<Vec<RawMeasurement>, OpenAqError> {
        self.fetch_all_pages(
            "/measurements",
            &[
                ("location_id", location_openaq_id.to_string()),
                ("parameter", parameter.to_string()),
                (
                    "date_from",
                    date_from.to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
            ],
            HISTORY_PAGE_SIZE,
        )
        .await
    }

    /// GET a JSON payload with rate limiting and retries.
    ///
    /// Returns `Ok(None)` for 404 and for transient failures that survive
    /// all retry attempts.
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, OpenAqError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 0;

        while attempt < MAX_ATTEMPTS {
            self.budget.lock().await.acquire().await;

            let result = self
                .http
                .get(&url)
                .header("X-API-Key", &self.api_key)
                .query(query)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    attempt += 1;
                    warn!(
                        url = %url,
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        error = %e,
                        "Request failed"
                    );
                    if attempt < MAX_ATTEMPTS {
                        time::sleep(backoff_delay(attempt)).await;
                    }
                    continue;
                }
            };

            if let Some(remaining) = header_u32(&response, "x-ratelimit-remaining") {
                self.budget.lock().await.observe_remaining(remaining);
            }

            let status = response.status();
            match status {
                StatusCode::TOO_MANY_REQUESTS => {
                    // Not counted against the attempt budget.
                    let reset = header_u32(&response, "x-ratelimit-reset").unwrap_or(60);
                    warn!(url = %url, reset_secs = reset, "Rate limited, waiting for reset");
                    time::sleep(Duration::from_secs(u64::from(reset)) + RATE_RESET_MARGIN).await;
                    continue;
                }
                StatusCode::NOT_FOUND => {
                    debug!(url = %url, ?query, "Resource not found");
                    return Ok(None);
                }
                s if s.is_success() => {
                    let body = response
                        .text()
                        .await
                        .context("Failed to read response body")?;
                    return parse_json_with_path(&body).map(Some).map_err(|source| {
                        OpenAqError::ParseFailed {
                            status: status.as_u16(),
                            url: url.clone(),
                            source,
                        }
                    });
                }
                s => {
                    attempt += 1;
                    warn!(
                        url = %url,
                        status = s.as_u16(),
                        attempt,
                        max_attempts = MAX_ATTEMPTS,
                        "Unexpected status"
                    );
                    if attempt < MAX_ATTEMPTS {
                        time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        warn!(url = %url, "Exhausted retry attempts, treating as no data");
        Ok(None)
    }

    /// Drive full pagination for a paged endpoint, accumulating results
    /// until the reported found count is covered or a page comes back empty.
    async fn fetch_all_pages<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        limit: u64,
    ) -> Result<Vec<T>, OpenAqError> {
        let mut results = Vec::new();
        let mut page: u64 = 1;

        loop {
            let mut paged_query: Vec<(&str, String)> = query.to_vec();
            paged_query.push(("limit", limit.to_string()));
            paged_query.push(("page", page.to_string()));

            let Some(body) = self.fetch::<Page<T>>(path, &paged_query).await? else {
                break;
            };

            let fetched = body.results.len() as u64;
            results.extend(body.results);

            let found = body
                .meta
                .found
                .as_ref()
                .map(|f| f.lower_bound())
                .unwrap_or(0);
            if !has_more_pages(page, limit, fetched, found) {
                break;
            }
            page += 1;
        }

        Ok(results)
    }
}

/// Whether another page should be requested. The found count is a lower
/// bound; an empty page always terminates regardless of what it claims.
fn has_more_pages(page: u64, limit: u64, fetched_on_page: u64, found_lower_bound: u64) -> bool {
    if fetched_on_page == 0 {
        return false;
    }
    page * limit < found_lower_bound
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1));
    base + Duration::from_millis(rand::random_range(0..250))
}

fn header_u32(response: &reqwest::Response, name: &str) -> Option<u32> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_terminates_on_empty_page() {
        assert!(!has_more_pages(1, 100, 0, 10_000));
    }

    #[test]
    fn pagination_covers_open_ended_found() {
        // found = "greater than 500" parses to a lower bound of 500 with
        // limit 100: pages 1..=4 continue, page 5 covers the bound.
        let found = 500;
        let limit = 100;
        for page in 1..5 {
            assert!(has_more_pages(page, limit, limit, found), "page {page}");
        }
        assert!(!has_more_pages(5, limit, limit, found));
    }

    #[test]
    fn pagination_stops_when_found_is_missing() {
        assert!(!has_more_pages(1, 100, 100, 0));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let first = backoff_delay(1);
        let second = backoff_delay(2);
        let third = backoff_delay(3);
        assert!(first >= Duration::from_secs(1));
        assert!(second >= Duration::from_secs(2));
        assert!(third >= Duration::from_secs(4));
        assert!(third < Duration::from_secs(5));
    }
}
