//! Report client for the Supabase REST (PostgREST) API.
//!
//! Every request asks the `SessionManager` for a valid token first, so a batch
//! of concurrent report fetches shares a single refresh when the token has
//! expired.

use std::time::Duration;

use futures::future::join_all;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::SessionManager;
use crate::models::{Report, ReportQuery, Row};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Shared HTTP client configuration.
pub fn build_http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .user_agent(concat!("supadesk/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Project URL and public (anon) API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupabaseEndpoint {
    url: String,
    anon_key: String,
}

impl SupabaseEndpoint {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        let url: String = url.into();
        Self {
            url: url.trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    pub fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.url, path)
    }

    pub fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.url, table)
    }
}

/// Retry behaviour for rate-limited requests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RATE_LIMIT_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }
}

/// Clone is cheap - reqwest::Client and SessionManager share their state.
#[derive(Clone)]
pub struct ReportClient {
    client: Client,
    endpoint: SupabaseEndpoint,
    session: SessionManager,
    retry: RetryPolicy,
}

impl ReportClient {
    pub fn new(endpoint: SupabaseEndpoint, session: SessionManager) -> Result<Self, ApiError> {
        Ok(Self::with_client(build_http_client()?, endpoint, session))
    }

    pub fn with_client(client: Client, endpoint: SupabaseEndpoint, session: SessionManager) -> Self {
        Self {
            client,
            endpoint,
            session,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Fetch the rows of one report.
    pub async fn fetch(&self, query: &ReportQuery) -> Result<Report, ApiError> {
        let url = self.endpoint.rest_url(&query.table);
        let rows: Vec<Row> = self.get(&url, &query.to_query_pairs()).await?;
        debug!(table = %query.table, rows = rows.len(), "Report fetched");
        Ok(Report::from_rows(query.table.clone(), rows))
    }

    /// Fetch several reports concurrently. Results are in query order.
    pub async fn fetch_all(&self, queries: &[ReportQuery]) -> Vec<Result<Report, ApiError>> {
        join_all(queries.iter().map(|query| self.fetch(query))).await
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<T, ApiError> {
        let mut retries = 0;
        let mut backoff = self.retry.initial_backoff;

        loop {
            // Asked on every attempt: the token may have been refreshed while backing off
            let token = self.session.valid_token().await?;

            let response = self
                .client
                .get(url)
                .query(query)
                .header("apikey", self.endpoint.anon_key())
                .bearer_auth(token.as_str())
                .send()
                .await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let text = response.text().await?;
                    return serde_json::from_str(&text).map_err(|e| {
                        ApiError::InvalidResponse(format!("Failed to parse JSON from {url}: {e}"))
                    });
                }
                None => {
                    retries += 1;
                    if retries > self.retry.max_retries {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(
                        url = url,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
}
