//! Pure Apify REST API client.
//!
//! A minimal client for the Apify platform API. Supports starting actor runs,
//! reading run metadata, and fetching results through every storage surface a
//! run can write to (its default dataset, an explicit dataset, or a
//! key-value-store record).
//!
//! # Example
//!
//! ```rust,ignore
//! use apify_client::{actors, ApifyClient};
//!
//! let client = ApifyClient::new("your-api-token".into());
//!
//! let actor_id = actors::INDEED_JOBS[0];
//! if client.actor_exists(actor_id).await? {
//!     let run = client
//!         .start_run(actor_id, &serde_json::json!({ "position": "nurse" }))
//!         .await?;
//! }
//! let run = client.get_run(&run.id).await?;
//! let rows: Vec<serde_json::Value> = client.run_dataset_items(&run.id).await?;
//! ```

pub mod error;
pub mod types;

pub use error::{ApifyError, Result};
pub use types::{RunData, RunStatus};

use std::time::Duration;

use serde::de::DeserializeOwned;
use types::ApiResponse;

const BASE_URL: &str = "https://api.apify.com/v2";

/// Per-request cap applied by [`ApifyClient::new`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Job board actors, preferred first.
pub mod actors {
    pub const INDEED_JOBS: &[&str] = &[
        "dtrungtin~indeed-scraper",
        "misceres~indeed-scraper",
        "nwua9Gu5YrADL7ZDj",
    ];
    pub const LINKEDIN_JOBS: &[&str] = &[
        "bebity~linkedin-jobs-scraper",
        "misceres~linkedin-jobs-scraper",
    ];

    /// Actors for a job board by name, case-insensitive.
    pub fn for_platform(platform: &str) -> Option<&'static [&'static str]> {
        match platform.to_ascii_lowercase().as_str() {
            "indeed" => Some(INDEED_JOBS),
            "linkedin" => Some(LINKEDIN_JOBS),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct ApifyClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl ApifyClient {
    /// Every request is capped at [`DEFAULT_TIMEOUT`]; use
    /// [`with_http_client`](Self::with_http_client) for a different policy.
    pub fn new(token: String) -> Self {
        Self {
            client: http_client_with_timeout(DEFAULT_TIMEOUT),
            token,
            base_url: BASE_URL.to_string(),
        }
    }

    /// Create from environment variable `APIFY_KEY`.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("APIFY_KEY")
            .map_err(|_| ApifyError::Config("APIFY_KEY not set".into()))?;
        Ok(Self::new(token))
    }

    /// Point the client at a different API root (proxies, tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Use a preconfigured HTTP client (timeouts, user agent).
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Replace the per-request timeout.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_http_client(http_client_with_timeout(timeout))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether the actor exists and is visible to this token.
    pub async fn actor_exists(&self, actor_id: &str) -> Result<bool> {
        let url = format!("{}/acts/{}", self.base_url, actor_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::FORBIDDEN {
            return Ok(false);
        }

        Self::ensure_success(resp).await?;
        Ok(true)
    }

    /// Start an actor run with the given JSON input. Returns immediately with run metadata.
    pub async fn start_run(&self, actor_id: &str, input: &serde_json::Value) -> Result<RunData> {
        let url = format!("{}/acts/{}/runs", self.base_url, actor_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(input)
            .send()
            .await?;

        let resp = Self::ensure_success(resp).await?;
        let api_resp: ApiResponse<RunData> = resp.json().await?;
        tracing::debug!(actor_id, run_id = %api_resp.data.id, "Apify run started");
        Ok(api_resp.data)
    }

    /// Read the current metadata of a run, without waiting.
    pub async fn get_run(&self, run_id: &str) -> Result<RunData> {
        let url = format!("{}/actor-runs/{}", self.base_url, run_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let resp = Self::ensure_success(resp).await?;
        let api_resp: ApiResponse<RunData> = resp.json().await?;
        Ok(api_resp.data)
    }

    /// Fetch items from the default dataset attached to a run.
    pub async fn run_dataset_items<T: DeserializeOwned>(&self, run_id: &str) -> Result<Vec<T>> {
        let url = format!(
            "{}/actor-runs/{}/dataset/items?format=json",
            self.base_url, run_id
        );
        self.get_items(&url).await
    }

    /// Fetch items from a dataset by id.
    pub async fn dataset_items<T: DeserializeOwned>(&self, dataset_id: &str) -> Result<Vec<T>> {
        let url = format!(
            "{}/datasets/{}/items?format=json",
            self.base_url, dataset_id
        );
        self.get_items(&url).await
    }

    /// Read a record from a key-value store. Returns `None` when the record does not exist.
    pub async fn key_value_record(
        &self,
        store_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let url = format!(
            "{}/key-value-stores/{}/records/{}",
            self.base_url, store_id, key
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let resp = Self::ensure_success(resp).await?;
        let record: serde_json::Value = resp.json().await?;
        Ok(Some(record))
    }

    async fn get_items<T: DeserializeOwned>(&self, url: &str) -> Result<Vec<T>> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let resp = Self::ensure_success(resp).await?;
        let items: Vec<T> = resp.json().await?;
        Ok(items)
    }

    async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(ApifyError::Api {
            status: status.as_u16(),
            message: body,
        })
    }
}

fn http_client_with_timeout(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to build HTTP client with timeout, using defaults");
            reqwest::Client::new()
        })
}
