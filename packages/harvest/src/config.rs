use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

use crate::error::{Error, Result};
use crate::remote::FetchStrategy;
use crate::types::RetryPolicy;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://harvest.db?mode=rwc";
pub const DEFAULT_OPENROUTER_MODEL: &str = "openai/gpt-3.5-turbo-0613";
pub const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Settings for draining a backlog.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum extractions in flight at once
    pub concurrency: usize,
    /// Attempts per item, including the first
    pub max_attempts: u32,
    /// Retry delay is `backoff_base * attempt_count`
    pub backoff_base: Duration,
    /// `InProgress` items claimed longer ago than this are reclaimed before a drain
    pub stale_after: Duration,
    /// Per-attempt ceiling; `None` lets an extraction run indefinitely
    pub item_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_attempts: 2,
            backoff_base: Duration::from_secs(2),
            stale_after: Duration::from_secs(10 * 60),
            item_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_item_timeout(mut self, item_timeout: Duration) -> Self {
        self.item_timeout = Some(item_timeout);
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_base)
    }
}

/// Settings for driving a single remote job.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub poll_interval: Duration,
    /// Wall-clock budget for submit + poll
    pub max_wait: Duration,
    /// Result-retrieval strategies, tried in this order
    pub fetch_order: Vec<FetchStrategy>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(300),
            fetch_order: FetchStrategy::DEFAULT_ORDER.to_vec(),
        }
    }
}

impl PollConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_fetch_order(mut self, fetch_order: Vec<FetchStrategy>) -> Self {
        self.fetch_order = fetch_order;
        self
    }
}

/// Credentials and endpoints of the external collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub apify_token: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    pub openrouter_base_url: String,
    pub database_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            apify_token: None,
            openrouter_api_key: None,
            openrouter_model: DEFAULT_OPENROUTER_MODEL.to_string(),
            openrouter_base_url: DEFAULT_OPENROUTER_BASE_URL.to_string(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarvestConfig {
    pub engine: EngineConfig,
    pub poll: PollConfig,
    pub providers: ProviderConfig,
}

impl HarvestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source. Missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(concurrency) = parse_var::<usize>(&lookup, "MAX_CONCURRENT_SCRAPES")? {
            config.engine.concurrency = concurrency;
        }
        // MAX_RETRIES counts retries, not attempts
        if let Some(retries) = parse_var::<u32>(&lookup, "MAX_RETRIES")? {
            config.engine.max_attempts = retries.saturating_add(1);
        }
        if let Some(secs) = parse_var::<f64>(&lookup, "BACKOFF_BASE_SECONDS")? {
            config.engine.backoff_base = seconds("BACKOFF_BASE_SECONDS", secs)?;
        }
        if let Some(secs) = parse_var::<f64>(&lookup, "POLL_INTERVAL_SECONDS")? {
            config.poll.poll_interval = seconds("POLL_INTERVAL_SECONDS", secs)?;
        }
        if let Some(secs) = parse_var::<f64>(&lookup, "MAX_WAIT_SECONDS")? {
            config.poll.max_wait = seconds("MAX_WAIT_SECONDS", secs)?;
        }

        let providers = &mut config.providers;
        providers.apify_token = non_empty(lookup("APIFY_KEY"));
        providers.openrouter_api_key = non_empty(lookup("OPENROUTER_API_KEY"));
        if let Some(model) = non_empty(lookup("OPENROUTER_MODEL")) {
            providers.openrouter_model = model;
        }
        if let Some(base_url) = non_empty(lookup("OPENROUTER_BASE_URL")) {
            providers.openrouter_base_url = base_url;
        }
        if let Some(database_url) = non_empty(lookup("DATABASE_URL")) {
            providers.database_url = database_url;
        }

        Ok(config)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match non_empty(lookup(key)) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{} must be a valid number, got {:?}", key, raw))),
    }
}

fn seconds(key: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| Error::Config(format!("{} must be a non-negative number of seconds", key)))
}
