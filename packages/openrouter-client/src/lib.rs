//! Pure OpenRouter REST API client
//!
//! A minimal client for OpenRouter's OpenAI-compatible chat completions
//! endpoint. Any OpenAI-compatible server works by overriding the base URL.
//!
//! # Example
//!
//! ```rust,ignore
//! use openrouter_client::{ChatRequest, Message, OpenRouterClient};
//!
//! let client = OpenRouterClient::from_env()?;
//!
//! let response = client
//!     .chat_completion(
//!         ChatRequest::new("openai/gpt-3.5-turbo-0613")
//!             .message(Message::system("Reply in JSON"))
//!             .message(Message::user("List three colors"))
//!             .json_mode(),
//!     )
//!     .await?;
//! ```

pub mod error;
pub mod types;

pub use error::{OpenRouterError, Result};
pub use types::*;

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Per-request cap applied by [`OpenRouterClient::new`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct OpenRouterClient {
    http_client: Client,
    api_key: String,
    base_url: String,
    app_name: Option<String>,
}

impl OpenRouterClient {
    /// Requests are capped at [`DEFAULT_TIMEOUT`].
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http_client: client_with_timeout(DEFAULT_TIMEOUT),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            app_name: None,
        }
    }

    /// Create from `OPENROUTER_API_KEY`, honoring `OPENROUTER_BASE_URL` when set.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| OpenRouterError::Config("OPENROUTER_API_KEY not set".into()))?;
        let client = Self::new(api_key);
        Ok(match std::env::var("OPENROUTER_BASE_URL") {
            Ok(url) => client.with_base_url(url),
            Err(_) => client,
        })
    }

    /// Set a custom base URL (self-hosted gateways, OpenAI itself, tests).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Application name sent as `X-Title` for OpenRouter's usage attribution.
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Use a preconfigured HTTP client (timeouts, proxies).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http_client = client;
        self
    }

    /// Replace the per-request timeout.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_http_client(client_with_timeout(timeout))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Chat completion.
    pub async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse> {
        let start = std::time::Instant::now();

        let mut builder = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request);
        if let Some(name) = &self.app_name {
            builder = builder.header("X-Title", name);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(error = %e, "OpenRouter request failed");
            OpenRouterError::Network(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "OpenRouter API error");
            return Err(OpenRouterError::Api {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let raw: types::ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| OpenRouterError::Parse(e.to_string()))?;

        let content = raw
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OpenRouterError::Parse("response has no message content".into()))?;

        debug!(
            model = %request.model,
            duration_ms = start.elapsed().as_millis(),
            "OpenRouter chat completion"
        );

        Ok(ChatResponse {
            content,
            model: raw.model,
            usage: raw.usage,
        })
    }

    /// Ask for a JSON object and parse it, tolerating a surrounding code fence.
    pub async fn json_completion(
        &self,
        model: &str,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Result<serde_json::Value> {
        let request = ChatRequest::new(model)
            .message(Message::system(system_prompt))
            .message(Message::user(user_prompt))
            .temperature(0.0)
            .json_mode();

        let response = self.chat_completion(request).await?;
        serde_json::from_str(strip_code_blocks(&response.content))
            .map_err(|e| OpenRouterError::Parse(format!("model did not return JSON: {}", e)))
    }
}

fn client_with_timeout(timeout: Duration) -> Client {
    Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        warn!(error = %e, "failed to build HTTP client with timeout, using defaults");
        Client::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn test_client_builder() {
        let client = OpenRouterClient::new("sk-test").with_base_url("https://custom.api.com/");

        assert_eq!(client.api_key, "sk-test");
        assert_eq!(client.base_url(), "https://custom.api.com");
    }

    #[tokio::test]
    async fn test_json_completion_strips_fences() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat/completions")
                    .header("authorization", "Bearer sk-test");
                then.status(200).json_body(json!({
                    "model": "openai/gpt-3.5-turbo-0613",
                    "choices": [{
                        "message": { "content": "```json\n{\"names\": [\"Ada\"]}\n```" }
                    }]
                }));
            })
            .await;

        let client = OpenRouterClient::new("sk-test").with_base_url(server.base_url());
        let value = client
            .json_completion("openai/gpt-3.5-turbo-0613", "system", "user")
            .await
            .unwrap();

        assert_eq!(value["names"][0], "Ada");
    }

    #[tokio::test]
    async fn test_hung_request_times_out_as_network_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).delay(Duration::from_millis(500)).json_body(json!({
                    "choices": [{ "message": { "content": "late" } }]
                }));
            })
            .await;

        let client = OpenRouterClient::new("k")
            .with_base_url(server.base_url())
            .with_timeout(Duration::from_millis(50));
        let err = client
            .chat_completion(ChatRequest::new("m").message(Message::user("hi")))
            .await
            .unwrap_err();

        assert!(matches!(err, OpenRouterError::Network(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(429).body("slow down");
            })
            .await;

        let client = OpenRouterClient::new("k").with_base_url(server.base_url());
        let err = client
            .chat_completion(ChatRequest::new("m").message(Message::user("hi")))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(matches!(err, OpenRouterError::Api { status: 429, .. }));
    }
}
