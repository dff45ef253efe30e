//! External AI provider.
//!
//! Handlers talk to the provider through [`Provider`] so tests can swap in a
//! scripted implementation. [`HttpProvider`] is the production client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::error::{WorkerError, WorkerResult};

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Classified provider failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider timed out: {0}")]
    Timeout(String),

    #[error("Provider rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Provider server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Provider connection failed: {0}")]
    Connection(String),

    #[error("Provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Transient failures say something about provider health; these are
    /// the ones the circuit breaker counts.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_)
                | ProviderError::RateLimited { .. }
                | ProviderError::Server { .. }
                | ProviderError::Connection(_)
        )
    }

    fn from_status(status: StatusCode, body: String, retry_after: Option<u64>) -> Self {
        let message = truncate(body, 512);
        if status == StatusCode::TOO_MANY_REQUESTS {
            ProviderError::RateLimited {
                retry_after_secs: retry_after,
            }
        } else if status.is_server_error() {
            ProviderError::Server {
                status: status.as_u16(),
                message,
            }
        } else {
            ProviderError::Rejected {
                status: status.as_u16(),
                message,
            }
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else if e.is_decode() {
            ProviderError::InvalidResponse(e.to_string())
        } else {
            ProviderError::Connection(e.to_string())
        }
    }
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

/// One provider call.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRequest {
    /// Provider task, e.g. `categorize`
    pub task: String,
    pub user_id: String,
    pub input: serde_json::Value,
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn call(&self, request: &ProviderRequest) -> ProviderResult<serde_json::Value>;
}

/// Provider endpoint configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Per-call timeout, independent of queue backoff
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ProviderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("PROVIDER_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("PROVIDER_API_KEY").ok().filter(|k| !k.is_empty()),
            timeout: std::env::var("PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            connect_timeout: defaults.connect_timeout,
        }
    }
}

/// JSON-over-HTTP provider client. Each task is `POST {base_url}/v1/{task}`.
#[derive(Clone)]
pub struct HttpProvider {
    http: Client,
    config: ProviderConfig,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> WorkerResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("spendbot-worker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WorkerError::config_error(format!("HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, task: &str) -> String {
        format!("{}/v1/{}", self.config.base_url.trim_end_matches('/'), task)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn call(&self, request: &ProviderRequest) -> ProviderResult<serde_json::Value> {
        let url = self.endpoint(&request.task);
        debug!(task = %request.task, user_id = %request.user_id, "Calling provider");

        let mut builder = self.http.post(&url).json(&serde_json::json!({
            "user_id": request.user_id,
            "input": request.input,
        }));
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body, retry_after));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, timeout: Duration) -> HttpProvider {
        HttpProvider::new(ProviderConfig {
            base_url: server.uri(),
            api_key: Some("test-key".to_string()),
            timeout,
            connect_timeout: Duration::from_secs(1),
        })
        .unwrap()
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            task: "categorize".to_string(),
            user_id: "u1".to_string(),
            input: serde_json::json!({"text": "coffee 3.50"}),
        }
    }

    #[tokio::test]
    async fn returns_body_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/categorize"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"category": "food"})),
            )
            .mount(&server)
            .await;

        let output = provider(&server, Duration::from_secs(5)).call(&request()).await.unwrap();
        assert_eq!(output["category"], "food");
    }

    #[tokio::test]
    async fn classifies_rate_limit_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = provider(&server, Duration::from_secs(5)).call(&request()).await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::RateLimited {
                retry_after_secs: Some(7)
            }
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn classifies_server_error_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = provider(&server, Duration::from_secs(5)).call(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Server { status: 503, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn classifies_client_error_as_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad input"))
            .mount(&server)
            .await;

        let err = provider(&server, Duration::from_secs(5)).call(&request()).await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Rejected {
                status: 422,
                message: "bad input".to_string()
            }
        );
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn enforces_call_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let err = provider(&server, Duration::from_millis(50)).call(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn non_json_success_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = provider(&server, Duration::from_secs(5)).call(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "ééé".to_string();
        assert_eq!(truncate(s, 3), "é");
    }
}
