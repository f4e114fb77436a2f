//! Outbound JSON client shared by the catalog, batch and notification
//! adapters.

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("client setup failed: {0}")]
    Build(String),
}

impl HttpError {
    /// Transport problems and 5xx/429 answers are worth another attempt.
    fn is_retryable(&self) -> bool {
        match self {
            HttpError::RequestFailed(_) | HttpError::Timeout => true,
            HttpError::Status { status, .. } => *status >= 500 || *status == 429,
            HttpError::Decode(_) | HttpError::Build(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, HttpError>;

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Total attempts, first one included
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            user_agent: concat!("geobatch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    config: HttpConfig,
    bearer_token: Option<String>,
}

impl HttpClient {
    pub fn new(config: HttpConfig, bearer_token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| HttpError::Build(e.to_string()))?;

        Ok(Self {
            client,
            config,
            bearer_token,
        })
    }

    /// Send a request and decode a JSON answer, retrying with exponential
    /// backoff.
    pub async fn send_json<B, T>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let bytes = self.send_with_retry(method, url, query, body).await?;
        if bytes.is_empty() {
            return serde_json::from_slice(b"null").map_err(|e| HttpError::Decode(e.to_string()));
        }
        serde_json::from_slice(&bytes).map_err(|e| HttpError::Decode(e.to_string()))
    }

    /// Like [`send_json`](Self::send_json) but discards the response body.
    pub async fn send<B>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<()>
    where
        B: Serialize + ?Sized,
    {
        self.send_with_retry(method, url, query, body).await.map(|_| ())
    }

    async fn send_with_retry<B>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<bytes::Bytes>
    where
        B: Serialize + ?Sized,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(method.clone(), url, query, body).await {
                Ok(bytes) => {
                    if attempt > 1 {
                        debug!(url, attempt, "Request succeeded after retry");
                    }
                    return Ok(bytes);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    warn!(url, attempt, error = %e, "Request failed, retrying");
                    let backoff = self.config.retry_backoff * 2u32.pow(attempt - 1);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    warn!(url, attempt, error = %e, "Request failed");
                    return Err(e);
                }
            }
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_once<B>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<bytes::Bytes>
    where
        B: Serialize + ?Sized,
    {
        let mut request = self.request(method, url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpError::Timeout
            } else {
                HttpError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| HttpError::RequestFailed(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            return Err(HttpError::Status {
                status: status.as_u16(),
                body: truncate(&String::from_utf8_lossy(&bytes), 512),
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(bytes::Bytes::new());
        }
        Ok(bytes)
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.max_attempts, 3);
        assert!(config.user_agent.starts_with("geobatch/"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(HttpError::Timeout.is_retryable());
        assert!(HttpError::RequestFailed("reset".into()).is_retryable());
        assert!(
            HttpError::Status {
                status: 503,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            HttpError::Status {
                status: 429,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            !HttpError::Status {
                status: 400,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(!HttpError::Decode("eof".into()).is_retryable());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }

    #[test]
    fn test_client_builds() {
        assert!(HttpClient::new(HttpConfig::default(), Some("token".into())).is_ok());
    }
}
