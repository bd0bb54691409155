use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::de::DeserializeOwned;
use std::{future::Future, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::SnapshotError;

/// Failures of a single outbound telemetry call
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TelemetryError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connect timeout: {0}")]
    ConnectTimeout(String),
    #[error("read timeout: {0}")]
    ReadTimeout(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl TelemetryError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        let text = err.to_string();
        if err.is_connect() && err.is_timeout() {
            Self::ConnectTimeout(text)
        } else if err.is_connect() {
            Self::Connect(text)
        } else if err.is_timeout() {
            Self::ReadTimeout(text)
        } else if err.is_decode() {
            Self::Malformed(text)
        } else if let Some(status) = err.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Transport(text)
        }
    }

    /// Counts towards the connect error counter.
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::ConnectTimeout(_))
    }

    /// Counts towards the read error counter.
    pub fn is_read(&self) -> bool {
        matches!(self, Self::ReadTimeout(_))
    }

    /// Worth another attempt within the same cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_) | Self::ConnectTimeout(_) | Self::ReadTimeout(_) | Self::Transport(_) => true,
            Self::Status(code) => *code >= 500,
            Self::Malformed(_) => false,
        }
    }
}

impl From<SnapshotError> for TelemetryError {
    fn from(err: SnapshotError) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Bounded retry with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt; the next control cycle is the retry.
    pub const NONE: Self = Self {
        max_retries: 0,
        backoff: Duration::ZERO,
    };

    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, TelemetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TelemetryError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    warn!(
                        request = what,
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "request failed, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

/// Basic-auth pair; applied only when the username is non-empty
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_parts(username: &str, password: &str) -> Option<Self> {
        (!username.trim().is_empty()).then(|| Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Shared HTTP plumbing for every device endpoint: one pooled client with a
/// request timeout, optional basic auth and a retry policy.
#[derive(Debug, Clone)]
pub struct HttpJsonClient {
    client: reqwest::Client,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
}

impl HttpJsonClient {
    pub fn new(timeout: Duration, credentials: Option<Credentials>, retry: RetryPolicy) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("zero-feed-in/", env!("CARGO_PKG_VERSION"))),
        );
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            credentials,
            retry,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some(c) => req.basic_auth(&c.username, Some(&c.password)),
            None => req,
        }
    }

    async fn respond(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, TelemetryError> {
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(TelemetryError::from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TelemetryError::Status(status.as_u16()));
        }
        Ok(resp)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<String, TelemetryError> {
        self.respond(req)
            .await?
            .text()
            .await
            .map_err(TelemetryError::from_reqwest)
    }

    pub async fn get_text(&self, url: &str) -> Result<String, TelemetryError> {
        debug!(url, "GET");
        self.retry
            .run(url, move || self.send(self.client.get(url)))
            .await
    }

    /// GET and decode; a body that does not decode is `Malformed` and not retried.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, TelemetryError> {
        debug!(url, "GET");
        self.retry
            .run(url, move || async move {
                self.respond(self.client.get(url))
                    .await?
                    .json::<T>()
                    .await
                    .map_err(TelemetryError::from_reqwest)
            })
            .await
    }

    /// POST a single form field `data=<payload>` (the OpenDTU write convention).
    pub async fn post_data(&self, url: &str, payload: &str) -> Result<String, TelemetryError> {
        debug!(url, payload, "POST");
        self.retry
            .run(url, move || {
                let req = self
                    .client
                    .post(url)
                    .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .form(&[("data", payload)]);
                self.send(req)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_retry_honours_attempt_count() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(5));
        let result: Result<(), _> = policy
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TelemetryError::Connect("refused".into()))
            })
            .await;

        assert!(matches!(result, Err(TelemetryError::Connect(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_waits_backoff_between_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(20));
        let start = tokio::time::Instant::now();
        let _: Result<(), _> = policy
            .run("test", || async { Err(TelemetryError::ReadTimeout("slow".into())) })
            .await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_malformed_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let _: Result<(), _> = policy
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TelemetryError::Malformed("bad".into()))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_recovers_on_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = HttpJsonClient::new(
            Duration::from_secs(2),
            None,
            RetryPolicy::new(1, Duration::from_millis(1)),
        )
        .unwrap();
        let body = client.get_text(&format!("{}/status", server.uri())).await.unwrap();
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_status_error_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpJsonClient::new(Duration::from_secs(2), None, RetryPolicy::NONE).unwrap();
        let err = client.get_text(&server.uri()).await.unwrap_err();
        assert_eq!(err, TelemetryError::Status(401));
    }

    #[tokio::test]
    async fn test_post_data_sends_form_field_and_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/limit/config"))
            .and(header_exists("authorization"))
            .and(body_string_contains("data=%7B%22serial%22"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"type\":\"success\"}"))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpJsonClient::new(
            Duration::from_secs(2),
            Credentials::from_parts("admin", "secret"),
            RetryPolicy::NONE,
        )
        .unwrap();
        client
            .post_data(
                &format!("{}/api/limit/config", server.uri()),
                r#"{"serial":"1","limit_type":1,"limit_value":40}"#,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout_classification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = HttpJsonClient::new(Duration::from_millis(50), None, RetryPolicy::NONE).unwrap();
        let err = client.get_text(&server.uri()).await.unwrap_err();
        assert!(err.is_read(), "{err:?}");
    }

    #[tokio::test]
    async fn test_undecodable_json_is_malformed_once() {
        #[derive(Debug, serde::Deserialize)]
        struct Status {
            #[allow(dead_code)]
            power: f64,
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"power\": "))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpJsonClient::new(
            Duration::from_secs(2),
            None,
            RetryPolicy::new(3, Duration::ZERO),
        )
        .unwrap();
        let err = client
            .get_json::<Status>(&format!("{}/status", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Malformed(_)), "{err:?}");
    }

    #[test]
    fn test_credentials_need_username() {
        assert!(Credentials::from_parts("", "pw").is_none());
        assert!(Credentials::from_parts("admin", "").is_some());
    }
}
