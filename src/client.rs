//! Rate-limited asynchronous HTTP client.
//!
//! [`RateLimitedClient`] wraps a [`Transport`] with:
//!
//! - a sliding one-hour request ceiling ([`RateLimiter`])
//! - a bound on requests in flight (a `tokio` semaphore)
//! - status classification and retry
//!
//! # Retry Strategy
//!
//! - HTTP 429 → sleep for `Retry-After`, then return
//!   [`ClientError::RateLimited`] so the caller re-issues the same request
//! - HTTP 5xx and network errors → retry with exponential backoff
//!   (1s, 2s, 4s, ... capped at 2^5) up to `max_retries`
//! - HTTP 401/403 → [`ClientError::Unauthorized`], no retry
//! - other HTTP 4xx → [`ClientError::Http`], no retry
//!
//! An [`AfterResponse`] policy sees every response before classification
//! and may ignore it (a 404 meaning "no data for this day"), ask for a
//! retry, or reject it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use ingest_harness_core::retry_after::parse_retry_after;

use crate::clock::Clock;
use crate::error::ClientError;
use crate::ratelimit::{Calibration, RateLimiter};

/// HTTP method, re-exported so connectors don't depend on `reqwest` directly.
pub use reqwest::Method;

/// An outbound request. `url` may be relative to the client's endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A received response. Header names are lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends a fully-resolved request. Network failures map to
/// [`ClientError::Network`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, ClientError>;
}

/// Production transport over `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, ClientError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::network(&request.url, e))?;
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::network(&url, e))?
            .to_vec();

        Ok(HttpResponse {
            url,
            status,
            headers,
            body,
        })
    }
}

/// What to do with a response, decided before status classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAction {
    /// Classify by status as usual.
    Continue,
    /// Skip this unit of work; the run continues.
    Ignore,
    /// Re-issue the request.
    Retry,
    /// Abort the run.
    Fail(String),
}

pub type AfterResponse = Arc<dyn Fn(&HttpResponse) -> ResponseAction + Send + Sync>;

/// Treat a 404 as "no data here" instead of an error.
pub fn ignore_not_found() -> AfterResponse {
    Arc::new(|response: &HttpResponse| {
        if response.status == 404 {
            ResponseAction::Ignore
        } else {
            ResponseAction::Continue
        }
    })
}

/// Limits for one [`RateLimitedClient`].
#[derive(Clone)]
pub struct ClientOptions {
    pub default_requests_per_hour: u32,
    /// Explicit ceiling; disables calibration.
    pub requests_per_hour: Option<u32>,
    pub calibration: Option<Calibration>,
    pub max_retries: u32,
    pub max_in_flight: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            default_requests_per_hour: 18000,
            requests_per_hour: None,
            calibration: None,
            max_retries: 3,
            max_in_flight: 16,
        }
    }
}

/// HTTP client shared by every worker of a collection run.
pub struct RateLimitedClient {
    endpoint: String,
    headers: Vec<(String, String)>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    in_flight: Semaphore,
    max_retries: u32,
}

impl RateLimitedClient {
    pub fn new(
        endpoint: &str,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        options: ClientOptions,
    ) -> Self {
        let limiter = RateLimiter::new(
            clock.clone(),
            options.default_requests_per_hour,
            options.requests_per_hour,
            options.calibration,
        );
        Self {
            endpoint: endpoint.to_string(),
            headers: Vec::new(),
            transport,
            clock,
            limiter,
            in_flight: Semaphore::new(options.max_in_flight.max(1)),
            max_retries: options.max_retries,
        }
    }

    /// Add a header sent with every request (authentication, accept type).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn requests_per_hour(&self) -> u32 {
        self.limiter.limit()
    }

    /// Resolve `path` against the endpoint. Absolute URLs pass through.
    pub fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Send `request`.
    ///
    /// Returns `Ok(None)` when `after_response` classified the response as
    /// ignorable.
    pub async fn get(
        &self,
        request: &HttpRequest,
        after_response: Option<&AfterResponse>,
    ) -> Result<Option<HttpResponse>, ClientError> {
        let mut resolved = request.clone();
        resolved.url = self.resolve_url(&request.url);
        if !resolved.url.starts_with("http") {
            return Err(ClientError::InvalidRequest(format!(
                "not an http(s) URL: {}",
                resolved.url
            )));
        }
        let mut headers = self.headers.clone();
        headers.append(&mut resolved.headers);
        resolved.headers = headers;

        let mut last_err: Option<ClientError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                warn!(
                    url = %resolved.url,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "retrying request"
                );
                self.clock.sleep(delay).await;
            }

            self.limiter.acquire().await;
            let result = {
                let _permit = self.in_flight.acquire().await.map_err(|_| ClientError::Closed)?;
                debug!(method = %resolved.method, url = %resolved.url, "sending request");
                self.transport.send(&resolved).await
            };

            let response = match result {
                Ok(response) => response,
                Err(e @ ClientError::Network { .. }) => {
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.limiter.observe(&response);

            let action = after_response
                .map(|policy| policy(&response))
                .unwrap_or(ResponseAction::Continue);
            match action {
                ResponseAction::Continue => {}
                ResponseAction::Ignore => {
                    debug!(url = %response.url, status = response.status, "response ignored");
                    return Ok(None);
                }
                ResponseAction::Retry => {
                    return Err(ClientError::Retryable {
                        url: response.url,
                        status: response.status,
                    })
                }
                ResponseAction::Fail(message) => {
                    return Err(ClientError::Rejected {
                        url: response.url,
                        message,
                    })
                }
            }

            match response.status {
                200..=299 => return Ok(Some(response)),
                429 => {
                    let wait = parse_retry_after(response.header("retry-after"), self.clock.now());
                    warn!(url = %response.url, wait_secs = wait.as_secs(), "rate limited, sleeping");
                    if !wait.is_zero() {
                        self.clock.sleep(wait).await;
                    }
                    return Err(ClientError::RateLimited {
                        url: response.url,
                        wait,
                    });
                }
                401 | 403 => {
                    return Err(ClientError::Unauthorized {
                        url: response.url,
                        status: response.status,
                    })
                }
                500..=599 => {
                    last_err = Some(ClientError::Http {
                        body: response.body_text(),
                        url: response.url,
                        status: response.status,
                    });
                    continue;
                }
                status => {
                    return Err(ClientError::Http {
                        body: response.body_text(),
                        url: response.url,
                        status,
                    })
                }
            }
        }

        Err(ClientError::RetriesExhausted {
            url: resolved.url,
            attempts: self.max_retries + 1,
            last: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}
