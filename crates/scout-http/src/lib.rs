//! Rate-limited HTTP plumbing shared by provider adapters and enrichers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretBox};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "scout-http";

const ERROR_BODY_LIMIT: usize = 512;

/// Provider API key. Redacted in `Debug`/`Display` output.
pub struct ApiKey(SecretBox<str>);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretBox::new(Box::from(value.into().as_str())))
    }

    /// Reads `name` from the environment, treating blank values as unset.
    pub fn from_env(name: &str) -> Option<Self> {
        std::env::var(name)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|v| Self::new(v.trim()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for ApiKey {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Steady request rate with a burst allowance, applied per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

impl RateLimit {
    /// `rate` requests per second with a burst of the same size. `0` disables pacing.
    pub fn per_second(rate: u32) -> Option<Self> {
        (rate > 0).then(|| Self {
            burst: rate,
            interval: Duration::from_secs(1) / rate,
        })
    }
}

/// Hands out request start times so that at most `burst` requests start
/// back to back and the rest follow one `interval` apart.
#[derive(Debug)]
struct Pacer {
    limit: RateLimit,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            next_slot: Mutex::new(None),
        }
    }

    async fn reserve(&self) -> Instant {
        let now = Instant::now();
        let window = self.limit.interval.saturating_mul(self.limit.burst.saturating_sub(1));
        let mut next_slot = self.next_slot.lock().await;
        let base = (*next_slot).map_or(now, |slot| slot.max(now));
        *next_slot = Some(base + self.limit.interval);
        base.checked_sub(window).map_or(now, |start| start.max(now))
    }

    async fn wait_turn(&self) {
        let start = self.reserve().await;
        if start > Instant::now() {
            tokio::time::sleep_until(start).await;
        }
    }
}

#[derive(Debug)]
struct SourceLimits {
    permits: Arc<Semaphore>,
    pacer: Option<Pacer>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("malformed JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 429, .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::Decode { .. } => None,
        }
    }
}

/// Shared client with global and per-provider concurrency caps, optional
/// per-provider pacing and retry with capped exponential backoff.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    rate_limit: Option<RateLimit>,
    per_source: Mutex<HashMap<String, Arc<SourceLimits>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            rate_limit: config.rate_limit.filter(|limit| limit.burst > 0),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn source_limits(&self, source_id: &str) -> Arc<SourceLimits> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| {
                Arc::new(SourceLimits {
                    permits: Arc::new(Semaphore::new(self.per_source_limit)),
                    pacer: self.rate_limit.map(Pacer::new),
                })
            })
            .clone()
    }

    /// Waits until `source_id` may start another request under its rate limit.
    async fn pace(&self, limits: &SourceLimits) {
        if let Some(pacer) = &limits.pacer {
            pacer.wait_turn().await;
        }
    }

    /// Sends the request produced by `build`, rebuilding it for every retry.
    pub async fn send<F>(&self, source_id: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let limits = self.source_limits(source_id).await;
        let _source = limits.permits.acquire().await.expect("semaphore not closed");
        self.pace(&limits).await;

        let span = info_span!("http_fetch", source_id);
        self.send_with_retries(build).instrument(span).await
    }

    async fn send_with_retries<F>(&self, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, url = %final_url, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let mut body = resp.text().await.unwrap_or_default();
                    truncate_on_char_boundary(&mut body, ERROR_BODY_LIMIT);
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    /// `send` followed by JSON decoding of the body.
    pub async fn send_json<T, F>(&self, source_id: &str, build: F) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let response = self.send(source_id, build).await?;
        decode_json(&response)
    }
}

pub fn decode_json<T: DeserializeOwned>(response: &FetchedResponse) -> Result<T, FetchError> {
    serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
        url: response.final_url.clone(),
        source,
    })
}

fn truncate_on_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn decode_errors_carry_the_url() {
        let response = FetchedResponse {
            status: StatusCode::OK,
            final_url: "https://api.example.test/search".into(),
            body: b"{not json".to_vec(),
        };
        let err = decode_json::<serde_json::Value>(&response).unwrap_err();
        assert!(err.to_string().contains("api.example.test"));
        assert_eq!(err.status(), None);
    }

    #[test]
    fn rate_limited_status_is_detected() {
        let err = FetchError::HttpStatus {
            status: 429,
            url: "https://api.example.test".into(),
            body: String::new(),
        };
        assert!(err.is_rate_limited());
        assert_eq!(err.status(), Some(429));
    }

    #[test]
    fn api_keys_are_redacted() {
        let key = ApiKey::new("sk-live-123");
        assert_eq!(format!("{key:?}"), "[REDACTED]");
        assert_eq!(key.to_string(), "[REDACTED]");
        assert_eq!(key.clone().expose(), "sk-live-123");
    }

    #[test]
    fn error_bodies_are_truncated_on_char_boundaries() {
        let mut body = "é".repeat(400);
        truncate_on_char_boundary(&mut body, 513);
        assert!(body.len() <= 513);
        assert!(body.chars().all(|c| c == 'é'));
    }

    fn paced(burst: u32, interval: Duration) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            rate_limit: Some(RateLimit { burst, interval }),
            ..HttpClientConfig::default()
        })
        .expect("client")
    }

    #[test]
    fn zero_rate_disables_pacing() {
        assert_eq!(RateLimit::per_second(0), None);
        assert_eq!(
            RateLimit::per_second(4),
            Some(RateLimit {
                burst: 4,
                interval: Duration::from_millis(250),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_allows_a_burst_then_spaces_requests() {
        let fetcher = paced(2, Duration::from_millis(500));
        let limits = fetcher.source_limits("resy").await;
        let start = Instant::now();

        fetcher.pace(&limits).await;
        fetcher.pace(&limits).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        fetcher.pace(&limits).await;
        assert!(start.elapsed() >= Duration::from_millis(500));
        fetcher.pace(&limits).await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn providers_are_paced_independently() {
        let fetcher = paced(1, Duration::from_secs(1));
        let resy = fetcher.source_limits("resy").await;
        let exa = fetcher.source_limits("exa").await;
        let start = Instant::now();

        fetcher.pace(&resy).await;
        fetcher.pace(&exa).await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        fetcher.pace(&resy).await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn unpaced_fetcher_never_waits() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        let limits = fetcher.source_limits("places").await;
        let start = Instant::now();
        for _ in 0..10 {
            fetcher.pace(&limits).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
