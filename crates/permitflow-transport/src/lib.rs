//! Rate-limited, retrying HTTP transport shared by the source adapters.

use std::time::Duration;

use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

pub const CRATE_NAME: &str = "permitflow-transport";

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
    if err.is_builder() || err.is_redirect() {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

/// Delay before retry `n` (1-based) is `unit * base^n + U(0, jitter_max)`, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub unit: Duration,
    pub base: u32,
    pub jitter_max: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            unit: Duration::from_secs(1),
            base: 2,
            jitter_max: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let factor = self
            .base
            .checked_pow(attempt.min(u32::MAX as usize) as u32)
            .unwrap_or(u32::MAX);
        self.unit.saturating_mul(factor).min(self.max_delay)
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let jitter = self.jitter_max.mul_f64(rand::rng().random::<f64>());
        (self.base_delay(attempt) + jitter).min(self.max_delay)
    }
}

/// Enforces a minimum spacing between consecutive requests.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// `None` for a non-positive or non-finite rate.
    pub fn per_second(rate: f64) -> Option<Self> {
        (rate.is_finite() && rate > 0.0).then(|| Self::new(Duration::from_secs_f64(1.0 / rate)))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until the interval since the previous request has elapsed, then
    /// claims the slot. The lock is held across the sleep so callers queue.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Requests per second; `None` disables spacing.
    pub rate_limit: Option<f64>,
    pub headers: Vec<(String, String)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
            headers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
    pub retry_delays: Vec<Duration>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("invalid http client configuration: {0}")]
    Config(String),
    #[error("request cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

/// One per source: owns that source's request spacing.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: Option<RateLimiter>,
    backoff: BackoffPolicy,
    headers: HeaderMap,
    cancel: CancellationToken,
}

pub fn build_client(timeout: Duration, user_agent: Option<&str>) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(timeout);
    if let Some(user_agent) = user_agent {
        builder = builder.user_agent(user_agent.to_string());
    }
    builder
        .build()
        .map_err(|e| FetchError::Config(format!("building reqwest client: {e}")))
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let client = build_client(config.timeout, config.user_agent.as_deref())?;
        Self::with_client(client, config)
    }

    /// Shares the connection pool of `client`; timeout and user agent come
    /// from the client, the rest from `config`.
    pub fn with_client(client: reqwest::Client, config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FetchError::Config(format!("header name `{name}`: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| FetchError::Config(format!("header value for `{name}`: {e}")))?;
            headers.insert(name, value);
        }
        Ok(Self {
            client,
            limiter: config.rate_limit.and_then(RateLimiter::per_second),
            backoff: config.backoff,
            headers,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// GET with rate limiting and retry. Every attempt, including retries,
    /// waits for the rate limiter.
    pub async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = tracing::info_span!("http_fetch", url);
        self.get_inner(url, query).instrument(span).await
    }

    async fn get_inner(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut retry_delays = Vec::new();

        for attempt in 0..=self.backoff.max_retries {
            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = limiter.acquire() => {}
                }
            }

            let request = self
                .client
                .get(url)
                .headers(self.headers.clone())
                .query(query)
                .send();
            let resp_result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                r = request => r,
            };
            let attempts = attempt + 1;

            let retry_reason = match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = tokio::select! {
                            _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                            b = resp.bytes() => b,
                        };
                        match body {
                            Ok(body) => {
                                debug!(status = status.as_u16(), attempts, bytes = body.len(), "fetched");
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    body: body.to_vec(),
                                    attempts,
                                    retry_delays,
                                });
                            }
                            Err(err) if attempt < self.backoff.max_retries => {
                                format!("reading body: {err}")
                            }
                            Err(err) => {
                                return Err(FetchError::Request {
                                    url: final_url,
                                    attempts,
                                    source: err,
                                })
                            }
                        }
                    } else if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        format!("http status {}", status.as_u16())
                    } else {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                            attempts,
                        });
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        err.to_string()
                    } else {
                        return Err(FetchError::Request {
                            url: url.to_string(),
                            attempts,
                            source: err,
                        });
                    }
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt + 1);
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                reason = %retry_reason,
                "retrying request"
            );
            retry_delays.push(delay);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // The loop returns on its final attempt; reaching here means max_retries
        // overflowed the range.
        Err(FetchError::HttpStatus {
            status: 0,
            url: url.to_string(),
            attempts: self.backoff.max_retries + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_backoff(max_retries: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            unit: Duration::from_millis(10),
            base: 2,
            jitter_max: Duration::from_millis(5),
            max_delay: Duration::from_secs(1),
        }
    }

    fn fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: fast_backoff(max_retries),
            ..Default::default()
        })
        .expect("fetcher")
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            unit: Duration::from_millis(100),
            base: 2,
            jitter_max: Duration::ZERO,
            max_delay: Duration::from_millis(900),
        };

        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay(3), Duration::from_millis(800));
        assert_eq!(policy.base_delay(4), Duration::from_millis(900));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_one_jitter_window() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let d = policy.delay_for_attempt(1);
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_secs(3));
        }
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_requests() {
        let limiter = RateLimiter::per_second(5.0).unwrap();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn first_request_is_not_delayed() {
        let limiter = RateLimiter::per_second(0.5).unwrap();
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(1));
        assert!(RateLimiter::per_second(0.0).is_none());
    }

    #[tokio::test]
    async fn rate_limited_fetcher_spaces_real_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig {
            rate_limit: Some(5.0),
            ..Default::default()
        })
        .unwrap();
        let start = std::time::Instant::now();
        for _ in 0..3 {
            http.get(&server.uri(), &[]).await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn retries_throttling_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resource"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/resource"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .with_priority(2)
            .mount(&server)
            .await;

        let resp = fetcher(2)
            .get(&format!("{}/resource", server.uri()), &[])
            .await
            .expect("third attempt succeeds");

        assert_eq!(resp.attempts, 3);
        assert_eq!(resp.body, b"ok");
        assert_eq!(resp.retry_delays.len(), 2);
        assert!(resp.retry_delays[1] > resp.retry_delays[0]);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetcher(3).get(&server.uri(), &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, attempts: 1, .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_typed_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = fetcher(2).get(&server.uri(), &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, attempts: 3, .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn query_and_headers_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("$limit", "10"))
            .and(wiremock::matchers::header("X-App-Token", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let http = HttpFetcher::new(HttpClientConfig {
            headers: vec![("X-App-Token".into(), "secret".into())],
            ..Default::default()
        })
        .unwrap();
        let resp = http
            .get(&server.uri(), &[("$limit".to_string(), "10".to_string())])
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn cancellation_aborts_before_sending() {
        let server = MockServer::start().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let http = fetcher(3).with_cancellation(cancel);
        let err = http.get(&server.uri(), &[]).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
