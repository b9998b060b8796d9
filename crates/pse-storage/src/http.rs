//! Paced, retrying HTTP client for the exchange site.

use std::time::Duration;

use anyhow::Context;
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// Exponential backoff, doubling from `base_delay` and capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Wait before retry number `retry` (zero-based).
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        u32::try_from(retry)
            .ok()
            .and_then(|r| 2u32.checked_pow(r))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Throttling, gateway trouble and request timeouts are worth another try.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Minimum spacing between request starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub interval: Duration,
}

impl RateLimit {
    pub fn per_second(requests: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            interval: Duration::from_secs(1) / requests,
        })
    }
}

/// Hands out start slots `interval` apart; callers sleep until their slot.
#[derive(Debug)]
struct Pacer {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl Pacer {
    fn new(limit: RateLimit) -> Self {
        Self {
            interval: limit.interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests allowed on the wire at once.
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 4,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

/// Everything needed to send a request again on retry.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl FetchRequest {
    fn with(method: Method, url: impl Into<String>, body: RequestBody) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::with(Method::GET, url, RequestBody::Empty)
    }

    pub fn post_form(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self::with(Method::POST, url, RequestBody::Form(form))
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self::with(Method::POST, url, RequestBody::Json(body))
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    /// The upstream `Date` header, verbatim.
    pub date_header: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    Status { status: u16, url: String },
    #[error("http client closed")]
    Closed,
}

enum Attempt {
    Done(FetchedResponse),
    Transient(FetchError),
    Fatal(FetchError),
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    pacer: Option<Pacer>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(agent) = config.user_agent {
            builder = builder.user_agent(agent);
        }
        Ok(Self {
            client: builder.build().context("build http client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            pacer: config.rate_limit.map(Pacer::new),
            backoff: config.backoff,
        })
    }

    /// Sends `request`, retrying transient failures per the backoff policy.
    pub async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!("http_fetch", %run_id, source_id, method = %request.method, url = %request.url);
        async {
            let mut retries = 0;
            loop {
                if let Some(pacer) = &self.pacer {
                    pacer.wait_turn().await;
                }
                match self.send_once(request).await {
                    Attempt::Done(response) => {
                        debug!(bytes = response.body.len(), retries, "fetched");
                        return Ok(response);
                    }
                    Attempt::Transient(err) if retries < self.backoff.max_retries => {
                        let delay = self.backoff.delay_for_attempt(retries);
                        warn!(error = %err, retry = retries + 1, ?delay, "transient fetch failure");
                        tokio::time::sleep(delay).await;
                        retries += 1;
                    }
                    Attempt::Transient(err) | Attempt::Fatal(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn send_once(&self, request: &FetchRequest) -> Attempt {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(form) => builder.form(form),
            RequestBody::Json(json) => builder.json(json),
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) if is_transient_error(&err) => return Attempt::Transient(err.into()),
            Err(err) => return Attempt::Fatal(err.into()),
        };

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            let err = FetchError::Status {
                status: status.as_u16(),
                url: final_url,
            };
            return if is_transient_status(status) {
                Attempt::Transient(err)
            } else {
                Attempt::Fatal(err)
            };
        }

        let date_header = response
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        match response.bytes().await {
            Ok(body) => Attempt::Done(FetchedResponse {
                status,
                final_url,
                body: body.to_vec(),
                date_header,
            }),
            Err(err) if is_transient_error(&err) => Attempt::Transient(err.into()),
            Err(err) => Attempt::Fatal(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(100),
        };
        let delays: Vec<_> = (0..4).map(|r| policy.delay_for_attempt(r)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(40),
                Duration::from_millis(80),
                Duration::from_millis(100),
                Duration::from_millis(100),
            ]
        );
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_millis(100));
    }

    #[test]
    fn rate_limit_spacing() {
        assert_eq!(RateLimit::per_second(0), None);
        assert_eq!(RateLimit::per_second(5).unwrap().interval, Duration::from_millis(200));
    }

    #[test]
    fn only_transient_statuses_retry() {
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn pacer_spaces_request_starts() {
        let pacer = Pacer::new(RateLimit {
            interval: Duration::from_millis(30),
        });
        let started = Instant::now();
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn json_post_keeps_body_and_headers() {
        let req = FetchRequest::post_json(
            "https://edge.pse.com.ph/common/DisclosureCht.ax",
            serde_json::json!({ "cmpy_id": "29" }),
        )
        .header("Content-Type", "application/json")
        .header("X-Requested-With", "XMLHttpRequest");
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.headers[1].0, "X-Requested-With");
        assert_eq!(req.body, RequestBody::Json(serde_json::json!({ "cmpy_id": "29" })));
    }
}
