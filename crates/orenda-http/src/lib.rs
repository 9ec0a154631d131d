//! HTTP transport port and the policy chain (rate limiting, retry) wrapped
//! around it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
pub use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info_span, warn};

pub const CRATE_NAME: &str = "orenda-http";

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub params: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Transport-level faults. HTTP-level failures are carried in `HttpResponse`
/// statuses, not here.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Reqwest-backed transport. The client owns its connection pool, so the
/// session is bracketed by construction and drop.
#[derive(Debug)]
pub struct ReqwestTransport {
    base_url: String,
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, config: &TransportConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = format!("{}{}", self.base_url, req.path);
        let span = info_span!("http_send", method = %req.method, path = %req.path);
        let _guard = span.enter();

        let resp = self
            .client
            .request(req.method.clone(), url)
            .query(&req.params)
            .send()
            .await?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.bytes().await?.to_vec();

        Ok(HttpResponse {
            status,
            final_url,
            body,
        })
    }
}

/// A composable request interceptor. `next` is the remainder of the chain;
/// a policy may delegate, short-circuit, or retry it.
#[async_trait]
pub trait HttpPolicy: Send + Sync {
    async fn handle(
        &self,
        req: &HttpRequest,
        next: Next<'_>,
    ) -> Result<HttpResponse, TransportError>;
}

/// Indexed traversal over the remaining policies, ending at the transport.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    policies: &'a [Arc<dyn HttpPolicy>],
    transport: &'a dyn HttpTransport,
}

impl Next<'_> {
    pub async fn run(self, req: &HttpRequest) -> Result<HttpResponse, TransportError> {
        match self.policies.split_first() {
            Some((policy, rest)) => {
                policy
                    .handle(
                        req,
                        Next {
                            policies: rest,
                            transport: self.transport,
                        },
                    )
                    .await
            }
            None => self.transport.send(req).await,
        }
    }
}

/// Transport wrapped in an ordered policy chain; the first policy added is
/// the outermost.
pub struct PolicyClient {
    transport: Arc<dyn HttpTransport>,
    policies: Vec<Arc<dyn HttpPolicy>>,
}

impl PolicyClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            policies: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn HttpPolicy>) -> Self {
        self.policies.push(policy);
        self
    }

    pub async fn send(&self, req: &HttpRequest) -> Result<HttpResponse, TransportError> {
        Next {
            policies: &self.policies,
            transport: self.transport.as_ref(),
        }
        .run(req)
        .await
    }
}

/// Token bucket: capacity = burst, refilled lazily from elapsed wall-clock
/// time. Acquisition suspends cooperatively until a token is available.
pub struct RateLimitPolicy {
    capacity: f64,
    rps: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimitPolicy {
    pub fn new(rps: f64, burst: u32) -> Self {
        assert!(rps > 0.0, "requests per second must be positive");
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            rps,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    async fn acquire(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed > Duration::ZERO {
                state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rps).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return;
            }

            let wait = Duration::from_secs_f64(((1.0 - state.tokens) / self.rps).max(0.01));
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl HttpPolicy for RateLimitPolicy {
    async fn handle(
        &self,
        req: &HttpRequest,
        next: Next<'_>,
    ) -> Result<HttpResponse, TransportError> {
        self.acquire().await;
        next.run(req).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
    ExponentialJitter,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::ExponentialJitter,
            base: Duration::from_millis(250),
            cap: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before jitter: base, base*attempt or base*2^(attempt-1), all
    /// clamped to the cap.
    fn clamped_delay(&self, attempt: u32) -> Duration {
        let base = self.base.as_secs_f64();
        let raw = match self.kind {
            BackoffKind::Fixed => base,
            BackoffKind::Linear => base * f64::from(attempt),
            BackoffKind::Exponential | BackoffKind::ExponentialJitter => {
                base * 2f64.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32)
            }
        };
        Duration::from_secs_f64(raw.min(self.cap.as_secs_f64()))
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let clamped = self.clamped_delay(attempt);
        match self.kind {
            BackoffKind::ExponentialJitter => {
                // uniform multiplier in [0.5, 1.5]
                clamped.mul_f64(0.5 + fastrand::f64())
            }
            _ => clamped,
        }
    }
}

/// Retries transient errors and retryable statuses with backoff. At least one
/// attempt always runs, so exhaustion always holds the response or error it
/// just observed.
pub struct RetryPolicy {
    max_attempts: u32,
    retry_on: HashSet<StatusCode>,
    backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        retry_on: impl IntoIterator<Item = StatusCode>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_on: retry_on.into_iter().collect(),
            backoff,
        }
    }

    pub fn default_retry_statuses() -> [StatusCode; 6] {
        [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ]
    }
}

#[async_trait]
impl HttpPolicy for RetryPolicy {
    async fn handle(
        &self,
        req: &HttpRequest,
        next: Next<'_>,
    ) -> Result<HttpResponse, TransportError> {
        let mut attempt = 1u32;
        loop {
            match next.run(req).await {
                Ok(resp) if !self.retry_on.contains(&resp.status) => return Ok(resp),
                Ok(resp) => {
                    // a bad status after exhaustion is data, not a fault
                    if attempt >= self.max_attempts {
                        return Ok(resp);
                    }
                    warn!(status = resp.status.as_u16(), attempt, path = %req.path, "retrying retryable status");
                }
                Err(err) => {
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    warn!(error = %err, attempt, path = %req.path, "retrying transport error");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn ok_response(status: StatusCode) -> HttpResponse {
        HttpResponse {
            status,
            final_url: "https://example.test/".to_string(),
            body: Vec::new(),
        }
    }

    /// Pops one scripted outcome per send.
    struct ScriptedTransport {
        outcomes: StdMutex<Vec<Result<HttpResponse, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<HttpResponse, TransportError>>) -> Self {
            let mut outcomes = outcomes;
            outcomes.reverse();
            Self {
                outcomes: StdMutex::new(outcomes),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, _req: &HttpRequest) -> Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .expect("scripted transport exhausted")
        }
    }

    fn fast_backoff(kind: BackoffKind) -> BackoffPolicy {
        BackoffPolicy {
            kind,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
        }
    }

    #[test]
    fn backoff_shapes_are_clamped_to_the_cap() {
        let policy = BackoffPolicy {
            kind: BackoffKind::Exponential,
            base: Duration::from_millis(100),
            cap: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(350));

        let linear = BackoffPolicy {
            kind: BackoffKind::Linear,
            base: Duration::from_millis(100),
            cap: Duration::from_millis(250),
        };
        assert_eq!(linear.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(linear.delay_for_attempt(5), Duration::from_millis(250));

        let fixed = BackoffPolicy {
            kind: BackoffKind::Fixed,
            base: Duration::from_millis(100),
            cap: Duration::from_millis(250),
        };
        assert_eq!(fixed.delay_for_attempt(7), Duration::from_millis(100));
    }

    #[test]
    fn jittered_delay_stays_within_half_to_one_and_a_half() {
        let policy = BackoffPolicy {
            kind: BackoffKind::ExponentialJitter,
            base: Duration::from_secs_f64(0.25),
            cap: Duration::from_secs_f64(5.0),
        };

        // attempt 10: 0.25 * 2^9 = 128, clamped to 5.0
        assert_eq!(policy.clamped_delay(10), Duration::from_secs_f64(5.0));

        for _ in 0..100 {
            let delay = policy.delay_for_attempt(10).as_secs_f64();
            assert!((2.5..=7.5).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[tokio::test]
    async fn retry_returns_last_response_when_statuses_stay_bad() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(ok_response(StatusCode::SERVICE_UNAVAILABLE)),
            Ok(ok_response(StatusCode::SERVICE_UNAVAILABLE)),
            Ok(ok_response(StatusCode::BAD_GATEWAY)),
        ]));
        let client = PolicyClient::new(transport.clone()).with_policy(Arc::new(RetryPolicy::new(
            3,
            RetryPolicy::default_retry_statuses(),
            fast_backoff(BackoffKind::Fixed),
        )));

        let resp = client
            .send(&HttpRequest::get("/search"))
            .await
            .expect("bad statuses are data, not faults");

        assert_eq!(resp.status, StatusCode::BAD_GATEWAY);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn retry_recovers_from_a_transient_fault() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Message("connection reset".to_string())),
            Ok(ok_response(StatusCode::OK)),
        ]));
        let client = PolicyClient::new(transport.clone()).with_policy(Arc::new(RetryPolicy::new(
            3,
            RetryPolicy::default_retry_statuses(),
            fast_backoff(BackoffKind::ExponentialJitter),
        )));

        let resp = client.send(&HttpRequest::get("/item/1")).await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn retry_propagates_the_last_fault_after_exhaustion() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Message("reset one".to_string())),
            Err(TransportError::Message("reset two".to_string())),
        ]));
        let client = PolicyClient::new(transport.clone()).with_policy(Arc::new(RetryPolicy::new(
            2,
            RetryPolicy::default_retry_statuses(),
            fast_backoff(BackoffKind::Linear),
        )));

        let err = client.send(&HttpRequest::get("/item/1")).await.unwrap_err();
        assert!(err.to_string().contains("reset two"));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn single_attempt_configuration_still_sends_once() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(ok_response(
            StatusCode::SERVICE_UNAVAILABLE,
        ))]));
        // zero attempts is clamped up to one
        let client = PolicyClient::new(transport.clone()).with_policy(Arc::new(RetryPolicy::new(
            0,
            RetryPolicy::default_retry_statuses(),
            fast_backoff(BackoffKind::Fixed),
        )));

        let resp = client.send(&HttpRequest::get("/search")).await.unwrap();
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn rate_limiter_spaces_requests_to_the_configured_rate() {
        let transport = Arc::new(ScriptedTransport::new(
            (0..5).map(|_| Ok(ok_response(StatusCode::OK))).collect(),
        ));
        let client = PolicyClient::new(transport)
            .with_policy(Arc::new(RateLimitPolicy::new(50.0, 1)));

        let started = Instant::now();
        for _ in 0..5 {
            client.send(&HttpRequest::get("/search")).await.unwrap();
        }

        // 5 requests at 50 rps need at least (5-1)/50 seconds
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn rate_limiter_burst_capacity_is_spent_before_throttling() {
        let transport = Arc::new(ScriptedTransport::new(
            (0..3).map(|_| Ok(ok_response(StatusCode::OK))).collect(),
        ));
        let client = PolicyClient::new(transport)
            .with_policy(Arc::new(RateLimitPolicy::new(2.0, 3)));

        let started = Instant::now();
        for _ in 0..3 {
            client.send(&HttpRequest::get("/search")).await.unwrap();
        }

        // burst of 3 means no waiting at all
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn chain_runs_policies_in_registration_order() {
        struct Tag(&'static str, Arc<StdMutex<Vec<&'static str>>>);

        #[async_trait]
        impl HttpPolicy for Tag {
            async fn handle(
                &self,
                req: &HttpRequest,
                next: Next<'_>,
            ) -> Result<HttpResponse, TransportError> {
                self.1.lock().unwrap().push(self.0);
                next.run(req).await
            }
        }

        let order = Arc::new(StdMutex::new(Vec::new()));
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(ok_response(StatusCode::OK))]));
        let client = PolicyClient::new(transport)
            .with_policy(Arc::new(Tag("limiter", order.clone())))
            .with_policy(Arc::new(Tag("retry", order.clone())));

        client.send(&HttpRequest::get("/")).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["limiter", "retry"]);
    }
}
