//! Network delivery of serialized batches.
//!
//! The breadcrumb queues hand every flushed batch to a [`BatchSender`]. Two
//! delivery primitives are offered:
//!
//! - **beacon**: fire-and-forget. Returns immediately and reports only
//!   whether the request was accepted for delivery. Like `navigator.sendBeacon`
//!   it refuses payloads above [`BEACON_MAX_BYTES`]. Requests still in flight
//!   are awaited by [`BatchSender::drain`] at shutdown.
//! - **post**: awaited HTTP POST. This is the only place a retry policy
//!   lives; the queue layer never retries.
//!
//! [`HttpSender`] implements both on top of reqwest with:
//!
//! - Connection pooling via reqwest
//! - Exponential backoff retry (±25% jitter by default)
//! - Rate limit handling (429 with Retry-After header)
//!
//! # Example
//!
//! ```no_run
//! use sightline_sdk::sender::{BatchSender, HttpSender, SenderConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let sender = HttpSender::new(SenderConfig::new("https://collect.example/report"))
//!         .expect("HTTP client");
//!
//!     let body = br#"[{"category":"custom","type":"ping"}]"#.to_vec();
//!     if !sender.beacon(&body) {
//!         sender.post(body).await.unwrap();
//!     }
//! }
//! ```

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Largest body the beacon primitive accepts.
pub const BEACON_MAX_BYTES: usize = 64 * 1024;

/// Default number of POST attempts per batch.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry.
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound for retry delays.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Jitter factor (±25%).
const JITTER_FACTOR: f64 = 0.25;

/// HTTP request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Errors that can occur while delivering a batch.
#[derive(Error, Debug)]
pub enum TransportError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error status.
    #[error("server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    /// Maximum retry attempts exceeded.
    #[error("max retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },
}

/// Retry behaviour of the POST path.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. At least 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Relative jitter applied to every delay, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: JITTER_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Short, jitter-free delays so tests against a mock server stay fast.
    #[must_use]
    pub fn fast_for_tests() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    #[must_use]
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Applies the configured jitter to a delay.
    fn add_jitter(&self, duration: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return duration;
        }
        let mut rng = rand::rng();
        let jitter_range = duration.as_secs_f64() * self.jitter;
        let jitter = rng.random_range(-jitter_range..=jitter_range);
        Duration::from_secs_f64((duration.as_secs_f64() + jitter).max(0.0))
    }
}

/// Delivery primitive used by the breadcrumb queues.
#[async_trait]
pub trait BatchSender: Send + Sync {
    /// Hands the body off for background delivery.
    ///
    /// Returns `false` if the primitive is unavailable or refuses the body,
    /// in which case the caller falls back to [`BatchSender::post`].
    fn beacon(&self, body: &[u8]) -> bool;

    /// Delivers the body and waits for the outcome.
    async fn post(&self, body: Vec<u8>) -> Result<(), TransportError>;

    /// Waits for beacon deliveries still in flight.
    async fn drain(&self) {}
}

/// Configuration for [`HttpSender`].
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Collection endpoint URL.
    pub dsn_url: String,

    /// Retry behaviour of the POST path.
    pub retry_policy: RetryPolicy,

    /// Whether the beacon primitive may be used.
    pub beacon: bool,

    /// Per-request timeout.
    pub timeout: Duration,
}

impl SenderConfig {
    /// Creates a configuration with the default retry policy and beacons on.
    #[must_use]
    pub fn new(dsn_url: impl Into<String>) -> Self {
        Self {
            dsn_url: dsn_url.into(),
            retry_policy: RetryPolicy::default(),
            beacon: true,
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Enables or disables the beacon primitive.
    #[must_use]
    pub fn with_beacon(mut self, beacon: bool) -> Self {
        self.beacon = beacon;
        self
    }
}

/// reqwest-backed [`BatchSender`] posting JSON arrays to the collection endpoint.
///
/// Clones share the connection pool and the set of in-flight beacons.
#[derive(Debug, Clone)]
pub struct HttpSender {
    config: SenderConfig,
    client: Client,
    beacons: Arc<Mutex<JoinSet<()>>>,
}

/// Outcome of a single HTTP attempt.
enum Attempt {
    Delivered,
    Retry { after: Option<Duration>, error: TransportError },
    Fatal(TransportError),
}

impl HttpSender {
    /// Creates a sender with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Http` if the HTTP client cannot be built.
    pub fn new(config: SenderConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(4)
            .build()?;

        Ok(Self {
            config,
            client,
            beacons: Arc::new(Mutex::new(JoinSet::new())),
        })
    }

    /// Returns the sender configuration.
    #[must_use]
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    fn lock_beacons(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.beacons.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Performs one POST without retrying.
    async fn attempt(client: &Client, url: &str, body: Vec<u8>) -> Attempt {
        let result = client
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Attempt::Delivered;
                }

                if status == StatusCode::TOO_MANY_REQUESTS {
                    let after = parse_retry_after(&response);
                    let message = response.text().await.unwrap_or_default();
                    return Attempt::Retry {
                        after,
                        error: TransportError::ServerError {
                            status: status.as_u16(),
                            message,
                        },
                    };
                }

                let message = response.text().await.unwrap_or_default();
                let error = TransportError::ServerError {
                    status: status.as_u16(),
                    message,
                };
                if status.is_server_error() {
                    Attempt::Retry { after: None, error }
                } else {
                    Attempt::Fatal(error)
                }
            }
            Err(e) if e.is_timeout() || e.is_connect() => Attempt::Retry {
                after: None,
                error: TransportError::Http(e),
            },
            Err(e) => Attempt::Fatal(TransportError::Http(e)),
        }
    }
}

#[async_trait]
impl BatchSender for HttpSender {
    fn beacon(&self, body: &[u8]) -> bool {
        if !self.config.beacon || body.len() > BEACON_MAX_BYTES {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };

        let client = self.client.clone();
        let url = self.config.dsn_url.clone();
        let body = body.to_vec();
        let bytes = body.len();
        let mut beacons = self.lock_beacons();
        // Reap finished deliveries so the set only holds pending ones.
        while beacons.try_join_next().is_some() {}
        beacons.spawn_on(
            async move {
                match Self::attempt(&client, &url, body).await {
                    Attempt::Delivered => debug!(bytes, "Beacon delivered"),
                    Attempt::Retry { error, .. } | Attempt::Fatal(error) => {
                        warn!(error = %error, "Beacon delivery failed, batch dropped");
                    }
                }
            },
            &runtime,
        );
        true
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), TransportError> {
        let policy = &self.config.retry_policy;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(
                url = %self.config.dsn_url,
                bytes = body.len(),
                attempt = attempts,
                "Posting batch"
            );

            match Self::attempt(&self.client, &self.config.dsn_url, body.clone()).await {
                Attempt::Delivered => {
                    info!(bytes = body.len(), "Batch posted");
                    return Ok(());
                }
                Attempt::Fatal(error) => return Err(error),
                Attempt::Retry { after, error } => {
                    if attempts >= max_attempts {
                        warn!(error = %error, attempts, "Giving up on batch");
                        return Err(TransportError::MaxRetriesExceeded { attempts });
                    }
                    let delay = after
                        .unwrap_or_else(|| policy.add_jitter(policy.base_delay(attempts)))
                        .min(policy.max_delay);
                    warn!(
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "Post failed, will retry"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn drain(&self) {
        let mut pending = mem::take(&mut *self.lock_beacons());
        if pending.is_empty() {
            return;
        }
        debug!(beacons = pending.len(), "Waiting for in-flight beacons");
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Beacon task failed");
            }
        }
    }
}

/// Parses the Retry-After header (whole seconds) from a 429 response.
fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_sender(server: &MockServer) -> HttpSender {
        let config = SenderConfig::new(format!("{}/report", server.uri()))
            .with_retry_policy(RetryPolicy::fast_for_tests());
        HttpSender::new(config).unwrap()
    }

    #[test]
    fn base_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        };
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(4));
        assert_eq!(policy.base_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn add_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        let base = Duration::from_secs(10);

        for _ in 0..100 {
            let secs = policy.add_jitter(base).as_secs_f64();
            assert!((7.5..=12.5).contains(&secs), "Jitter out of bounds: {secs}");
        }
    }

    #[test]
    fn none_policy_makes_one_attempt() {
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }

    #[test]
    fn beacon_refuses_oversized_body() {
        let sender = HttpSender::new(SenderConfig::new("http://localhost:9")).unwrap();
        assert!(!sender.beacon(&vec![b'x'; BEACON_MAX_BYTES + 1]));
    }

    #[test]
    fn beacon_refuses_when_disabled() {
        let sender =
            HttpSender::new(SenderConfig::new("http://localhost:9").with_beacon(false)).unwrap();
        assert!(!sender.beacon(b"[]"));
    }

    #[test]
    fn beacon_refuses_outside_a_runtime() {
        let sender = HttpSender::new(SenderConfig::new("http://localhost:9")).unwrap();
        assert!(!sender.beacon(b"[]"));
    }

    #[tokio::test]
    async fn drain_waits_for_beacon_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/report"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(150)))
            .expect(2)
            .mount(&server)
            .await;

        let sender = test_sender(&server);
        assert!(sender.beacon(br#"[{"type":"a"}]"#));
        assert!(sender.beacon(br#"[{"type":"b"}]"#));

        let started = std::time::Instant::now();
        sender.drain().await;
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);

        // Nothing left to wait for.
        let started = std::time::Instant::now();
        sender.drain().await;
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn post_sends_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/report"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = test_sender(&server);
        sender.post(b"[]".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn post_retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sender = test_sender(&server);
        sender.post(b"[]".to_vec()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
    }

    #[tokio::test]
    async fn post_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sender = test_sender(&server);
        let err = sender.post(b"[]".to_vec()).await.unwrap_err();
        assert!(matches!(err, TransportError::MaxRetriesExceeded { attempts: 3 }));
    }

    #[tokio::test]
    async fn post_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(413).set_body_string("Payload too large"))
            .expect(1)
            .mount(&server)
            .await;

        let sender = test_sender(&server);
        let err = sender.post(b"[]".to_vec()).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ServerError { status: 413, ref message } if message == "Payload too large"
        ));
    }

    #[tokio::test]
    async fn post_honors_retry_after_on_429() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sender = test_sender(&server);
        sender.post(b"[]".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn beacon_delivers_in_background() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/report"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sender = test_sender(&server);
        assert!(sender.beacon(b"[]"));

        let mut delivered = false;
        for _ in 0..50 {
            if !server.received_requests().await.unwrap().is_empty() {
                delivered = true;
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(delivered, "beacon request never reached the server");
    }
}
