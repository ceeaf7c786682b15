//! Webhook delivery engine (§4.6): a backoff-driven retry loop over an
//! HTTP transport, generalized from chain submission to signed HTTP
//! callbacks, with a per-failure-class retry policy table.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::bounded_cache::BoundedCache;
use crate::clock::Clock;
use crate::crypto::hmac_sha256_hex;
use crate::metrics::MetricsSink;
use crate::rate_limit::{Decision, Policy, RateLimiter};
use crate::types::{NotificationTask, NotificationType};

/// A failure classified from a delivery attempt (§4.6 taxonomy). Determines
/// whether the dispatcher retries and how it counts toward the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    Timeout,
    HttpError(u16),
    Dns,
    Tls,
    RateLimited,
    PayloadTooLarge,
    MaxRetriesExhausted,
}

impl DeliveryFailure {
    pub fn code(self) -> &'static str {
        match self {
            DeliveryFailure::Timeout => "TIMEOUT",
            DeliveryFailure::HttpError(_) => "HTTP_ERROR",
            DeliveryFailure::Dns => "DNS",
            DeliveryFailure::Tls => "TLS",
            DeliveryFailure::RateLimited => "RATE_LIMITED",
            DeliveryFailure::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            DeliveryFailure::MaxRetriesExhausted => "MAX_RETRIES_EXHAUSTED",
        }
    }

    fn is_retryable(self) -> bool {
        match self {
            DeliveryFailure::PayloadTooLarge | DeliveryFailure::MaxRetriesExhausted => false,
            DeliveryFailure::HttpError(status) => is_retryable_status(status),
            DeliveryFailure::Timeout | DeliveryFailure::Dns | DeliveryFailure::Tls | DeliveryFailure::RateLimited => true,
        }
    }
}

/// Only 5xx and 429 are worth retrying (§7); other 4xx responses are the
/// merchant rejecting the callback outright and must not burn the attempt
/// budget.
fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Per-notification-type retry policy (§4.6 table).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

fn retry_policy_for(kind: NotificationType) -> RetryPolicy {
    match kind {
        NotificationType::PaymentStatusChange => RetryPolicy { max_attempts: 5, base_delay: Duration::from_secs(2) },
        NotificationType::PaymentSuccess => RetryPolicy { max_attempts: 3, base_delay: Duration::from_secs(1) },
        NotificationType::PaymentFailure => RetryPolicy { max_attempts: 5, base_delay: Duration::from_secs(1) },
        NotificationType::FraudAlert => RetryPolicy { max_attempts: 10, base_delay: Duration::from_secs(1) },
        NotificationType::SystemAlert => RetryPolicy { max_attempts: 8, base_delay: Duration::from_secs(5) },
    }
}

/// `delay(attempt) = baseDelay * 2^attempt + jitter∈[0,1s)` (§4.6).
fn backoff_for(policy: RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.base_delay * 2u32.saturating_pow(attempt.min(10));
    let jitter = Duration::from_millis((rand::random::<f64>() * 1000.0) as u64);
    exp + jitter
}

/// One delivery attempt row, appended to an idempotent log so re-drives of
/// the same task never double-count attempts (§4.6).
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub notification_id: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub outcome: Result<u16, DeliveryFailure>,
}

/// Abstraction over the outbound HTTP call so tests never touch the network.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, url: &str, body: &[u8], headers: &[(String, String)], timeout: Duration) -> Result<u16, DeliveryFailure>;
}

pub struct ReqwestWebhookTransport {
    client: reqwest::Client,
}

impl Default for ReqwestWebhookTransport {
    fn default() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl WebhookTransport for ReqwestWebhookTransport {
    async fn post(&self, url: &str, body: &[u8], headers: &[(String, String)], timeout: Duration) -> Result<u16, DeliveryFailure> {
        let mut builder = self.client.post(url).body(body.to_vec()).timeout(timeout);
        for (k, v) in headers {
            builder = builder.header(k, v);
        }
        match builder.send().await {
            Ok(resp) => Ok(resp.status().as_u16()),
            Err(e) if e.is_timeout() => Err(DeliveryFailure::Timeout),
            Err(e) if e.is_connect() => Err(DeliveryFailure::Dns),
            Err(_) => Err(DeliveryFailure::HttpError(0)),
        }
    }
}

/// Test double that records every call instead of hitting the network.
#[derive(Default)]
pub struct RecordingWebhookTransport {
    pub calls: Mutex<Vec<(String, Vec<u8>, Vec<(String, String)>)>>,
    pub responses: Mutex<VecDeque<Result<u16, DeliveryFailure>>>,
}

#[async_trait]
impl WebhookTransport for RecordingWebhookTransport {
    async fn post(&self, url: &str, body: &[u8], headers: &[(String, String)], _timeout: Duration) -> Result<u16, DeliveryFailure> {
        self.calls.lock().await.push((url.to_string(), body.to_vec(), headers.to_vec()));
        self.responses.lock().await.pop_front().unwrap_or(Ok(200))
    }
}

const NONCE_CACHE_SIZE: usize = 100_000;
const NONCE_CACHE_TTL: Duration = Duration::from_secs(900);
const REPLAY_WINDOW: chrono::Duration = chrono::Duration::seconds(300);

/// Signs, rate-limits, retries, and records webhook deliveries. Owns no
/// queue of its own here: the dispatcher (or a caller's scheduler) drives
/// `deliver` per task and re-submits on a retryable failure.
pub struct WebhookEngine<T: WebhookTransport> {
    transport: Arc<T>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    rate_limiter: RateLimiter,
    attempts: Mutex<Vec<AttemptRecord>>,
    seen_nonces: Mutex<BoundedCache<String, ()>>,
}

impl<T: WebhookTransport> WebhookEngine<T> {
    pub fn new(transport: Arc<T>, clock: Arc<dyn Clock>, metrics: Arc<dyn MetricsSink>) -> Self {
        let mut policies = HashMap::new();
        for kind in [
            NotificationType::PaymentStatusChange,
            NotificationType::PaymentSuccess,
            NotificationType::PaymentFailure,
            NotificationType::FraudAlert,
            NotificationType::SystemAlert,
        ] {
            policies.insert(
                Self::minute_policy_key(kind),
                Policy::new(30, chrono::Duration::seconds(60), chrono::Duration::seconds(30)),
            );
            policies.insert(
                Self::hour_policy_key(kind),
                Policy::new(300, chrono::Duration::seconds(3600), chrono::Duration::seconds(300)),
            );
        }
        Self {
            transport,
            clock,
            metrics,
            rate_limiter: RateLimiter::new(policies),
            attempts: Mutex::new(Vec::new()),
            seen_nonces: Mutex::new(BoundedCache::new(NONCE_CACHE_SIZE, NONCE_CACHE_TTL)),
        }
    }

    fn minute_policy_key(kind: NotificationType) -> String {
        format!("webhook:{}:minute", kind.as_str())
    }

    fn hour_policy_key(kind: NotificationType) -> String {
        format!("webhook:{}:hour", kind.as_str())
    }

    /// HMAC-SHA256 signature header value for a given payload and secret
    /// (§4.6: `X-Webhook-Signature: sha256=<hex>`).
    pub fn sign(secret: &str, body: &[u8]) -> String {
        format!("sha256={}", hmac_sha256_hex(secret.as_bytes(), body))
    }

    /// Rejects a replayed inbound callback verification: timestamps outside
    /// `REPLAY_WINDOW` of now, or a nonce already seen within its cache TTL.
    pub async fn check_replay(&self, nonce: &str, timestamp: DateTime<Utc>) -> bool {
        let now = self.clock.now();
        if (now - timestamp).num_seconds().abs() > REPLAY_WINDOW.num_seconds() {
            return false;
        }
        let mut cache = self.seen_nonces.lock().await;
        if cache.get(&nonce.to_string()).is_some() {
            return false;
        }
        cache.insert(nonce.to_string(), ());
        true
    }

    async fn record(&self, record: AttemptRecord) {
        self.attempts.lock().await.push(record);
    }

    pub async fn attempts_for(&self, notification_id: &str) -> Vec<AttemptRecord> {
        self.attempts
            .lock()
            .await
            .iter()
            .filter(|a| a.notification_id == notification_id)
            .cloned()
            .collect()
    }

    /// Deliver one attempt of `task`. Returns `Ok(Some(next_delay))` when a
    /// retry should be scheduled, `Ok(None)` on terminal success or
    /// exhaustion, `Err` only for caller misuse (unknown notification type
    /// never happens since the enum is exhaustive, kept for symmetry with
    /// other fallible entry points).
    #[instrument(skip(self, task, secret), fields(notification_id = %task.notification_id, attempt = task.attempt_count))]
    pub async fn deliver(&self, team_slug: &str, secret: &str, task: &NotificationTask) -> Option<Duration> {
        // §4.6 tracks both a per-minute and a per-hour window per (team, type);
        // both counters advance on every attempt, and either can deny.
        let minute_key = Self::minute_policy_key(task.kind);
        let hour_key = Self::hour_policy_key(task.kind);
        let now = self.clock.now();
        let minute_decision = self.rate_limiter.check(&minute_key, team_slug, now).await;
        let hour_decision = self.rate_limiter.check(&hour_key, team_slug, now).await;

        let denied = match (minute_decision, hour_decision) {
            (Decision::Deny { retry_after }, _) => Some((minute_key, retry_after)),
            (_, Decision::Deny { retry_after }) => Some((hour_key, retry_after)),
            _ => None,
        };
        if let Some((policy_name, retry_after)) = denied {
            self.metrics.record_rate_limit_hit(&policy_name, "team");
            self.record(AttemptRecord {
                notification_id: task.notification_id.clone(),
                attempt: task.attempt_count,
                at: self.clock.now(),
                outcome: Err(DeliveryFailure::RateLimited),
            })
            .await;
            return Some(Duration::from_secs(retry_after.num_seconds().max(1) as u64));
        }

        let signature = Self::sign(secret, &task.payload);
        let mut headers = task.headers.clone();
        headers.push(("X-Webhook-Signature".to_string(), signature));

        let policy = retry_policy_for(task.kind);
        let outcome = self.transport.post(&task.endpoint, &task.payload, &headers, task.timeout).await;

        let result_label = if outcome.is_ok() { "success" } else { "failure" };
        self.metrics.record_notification_delivery(team_slug, result_label, task.priority, task.kind.as_str(), "POST", 0.0);

        self.record(AttemptRecord {
            notification_id: task.notification_id.clone(),
            attempt: task.attempt_count,
            at: self.clock.now(),
            outcome,
        })
        .await;

        match outcome {
            Ok(status) if (200..300).contains(&status) => {
                info!(status, "webhook delivered");
                None
            }
            Ok(status) if !is_retryable_status(status) => {
                warn!(status, "webhook rejected permanently");
                None
            }
            Err(f) if !f.is_retryable() => None,
            _ => {
                if task.attempt_count + 1 >= policy.max_attempts {
                    warn!(attempts = task.attempt_count + 1, "webhook retries exhausted");
                    self.record(AttemptRecord {
                        notification_id: task.notification_id.clone(),
                        attempt: task.attempt_count + 1,
                        at: self.clock.now(),
                        outcome: Err(DeliveryFailure::MaxRetriesExhausted),
                    })
                    .await;
                    return None;
                }
                Some(backoff_for(policy, task.attempt_count))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, SystemRng};

    fn task(kind: NotificationType, attempt: u32) -> NotificationTask {
        NotificationTask {
            notification_id: "n1".to_string(),
            team_id: "t1".to_string(),
            kind,
            endpoint: "https://merchant.example/hook".to_string(),
            payload: b"{\"status\":\"CONFIRMED\"}".to_vec(),
            priority: 5,
            attempt_count: attempt,
            headers: vec![],
            timeout: Duration::from_secs(5),
            created_at: Utc::now(),
            next_attempt_at: Utc::now(),
        }
    }

    fn engine() -> WebhookEngine<RecordingWebhookTransport> {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        WebhookEngine::new(Arc::new(RecordingWebhookTransport::default()), clock, Arc::new(crate::metrics::NoopMetricsSink))
    }

    #[test]
    fn sign_is_deterministic() {
        let a = WebhookEngine::<RecordingWebhookTransport>::sign("secret", b"payload");
        let b = WebhookEngine::<RecordingWebhookTransport>::sign("secret", b"payload");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256="));
    }

    #[tokio::test]
    async fn success_needs_no_retry() {
        let engine = engine();
        engine.transport.responses.lock().await.push_back(Ok(200));
        let delay = engine.deliver("acme", "secret", &task(NotificationType::PaymentSuccess, 0)).await;
        assert!(delay.is_none());
        let attempts = engine.attempts_for("n1").await;
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].outcome.is_ok());
    }

    #[tokio::test]
    async fn failure_schedules_retry_until_exhausted() {
        let engine = engine();
        // PAYMENT_FAILURE policy allows 5 attempts; attempt_count 0..3 (4 calls)
        // still retry, attempt_count 4 (the 5th call) exhausts.
        for attempt in 0..4 {
            engine.transport.responses.lock().await.push_back(Err(DeliveryFailure::Timeout));
            let delay = engine.deliver("acme", "secret", &task(NotificationType::PaymentFailure, attempt)).await;
            assert!(delay.is_some(), "attempt {attempt} should still retry");
        }

        engine.transport.responses.lock().await.push_back(Err(DeliveryFailure::Timeout));
        let delay = engine.deliver("acme", "secret", &task(NotificationType::PaymentFailure, 4)).await;
        assert!(delay.is_none(), "5th attempt should exhaust retries");
    }

    #[tokio::test]
    async fn non_retryable_4xx_is_terminal() {
        let engine = engine();
        engine.transport.responses.lock().await.push_back(Ok(404));
        let delay = engine.deliver("acme", "secret", &task(NotificationType::PaymentFailure, 0)).await;
        assert!(delay.is_none(), "404 must not be retried");
        let attempts = engine.attempts_for("n1").await;
        assert_eq!(attempts.len(), 1);
    }

    #[tokio::test]
    async fn rate_limited_429_is_retryable() {
        let engine = engine();
        engine.transport.responses.lock().await.push_back(Ok(429));
        let delay = engine.deliver("acme", "secret", &task(NotificationType::PaymentFailure, 0)).await;
        assert!(delay.is_some(), "429 should be retried");
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let engine = engine();
        engine.transport.responses.lock().await.push_back(Ok(503));
        let delay = engine.deliver("acme", "secret", &task(NotificationType::PaymentFailure, 0)).await;
        assert!(delay.is_some(), "503 should be retried");
    }

    #[tokio::test]
    async fn hourly_window_denies_even_after_minute_window_resets() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let engine = WebhookEngine::new(
            Arc::new(RecordingWebhookTransport::default()),
            clock.clone(),
            Arc::new(crate::metrics::NoopMetricsSink),
        );
        // 10 batches of 30, each in its own minute, so the per-minute window
        // never denies; only the 300/hour cap can.
        for _ in 0..10 {
            for _ in 0..30 {
                engine.transport.responses.lock().await.push_back(Ok(200));
                let delay = engine.deliver("acme", "secret", &task(NotificationType::PaymentSuccess, 0)).await;
                assert!(delay.is_none());
            }
            clock.advance(chrono::Duration::seconds(61));
        }
        engine.transport.responses.lock().await.push_back(Ok(200));
        let delay = engine.deliver("acme", "secret", &task(NotificationType::PaymentSuccess, 0)).await;
        assert!(delay.is_some(), "301st request within the hour should be rate limited");
    }

    #[tokio::test]
    async fn replay_rejects_reused_nonce() {
        let engine = engine();
        let now = Utc::now();
        assert!(engine.check_replay("nonce-1", now).await);
        assert!(!engine.check_replay("nonce-1", now).await);
    }

    #[tokio::test]
    async fn replay_rejects_stale_timestamp() {
        let engine = engine();
        let stale = Utc::now() - chrono::Duration::seconds(600);
        assert!(!engine.check_replay("nonce-2", stale).await);
    }
}
