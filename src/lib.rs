//! Transactional core of a card payment gateway (§1-§2): state machine,
//! lifecycle engine, dispatcher, authentication, rate limiting, and webhook
//! delivery. Transport, persistence, and tenant storage are collaborators
//! this crate depends on through narrow capability traits — see
//! [`store::PaymentStore`], [`store::TeamRegistry`], [`lock::Lock`],
//! [`clock::Clock`], [`clock::Rng`], [`metrics::MetricsSink`],
//! [`webhook::WebhookTransport`] — and are wired up by the composition root,
//! not owned here.

pub mod admin;
pub mod audit;
pub mod auth;
pub mod bounded_cache;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod metrics;
pub mod rate_limit;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod types;
pub mod webhook;

use std::sync::Arc;

use crate::clock::{Clock, Rng, SystemClock, SystemRng};
use crate::config::Config;
use crate::lifecycle::{DomainEventSink, LifecycleEngine, NullDomainEventSink};
use crate::lock::{InMemoryLock, Lock};
use crate::metrics::{MetricsSink, PrometheusMetricsSink};
use crate::store::{InMemoryPaymentStore, InMemoryTeamRegistry, PaymentStore, TeamRegistry};

/// Explicit constructor wiring for the whole core (§9: "runtime dependency
/// injection → explicit constructor wiring"). Each capability is swappable;
/// [`Gateway::in_memory`] builds a fully self-contained instance suitable
/// for tests and local development.
pub struct Gateway {
    pub lifecycle: Arc<LifecycleEngine>,
    pub store: Arc<dyn PaymentStore>,
    pub teams: Arc<dyn TeamRegistry>,
    pub lock: Arc<dyn Lock>,
    pub clock: Arc<dyn Clock>,
    pub rng: Arc<dyn Rng>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn PaymentStore>,
        teams: Arc<dyn TeamRegistry>,
        lock: Arc<dyn Lock>,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn Rng>,
        metrics: Arc<dyn MetricsSink>,
        events: Arc<dyn DomainEventSink>,
        config: Config,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleEngine::new(
            store.clone(),
            teams.clone(),
            lock.clone(),
            clock.clone(),
            rng.clone(),
            metrics.clone(),
            events,
            config.lifecycle,
            config.dispatcher.global_concurrency,
        ));
        Self {
            lifecycle,
            store,
            teams,
            lock,
            clock,
            rng,
            metrics,
        }
    }

    /// A fully in-memory gateway: real state machine, locking, rate
    /// limiting, and signing, but the store and tenant registry are the
    /// crate's own fakes and webhook delivery is dropped on the floor.
    /// Suitable for tests and for running this crate standalone.
    pub fn in_memory(config: Config) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let rng: Arc<dyn Rng> = Arc::new(SystemRng);
        Self::new(
            Arc::new(InMemoryPaymentStore::new()),
            Arc::new(InMemoryTeamRegistry::new()),
            Arc::new(InMemoryLock::new(clock.clone(), rng.clone())),
            clock,
            rng,
            Arc::new(PrometheusMetricsSink),
            Arc::new(NullDomainEventSink),
            config,
        )
    }
}

/// Structured logging setup (§9: ambient logging is carried regardless of
/// feature non-goals).
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cardgate_core=debug"));

    tracing_subscriber::registry().with(fmt::layer().with_target(true).with_thread_ids(true)).with(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{AuthorizeRequest, CancelRequest, ConfirmRequest, InitializeRequest, NullDomainEventSink};
    use crate::types::{PaymentStatus, Team};

    async fn test_gateway(slug: &str, password: &str) -> Gateway {
        let teams = Arc::new(InMemoryTeamRegistry::new());
        teams
            .insert(Team {
                id: format!("team-{slug}"),
                slug: slug.to_string(),
                password: password.to_string(),
                webhook_url: None,
                webhook_secret: None,
                webhook_retry_attempts: 3,
                webhook_timeout_seconds: 30,
                enable_webhooks: false,
                is_active: true,
                rate_limit_policy_override: None,
            })
            .await;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let rng: Arc<dyn Rng> = Arc::new(SystemRng);
        Gateway::new(
            Arc::new(InMemoryPaymentStore::new()),
            teams,
            Arc::new(InMemoryLock::new(clock.clone(), rng.clone())),
            clock,
            rng,
            Arc::new(PrometheusMetricsSink),
            Arc::new(NullDomainEventSink),
            Config::default(),
        )
    }

    #[tokio::test]
    async fn happy_path_auth_to_confirm() {
        let gateway = test_gateway("acme", "pw").await;

        let init = gateway
            .lifecycle
            .initialize(InitializeRequest {
                team_slug: "acme".to_string(),
                team_id: "team-acme".to_string(),
                order_id: "o-1".to_string(),
                amount: 100,
                currency: "RUB".to_string(),
                metadata: serde_json::Value::Null,
                external_request_id: None,
            })
            .await
            .unwrap();
        assert_eq!(init.status, PaymentStatus::New);

        let authorized = gateway
            .lifecycle
            .authorize(AuthorizeRequest {
                payment_id: init.payment_id.clone(),
                team_slug: "acme".to_string(),
                external_request_id: None,
            })
            .await
            .unwrap();
        assert_eq!(authorized.status, PaymentStatus::Authorized);

        let confirmed = gateway
            .lifecycle
            .confirm(ConfirmRequest {
                payment_id: init.payment_id.clone(),
                team_slug: "acme".to_string(),
                external_request_id: None,
            })
            .await
            .unwrap();
        assert_eq!(confirmed.status, PaymentStatus::Confirmed);
    }

    #[tokio::test]
    async fn illegal_confirm_while_new_does_not_mutate() {
        let gateway = test_gateway("acme", "pw").await;

        let init = gateway
            .lifecycle
            .initialize(InitializeRequest {
                team_slug: "acme".to_string(),
                team_id: "team-acme".to_string(),
                order_id: "o-2".to_string(),
                amount: 100,
                currency: "RUB".to_string(),
                metadata: serde_json::Value::Null,
                external_request_id: None,
            })
            .await
            .unwrap();

        let result = gateway
            .lifecycle
            .confirm(ConfirmRequest {
                payment_id: init.payment_id.clone(),
                team_slug: "acme".to_string(),
                external_request_id: None,
            })
            .await;
        assert!(result.is_err());

        let stored = gateway.lifecycle.get(&init.payment_id, "acme").await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::New);
    }

    #[tokio::test]
    async fn full_refund_then_partial_amount_rejected() {
        let gateway = test_gateway("acme", "pw").await;

        let init = gateway
            .lifecycle
            .initialize(InitializeRequest {
                team_slug: "acme".to_string(),
                team_id: "team-acme".to_string(),
                order_id: "o-3".to_string(),
                amount: 500,
                currency: "RUB".to_string(),
                metadata: serde_json::Value::Null,
                external_request_id: None,
            })
            .await
            .unwrap();
        gateway
            .lifecycle
            .authorize(AuthorizeRequest {
                payment_id: init.payment_id.clone(),
                team_slug: "acme".to_string(),
                external_request_id: None,
            })
            .await
            .unwrap();
        gateway
            .lifecycle
            .confirm(ConfirmRequest {
                payment_id: init.payment_id.clone(),
                team_slug: "acme".to_string(),
                external_request_id: None,
            })
            .await
            .unwrap();

        let partial = gateway
            .lifecycle
            .cancel(CancelRequest {
                payment_id: init.payment_id.clone(),
                team_slug: "acme".to_string(),
                amount: Some(499),
                reason: None,
                external_request_id: None,
            })
            .await;
        assert!(partial.is_err());

        let refunded = gateway
            .lifecycle
            .cancel(CancelRequest {
                payment_id: init.payment_id.clone(),
                team_slug: "acme".to_string(),
                amount: Some(500),
                reason: None,
                external_request_id: None,
            })
            .await
            .unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
    }
}
