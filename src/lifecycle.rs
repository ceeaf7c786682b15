//! Lifecycle engine (§4.4): executes one lifecycle command end-to-end with
//! exactly-once state mutation semantics, owning its own retry policy and
//! consecutive-failure bookkeeping the way a managed worker loop would, but
//! the "work" here is a single in-process state machine call instead of an
//! outbound chain transaction.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, instrument, warn};

use crate::audit::AuditEntryBuilder;
use crate::bounded_cache::BoundedCache;
use crate::clock::{Clock, Rng};
use crate::config::LifecycleConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::lock::Lock;
use crate::metrics::MetricsSink;
use crate::state_machine::{self, Event};
use crate::store::{PaymentStore, StoreTransaction, TeamRegistry};
use crate::types::{Payment, PaymentStatus, Transaction, TransactionType};

/// Emitted once a lifecycle command has committed a new status. The webhook
/// engine is the production subscriber; tests can plug in a recording sink.
#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub payment: Payment,
    pub from: PaymentStatus,
}

#[async_trait]
pub trait DomainEventSink: Send + Sync {
    async fn emit(&self, event: DomainEvent);
}

/// Sink that drops every event; used when webhook delivery isn't wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDomainEventSink;

#[async_trait]
impl DomainEventSink for NullDomainEventSink {
    async fn emit(&self, _event: DomainEvent) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub payment_id: String,
    pub status: PaymentStatus,
}

pub struct InitializeRequest {
    pub team_slug: String,
    pub team_id: String,
    pub order_id: String,
    pub amount: u64,
    pub currency: String,
    pub metadata: Value,
    pub external_request_id: Option<String>,
}

pub struct AuthorizeRequest {
    pub payment_id: String,
    pub team_slug: String,
    pub external_request_id: Option<String>,
}

pub struct ConfirmRequest {
    pub payment_id: String,
    pub team_slug: String,
    pub external_request_id: Option<String>,
}

pub struct CancelRequest {
    pub payment_id: String,
    pub team_slug: String,
    pub amount: Option<u64>,
    pub reason: Option<String>,
    pub external_request_id: Option<String>,
}

const IDEMPOTENCY_CACHE_SIZE: usize = 50_000;
const IDEMPOTENCY_CACHE_TTL: StdDuration = StdDuration::from_secs(86_400);

pub struct LifecycleEngine {
    store: Arc<dyn PaymentStore>,
    teams: Arc<dyn TeamRegistry>,
    lock: Arc<dyn Lock>,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn Rng>,
    metrics: Arc<dyn MetricsSink>,
    events: Arc<dyn DomainEventSink>,
    config: LifecycleConfig,
    admission: Semaphore,
    idempotency: Mutex<BoundedCache<String, CommandOutcome>>,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        teams: Arc<dyn TeamRegistry>,
        lock: Arc<dyn Lock>,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn Rng>,
        metrics: Arc<dyn MetricsSink>,
        events: Arc<dyn DomainEventSink>,
        config: LifecycleConfig,
        global_concurrency: usize,
    ) -> Self {
        Self {
            store,
            teams,
            lock,
            clock,
            rng,
            metrics,
            events,
            config,
            admission: Semaphore::new(global_concurrency),
            idempotency: Mutex::new(BoundedCache::new(IDEMPOTENCY_CACHE_SIZE, IDEMPOTENCY_CACHE_TTL)),
        }
    }

    async fn cached(&self, external_request_id: Option<&str>) -> Option<CommandOutcome> {
        let id = external_request_id?;
        self.idempotency.lock().await.get(&id.to_string()).cloned()
    }

    async fn cache_result(&self, external_request_id: Option<&str>, outcome: &CommandOutcome) {
        if let Some(id) = external_request_id {
            self.idempotency.lock().await.insert(id.to_string(), outcome.clone());
        }
    }

    async fn admit(&self) -> GatewayResult<tokio::sync::SemaphorePermit<'_>> {
        tokio::time::timeout(self.config.processing_timeout, self.admission.acquire())
            .await
            .map_err(|_| GatewayError::SystemOverload)?
            .map_err(|_| GatewayError::Internal("admission semaphore closed".into()))
    }

    async fn with_payment_lock<T, F, Fut>(&self, payment_id: &str, f: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = GatewayResult<T>>,
    {
        let key = format!("payment:{payment_id}");
        let handle = self
            .lock
            .acquire(&key, chrono::Duration::seconds(self.config.lock_timeout.as_secs() as i64), self.config.lock_timeout)
            .await?;
        let result = f().await;
        self.lock.release(&handle).await;
        result
    }

    /// Append a transaction + audit row and update the payment status in one
    /// transactional closure (§4.4 steps 6-7), with retry-on-transient (§4.4,
    /// retries only inside this step).
    async fn commit_transition(
        &self,
        payment: Payment,
        txn_kind: TransactionType,
        txn_amount: u64,
        action: &str,
    ) -> GatewayResult<Payment> {
        let mut attempt = 0u32;
        loop {
            let payment_id = payment.payment_id.clone();
            let snapshot_after = serde_json::to_string(&payment).unwrap_or_default();
            let now = self.clock.now();
            let previous_hash = self
                .store
                .list_audit(&payment_id)
                .await?
                .last()
                .map(|e| e.integrity_hash.clone());
            let audit_id = self.rng.new_id();
            let audit = AuditEntryBuilder {
                entity_id: payment_id.clone(),
                entity_type: "payment".to_string(),
                action: action.to_string(),
                user_id: None,
                details: "{}".to_string(),
                snapshot_after,
                is_sensitive: false,
            }
            .build(audit_id, now, previous_hash);

            let txn = Transaction {
                id: self.rng.new_id(),
                payment_id: payment_id.clone(),
                kind: txn_kind,
                amount: txn_amount,
                created_at: now,
                result_code: "OK".to_string(),
                result_message: None,
            };

            let result = async {
                let mut tx = self.store.begin().await?;
                tx.update_payment(payment.clone());
                tx.append_transaction(txn);
                tx.append_audit(audit);
                tx.commit().await
            }
            .await;

            match result {
                Ok(()) => return Ok(payment),
                Err(e) if e.is_retryable_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.base_retry_delay * attempt;
                    warn!(attempt, ?delay, error = %e, "transient commit failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[instrument(skip(self, req), fields(team = %req.team_slug, order_id = %req.order_id))]
    pub async fn initialize(&self, req: InitializeRequest) -> GatewayResult<CommandOutcome> {
        if let Some(cached) = self.cached(req.external_request_id.as_deref()).await {
            return Ok(cached);
        }
        let _permit = self.admit().await?;

        if let Some(existing) = self.store.get_by_order_id(&req.team_id, &req.order_id).await? {
            let outcome = CommandOutcome {
                payment_id: existing.payment_id,
                status: existing.status,
            };
            self.cache_result(req.external_request_id.as_deref(), &outcome).await;
            return Ok(outcome);
        }

        let transition = state_machine::transition_initial(Event::Initialize);
        if !transition.valid {
            return Err(GatewayError::InvalidState { from: "NONE".into() });
        }
        let now = self.clock.now();
        let payment = Payment {
            id: self.rng.new_id(),
            payment_id: self.rng.new_id(),
            team_id: req.team_id,
            team_slug: req.team_slug,
            order_id: req.order_id,
            amount: req.amount,
            currency: req.currency,
            status: transition.to.unwrap(),
            created_at: now,
            updated_at: now,
            is_deleted: false,
            metadata: req.metadata,
        };

        let committed = self
            .commit_transition(payment, TransactionType::StatusChange, req.amount, "Initialize")
            .await?;
        self.events
            .emit(DomainEvent {
                payment: committed.clone(),
                from: PaymentStatus::Init,
            })
            .await;
        self.metrics.record_state_transition("INIT", committed.status.as_str(), 0.0);

        let outcome = CommandOutcome {
            payment_id: committed.payment_id,
            status: committed.status,
        };
        self.cache_result(req.external_request_id.as_deref(), &outcome).await;
        info!(payment_id = %outcome.payment_id, "payment initialized");
        Ok(outcome)
    }

    async fn run_transition(
        &self,
        payment_id: &str,
        team_slug: &str,
        external_request_id: Option<&str>,
        amount_check: Option<u64>,
        event: Event,
        txn_kind: TransactionType,
        action: &str,
    ) -> GatewayResult<CommandOutcome> {
        if let Some(cached) = self.cached(external_request_id).await {
            return Ok(cached);
        }
        let _permit = self.admit().await?;

        let payment_id = payment_id.to_string();
        let outcome = self
            .with_payment_lock(&payment_id, || async {
                let mut payment = self
                    .store
                    .get_by_payment_id(&payment_id)
                    .await?
                    .ok_or(GatewayError::NotFound)?;

                if payment.team_slug != team_slug {
                    return Err(GatewayError::AccessDenied);
                }
                if let Some(amount) = amount_check {
                    if amount != payment.amount {
                        return Err(GatewayError::PartialNotSupported);
                    }
                }

                let from = payment.status;
                let transition = state_machine::transition(from, event);
                if !transition.valid {
                    return Err(GatewayError::InvalidState { from: from.as_str().to_string() });
                }
                let to = transition.to.unwrap();
                payment.status = to;
                payment.updated_at = self.clock.now();

                let committed = self.commit_transition(payment, txn_kind, amount_check.unwrap_or(0), action).await?;
                self.events.emit(DomainEvent { payment: committed.clone(), from }).await;
                self.metrics.record_state_transition(from.as_str(), to.as_str(), 0.0);

                Ok(CommandOutcome {
                    payment_id: committed.payment_id,
                    status: committed.status,
                })
            })
            .await?;

        self.cache_result(external_request_id, &outcome).await;
        Ok(outcome)
    }

    /// `Authorize` covers both the `NEW → FORM_SHOWED` and `FORM_SHOWED →
    /// AUTHORIZED` edges in one call (§4.4): the form-display step has no
    /// public command of its own, but still produces its own audit row,
    /// transaction, and domain event, so the merchant's webhook sequence
    /// observes `FORM_SHOWED` before `AUTHORIZED`.
    #[instrument(skip(self, req), fields(payment_id = %req.payment_id))]
    pub async fn authorize(&self, req: AuthorizeRequest) -> GatewayResult<CommandOutcome> {
        if let Some(cached) = self.cached(req.external_request_id.as_deref()).await {
            return Ok(cached);
        }
        let _permit = self.admit().await?;

        let payment_id = req.payment_id.clone();
        let outcome = self
            .with_payment_lock(&payment_id, || async {
                let mut payment = self
                    .store
                    .get_by_payment_id(&payment_id)
                    .await?
                    .ok_or(GatewayError::NotFound)?;
                if payment.team_slug != req.team_slug {
                    return Err(GatewayError::AccessDenied);
                }

                if payment.status == PaymentStatus::New {
                    let from = payment.status;
                    let transition = state_machine::transition(from, Event::ShowForm);
                    if !transition.valid {
                        return Err(GatewayError::InvalidState { from: from.as_str().to_string() });
                    }
                    payment.status = transition.to.unwrap();
                    payment.updated_at = self.clock.now();
                    payment = self.commit_transition(payment, TransactionType::StatusChange, 0, "ShowForm").await?;
                    self.events.emit(DomainEvent { payment: payment.clone(), from }).await;
                    self.metrics.record_state_transition(from.as_str(), payment.status.as_str(), 0.0);
                }

                let from = payment.status;
                let transition = state_machine::transition(from, Event::Authorize);
                if !transition.valid {
                    return Err(GatewayError::InvalidState { from: from.as_str().to_string() });
                }
                payment.status = transition.to.unwrap();
                payment.updated_at = self.clock.now();

                let committed = self.commit_transition(payment, TransactionType::Authorize, 0, "Authorize").await?;
                self.events.emit(DomainEvent { payment: committed.clone(), from }).await;
                self.metrics.record_state_transition(from.as_str(), committed.status.as_str(), 0.0);

                Ok(CommandOutcome {
                    payment_id: committed.payment_id,
                    status: committed.status,
                })
            })
            .await?;

        self.cache_result(req.external_request_id.as_deref(), &outcome).await;
        Ok(outcome)
    }

    #[instrument(skip(self, req), fields(payment_id = %req.payment_id))]
    pub async fn confirm(&self, req: ConfirmRequest) -> GatewayResult<CommandOutcome> {
        self.run_transition(
            &req.payment_id,
            &req.team_slug,
            req.external_request_id.as_deref(),
            None,
            Event::Confirm,
            TransactionType::Capture,
            "Confirm",
        )
        .await
    }

    /// Dispatches to cancellation / reversal / refund depending on the
    /// current status (§4.4): `NEW→CANCELLED`, `AUTHORIZED→CANCELLED`
    /// (logical reversal), `CONFIRMED→REFUNDED`.
    #[instrument(skip(self, req), fields(payment_id = %req.payment_id))]
    pub async fn cancel(&self, req: CancelRequest) -> GatewayResult<CommandOutcome> {
        if let Some(cached) = self.cached(req.external_request_id.as_deref()).await {
            return Ok(cached);
        }
        let _permit = self.admit().await?;

        let payment_id = req.payment_id.clone();
        let outcome = self
            .with_payment_lock(&payment_id, || async {
                let mut payment = self
                    .store
                    .get_by_payment_id(&payment_id)
                    .await?
                    .ok_or(GatewayError::NotFound)?;
                if payment.team_slug != req.team_slug {
                    return Err(GatewayError::AccessDenied);
                }
                if let Some(amount) = req.amount {
                    if amount != payment.amount {
                        return Err(GatewayError::PartialNotSupported);
                    }
                }

                let from = payment.status;
                let (event, txn_kind, action) = match from {
                    PaymentStatus::Confirmed => (Event::Refund, TransactionType::Refund, "Refund"),
                    _ => (Event::Cancel, TransactionType::Void, "Cancel"),
                };
                let transition = state_machine::transition(from, event);
                if !transition.valid {
                    return Err(GatewayError::InvalidState { from: from.as_str().to_string() });
                }
                let to = transition.to.unwrap();
                payment.status = to;
                payment.updated_at = self.clock.now();

                let committed = self.commit_transition(payment, txn_kind, req.amount.unwrap_or(0), action).await?;
                self.events.emit(DomainEvent { payment: committed.clone(), from }).await;
                self.metrics.record_state_transition(from.as_str(), to.as_str(), 0.0);
                self.metrics.record_cancellation(&committed.team_slug, action, 0);

                Ok(CommandOutcome {
                    payment_id: committed.payment_id,
                    status: committed.status,
                })
            })
            .await?;

        self.cache_result(req.external_request_id.as_deref(), &outcome).await;
        Ok(outcome)
    }

    pub async fn get(&self, payment_id: &str, team_slug: &str) -> GatewayResult<Option<Payment>> {
        match self.store.get_by_payment_id(payment_id).await? {
            Some(p) if p.team_slug == team_slug => Ok(Some(p)),
            Some(_) => Err(GatewayError::AccessDenied),
            None => Ok(None),
        }
    }

    pub fn teams(&self) -> &Arc<dyn TeamRegistry> {
        &self.teams
    }
}
