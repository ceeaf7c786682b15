//! External persistence interfaces (§6, §1 out-of-scope). The SQL engine and
//! the tenant registry are collaborators this crate never implements for
//! real — callers inject a `PgPool`-backed implementation rather than this
//! crate owning the database; it ships in-memory fakes so its own test suite
//! is self-contained.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{GatewayError, GatewayResult};
use crate::types::{AuditEntry, Payment, Team, Transaction};

/// Looks up tenants by slug. Read-mostly; mutated only by out-of-scope admin
/// flows.
#[async_trait]
pub trait TeamRegistry: Send + Sync {
    async fn lookup_by_slug(&self, slug: &str) -> GatewayResult<Team>;
}

/// A single atomic unit of work against the store. Writes are buffered in
/// the transaction and only become visible once `commit` is called;
/// dropping it without committing reverts everything (matches "commit
/// succeeds or all writes revert", §6).
#[async_trait]
pub trait StoreTransaction: Send {
    async fn get_payment(&mut self, payment_id: &str) -> GatewayResult<Option<Payment>>;
    fn update_payment(&mut self, payment: Payment);
    fn append_transaction(&mut self, txn: Transaction);
    fn append_audit(&mut self, entry: AuditEntry);
    async fn commit(self: Box<Self>) -> GatewayResult<()>;
}

/// Transactional key-indexed payment store (§6 persistence contract).
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn begin(&self) -> GatewayResult<Box<dyn StoreTransaction>>;

    async fn get_by_payment_id(&self, payment_id: &str) -> GatewayResult<Option<Payment>>;
    async fn get_by_order_id(&self, team_id: &str, order_id: &str) -> GatewayResult<Option<Payment>>;
    async fn list_audit(&self, entity_id: &str) -> GatewayResult<Vec<AuditEntry>>;
    async fn list_transactions(&self, payment_id: &str) -> GatewayResult<Vec<Transaction>>;

    /// Soft-delete every row for `team_id`, used only by admin ops.
    /// Performed inside a single transactional closure; row order is an
    /// implementation choice as long as the whole operation is atomic.
    async fn bulk_delete(&self, team_id: &str) -> GatewayResult<u64>;
}

#[derive(Default)]
struct Inner {
    payments: HashMap<String, Payment>,
    transactions: Vec<Transaction>,
    audit: Vec<AuditEntry>,
}

/// Reference `PaymentStore` used by this crate's own test suite.
pub struct InMemoryPaymentStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for InMemoryPaymentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }
}

/// Buffers writes locally; only `commit` applies them to the shared map, so
/// a transaction dropped on an error path (the `?` in callers) reverts
/// cleanly with no extra bookkeeping.
struct InMemoryTransaction {
    store: Arc<Mutex<Inner>>,
    pending_payments: HashMap<String, Payment>,
    pending_transactions: Vec<Transaction>,
    pending_audit: Vec<AuditEntry>,
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn get_payment(&mut self, payment_id: &str) -> GatewayResult<Option<Payment>> {
        if let Some(p) = self.pending_payments.get(payment_id) {
            return Ok(Some(p.clone()));
        }
        Ok(self.store.lock().await.payments.get(payment_id).cloned())
    }

    fn update_payment(&mut self, payment: Payment) {
        self.pending_payments.insert(payment.payment_id.clone(), payment);
    }

    fn append_transaction(&mut self, txn: Transaction) {
        self.pending_transactions.push(txn);
    }

    fn append_audit(&mut self, entry: AuditEntry) {
        self.pending_audit.push(entry);
    }

    async fn commit(self: Box<Self>) -> GatewayResult<()> {
        let mut guard = self.store.lock().await;
        guard.payments.extend(self.pending_payments);
        guard.transactions.extend(self.pending_transactions);
        guard.audit.extend(self.pending_audit);
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn begin(&self) -> GatewayResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            store: self.inner.clone(),
            pending_payments: HashMap::new(),
            pending_transactions: Vec::new(),
            pending_audit: Vec::new(),
        }))
    }

    async fn get_by_payment_id(&self, payment_id: &str) -> GatewayResult<Option<Payment>> {
        Ok(self.inner.lock().await.payments.get(payment_id).cloned())
    }

    async fn get_by_order_id(&self, team_id: &str, order_id: &str) -> GatewayResult<Option<Payment>> {
        Ok(self
            .inner
            .lock()
            .await
            .payments
            .values()
            .find(|p| p.team_id == team_id && p.order_id == order_id && !p.is_deleted)
            .cloned())
    }

    async fn list_audit(&self, entity_id: &str) -> GatewayResult<Vec<AuditEntry>> {
        Ok(self
            .inner
            .lock()
            .await
            .audit
            .iter()
            .filter(|e| e.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn list_transactions(&self, payment_id: &str) -> GatewayResult<Vec<Transaction>> {
        Ok(self
            .inner
            .lock()
            .await
            .transactions
            .iter()
            .filter(|t| t.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn bulk_delete(&self, team_id: &str) -> GatewayResult<u64> {
        let mut guard = self.inner.lock().await;
        let payment_ids: Vec<String> = guard
            .payments
            .values()
            .filter(|p| p.team_id == team_id && !p.is_deleted)
            .map(|p| p.payment_id.clone())
            .collect();
        // Transactions before payments, respecting FK direction, even though
        // both mutate in one atomic critical section here.
        guard
            .transactions
            .retain(|t| !payment_ids.contains(&t.payment_id));
        let mut count = 0u64;
        for id in &payment_ids {
            if let Some(p) = guard.payments.get_mut(id) {
                p.is_deleted = true;
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Reference `TeamRegistry` used by this crate's own test suite.
#[derive(Default)]
pub struct InMemoryTeamRegistry {
    teams: Arc<Mutex<HashMap<String, Team>>>,
}

impl InMemoryTeamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, team: Team) {
        self.teams.lock().await.insert(team.slug.clone(), team);
    }
}

#[async_trait]
impl TeamRegistry for InMemoryTeamRegistry {
    async fn lookup_by_slug(&self, slug: &str) -> GatewayResult<Team> {
        self.teams
            .lock()
            .await
            .get(slug)
            .cloned()
            .ok_or(GatewayError::TeamNotFound)
    }
}
