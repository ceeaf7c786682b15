//! Administrative bulk operations (§4.7, out-of-band from the lifecycle
//! dispatcher: no admission control, no idempotency cache, run directly
//! against the store). Thin by design — the atomicity guarantee lives in
//! [`crate::store::PaymentStore::bulk_delete`], not here.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::error::GatewayResult;
use crate::store::PaymentStore;

pub struct AdminOps {
    store: Arc<dyn PaymentStore>,
}

impl AdminOps {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    /// Soft-delete every payment (and its transactions) belonging to
    /// `team_id`. Returns the count of payments affected.
    #[instrument(skip(self))]
    pub async fn bulk_delete_team(&self, team_id: &str) -> GatewayResult<u64> {
        let count = self.store.bulk_delete(team_id).await?;
        info!(team_id, count, "bulk deleted team payments");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryPaymentStore;
    use crate::types::{Payment, PaymentStatus};
    use chrono::Utc;

    async fn seed_payment(store: &InMemoryPaymentStore, team_id: &str, payment_id: &str) {
        let mut tx = store.begin().await.unwrap();
        let now = Utc::now();
        tx.update_payment(Payment {
            id: payment_id.to_string(),
            payment_id: payment_id.to_string(),
            team_id: team_id.to_string(),
            team_slug: "acme".to_string(),
            order_id: format!("order-{payment_id}"),
            amount: 100,
            currency: "USD".to_string(),
            status: PaymentStatus::New,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            metadata: serde_json::Value::Null,
        });
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn bulk_delete_removes_only_matching_team() {
        let store = InMemoryPaymentStore::new();
        seed_payment(&store, "team-1", "p1").await;
        seed_payment(&store, "team-1", "p2").await;
        seed_payment(&store, "team-2", "p3").await;

        let admin = AdminOps::new(Arc::new(store));
        let deleted = admin.bulk_delete_team("team-1").await.unwrap();
        assert_eq!(deleted, 2);
    }
}
