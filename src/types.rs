//! Data model (§3): the entities every other module operates on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Tenant / merchant integration account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub slug: String,
    /// Secret shared with the merchant, used both for request signing and
    /// webhook HMAC. Never serialized back out over the wire.
    pub password: String,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_retry_attempts: u32,
    pub webhook_timeout_seconds: u64,
    pub enable_webhooks: bool,
    pub is_active: bool,
    /// Optional override of the default rate-limit policy for this tenant.
    pub rate_limit_policy_override: Option<String>,
}

/// Finite set of payment lifecycle states (§4.3). Terminal variants accept
/// no outbound edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Init,
    New,
    FormShowed,
    Authorized,
    Confirmed,
    Cancelled,
    Refunded,
    Rejected,
}

impl PaymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Confirmed
                | PaymentStatus::Cancelled
                | PaymentStatus::Refunded
                | PaymentStatus::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Init => "INIT",
            PaymentStatus::New => "NEW",
            PaymentStatus::FormShowed => "FORM_SHOWED",
            PaymentStatus::Authorized => "AUTHORIZED",
            PaymentStatus::Confirmed => "CONFIRMED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::Rejected => "REJECTED",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One merchant-initiated charge lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub payment_id: String,
    pub team_id: String,
    pub team_slug: String,
    pub order_id: String,
    pub amount: u64,
    pub currency: String,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
    /// Opaque merchant-supplied metadata, carried through but never interpreted.
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Authorize,
    Capture,
    Void,
    Refund,
    StatusChange,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Authorize => "authorize",
            TransactionType::Capture => "capture",
            TransactionType::Void => "void",
            TransactionType::Refund => "refund",
            TransactionType::StatusChange => "status_change",
        }
    }
}

/// Append-only child of [`Payment`]. Never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub payment_id: String,
    pub kind: TransactionType,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
    pub result_code: String,
    pub result_message: Option<String>,
}

/// Append-only, hash-chained audit row (§3 invariant I4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub action: String,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    pub snapshot_after: String,
    pub integrity_hash: String,
    pub is_sensitive: bool,
    pub previous_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationType {
    PaymentStatusChange,
    PaymentSuccess,
    PaymentFailure,
    FraudAlert,
    SystemAlert,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationType::PaymentStatusChange => "PAYMENT_STATUS_CHANGE",
            NotificationType::PaymentSuccess => "PAYMENT_SUCCESS",
            NotificationType::PaymentFailure => "PAYMENT_FAILURE",
            NotificationType::FraudAlert => "FRAUD_ALERT",
            NotificationType::SystemAlert => "SYSTEM_ALERT",
        }
    }
}

/// A scheduled webhook delivery. Lifecycle: created on domain event → enqueued
/// → dequeued by worker → rescheduled with backoff on failure → terminal
/// after max attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTask {
    pub notification_id: String,
    pub team_id: String,
    pub kind: NotificationType,
    pub endpoint: String,
    pub payload: Vec<u8>,
    pub priority: u8,
    pub attempt_count: u32,
    pub headers: Vec<(String, String)>,
    pub timeout: std::time::Duration,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
}

/// Per-(policyName, identifier) rate-limit bookkeeping. Purely in-memory.
#[derive(Debug, Clone)]
pub struct RateLimitEntry {
    pub window_start: DateTime<Utc>,
    pub request_count: u64,
    pub last_request: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub burst_timestamps: VecDeque<DateTime<Utc>>,
}

/// Named-resource lock handle (§3). A release with a mismatched owner is a
/// no-op; a lock past `expires_at` is considered free (P7).
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub key: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Optional expiring-token bookkeeping layer (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiringToken {
    pub token_id: String,
    pub team_slug: String,
    pub token: String,
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub original_params: std::collections::BTreeMap<String, String>,
}
