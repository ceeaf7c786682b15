//! Append-only audit trail with hash-chained integrity (§3 invariant I4, P6).

use chrono::{DateTime, Utc};

use crate::types::AuditEntry;

/// `integrityHash = SHA256(entityId | entityType | action | userId |
/// timestamp-ISO8601 | details | snapshotAfter)`.
pub fn integrity_hash(
    entity_id: &str,
    entity_type: &str,
    action: &str,
    user_id: Option<&str>,
    timestamp: DateTime<Utc>,
    details: &str,
    snapshot_after: &str,
) -> String {
    let concat = format!(
        "{entity_id}{entity_type}{action}{}{}{details}{snapshot_after}",
        user_id.unwrap_or(""),
        timestamp.to_rfc3339(),
    );
    crate::crypto::sha256_hex(concat.as_bytes())
}

pub struct AuditEntryBuilder {
    pub entity_id: String,
    pub entity_type: String,
    pub action: String,
    pub user_id: Option<String>,
    pub details: String,
    pub snapshot_after: String,
    pub is_sensitive: bool,
}

impl AuditEntryBuilder {
    pub fn build(self, id: String, timestamp: DateTime<Utc>, previous_hash: Option<String>) -> AuditEntry {
        let hash = integrity_hash(
            &self.entity_id,
            &self.entity_type,
            &self.action,
            self.user_id.as_deref(),
            timestamp,
            &self.details,
            &self.snapshot_after,
        );
        AuditEntry {
            id,
            entity_id: self.entity_id,
            entity_type: self.entity_type,
            action: self.action,
            user_id: self.user_id,
            timestamp,
            details: self.details,
            snapshot_after: self.snapshot_after,
            integrity_hash: hash,
            is_sensitive: self.is_sensitive,
            previous_hash,
        }
    }
}

/// Recompute and compare every row's `integrityHash`; verify timestamps
/// within `(entityId, entityType)` are non-decreasing (P6).
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), String> {
    let mut last_timestamp: Option<DateTime<Utc>> = None;
    for entry in entries {
        let recomputed = integrity_hash(
            &entry.entity_id,
            &entry.entity_type,
            &entry.action,
            entry.user_id.as_deref(),
            entry.timestamp,
            &entry.details,
            &entry.snapshot_after,
        );
        if recomputed != entry.integrity_hash {
            return Err(format!("integrity hash mismatch for audit entry {}", entry.id));
        }
        if let Some(prev) = last_timestamp {
            if entry.timestamp < prev {
                return Err(format!("timestamp reversal detected at audit entry {}", entry.id));
            }
        }
        last_timestamp = Some(entry.timestamp);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_recomputable() {
        let now = Utc::now();
        let entry = AuditEntryBuilder {
            entity_id: "P1".into(),
            entity_type: "payment".into(),
            action: "Authorize".into(),
            user_id: None,
            details: "{}".into(),
            snapshot_after: "{\"status\":\"AUTHORIZED\"}".into(),
            is_sensitive: false,
        }
        .build("A1".into(), now, None);

        assert!(verify_chain(&[entry]).is_ok());
    }

    #[test]
    fn tampered_snapshot_fails_verification() {
        let now = Utc::now();
        let mut entry = AuditEntryBuilder {
            entity_id: "P1".into(),
            entity_type: "payment".into(),
            action: "Authorize".into(),
            user_id: None,
            details: "{}".into(),
            snapshot_after: "{\"status\":\"AUTHORIZED\"}".into(),
            is_sensitive: false,
        }
        .build("A1".into(), now, None);
        entry.snapshot_after = "{\"status\":\"CONFIRMED\"}".into();

        assert!(verify_chain(&[entry]).is_err());
    }

    #[test]
    fn timestamp_reversal_is_detected() {
        let now = Utc::now();
        let e1 = AuditEntryBuilder {
            entity_id: "P1".into(),
            entity_type: "payment".into(),
            action: "Authorize".into(),
            user_id: None,
            details: "{}".into(),
            snapshot_after: "a".into(),
            is_sensitive: false,
        }
        .build("A1".into(), now, None);
        let e2 = AuditEntryBuilder {
            entity_id: "P1".into(),
            entity_type: "payment".into(),
            action: "Confirm".into(),
            user_id: None,
            details: "{}".into(),
            snapshot_after: "b".into(),
            is_sensitive: false,
        }
        .build("A2".into(), now - chrono::Duration::seconds(5), Some(e1.integrity_hash.clone()));

        assert!(verify_chain(&[e1, e2]).is_err());
    }
}
