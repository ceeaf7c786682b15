//! Distributed (named) lock service (§4.4 data model, used by the lifecycle
//! engine's payment-level mutual exclusion). Abstracted behind a trait so a
//! shared-store backend can replace the single-node implementation without
//! touching callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration as TokioDuration};

use crate::clock::Clock;
use crate::error::{GatewayError, GatewayResult};
use crate::types::LockHandle;

#[async_trait]
pub trait Lock: Send + Sync {
    /// Acquire `key` for `ttl`, retrying until `deadline` elapses. Returns a
    /// handle whose `owner` must be presented on release.
    async fn acquire(&self, key: &str, ttl: chrono::Duration, deadline: TokioDuration) -> GatewayResult<LockHandle>;

    /// Release `handle`. A release with a mismatched owner, or for a lock
    /// that has already expired, is a no-op (P7).
    async fn release(&self, handle: &LockHandle);
}

struct Entry {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// Single-node in-memory lock table with TTL and fencing by owner token.
pub struct InMemoryLock {
    table: Mutex<HashMap<String, Entry>>,
    clock: std::sync::Arc<dyn Clock>,
    rng: std::sync::Arc<dyn crate::clock::Rng>,
}

impl InMemoryLock {
    pub fn new(clock: std::sync::Arc<dyn Clock>, rng: std::sync::Arc<dyn crate::clock::Rng>) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            clock,
            rng,
        }
    }

    async fn try_acquire(&self, key: &str, ttl: chrono::Duration) -> Option<LockHandle> {
        let now = self.clock.now();
        let mut guard = self.table.lock().await;
        let free = match guard.get(key) {
            None => true,
            Some(entry) => entry.expires_at <= now,
        };
        if !free {
            return None;
        }
        let owner = self.rng.new_id();
        let expires_at = now + ttl;
        guard.insert(
            key.to_string(),
            Entry {
                owner: owner.clone(),
                expires_at,
            },
        );
        Some(LockHandle {
            key: key.to_string(),
            owner,
            expires_at,
        })
    }
}

#[async_trait]
impl Lock for InMemoryLock {
    async fn acquire(&self, key: &str, ttl: chrono::Duration, deadline: TokioDuration) -> GatewayResult<LockHandle> {
        let poll_interval = TokioDuration::from_millis(10);
        let start = tokio::time::Instant::now();
        loop {
            if let Some(handle) = self.try_acquire(key, ttl).await {
                return Ok(handle);
            }
            if start.elapsed() >= deadline {
                return Err(GatewayError::LockTimeout);
            }
            sleep(poll_interval).await;
        }
    }

    async fn release(&self, handle: &LockHandle) {
        let mut guard = self.table.lock().await;
        if let Some(entry) = guard.get(&handle.key) {
            if entry.owner == handle.owner {
                guard.remove(&handle.key);
            }
            // Mismatched owner: no-op, safety against late releases.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, SystemRng};
    use std::sync::Arc;

    fn lock() -> InMemoryLock {
        InMemoryLock::new(Arc::new(FixedClock::new(Utc::now())), Arc::new(SystemRng))
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_first_holds() {
        let lock = lock();
        let h1 = lock
            .acquire("payment:P", chrono::Duration::seconds(30), TokioDuration::from_millis(50))
            .await
            .unwrap();
        let second = lock
            .acquire("payment:P", chrono::Duration::seconds(30), TokioDuration::from_millis(50))
            .await;
        assert!(matches!(second, Err(GatewayError::LockTimeout)));
        lock.release(&h1).await;
        let third = lock
            .acquire("payment:P", chrono::Duration::seconds(30), TokioDuration::from_millis(50))
            .await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn release_with_wrong_owner_is_noop() {
        let lock = lock();
        let h1 = lock
            .acquire("payment:P", chrono::Duration::seconds(30), TokioDuration::from_millis(50))
            .await
            .unwrap();
        let forged = LockHandle {
            key: h1.key.clone(),
            owner: "someone-else".to_string(),
            expires_at: h1.expires_at,
        };
        lock.release(&forged).await;
        let still_held = lock
            .acquire("payment:P", chrono::Duration::seconds(30), TokioDuration::from_millis(20))
            .await;
        assert!(matches!(still_held, Err(GatewayError::LockTimeout)));
    }

    #[tokio::test]
    async fn expired_lock_is_considered_free() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let lock = InMemoryLock::new(clock.clone(), Arc::new(SystemRng));
        let _h1 = lock
            .acquire("payment:P", chrono::Duration::milliseconds(10), TokioDuration::from_millis(50))
            .await
            .unwrap();
        clock.advance(chrono::Duration::milliseconds(20));
        let second = lock
            .acquire("payment:P", chrono::Duration::seconds(30), TokioDuration::from_millis(50))
            .await;
        assert!(second.is_ok());
    }
}
