//! Sliding-window rate limiter with burst protection (§4.2). Each
//! `(policyName, identifier)` pair has its own entry, protected by a per-key
//! critical section so decisions for one identifier are serialized while
//! decisions across identifiers proceed independently.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::types::RateLimitEntry;

#[derive(Debug, Clone)]
pub struct Policy {
    pub max_requests: u64,
    pub window_size: chrono::Duration,
    pub block_duration: chrono::Duration,
    pub enable_burst: bool,
    pub burst_limit: u64,
    pub burst_window: chrono::Duration,
}

impl Policy {
    pub fn new(max_requests: u64, window_size: chrono::Duration, block_duration: chrono::Duration) -> Self {
        Self {
            max_requests,
            window_size,
            block_duration,
            enable_burst: false,
            burst_limit: 0,
            burst_window: chrono::Duration::zero(),
        }
    }

    pub fn with_burst(mut self, burst_limit: u64, burst_window: chrono::Duration) -> Self {
        self.enable_burst = true;
        self.burst_limit = burst_limit;
        self.burst_window = burst_window;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow { remaining: u64 },
    Deny { retry_after: chrono::Duration },
}

struct KeyTable {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

/// One table per policy name; identifiers within a policy share a table but
/// are keyed independently.
pub struct RateLimiter {
    policies: HashMap<String, Policy>,
    tables: Mutex<HashMap<String, Arc<KeyTable>>>,
}

impl RateLimiter {
    pub fn new(policies: HashMap<String, Policy>) -> Self {
        Self {
            policies,
            tables: Mutex::new(HashMap::new()),
        }
    }

    async fn table_for(&self, policy_name: &str) -> Arc<KeyTable> {
        let mut guard = self.tables.lock().await;
        guard
            .entry(policy_name.to_string())
            .or_insert_with(|| {
                Arc::new(KeyTable {
                    entries: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }

    /// Decide whether `(policyName, identifier)` may proceed at `now`.
    /// Unknown policies allow unconditionally (fail-open at the boundary;
    /// the composition root is responsible for registering every policy it
    /// uses).
    pub async fn check(&self, policy_name: &str, identifier: &str, now: DateTime<Utc>) -> Decision {
        let Some(policy) = self.policies.get(policy_name) else {
            return Decision::Allow { remaining: u64::MAX };
        };
        let table = self.table_for(policy_name).await;
        let mut entries = table.entries.lock().await;
        let entry = entries.entry(identifier.to_string()).or_insert_with(|| RateLimitEntry {
            window_start: now,
            request_count: 0,
            last_request: now,
            blocked_until: None,
            burst_timestamps: Default::default(),
        });

        entry.last_request = now;

        if let Some(blocked_until) = entry.blocked_until {
            if now < blocked_until {
                return Decision::Deny {
                    retry_after: blocked_until - now,
                };
            }
        }

        if now >= entry.window_start + policy.window_size {
            entry.request_count = 1;
            entry.window_start = now;
            entry.blocked_until = None;
            entry.burst_timestamps.clear();
        } else {
            entry.request_count += 1;
        }

        if policy.enable_burst {
            entry.burst_timestamps.push_back(now);
            while entry
                .burst_timestamps
                .front()
                .is_some_and(|&t| now - t > policy.burst_window)
            {
                entry.burst_timestamps.pop_front();
            }
            if entry.burst_timestamps.len() as u64 > policy.burst_limit {
                entry.blocked_until = Some(now + policy.block_duration);
                return Decision::Deny {
                    retry_after: policy.block_duration,
                };
            }
        }

        if entry.request_count > policy.max_requests {
            entry.blocked_until = Some(now + policy.block_duration);
            return Decision::Deny {
                retry_after: policy.block_duration,
            };
        }

        Decision::Allow {
            remaining: policy.max_requests.saturating_sub(entry.request_count),
        }
    }

    /// Periodic sweep: remove entries idle longer than `windowSize + grace`
    /// and unblock expired blocks. Intended to be driven by the scheduler
    /// (§9) on a fixed period.
    pub async fn sweep(&self, now: DateTime<Utc>, grace: chrono::Duration) {
        let tables: Vec<(String, Arc<KeyTable>)> = self
            .tables
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, table) in &tables {
            let Some(policy) = self.policies.get(name) else { continue };
            let mut entries = table.entries.lock().await;
            entries.retain(|_, e| now - e.last_request < policy.window_size + grace);
            for e in entries.values_mut() {
                if e.blocked_until.is_some_and(|b| b <= now) {
                    e.blocked_until = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn limiter() -> RateLimiter {
        let mut policies = HashMap::new();
        policies.insert(
            "default".to_string(),
            Policy::new(3, Duration::seconds(1), Duration::seconds(5)),
        );
        RateLimiter::new(policies)
    }

    #[tokio::test]
    async fn allows_up_to_max_then_denies() {
        let limiter = limiter();
        let t0 = Utc::now();
        for _ in 0..3 {
            assert!(matches!(
                limiter.check("default", "team:acme", t0).await,
                Decision::Allow { .. }
            ));
        }
        let fourth = limiter.check("default", "team:acme", t0 + Duration::milliseconds(50)).await;
        assert!(matches!(fourth, Decision::Deny { .. }));
    }

    #[tokio::test]
    async fn unblocks_after_block_duration() {
        let limiter = limiter();
        let t0 = Utc::now();
        for _ in 0..4 {
            limiter.check("default", "team:acme", t0).await;
        }
        let after_block = limiter
            .check("default", "team:acme", t0 + Duration::seconds(6))
            .await;
        assert!(matches!(after_block, Decision::Allow { .. }));
    }

    #[tokio::test]
    async fn identifiers_are_independent() {
        let limiter = limiter();
        let t0 = Utc::now();
        for _ in 0..3 {
            limiter.check("default", "team:a", t0).await;
        }
        let other = limiter.check("default", "team:b", t0).await;
        assert!(matches!(other, Decision::Allow { .. }));
    }

    #[tokio::test]
    async fn burst_denies_before_main_window_limit() {
        let mut policies = HashMap::new();
        policies.insert(
            "burst".to_string(),
            Policy::new(100, Duration::seconds(60), Duration::seconds(5))
                .with_burst(2, Duration::milliseconds(200)),
        );
        let limiter = RateLimiter::new(policies);
        let t0 = Utc::now();
        assert!(matches!(limiter.check("burst", "id", t0).await, Decision::Allow { .. }));
        assert!(matches!(limiter.check("burst", "id", t0).await, Decision::Allow { .. }));
        let third = limiter.check("burst", "id", t0).await;
        assert!(matches!(third, Decision::Deny { .. }));
    }
}
