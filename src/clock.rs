//! Monotonic clock, opaque identifiers, and constant-time byte compare.

use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Capability for reading the current time. Injected so tests can control it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A fixed-time clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct FixedClock {
    at: std::sync::Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            at: std::sync::Arc::new(std::sync::Mutex::new(at)),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.at.lock().expect("fixed clock poisoned");
        *guard += delta;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.at.lock().expect("fixed clock poisoned")
    }
}

/// Capability for generating opaque v4 identifiers. Injected so tests are reproducible.
pub trait Rng: Send + Sync {
    fn new_id(&self) -> String;
    fn random_bytes(&self, len: usize) -> Vec<u8>;
}

/// Production id generator using real randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRng;

impl Rng for SystemRng {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn random_bytes(&self, len: usize) -> Vec<u8> {
        use rand::RngCore;
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }
}

/// Constant-time comparison of two byte buffers. Unequal lengths are rejected
/// without comparing content, matching the "mismatched length ⇒ reject" rule.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Unix seconds, used for webhook timestamp headers and replay windows.
pub fn unix_seconds(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub fn system_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
