//! Bounded, TTL'd cache used for idempotency results, retry state, and other
//! in-memory maps that must not grow without bound (§9: "concurrent hash maps
//! with explicit eviction by TTL and by count"). Generic over an arbitrary
//! key type rather than a fixed `[u8; 32]` hash.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub struct BoundedCache<K, V> {
    map: HashMap<K, (V, Instant)>,
    max_size: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            map: HashMap::new(),
            max_size,
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key).filter(|(_, t)| t.elapsed() < self.ttl).map(|(v, _)| v)
    }

    pub fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();
        self.map.retain(|_, (_, t)| now.duration_since(*t) < self.ttl);
        while self.map.len() >= self.max_size && !self.map.is_empty() {
            let oldest = self.map.iter().min_by_key(|(_, (_, t))| *t).map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                self.map.remove(&k);
            } else {
                break;
            }
        }
        self.map.insert(key, (value, now));
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(v, _)| v)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
