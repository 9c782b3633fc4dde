//! A small TTL-bounded LRU cache for policy decisions (spec §4.3).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::policy::Decision;

/// Cache key: identity, resource, actions sorted for order-independence,
/// and source ip (spec §4.3).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub identity: String,
    pub resource: String,
    pub actions: Vec<String>,
    pub source_ip: Option<String>,
}

impl CacheKey {
    pub fn new(identity: &str, resource: &str, actions: &[String], source_ip: Option<&str>) -> Self {
        let mut actions: Vec<String> = actions.to_vec();
        actions.sort();
        Self {
            identity: identity.to_string(),
            resource: resource.to_string(),
            actions,
            source_ip: source_ip.map(str::to_string),
        }
    }
}

struct Entry {
    decision: Decision,
    inserted_at: Instant,
    last_used: u64,
}

/// Insertion-order-free LRU: eviction picks the smallest `last_used`
/// counter, which is simple and adequate at the sizes this cache runs at
/// (spec-configured `cache_size`, defaulting to the low thousands).
pub struct DecisionCache {
    entries: HashMap<CacheKey, Entry>,
    capacity: usize,
    ttl: Duration,
    clock: u64,
}

impl DecisionCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            ttl,
            clock: 0,
        }
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<Decision> {
        self.clock += 1;
        let now = Instant::now();
        let expired = self
            .entries
            .get(key)
            .map(|e| now.duration_since(e.inserted_at) > self.ttl)
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
            return None;
        }
        let clock = self.clock;
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_used = clock;
            return Some(entry.decision);
        }
        None
    }

    pub fn put(&mut self, key: CacheKey, decision: Decision) {
        self.clock += 1;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(victim) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(
            key,
            Entry {
                decision,
                inserted_at: Instant::now(),
                last_used: self.clock,
            },
        );
    }

    /// Invalidated wholesale on any policy add/remove/reload (spec §4.3).
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = DecisionCache::new(2, Duration::from_secs(60));
        let k1 = CacheKey::new("a", "r1", &[], None);
        let k2 = CacheKey::new("b", "r2", &[], None);
        let k3 = CacheKey::new("c", "r3", &[], None);
        cache.put(k1.clone(), Decision::Allow);
        cache.put(k2.clone(), Decision::Deny);
        cache.get(&k1);
        cache.put(k3.clone(), Decision::Allow);
        assert!(cache.get(&k2).is_none());
        assert!(cache.get(&k1).is_some());
        assert!(cache.get(&k3).is_some());
    }

    #[test]
    fn ttl_expiry() {
        let mut cache = DecisionCache::new(10, Duration::from_millis(0));
        let k = CacheKey::new("a", "r", &[], None);
        cache.put(k.clone(), Decision::Allow);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&k).is_none());
    }
}
