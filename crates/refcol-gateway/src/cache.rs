//! Response cache keyed by request.
//!
//! Both answers and "nobody answered" outcomes are stored, so a repeated
//! request never reaches a backend again. Entries live for the whole
//! process; when a bound is set and reached, new keys are simply not
//! stored.

use dashmap::DashMap;
use refcol_core::reflection::ServerReflectionResponse;
use tracing::debug;

/// Concurrent map from request key to the aggregated outcome
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<String, Option<ServerReflectionResponse>>,
    max_entries: Option<usize>,
}

impl ResponseCache {
    /// Create a cache holding at most `max_entries` keys, or any number for `None`
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Cached outcome for `key`. The outer `None` is a miss.
    pub fn get(&self, key: &str) -> Option<Option<ServerReflectionResponse>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Store an outcome. Returns false when the cache is full and `key` is new.
    pub fn insert(&self, key: String, outcome: Option<ServerReflectionResponse>) -> bool {
        if let Some(max) = self.max_entries {
            if self.entries.len() >= max && !self.entries.contains_key(&key) {
                debug!(max_entries = max, "Response cache full, not storing");
                return false;
            }
        }
        self.entries.insert(key, outcome);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(host: &str) -> ServerReflectionResponse {
        ServerReflectionResponse {
            valid_host: host.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = ResponseCache::new(None);
        assert!(cache.get("k").is_none());
        assert!(cache.insert("k".to_string(), Some(response("a"))));
        assert_eq!(cache.get("k"), Some(Some(response("a"))));
    }

    #[test]
    fn stores_empty_outcomes() {
        let cache = ResponseCache::default();
        cache.insert("nobody".to_string(), None);
        assert_eq!(cache.get("nobody"), Some(None));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn bounded_cache_stops_growing() {
        let cache = ResponseCache::new(Some(1));
        assert!(cache.insert("a".to_string(), None));
        assert!(!cache.insert("b".to_string(), None));
        assert!(cache.get("b").is_none());
        // Existing keys may still be refreshed.
        assert!(cache.insert("a".to_string(), Some(response("a"))));
        assert_eq!(cache.len(), 1);
    }
}
