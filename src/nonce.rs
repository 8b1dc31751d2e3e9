//! Replay-protection cache for HMAC-authenticated admin requests.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Bounded TTL set of nonces seen on the admin plane.
///
/// A nonce is remembered for `ttl` after first use; a second request
/// presenting the same nonce within that window is rejected as a replay.
/// Expired entries are swept periodically by [`NonceCache::sweep`] rather
/// than on every lookup, so a lookup never pays for eviction.
pub struct NonceCache {
    ttl: Duration,
    entries: DashMap<String, Instant>,
}

impl NonceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Whether `nonce` was already recorded and is still within its TTL.
    /// Does not itself record anything — callers that only want to check
    /// replay status without committing to acceptance use this, then call
    /// [`NonceCache::insert`] once the rest of validation succeeds.
    pub fn contains(&self, nonce: &str) -> bool {
        match self.entries.get(nonce) {
            Some(seen_at) => Instant::now().duration_since(*seen_at) < self.ttl,
            None => false,
        }
    }

    /// Record `nonce` as seen, starting its TTL now.
    pub fn insert(&self, nonce: &str) {
        self.entries.insert(nonce.to_string(), Instant::now());
    }

    /// Drop entries older than `ttl`. Intended to run on a fixed interval
    /// (see `LT_NONCE_CLEANUP_INTERVAL`) from a background task.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);
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

    #[test]
    fn first_sighting_is_not_yet_present() {
        let cache = NonceCache::new(Duration::from_secs(60));
        assert!(!cache.contains("abc"));
        cache.insert("abc");
        assert!(cache.contains("abc"));
    }

    #[test]
    fn replay_is_detected() {
        let cache = NonceCache::new(Duration::from_secs(60));
        cache.insert("abc");
        assert!(cache.contains("abc"));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let cache = NonceCache::new(Duration::from_millis(1));
        cache.insert("abc");
        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_keeps_fresh_entries() {
        let cache = NonceCache::new(Duration::from_secs(60));
        cache.insert("abc");
        cache.sweep();
        assert_eq!(cache.len(), 1);
    }
}
