//! Short-TTL cache of presigned artifact URLs.
//!
//! Entries live for 0.9× the signature expiry they were stored with,
//! leaving a refresh margin before the underlying signed URL actually
//! expires. The cache is bounded: inserts past capacity first sweep expired
//! entries, then evict the entry closest to expiry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// TTL fraction of the signature expiry.
const TTL_MARGIN: f64 = 0.9;

struct CacheEntry {
    url: String,
    expires_at: Instant,
}

/// Bounded TTL cache keyed by artifact id.
pub struct ArtifactUrlCache {
    entries: Mutex<HashMap<Uuid, CacheEntry>>,
    capacity: usize,
}

impl ArtifactUrlCache {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns the cached URL if present and unexpired.
    pub fn get(&self, artifact_id: Uuid) -> Option<String> {
        let mut entries = self.entries.lock().expect("url cache poisoned");
        match entries.get(&artifact_id) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.url.clone()),
            Some(_) => {
                entries.remove(&artifact_id);
                None
            }
            None => None,
        }
    }

    /// Caches a URL whose signature expires in `expiry_secs`; the entry
    /// itself lives for 0.9× that.
    pub fn put(&self, artifact_id: Uuid, url: impl Into<String>, expiry_secs: u64) {
        let ttl = Duration::from_secs_f64(expiry_secs as f64 * TTL_MARGIN);
        let mut entries = self.entries.lock().expect("url cache poisoned");
        let now = Instant::now();
        if entries.len() >= self.capacity && !entries.contains_key(&artifact_id) {
            entries.retain(|_, entry| entry.expires_at > now);
            if entries.len() >= self.capacity {
                // Still full after the sweep: evict the entry closest to
                // expiry.
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(id, _)| *id)
                {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            artifact_id,
            CacheEntry {
                url: url.into(),
                expires_at: now + ttl,
            },
        );
    }

    /// Drops the cached URL for an artifact, if any.
    pub fn invalidate(&self, artifact_id: Uuid) {
        self.entries
            .lock()
            .expect("url cache poisoned")
            .remove(&artifact_id);
    }

    /// Seconds until the cached entry expires, `None` on a miss.
    pub fn ttl_remaining(&self, artifact_id: Uuid) -> Option<u64> {
        let entries = self.entries.lock().expect("url cache poisoned");
        entries.get(&artifact_id).map(|entry| {
            entry
                .expires_at
                .saturating_duration_since(Instant::now())
                .as_secs()
        })
    }

    /// Current entry count, expired entries included until swept.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("url cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_invalidate() {
        let cache = ArtifactUrlCache::new(16);
        let id = Uuid::new_v4();

        assert!(cache.get(id).is_none());
        cache.put(id, "https://signed.example/a", 3600);
        assert_eq!(cache.get(id).as_deref(), Some("https://signed.example/a"));

        // TTL is 0.9 × expiry.
        let ttl = cache.ttl_remaining(id).unwrap();
        assert!(ttl <= 3240 && ttl > 3230);

        cache.invalidate(id);
        assert!(cache.get(id).is_none());
    }

    #[test]
    fn test_expired_entries_miss() {
        let cache = ArtifactUrlCache::new(16);
        // Zero expiry yields a zero TTL; entries are dead on arrival.
        let id = Uuid::new_v4();
        cache.put(id, "https://signed.example/a", 0);
        assert!(cache.get(id).is_none());
    }

    #[test]
    fn test_capacity_bound_holds() {
        let cache = ArtifactUrlCache::new(4);
        for _ in 0..32 {
            cache.put(Uuid::new_v4(), "https://signed.example/x", 3600);
        }
        assert!(cache.len() <= 4);
    }

    #[test]
    fn test_reinsert_refreshes_without_eviction() {
        let cache = ArtifactUrlCache::new(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.put(a, "https://signed.example/a", 3600);
        cache.put(b, "https://signed.example/b", 3600);
        // Re-inserting an existing key does not evict the other entry.
        cache.put(a, "https://signed.example/a2", 3600);
        assert_eq!(cache.get(a).as_deref(), Some("https://signed.example/a2"));
        assert!(cache.get(b).is_some());
    }
}
