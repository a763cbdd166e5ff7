//! Process-local TTL cache.
//!
//! Backs the workflow-version, queue and expression caches. Entries are never
//! authoritative: a miss or an expired entry sends the caller back to storage.
//! Callers that want negative caching store `Option`/`Result` values.

use std::borrow::Borrow;
use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct TtlCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            let ttl = self.ttl;
            self.entries
                .remove_if(key, |_, entry| entry.inserted_at.elapsed() >= ttl);
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key);
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_fresh_entry() {
        let cache: TtlCache<String, i32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_expired_entry_is_a_miss_and_removed() {
        let cache: TtlCache<String, i32> = TtlCache::new(Duration::ZERO);
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_negative_entries_are_cached() {
        let cache: TtlCache<u32, Option<&'static str>> = TtlCache::new(Duration::from_secs(60));
        cache.insert(7, None);
        assert_eq!(cache.get(&7), Some(None));
    }

    #[test]
    fn test_invalidate_and_purge() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.invalidate(&1);
        assert_eq!(cache.len(), 1);

        let stale: TtlCache<u32, u32> = TtlCache::new(Duration::ZERO);
        stale.insert(1, 1);
        stale.purge_expired();
        assert!(stale.is_empty());
    }
}
