//! In-memory entry store with per-entry TTL

use crate::clock::Clock;
use crate::config::DomainConfig;
use crate::types::{CacheEntry, Domain, Payload};
use chrono::{DateTime, Utc};
use moka::notification::RemovalCause;
use moka::sync::Cache;
use moka::Expiry;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A stored entry; everything but the access time is fixed at insert
struct Slot {
    entry: CacheEntry,
    expire_in: Option<Duration>,
    last_accessed_ms: AtomicI64,
}

impl Slot {
    fn touch(&self, now: DateTime<Utc>) {
        self.last_accessed_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheEntry {
        let mut entry = self.entry.clone();
        let ms = self.last_accessed_ms.load(Ordering::Relaxed);
        if let Some(at) = DateTime::<Utc>::from_timestamp_millis(ms) {
            entry.last_accessed_at = at;
        }
        entry
    }
}

/// Hands moka the remaining lifetime of each entry, on insert and overwrite
struct SlotExpiry;

impl Expiry<String, Arc<Slot>> for SlotExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<Slot>,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.expire_in
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<Slot>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.expire_in
    }
}

/// Key → entry map for one domain
pub struct EntryStore {
    domain: Domain,
    cache: Cache<String, Arc<Slot>>,
    default_ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
    evictions: Arc<AtomicU64>,
}

impl EntryStore {
    pub fn new(domain: Domain, config: &DomainConfig, clock: Arc<dyn Clock>) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let counter = evictions.clone();

        let cache = Cache::builder()
            .max_capacity(config.capacity)
            .expire_after(SlotExpiry)
            .eviction_listener(move |key: Arc<String>, _slot, cause: RemovalCause| {
                if cause.was_evicted() {
                    counter.fetch_add(1, Ordering::Relaxed);
                    debug!(domain = %domain, key = %key, ?cause, "Entry store eviction");
                }
            })
            .build();

        Self {
            domain,
            cache,
            default_ttl: config.ttl,
            clock,
            evictions,
        }
    }

    /// Store or overwrite a value, resetting its TTL
    pub fn set(&self, key: &str, value: Payload, ttl: Option<Duration>) -> CacheEntry {
        let ttl = ttl.or(self.default_ttl);
        let entry = CacheEntry::new(key.to_string(), value, self.clock.now(), ttl);
        self.insert(entry.clone());
        entry
    }

    /// Insert an existing entry, keeping its `cachedAt`. Returns false if it has
    /// already expired.
    pub fn insert(&self, entry: CacheEntry) -> bool {
        let now = self.clock.now();
        if entry.is_expired(now) {
            return false;
        }

        let expire_in = entry
            .expires_at()
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO));
        let slot = Slot {
            last_accessed_ms: AtomicI64::new(entry.last_accessed_at.timestamp_millis()),
            entry,
            expire_in,
        };
        self.cache.insert(slot.entry.key.clone(), Arc::new(slot));
        true
    }

    /// Look up a live entry and refresh its `lastAccessedAt`
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let slot = self.cache.get(key)?;
        let now = self.clock.now();

        if slot.entry.is_expired(now) {
            debug!(domain = %self.domain, key = %key, "Entry expired on read");
            self.cache.invalidate(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        slot.touch(now);
        Some(slot.snapshot())
    }

    /// Look up a live entry without touching access time or removing anything
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        let slot = self.cache.get(key)?;
        if slot.entry.is_expired(self.clock.now()) {
            return None;
        }
        Some(slot.snapshot())
    }

    /// Live keys, optionally restricted to a prefix
    pub fn keys(&self, prefix: Option<&str>) -> Vec<String> {
        let now = self.clock.now();
        self.cache
            .iter()
            .filter(|(key, slot)| {
                !slot.entry.is_expired(now) && prefix.map_or(true, |p| key.starts_with(p))
            })
            .map(|(key, _)| key.as_ref().clone())
            .collect()
    }

    /// Snapshot of every live entry
    pub fn entries(&self) -> Vec<CacheEntry> {
        let now = self.clock.now();
        self.cache
            .iter()
            .filter(|(_, slot)| !slot.entry.is_expired(now))
            .map(|(_, slot)| slot.snapshot())
            .collect()
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.cache
            .iter()
            .filter(|(_, slot)| !slot.entry.is_expired(now))
            .count()
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    /// Drop every entry whose `cachedAt + ttl <= now`. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| key.as_ref().clone())
            .collect();

        for key in &expired {
            self.cache.invalidate(key);
        }
        self.cache.run_pending_tasks();

        if !expired.is_empty() {
            self.evictions
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            debug!(domain = %self.domain, removed = expired.len(), "TTL sweep");
        }
        expired.len()
    }

    /// If more than `ceiling` entries are live, drop the oldest by `cachedAt`
    /// until `keep` remain. Returns the removed keys.
    pub fn trim_oldest(&self, ceiling: usize, keep: usize) -> Vec<String> {
        let mut entries = self.entries();
        if entries.len() <= ceiling {
            return Vec::new();
        }

        entries.sort_by_key(|e| e.cached_at);
        let excess = entries.len().saturating_sub(keep);
        let removed: Vec<String> = entries.into_iter().take(excess).map(|e| e.key).collect();
        for key in &removed {
            self.cache.invalidate(key);
        }
        self.cache.run_pending_tasks();

        self.evictions
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::ContactRecord;
    use chrono::Duration as ChronoDuration;
    use serde_json::Map;

    fn contact(id: &str) -> Payload {
        Payload::Contact(ContactRecord {
            id: id.to_string(),
            name: Some("Ana".to_string()),
            push_name: None,
            phone: None,
            extra: Map::new(),
        })
    }

    fn store_with_clock() -> (EntryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = DomainConfig::default();
        let store = EntryStore::new(Domain::Contact, &config, clock.clone());
        (store, clock)
    }

    #[test]
    fn test_set_and_get() {
        let (store, _) = store_with_clock();
        store.set("555@c.us", contact("555@c.us"), None);

        let entry = store.get("555@c.us").unwrap();
        assert_eq!(entry.key, "555@c.us");
        assert_eq!(entry.value, contact("555@c.us"));
    }

    #[test]
    fn test_miss_returns_none() {
        let (store, _) = store_with_clock();
        assert!(store.get("nobody@c.us").is_none());
    }

    #[test]
    fn test_get_refreshes_last_accessed() {
        let (store, clock) = store_with_clock();
        let saved = store.set("a", contact("a"), Some(Duration::from_secs(600)));

        clock.advance(ChronoDuration::seconds(30));
        let read = store.get("a").unwrap();
        assert_eq!(read.cached_at, saved.cached_at);
        assert!(read.last_accessed_at > saved.last_accessed_at);
    }

    #[test]
    fn test_expired_entry_not_returned() {
        let (store, clock) = store_with_clock();
        store.set("a", contact("a"), Some(Duration::from_secs(60)));

        clock.advance(ChronoDuration::seconds(61));
        assert!(store.get("a").is_none());
        assert_eq!(store.evictions(), 1);
    }

    #[test]
    fn test_overwrite_resets_ttl() {
        let (store, clock) = store_with_clock();
        store.set("a", contact("a"), Some(Duration::from_secs(60)));
        clock.advance(ChronoDuration::seconds(45));
        store.set("a", contact("a"), Some(Duration::from_secs(60)));
        clock.advance(ChronoDuration::seconds(45));

        assert!(store.get("a").is_some());
    }

    #[test]
    fn test_insert_rejects_expired_entry() {
        let (store, clock) = store_with_clock();
        let entry = CacheEntry::new(
            "a".to_string(),
            contact("a"),
            clock.now() - ChronoDuration::seconds(120),
            Some(Duration::from_secs(60)),
        );
        assert!(!store.insert(entry));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_keys_with_prefix() {
        let (store, _) = store_with_clock();
        store.set("team:1", contact("team:1"), None);
        store.set("team:2", contact("team:2"), None);
        store.set("other:1", contact("other:1"), None);

        let mut keys = store.keys(Some("team:"));
        keys.sort();
        assert_eq!(keys, vec!["team:1".to_string(), "team:2".to_string()]);
        assert_eq!(store.keys(None).len(), 3);
    }

    #[test]
    fn test_sweep_removes_expired() {
        let (store, clock) = store_with_clock();
        store.set("short", contact("short"), Some(Duration::from_secs(10)));
        store.set("long", contact("long"), Some(Duration::from_secs(1000)));

        clock.advance(ChronoDuration::seconds(11));
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.keys(None), vec!["long".to_string()]);
    }

    #[test]
    fn test_trim_oldest() {
        let (store, clock) = store_with_clock();
        for i in 0..8 {
            store.set(&format!("k{i}"), contact(&format!("k{i}")), None);
            clock.advance(ChronoDuration::seconds(1));
        }

        assert!(store.trim_oldest(10, 5).is_empty());
        let mut removed = store.trim_oldest(6, 3);
        removed.sort();
        assert_eq!(removed, vec!["k0", "k1", "k2", "k3", "k4"]);

        let mut keys = store.keys(None);
        keys.sort();
        assert_eq!(keys, vec!["k5".to_string(), "k6".to_string(), "k7".to_string()]);
    }

    #[test]
    fn test_peek_does_not_touch() {
        let (store, clock) = store_with_clock();
        let saved = store.set("a", contact("a"), None);
        clock.advance(ChronoDuration::seconds(30));

        let peeked = store.peek("a").unwrap();
        assert_eq!(peeked.last_accessed_at, saved.last_accessed_at);
    }
}
