//! Bounded newest-first lists per scope

use crate::types::CacheEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// Most recent entries of one scope (a conversation, an event type)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecencyList {
    pub scope_key: String,
    pub entries: VecDeque<CacheEntry>,
    pub max_length: usize,
}

impl RecencyList {
    pub fn new(scope_key: &str, max_length: usize) -> Self {
        Self {
            scope_key: scope_key.to_string(),
            entries: VecDeque::new(),
            max_length,
        }
    }

    /// Prepend an entry, replacing any older entry with the same key, and
    /// return whatever fell off the end.
    pub fn push(&mut self, entry: CacheEntry) -> Vec<CacheEntry> {
        self.entries.retain(|e| e.key != entry.key);
        self.entries.push_front(entry);

        let mut dropped = Vec::new();
        while self.entries.len() > self.max_length {
            if let Some(oldest) = self.entries.pop_back() {
                dropped.push(oldest);
            }
        }
        dropped
    }

    pub fn list(&self, limit: usize) -> Vec<CacheEntry> {
        self.entries.iter().take(limit).cloned().collect()
    }

    pub fn find(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Keep only entries passing `keep`. Returns how many were removed.
    pub fn retain(&mut self, keep: impl Fn(&CacheEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| keep(e));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All recency lists of one domain
#[derive(Debug, Default)]
pub struct RecencyIndex {
    lists: Mutex<HashMap<String, RecencyList>>,
}

impl RecencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lists(&self) -> std::sync::MutexGuard<'_, HashMap<String, RecencyList>> {
        self.lists.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Prepend to a scope's list, truncating to `max_length`. The truncated
    /// entries are only removed from this list.
    pub fn push(&self, scope: &str, entry: CacheEntry, max_length: usize) -> Vec<CacheEntry> {
        let mut lists = self.lists();
        let list = lists
            .entry(scope.to_string())
            .or_insert_with(|| RecencyList::new(scope, max_length));
        list.max_length = max_length;
        list.push(entry)
    }

    /// Up to `limit` most recent entries, newest first
    pub fn list(&self, scope: &str, limit: usize) -> Vec<CacheEntry> {
        self.lists()
            .get(scope)
            .map(|list| list.list(limit))
            .unwrap_or_default()
    }

    pub fn find(&self, key: &str) -> Option<CacheEntry> {
        self.lists()
            .values()
            .find_map(|list| list.find(key).cloned())
    }

    /// Keep only entries passing `keep`, dropping lists left empty
    pub fn retain(&self, keep: impl Fn(&CacheEntry) -> bool) -> usize {
        let mut lists = self.lists();
        let removed = lists.values_mut().map(|list| list.retain(&keep)).sum();
        lists.retain(|_, list| !list.is_empty());
        removed
    }

    /// Drop entries whose TTL has run out at `now`
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        self.retain(|e| !e.is_expired(now))
    }

    pub fn remove_keys(&self, keys: &HashSet<String>) -> usize {
        if keys.is_empty() {
            return 0;
        }
        self.retain(|e| !keys.contains(&e.key))
    }

    /// If more than `ceiling` entries are held across all scopes, drop the
    /// oldest by `cachedAt` until `keep` remain
    pub fn trim_oldest(&self, ceiling: usize, keep: usize) -> usize {
        let mut lists = self.lists();
        let total: usize = lists.values().map(RecencyList::len).sum();
        if total <= ceiling {
            return 0;
        }

        let mut by_age: Vec<(DateTime<Utc>, String, String)> = lists
            .values()
            .flat_map(|list| {
                list.entries
                    .iter()
                    .map(move |e| (e.cached_at, list.scope_key.clone(), e.key.clone()))
            })
            .collect();
        by_age.sort();

        let excess = total.saturating_sub(keep);
        let mut doomed: HashMap<String, HashSet<String>> = HashMap::new();
        for (_, scope, key) in by_age.into_iter().take(excess) {
            doomed.entry(scope).or_default().insert(key);
        }
        for (scope, keys) in &doomed {
            if let Some(list) = lists.get_mut(scope) {
                list.retain(|e| !keys.contains(&e.key));
            }
        }
        lists.retain(|_, list| !list.is_empty());
        excess
    }

    /// Replace a scope's list wholesale, used when warming from the mirror
    pub fn restore(&self, list: RecencyList) {
        if list.is_empty() {
            return;
        }
        self.lists().insert(list.scope_key.clone(), list);
    }

    /// Sum of all list lengths
    pub fn total_len(&self) -> usize {
        self.lists().values().map(RecencyList::len).sum()
    }

    pub fn clear(&self) {
        self.lists().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventPayload, Payload};
    use chrono::Duration;

    fn event(i: usize) -> CacheEntry {
        let now = Utc::now() + Duration::milliseconds(i as i64);
        let payload = Payload::Event(EventPayload {
            id: format!("e{i}"),
            event_type: "presence".to_string(),
            chat_id: None,
            occurred_at: Some(now),
            data: serde_json::Value::Null,
        });
        CacheEntry::new(format!("e{i}"), payload, now, None)
    }

    fn expiring(i: usize, now: DateTime<Utc>, ttl_secs: u64) -> CacheEntry {
        let mut entry = event(i);
        entry.cached_at = now;
        CacheEntry {
            ttl_ms: Some(ttl_secs * 1000),
            ..entry
        }
    }

    #[test]
    fn test_push_truncates_and_returns_dropped() {
        let mut list = RecencyList::new("presence", 3);
        for i in 0..3 {
            assert!(list.push(event(i)).is_empty());
        }
        let dropped = list.push(event(3));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].key, "e0");

        let keys: Vec<String> = list.list(10).into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["e3", "e2", "e1"]);
    }

    #[test]
    fn test_push_same_key_moves_to_front() {
        let mut list = RecencyList::new("presence", 5);
        list.push(event(1));
        list.push(event(2));
        list.push(event(1));

        let keys: Vec<String> = list.list(10).into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["e1", "e2"]);
    }

    #[test]
    fn test_index_bound_holds_for_150_pushes() {
        let index = RecencyIndex::new();
        for i in 0..150 {
            index.push("presence", event(i), 100);
        }

        let all = index.list("presence", usize::MAX);
        assert_eq!(all.len(), 100);
        assert_eq!(all[0].key, "e149");
        assert_eq!(all[99].key, "e50");
    }

    #[test]
    fn test_list_limit_and_unknown_scope() {
        let index = RecencyIndex::new();
        for i in 0..5 {
            index.push("presence", event(i), 10);
        }
        assert_eq!(index.list("presence", 2).len(), 2);
        assert!(index.list("typing", 2).is_empty());
    }

    #[test]
    fn test_remove_keys_drops_empty_lists() {
        let index = RecencyIndex::new();
        index.push("a", event(1), 10);
        index.push("b", event(2), 10);

        let keys: HashSet<String> = ["e1".to_string()].into_iter().collect();
        assert_eq!(index.remove_keys(&keys), 1);
        assert!(index.list("a", 10).is_empty());
        assert_eq!(index.lists().len(), 1);
        assert_eq!(index.total_len(), 1);
        assert!(index.find("e2").is_some());
        assert!(index.find("e1").is_none());
    }

    #[test]
    fn test_prune_expired_shrinks_index() {
        let now = Utc::now();
        let index = RecencyIndex::new();
        index.push("presence", expiring(1, now, 10), 10);
        index.push("presence", expiring(2, now, 100), 10);
        index.push("typing", expiring(3, now, 10), 10);

        assert_eq!(index.prune_expired(now + Duration::seconds(10)), 2);
        assert_eq!(index.total_len(), 1);
        assert_eq!(index.lists().len(), 1);
        assert!(index.find("e2").is_some());
    }

    #[test]
    fn test_trim_oldest_across_scopes() {
        let index = RecencyIndex::new();
        for i in 0..6 {
            let scope = if i % 2 == 0 { "even" } else { "odd" };
            index.push(scope, event(i), 100);
        }

        assert_eq!(index.trim_oldest(10, 2), 0);
        assert_eq!(index.trim_oldest(4, 2), 4);
        assert_eq!(index.total_len(), 2);
        assert!(index.find("e5").is_some());
        assert!(index.find("e4").is_some());
        assert!(index.find("e3").is_none());
    }

    #[test]
    fn test_list_serializes_camel_case() {
        let mut list = RecencyList::new("chat-1", 2);
        list.push(event(1));
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json["scopeKey"], "chat-1");
        assert_eq!(json["maxLength"], 2);
        assert_eq!(json["entries"].as_array().unwrap().len(), 1);
    }
}
