//! Hit/miss counters and statistics snapshots

use crate::types::Domain;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live hit/miss counters for one domain
#[derive(Debug, Default)]
pub struct DomainCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DomainCounters {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// `hits / (hits + misses)`, or 0 when nothing was looked up
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Statistics about one domain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub keys: usize,
    pub evictions: u64,
    pub recency_len: usize,
    pub mirror_entries: usize,
    pub mirror_recency_len: usize,
}

/// Statistics about the whole cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub domains: BTreeMap<Domain, DomainStats>,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub keys: usize,
    pub mirror_entries: usize,
}

impl CacheStats {
    pub fn from_domains(domains: BTreeMap<Domain, DomainStats>) -> Self {
        let hits = domains.values().map(|d| d.hits).sum();
        let misses = domains.values().map(|d| d.misses).sum();
        Self {
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
            keys: domains.values().map(|d| d.keys).sum(),
            mirror_entries: domains.values().map(|d| d.mirror_entries).sum(),
            domains,
        }
    }

    pub fn domain(&self, domain: Domain) -> Option<&DomainStats> {
        self.domains.get(&domain)
    }
}
