//! The cache facade: entry store, recency index and durable mirror per domain

use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, DomainConfig};
use crate::error::{CacheError, Result};
use crate::mirror::{BlobStore, DurableMirror, FsBlobStore};
use crate::recency::RecencyIndex;
use crate::stats::{hit_rate, CacheStats, DomainCounters, DomainStats};
use crate::store::EntryStore;
use crate::types::{CacheEntry, Domain, Payload, SearchCriteria};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Every tier of one domain
pub(crate) struct DomainCache {
    pub(crate) config: DomainConfig,
    pub(crate) store: EntryStore,
    pub(crate) recency: RecencyIndex,
    pub(crate) mirror: Arc<DurableMirror>,
    pub(crate) counters: DomainCounters,
}

impl DomainCache {
    async fn open(
        domain: Domain,
        config: DomainConfig,
        store: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mirror = Arc::new(DurableMirror::open(domain, store));
        let doc = mirror.load().await;

        let now = clock.now();
        let recency = RecencyIndex::new();
        for (_, mut list) in doc.recency_by_scope {
            list.entries.retain(|e| !e.is_expired(now));
            list.max_length = config.recency_max_length;
            list.entries.truncate(config.recency_max_length);
            recency.restore(list);
        }

        debug!(
            domain = %domain,
            mirror_entries = doc.entries.len(),
            recency = recency.total_len(),
            "Domain warmed from mirror"
        );

        Self {
            store: EntryStore::new(domain, &config, clock),
            recency,
            mirror,
            counters: DomainCounters::default(),
            config,
        }
    }

    fn recency_scope<'a>(&self, entry: &'a CacheEntry) -> Option<(&'a str, usize)> {
        let max_length = self.config.recency_max_length;
        entry
            .value
            .scope()
            .filter(|_| max_length > 0)
            .map(|scope| (scope, max_length))
    }
}

pub(crate) struct Domains {
    message: DomainCache,
    event: DomainCache,
    contact: DomainCache,
    chat: DomainCache,
    group_metadata: DomainCache,
}

impl Domains {
    pub(crate) fn get(&self, domain: Domain) -> &DomainCache {
        match domain {
            Domain::Message => &self.message,
            Domain::Event => &self.event,
            Domain::Contact => &self.contact,
            Domain::Chat => &self.chat,
            Domain::GroupMetadata => &self.group_metadata,
        }
    }
}

/// Tiered cache for chat-platform data
pub struct ChatCache {
    pub(crate) config: CacheConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) domains: Domains,
    pub(crate) runtime: Handle,
    pub(crate) writes: AtomicU64,
    pub(crate) last_mirror_pass: Mutex<Option<DateTime<Utc>>>,
    pub(crate) mirror_pass_running: Arc<AtomicBool>,
}

impl ChatCache {
    /// Open the cache with file mirrors under `config.cache_dir`
    pub async fn open(config: CacheConfig) -> Result<Self> {
        let store = FsBlobStore::new(config.cache_dir.clone());
        store.init().await?;
        Ok(Self::with_store(config, Arc::new(store), Arc::new(SystemClock)).await)
    }

    /// Open the cache over any blob store and clock
    pub async fn with_store(
        config: CacheConfig,
        store: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let open = |domain: Domain| {
            DomainCache::open(
                domain,
                config.domain(domain).clone(),
                store.clone(),
                clock.clone(),
            )
        };

        let domains = Domains {
            message: open(Domain::Message).await,
            event: open(Domain::Event).await,
            contact: open(Domain::Contact).await,
            chat: open(Domain::Chat).await,
            group_metadata: open(Domain::GroupMetadata).await,
        };

        info!("Chat cache opened");

        Self {
            config,
            clock,
            domains,
            runtime: Handle::current(),
            writes: AtomicU64::new(0),
            last_mirror_pass: Mutex::new(None),
            mirror_pass_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Store a value with the domain's default TTL. Invalid input is logged
    /// and dropped; the mirror update happens in the background.
    pub fn save(&self, domain: Domain, key: &str, value: Payload) {
        self.save_entry(domain, key, value, None);
    }

    /// Like `save`, with an explicit TTL for this entry
    pub fn save_with_ttl(&self, domain: Domain, key: &str, value: Payload, ttl: Duration) {
        self.save_entry(domain, key, value, Some(ttl));
    }

    pub(crate) fn save_entry(
        &self,
        domain: Domain,
        key: &str,
        value: Payload,
        ttl: Option<Duration>,
    ) -> Option<CacheEntry> {
        if let Err(e) = validate(domain, key, &value) {
            warn!(domain = %domain, key = %key, error = %e, "Dropping invalid save");
            return None;
        }

        let dc = self.domains.get(domain);
        let entry = dc.store.set(key, value, ttl);
        let scope = dc.recency_scope(&entry);
        if let Some((scope, max_length)) = scope {
            dc.recency.push(scope, entry.clone(), max_length);
        }
        dc.mirror.schedule_merge(entry.clone(), scope);

        self.after_write();
        Some(entry)
    }

    /// Entry store, then recency index, then mirror. Hits from the slower
    /// tiers are promoted into the entry store.
    pub async fn get(&self, domain: Domain, key: &str) -> Option<CacheEntry> {
        let dc = self.domains.get(domain);

        if let Some(entry) = dc.store.get(key) {
            dc.counters.record_hit();
            debug!(domain = %domain, key = %key, "Cache hit");
            return Some(entry);
        }

        let now = self.clock.now();
        let promoted = match dc.recency.find(key).filter(|e| !e.is_expired(now)) {
            Some(entry) => Some(entry),
            None => dc.mirror.get(key).await.filter(|e| !e.is_expired(now)),
        };

        match promoted {
            Some(entry) => {
                dc.counters.record_hit();
                debug!(domain = %domain, key = %key, "Promoted from slower tier");
                dc.store.insert(entry.clone());
                Some(dc.store.get(key).unwrap_or(entry))
            }
            None => {
                dc.counters.record_miss();
                debug!(domain = %domain, key = %key, "Cache miss");
                None
            }
        }
    }

    /// Live keys of a domain's entry store
    pub fn keys(&self, domain: Domain, prefix: Option<&str>) -> Vec<String> {
        self.domains.get(domain).store.keys(prefix)
    }

    /// Every live entry in the entry store, newest first
    pub fn list(&self, domain: Domain) -> Vec<CacheEntry> {
        let mut entries = self.domains.get(domain).store.entries();
        entries.sort_by(|a, b| b.cached_at.cmp(&a.cached_at));
        entries
    }

    /// Up to `limit` most recent entries of one scope
    pub fn recent(&self, domain: Domain, scope: &str, limit: usize) -> Vec<CacheEntry> {
        let now = self.clock.now();
        self.domains
            .get(domain)
            .recency
            .list(scope, limit)
            .into_iter()
            .filter(|e| !e.is_expired(now))
            .collect()
    }

    /// Live entries from the entry store and the mirror matching `criteria`,
    /// newest first
    pub async fn search(&self, domain: Domain, criteria: &SearchCriteria) -> Vec<CacheEntry> {
        let dc = self.domains.get(domain);
        let now = self.clock.now();

        let mut seen = HashSet::new();
        let mut results: Vec<CacheEntry> = Vec::new();
        for entry in dc.store.entries() {
            seen.insert(entry.key.clone());
            if criteria.matches(&entry) {
                results.push(entry);
            }
        }

        match dc.mirror.read().await {
            Ok(Some(doc)) => {
                results.extend(
                    doc.entries
                        .values()
                        .filter(|e| {
                            !seen.contains(&e.key) && !e.is_expired(now) && criteria.matches(e)
                        })
                        .cloned(),
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(domain = %domain, error = %e, "Search skipped unreadable mirror");
            }
        }

        results.sort_by(|a, b| b.effective_time().cmp(&a.effective_time()));
        if let Some(limit) = criteria.limit {
            results.truncate(limit);
        }
        results
    }

    /// Snapshot of counters and sizes. Reads only; never creates or evicts.
    pub async fn stats(&self) -> CacheStats {
        let mut domains = BTreeMap::new();
        for domain in Domain::ALL {
            let dc = self.domains.get(domain);
            let hits = dc.counters.hits();
            let misses = dc.counters.misses();

            let (mirror_entries, mirror_recency_len) = match dc.mirror.read().await {
                Ok(Some(doc)) => (doc.entries.len(), doc.recency_len()),
                Ok(None) => (0, 0),
                Err(e) => {
                    debug!(domain = %domain, error = %e, "Mirror unreadable for stats");
                    (0, 0)
                }
            };

            domains.insert(
                domain,
                DomainStats {
                    hits,
                    misses,
                    hit_rate: hit_rate(hits, misses),
                    keys: dc.store.len(),
                    evictions: dc.store.evictions(),
                    recency_len: dc.recency.total_len(),
                    mirror_entries,
                    mirror_recency_len,
                },
            );
        }
        CacheStats::from_domains(domains)
    }

    /// Wait for every queued mirror write
    pub async fn flush_pending(&self) -> Result<()> {
        for domain in Domain::ALL {
            self.domains.get(domain).mirror.flush().await?;
        }
        Ok(())
    }

    /// Drop everything held for a domain, in memory and on disk
    pub async fn purge_domain(&self, domain: Domain) -> Result<()> {
        let dc = self.domains.get(domain);
        dc.store.clear();
        dc.recency.clear();
        if let Err(e) = dc.mirror.flush().await {
            warn!(domain = %domain, error = %e, "Queued mirror writes failed before purge");
        }
        dc.mirror.clear().await?;
        info!(domain = %domain, "Domain purged");
        Ok(())
    }
}

fn validate(domain: Domain, key: &str, value: &Payload) -> Result<()> {
    if key.trim().is_empty() {
        return Err(CacheError::InvalidKey("empty key".to_string()));
    }
    if value.domain() != domain {
        return Err(CacheError::InvalidKey(format!(
            "{} payload saved under {}",
            value.domain(),
            domain
        )));
    }
    if value.id().trim().is_empty() {
        return Err(CacheError::InvalidKey("payload has no id".to_string()));
    }
    if value.scope().is_some_and(|scope| scope.trim().is_empty()) {
        return Err(CacheError::InvalidKey("payload has an empty scope".to_string()));
    }
    Ok(())
}
