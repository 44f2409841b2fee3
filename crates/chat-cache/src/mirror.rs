//! Durable JSON mirror, one document per domain
//!
//! Every domain owns one document `{ entries, recencyByScope, counters }`.
//! Writes from the hot path are queued to a per-domain writer task which
//! drains the queue and applies the batch as a single read-modify-write, so
//! merges for one domain never race each other.

use crate::error::{CacheError, Result};
use crate::recency::RecencyList;
use crate::types::{CacheEntry, Domain};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::fs;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

/// On-disk shape of a domain mirror
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorDocument {
    #[serde(default)]
    pub entries: BTreeMap<String, CacheEntry>,
    #[serde(default)]
    pub recency_by_scope: BTreeMap<String, RecencyList>,
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
}

impl MirrorDocument {
    /// Insert or overwrite an entry and record it in its scope's list.
    /// An existing entry with a later `cachedAt` wins.
    pub fn merge(&mut self, entry: CacheEntry, scope: Option<(&str, usize)>) {
        let newer_exists = self
            .entries
            .get(&entry.key)
            .is_some_and(|existing| existing.cached_at > entry.cached_at);
        if newer_exists {
            return;
        }

        if let Some((scope, max_length)) = scope {
            let list = self
                .recency_by_scope
                .entry(scope.to_string())
                .or_insert_with(|| RecencyList::new(scope, max_length));
            list.max_length = max_length;
            list.push(entry.clone());
            *self.counters.entry(scope.to_string()).or_insert(0) += 1;
        }

        self.entries.insert(entry.key.clone(), entry);
    }

    /// Remove recency references to keys missing from `entries`
    pub fn prune_dangling(&mut self) -> usize {
        let entries = &self.entries;
        let removed = self
            .recency_by_scope
            .values_mut()
            .map(|list| list.retain(|e| entries.contains_key(&e.key)))
            .sum();
        self.recency_by_scope.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn dangling_keys(&self) -> Vec<String> {
        self.recency_by_scope
            .values()
            .flat_map(|list| list.entries.iter())
            .filter(|e| !self.entries.contains_key(&e.key))
            .map(|e| e.key.clone())
            .collect()
    }

    /// If there are more than `ceiling` entries, drop the oldest by `cachedAt`
    /// until `keep` remain
    pub fn evict_oldest(&mut self, ceiling: usize, keep: usize) -> usize {
        if self.entries.len() <= ceiling {
            return 0;
        }

        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .entries
            .values()
            .map(|e| (e.cached_at, e.key.clone()))
            .collect();
        by_age.sort();

        let excess = self.entries.len().saturating_sub(keep);
        for (_, key) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        excess
    }

    /// Drop every entry cached before `cutoff`
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.cached_at >= cutoff);
        before - self.entries.len()
    }

    pub fn recency_len(&self) -> usize {
        self.recency_by_scope.values().map(RecencyList::len).sum()
    }
}

/// Whole-document blob storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// `Ok(None)` when the blob does not exist
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;
    async fn write(&self, name: &str, bytes: &[u8]) -> Result<()>;
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Blobs as files in one directory
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Ensure the directory exists
    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        info!(cache_dir = ?self.dir, "Mirror directory initialized");
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.dir.join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.dir.join(name)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Blobs held in memory
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reads served
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of completed writes
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.blobs.read().await.get(name).cloned())
    }

    async fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .await
            .insert(name.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.blobs.write().await.remove(name);
        Ok(())
    }
}

struct PendingMerge {
    entry: CacheEntry,
    scope: Option<(String, usize)>,
}

/// Acknowledges a flush; carries the reason if a write since the last
/// acknowledgement failed
type FlushAck = oneshot::Sender<std::result::Result<(), String>>;

enum MirrorOp {
    Merge(PendingMerge),
    Flush(FlushAck),
}

/// Last parsed document, and a counter bumped on every write through this
/// mirror so a slow read cannot install an outdated copy
#[derive(Default)]
struct Snapshot {
    generation: u64,
    doc: Option<Arc<MirrorDocument>>,
}

struct MirrorInner {
    domain: Domain,
    store: Arc<dyn BlobStore>,
    /// Held across every read-modify-write of the document
    lock: Mutex<()>,
    snapshot: StdRwLock<Snapshot>,
}

impl MirrorInner {
    fn name(&self) -> &'static str {
        self.domain.document_name()
    }

    fn remember(&self, doc: Option<Arc<MirrorDocument>>) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        snapshot.generation += 1;
        snapshot.doc = doc;
    }

    /// Always goes to the blob store
    async fn read_stored(&self) -> Result<Option<MirrorDocument>> {
        match self.store.read(self.name()).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The remembered document, or a fresh parse of the stored one
    async fn read_shared(&self) -> Result<Option<Arc<MirrorDocument>>> {
        let generation = {
            let snapshot = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
            if let Some(doc) = &snapshot.doc {
                return Ok(Some(doc.clone()));
            }
            snapshot.generation
        };

        let doc = self.read_stored().await?.map(Arc::new);
        if let Some(doc) = &doc {
            let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            if snapshot.generation == generation {
                snapshot.doc = Some(doc.clone());
            }
        }
        Ok(doc)
    }

    /// Missing or unreadable documents come back empty
    async fn read_lenient(&self) -> MirrorDocument {
        match self.read_stored().await {
            Ok(doc) => doc.unwrap_or_default(),
            Err(e) => {
                warn!(domain = %self.domain, error = %e, "Mirror document unreadable, using empty document");
                MirrorDocument::default()
            }
        }
    }

    async fn write(&self, doc: MirrorDocument) -> Result<()> {
        let bytes = serde_json::to_vec(&doc)?;
        match self.store.write(self.name(), &bytes).await {
            Ok(()) => {
                self.remember(Some(Arc::new(doc)));
                Ok(())
            }
            Err(e) => {
                self.remember(None);
                Err(e)
            }
        }
    }

    async fn apply(&self, merges: Vec<PendingMerge>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_lenient().await;
        let count = merges.len();
        for merge in merges {
            let scope = merge.scope.as_ref().map(|(s, len)| (s.as_str(), *len));
            doc.merge(merge.entry, scope);
        }
        let entries = doc.entries.len();
        self.write(doc).await?;
        debug!(domain = %self.domain, merged = count, entries, "Mirror updated");
        Ok(())
    }
}

async fn run_writer(inner: Arc<MirrorInner>, mut rx: mpsc::UnboundedReceiver<MirrorOp>) {
    let mut failure: Option<String> = None;

    while let Some(op) = rx.recv().await {
        let mut batch = vec![op];
        while let Ok(op) = rx.try_recv() {
            batch.push(op);
        }

        let mut merges = Vec::new();
        let mut waiters = Vec::new();
        for op in batch {
            match op {
                MirrorOp::Merge(merge) => merges.push(merge),
                MirrorOp::Flush(ack) => waiters.push(ack),
            }
        }

        if !merges.is_empty() {
            if let Err(e) = inner.apply(merges).await {
                warn!(domain = %inner.domain, error = %e, "Failed to write mirror document");
                failure = Some(e.to_string());
            }
        }

        if !waiters.is_empty() {
            let outcome = match failure.take() {
                Some(reason) => Err(reason),
                None => Ok(()),
            };
            for ack in waiters {
                let _ = ack.send(outcome.clone());
            }
        }
    }
    debug!(domain = %inner.domain, "Mirror writer stopped");
}

/// Durable copy of one domain's cache
pub struct DurableMirror {
    inner: Arc<MirrorInner>,
    tx: mpsc::UnboundedSender<MirrorOp>,
}

impl DurableMirror {
    /// Open the mirror and start its writer task. Must be called inside a
    /// tokio runtime.
    pub fn open(domain: Domain, store: Arc<dyn BlobStore>) -> Self {
        let inner = Arc::new(MirrorInner {
            domain,
            store,
            lock: Mutex::new(()),
            snapshot: StdRwLock::new(Snapshot::default()),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(inner.clone(), rx));
        Self { inner, tx }
    }

    pub fn domain(&self) -> Domain {
        self.inner.domain
    }

    /// Read the document. A missing document is created empty; a malformed
    /// one is logged and treated as empty.
    pub async fn load(&self) -> MirrorDocument {
        let _guard = self.inner.lock.lock().await;
        match self.inner.read_stored().await {
            Ok(Some(doc)) => {
                self.inner.remember(Some(Arc::new(doc.clone())));
                doc
            }
            Ok(None) => {
                if let Err(e) = self.inner.write(MirrorDocument::default()).await {
                    warn!(domain = %self.inner.domain, error = %e, "Failed to initialize mirror document");
                }
                MirrorDocument::default()
            }
            Err(e) => {
                warn!(domain = %self.inner.domain, error = %e, "Mirror document malformed, starting empty");
                MirrorDocument::default()
            }
        }
    }

    /// Shared view of the document without creating it. Errors on IO or
    /// parse failure. Served from memory once the document has been parsed
    /// or written through this mirror.
    pub async fn read(&self) -> Result<Option<Arc<MirrorDocument>>> {
        self.inner.read_shared().await
    }

    /// Look up one entry in the mirror
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        match self.inner.read_shared().await {
            Ok(doc) => doc.and_then(|doc| doc.entries.get(key).cloned()),
            Err(e) => {
                warn!(domain = %self.inner.domain, error = %e, "Mirror document unreadable");
                None
            }
        }
    }

    /// Queue a merge for the writer task; never blocks
    pub fn schedule_merge(&self, entry: CacheEntry, scope: Option<(&str, usize)>) {
        let op = MirrorOp::Merge(PendingMerge {
            entry,
            scope: scope.map(|(s, len)| (s.to_string(), len)),
        });
        if self.tx.send(op).is_err() {
            warn!(domain = %self.inner.domain, "Mirror writer stopped, dropping merge");
        }
    }

    /// Read-modify-write a single entry, waiting for the write
    pub async fn merge(&self, entry: CacheEntry, scope: Option<(&str, usize)>) -> Result<()> {
        self.inner
            .apply(vec![PendingMerge {
                entry,
                scope: scope.map(|(s, len)| (s.to_string(), len)),
            }])
            .await
    }

    /// Wait until every merge queued before this call has been processed.
    /// Fails if any queued write since the previous flush could not be stored.
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(MirrorOp::Flush(ack))
            .map_err(|_| CacheError::WriterClosed(self.inner.domain.to_string()))?;
        done.await
            .map_err(|_| CacheError::WriterClosed(self.inner.domain.to_string()))?
            .map_err(|reason| CacheError::MirrorWrite {
                domain: self.inner.domain.to_string(),
                reason,
            })
    }

    /// Apply `f` to the document under the domain lock and write it back if it
    /// changed. Fails without writing if the document cannot be read.
    pub async fn modify<R>(&self, f: impl FnOnce(&mut MirrorDocument) -> R) -> Result<R> {
        let _guard = self.inner.lock.lock().await;
        let original = self.inner.read_stored().await?.unwrap_or_default();
        let mut doc = original.clone();
        let result = f(&mut doc);
        if doc != original {
            self.inner.write(doc).await?;
        }
        Ok(result)
    }

    /// Replace the document with an empty one
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.inner.lock.lock().await;
        self.inner.write(MirrorDocument::default()).await
    }
}
