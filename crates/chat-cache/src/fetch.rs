//! Read-through lookups of group metadata with stale fallback

use crate::cache::ChatCache;
use crate::error::{CacheError, Result};
use crate::types::{CacheEntry, Domain, FetchOutcome, FetchSource, GroupMetadata, Payload};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use tracing::{debug, info, warn};

const GROUP_ID_SUFFIXES: [&str; 2] = ["@g.us", "@group"];

/// Whether `id` names a group conversation
pub fn is_group_id(id: &str) -> bool {
    GROUP_ID_SUFFIXES
        .iter()
        .any(|suffix| id.len() > suffix.len() && id.ends_with(suffix))
}

/// Summary of a `preload` run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadReport {
    pub requested: usize,
    pub skipped_fresh: usize,
    pub fetched: usize,
    pub served_stale: usize,
    pub failed: usize,
}

impl ChatCache {
    /// `now - cached_at < group_max_age`; copies from the future count as fresh
    fn is_fresh(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - cached_at).to_std() {
            Ok(age) => age < self.config.group_max_age,
            Err(_) => true,
        }
    }

    /// Cached group metadata from the entry store or the mirror. Mirror copies
    /// past their TTL are returned as stale candidates but not promoted.
    async fn cached_group_metadata(&self, group_id: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.get(Domain::GroupMetadata, group_id).await {
            return Some(entry);
        }
        self.domains
            .get(Domain::GroupMetadata)
            .mirror
            .get(group_id)
            .await
    }

    /// Cached group metadata if it is younger than `group_max_age`, otherwise
    /// a fresh copy from `fetch`. A failed fetch falls back to any cached copy.
    pub async fn get_or_fetch<F, Fut, E>(&self, group_id: &str, fetch: F) -> Result<FetchOutcome>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = std::result::Result<GroupMetadata, E>>,
        E: Display,
    {
        if !is_group_id(group_id) {
            return Err(CacheError::InvalidIdentifier(group_id.to_string()));
        }

        let cached = self
            .cached_group_metadata(group_id)
            .await
            .and_then(|entry| {
                entry
                    .value
                    .as_group_metadata()
                    .map(|metadata| (metadata.clone(), entry.cached_at))
            });

        let now = self.clock.now();
        if let Some((metadata, cached_at)) = &cached {
            if self.is_fresh(*cached_at, now) {
                debug!(group_id = %group_id, "Group metadata served from cache");
                return Ok(FetchOutcome {
                    metadata: metadata.clone(),
                    source: FetchSource::Cache,
                    cached_at: *cached_at,
                });
            }
        }

        let reason = match tokio::time::timeout(self.config.fetch_timeout, fetch(group_id.to_string())).await {
            Ok(Ok(mut metadata)) => {
                if metadata.id.is_empty() {
                    metadata.id = group_id.to_string();
                }
                metadata.fetched_from_client = true;
                if !metadata.participants.is_empty() {
                    metadata.participant_count = metadata.participants.len();
                }

                let cached_at = match self.save_entry(
                    Domain::GroupMetadata,
                    group_id,
                    Payload::GroupMetadata(metadata.clone()),
                    None,
                ) {
                    Some(entry) => entry.cached_at,
                    None => now,
                };

                info!(
                    group_id = %group_id,
                    participants = metadata.participant_count,
                    "Group metadata fetched"
                );
                return Ok(FetchOutcome {
                    metadata,
                    source: FetchSource::Client,
                    cached_at,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.config.fetch_timeout),
        };

        match cached {
            Some((mut metadata, cached_at)) => {
                warn!(
                    group_id = %group_id,
                    reason = %reason,
                    cached_at = %cached_at,
                    "Group metadata fetch failed, serving stale copy"
                );
                metadata.fetched_from_client = false;
                Ok(FetchOutcome {
                    metadata,
                    source: FetchSource::Stale,
                    cached_at,
                })
            }
            None => {
                warn!(group_id = %group_id, reason = %reason, "Group metadata not available");
                Err(CacheError::NotAvailable {
                    group_id: group_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// True when a copy younger than `group_max_age` exists in any tier.
    /// Touches nothing.
    pub async fn has_fresh_group_metadata(&self, group_id: &str) -> bool {
        if !is_group_id(group_id) {
            return false;
        }
        let now = self.clock.now();
        let dc = self.domains.get(Domain::GroupMetadata);

        if let Some(entry) = dc.store.peek(group_id) {
            if self.is_fresh(entry.cached_at, now) {
                return true;
            }
        }

        match dc.mirror.read().await {
            Ok(Some(doc)) => doc
                .entries
                .get(group_id)
                .is_some_and(|entry| self.is_fresh(entry.cached_at, now)),
            _ => false,
        }
    }

    /// Warm group metadata for many groups, skipping fresh ones and pausing
    /// `preload_delay` between client calls. Failures are counted, never
    /// propagated.
    pub async fn preload<I, S, F, Fut, E>(&self, group_ids: I, fetch: F) -> PreloadReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(String) -> Fut,
        Fut: Future<Output = std::result::Result<GroupMetadata, E>>,
        E: Display,
    {
        let mut report = PreloadReport::default();
        let mut called = false;

        for group_id in group_ids {
            let group_id = group_id.as_ref();
            report.requested += 1;

            if self.has_fresh_group_metadata(group_id).await {
                report.skipped_fresh += 1;
                continue;
            }

            if called && !self.config.preload_delay.is_zero() {
                tokio::time::sleep(self.config.preload_delay).await;
            }
            called = true;

            match self.get_or_fetch(group_id, &fetch).await {
                Ok(outcome) => match outcome.source {
                    FetchSource::Client => report.fetched += 1,
                    FetchSource::Stale => report.served_stale += 1,
                    FetchSource::Cache => report.skipped_fresh += 1,
                },
                Err(e) => {
                    warn!(group_id = %group_id, error = %e, "Preload failed for group");
                    report.failed += 1;
                }
            }
        }

        info!(
            requested = report.requested,
            fetched = report.fetched,
            skipped = report.skipped_fresh,
            stale = report.served_stale,
            failed = report.failed,
            "Group metadata preload finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::mirror::MemoryBlobStore;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn cache() -> (ChatCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let mut config = CacheConfig::default();
        config.preload_delay = std::time::Duration::ZERO;
        let cache = ChatCache::with_store(config, Arc::new(MemoryBlobStore::new()), clock.clone()).await;
        (cache, clock)
    }

    #[test]
    fn test_is_group_id() {
        assert!(is_group_id("123-456@g.us"));
        assert!(is_group_id("team@group"));
        assert!(!is_group_id("5511999@c.us"));
        assert!(!is_group_id("@g.us"));
        assert!(!is_group_id(""));
    }

    #[tokio::test]
    async fn test_invalid_identifier_never_fetches() {
        let (cache, _) = cache().await;
        let calls = AtomicUsize::new(0);
        let result = cache
            .get_or_fetch("5511999@c.us", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(GroupMetadata::default())
            })
            .await;

        assert!(matches!(result, Err(CacheError::InvalidIdentifier(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_annotates_and_writes_through() {
        let (cache, _) = cache().await;
        let outcome = cache
            .get_or_fetch("g1@g.us", |_| async {
                Ok::<_, String>(GroupMetadata {
                    participants: vec!["a@c.us".to_string(), "b@c.us".to_string()],
                    ..GroupMetadata::with_subject("Team")
                })
            })
            .await
            .unwrap();

        assert_eq!(outcome.source, FetchSource::Client);
        assert_eq!(outcome.metadata.id, "g1@g.us");
        assert!(outcome.metadata.fetched_from_client);
        assert_eq!(outcome.metadata.participant_count, 2);
        assert!(cache.has_fresh_group_metadata("g1@g.us").await);
    }

    #[tokio::test]
    async fn test_fresh_copy_skips_client() {
        let (cache, clock) = cache().await;
        cache
            .get_or_fetch("g1@g.us", |_| async { Ok::<_, String>(GroupMetadata::with_subject("Team")) })
            .await
            .unwrap();

        clock.advance(Duration::minutes(29));
        let calls = AtomicUsize::new(0);
        let outcome = cache
            .get_or_fetch("g1@g.us", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(GroupMetadata::with_subject("Other"))
            })
            .await
            .unwrap();

        assert_eq!(outcome.source, FetchSource::Cache);
        assert_eq!(outcome.metadata.subject.as_deref(), Some("Team"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_copy_served_when_client_fails() {
        let (cache, clock) = cache().await;
        cache
            .get_or_fetch("g1@g.us", |_| async { Ok::<_, String>(GroupMetadata::with_subject("Team")) })
            .await
            .unwrap();

        clock.advance(Duration::minutes(31));
        assert!(!cache.has_fresh_group_metadata("g1@g.us").await);

        let outcome = cache
            .get_or_fetch("g1@g.us", |_| async { Err::<GroupMetadata, _>("rate limited") })
            .await
            .unwrap();

        assert!(outcome.is_stale());
        assert_eq!(outcome.metadata.subject.as_deref(), Some("Team"));
        assert!(!outcome.metadata.fetched_from_client);
    }

    #[tokio::test]
    async fn test_not_available_without_any_copy() {
        let (cache, _) = cache().await;
        let result = cache
            .get_or_fetch("g1@g.us", |_| async { Err::<GroupMetadata, _>("offline") })
            .await;

        match result {
            Err(CacheError::NotAvailable { group_id, reason }) => {
                assert_eq!(group_id, "g1@g.us");
                assert_eq!(reason, "offline");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_counts_as_failure() {
        let clock = Arc::new(ManualClock::default());
        let mut config = CacheConfig::default();
        config.fetch_timeout = std::time::Duration::from_secs(1);
        let cache = ChatCache::with_store(config, Arc::new(MemoryBlobStore::new()), clock).await;

        let result = cache
            .get_or_fetch("g1@g.us", |_| async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok::<_, String>(GroupMetadata::default())
            })
            .await;

        assert!(matches!(result, Err(CacheError::NotAvailable { .. })));
    }

    #[tokio::test]
    async fn test_preload_settles_every_id() {
        let (cache, _) = cache().await;
        cache
            .get_or_fetch("fresh@g.us", |_| async { Ok::<_, String>(GroupMetadata::with_subject("Fresh")) })
            .await
            .unwrap();

        let calls = AtomicUsize::new(0);
        let report = cache
            .preload(
                ["fresh@g.us", "ok@g.us", "broken@g.us", "not-a-group"],
                |id| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if id.starts_with("broken") {
                            Err("boom".to_string())
                        } else {
                            Ok(GroupMetadata::with_subject("Loaded"))
                        }
                    }
                },
            )
            .await;

        assert_eq!(
            report,
            PreloadReport {
                requested: 4,
                skipped_fresh: 1,
                fetched: 1,
                served_stale: 0,
                failed: 2,
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
