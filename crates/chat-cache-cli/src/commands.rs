//! Operations behind each CLI subcommand

use crate::error::{CliError, Result};
use chat_cache::{
    BlobStore, CacheConfig, CacheEntry, CacheStats, ChatCache, Domain, DomainStats, DurableMirror,
    FsBlobStore, MaintenanceReport, SearchCriteria,
};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

/// Environment config with command-line overrides applied
pub fn build_config(cache_dir: Option<PathBuf>) -> CacheConfig {
    let mut config = CacheConfig::from_env();
    if let Some(dir) = cache_dir {
        config.cache_dir = dir;
    }
    config
}

/// Mirror sizes per domain. Reads only: missing documents count as empty
/// and nothing is created. Hit counters belong to a running process, so
/// they are zero here.
pub async fn stats(config: &CacheConfig) -> Result<CacheStats> {
    let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.cache_dir.clone()));

    let mut domains = BTreeMap::new();
    for domain in Domain::ALL {
        let mirror = DurableMirror::open(domain, store.clone());
        let (mirror_entries, mirror_recency_len) = match mirror.read().await {
            Ok(Some(doc)) => (doc.entries.len(), doc.recency_len()),
            Ok(None) => (0, 0),
            Err(e) => {
                warn!(domain = %domain, error = %e, "Mirror unreadable, reporting it as empty");
                (0, 0)
            }
        };
        domains.insert(
            domain,
            DomainStats {
                mirror_entries,
                mirror_recency_len,
                ..DomainStats::default()
            },
        );
    }
    Ok(CacheStats::from_domains(domains))
}

pub async fn maintain(config: CacheConfig) -> Result<MaintenanceReport> {
    let cache = ChatCache::open(config).await?;
    let report = cache.run_maintenance().await;
    cache.flush_pending().await?;
    Ok(report)
}

pub async fn purge(config: CacheConfig, domain: Domain) -> Result<()> {
    let cache = ChatCache::open(config).await?;
    cache.purge_domain(domain).await?;
    Ok(())
}

/// Entries of one mirror document, newest first. Reads only; a missing
/// document yields nothing.
pub async fn inspect(
    config: &CacheConfig,
    domain: Domain,
    key: Option<&str>,
    criteria: &SearchCriteria,
) -> Result<Vec<CacheEntry>> {
    let store = Arc::new(FsBlobStore::new(config.cache_dir.clone()));
    let mirror = DurableMirror::open(domain, store);

    let Some(doc) = mirror.read().await? else {
        return Ok(Vec::new());
    };

    let mut entries: Vec<CacheEntry> = doc
        .entries
        .values()
        .filter(|e| key.map_or(true, |k| e.key == k))
        .filter(|e| criteria.matches(e))
        .cloned()
        .collect();
    entries.sort_by(|a, b| b.effective_time().cmp(&a.effective_time()));
    if let Some(limit) = criteria.limit {
        entries.truncate(limit);
    }
    Ok(entries)
}

/// Sweep and maintain on schedule, logging stats every `stats_every` until
/// interrupted
pub async fn run(config: CacheConfig, stats_every: Duration) -> Result<()> {
    let cache = Arc::new(ChatCache::open(config).await?);
    let scheduler = cache.spawn_scheduler();
    info!(stats_every = ?stats_every, "Scheduler running, press Ctrl-C to stop");

    let mut ticker = interval(stats_every.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = cache.stats().await;
                info!(
                    hits = stats.hits,
                    misses = stats.misses,
                    hit_rate = stats.hit_rate,
                    keys = stats.keys,
                    mirror_entries = stats.mirror_entries,
                    "Cache statistics"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    info!("Shutting down");
    scheduler.abort();
    cache.flush_pending().await?;
    Ok(())
}

pub fn render_stats(stats: &CacheStats) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<16} {:>8} {:>8} {:>8} {:>8} {:>10} {:>10} {:>10}",
        "domain", "hits", "misses", "rate", "keys", "evictions", "mirrored", "recency"
    );
    for (domain, d) in &stats.domains {
        let _ = writeln!(
            out,
            "{:<16} {:>8} {:>8} {:>7.1}% {:>8} {:>10} {:>10} {:>10}",
            domain.as_str(),
            d.hits,
            d.misses,
            d.hit_rate * 100.0,
            d.keys,
            d.evictions,
            d.mirror_entries,
            d.mirror_recency_len
        );
    }
    let _ = writeln!(
        out,
        "{:<16} {:>8} {:>8} {:>7.1}% {:>8} {:>10} {:>10}",
        "total",
        stats.hits,
        stats.misses,
        stats.hit_rate * 100.0,
        stats.keys,
        "",
        stats.mirror_entries
    );
    out
}

pub fn render_maintenance(report: &MaintenanceReport) -> String {
    let mut out = String::new();
    for (domain, removed) in &report.memory {
        if *removed > 0 {
            let _ = writeln!(out, "{}: {} entries trimmed from memory", domain, removed);
        }
    }
    for r in &report.mirror {
        if r.skipped {
            let _ = writeln!(out, "{}: mirror unreadable, skipped", r.domain);
        } else {
            let _ = writeln!(
                out,
                "{}: {} removed by count, {} by age, {} recency references pruned",
                r.domain, r.removed_by_count, r.removed_by_age, r.pruned_references
            );
        }
    }
    out
}

pub fn render_entries(entries: &[CacheEntry]) -> Result<String> {
    let mut out = String::new();
    for entry in entries {
        let value = serde_json::to_string(&entry.value)?;
        writeln!(
            out,
            "{}  cached {}  {}",
            entry.key,
            entry.cached_at.to_rfc3339(),
            value
        )
        .map_err(|e| CliError::Output(e.to_string()))?;
    }
    Ok(out)
}
