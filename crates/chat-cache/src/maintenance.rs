//! Budget enforcement for the entry stores and the durable mirrors

use crate::cache::{ChatCache, DomainCache};
use crate::config::DomainConfig;
use crate::mirror::DurableMirror;
use crate::types::Domain;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// What one mirror pass removed from a domain's document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorReport {
    pub domain: Domain,
    pub removed_by_count: usize,
    pub removed_by_age: usize,
    pub pruned_references: usize,
    /// The document could not be read; nothing was written this cycle
    pub skipped: bool,
}

impl MirrorReport {
    fn skipped(domain: Domain) -> Self {
        Self {
            domain,
            removed_by_count: 0,
            removed_by_age: 0,
            pruned_references: 0,
            skipped: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    /// Entries trimmed from each entry store
    pub memory: Vec<(Domain, usize)>,
    pub mirror: Vec<MirrorReport>,
}

impl MaintenanceReport {
    pub fn memory_removed(&self, domain: Domain) -> usize {
        self.memory
            .iter()
            .find(|(d, _)| *d == domain)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub fn mirror(&self, domain: Domain) -> Option<&MirrorReport> {
        self.mirror.iter().find(|r| r.domain == domain)
    }
}

/// Count trim, then age trim, then drop recency references left dangling
async fn mirror_pass(mirror: &DurableMirror, config: &DomainConfig, now: DateTime<Utc>) -> MirrorReport {
    let domain = mirror.domain();
    let max_age = config
        .mirror_max_age
        .and_then(|age| chrono::Duration::from_std(age).ok());

    let result = mirror
        .modify(|doc| {
            let removed_by_count = doc.evict_oldest(config.mirror_max_entries, config.mirror_keep);
            let removed_by_age = max_age
                .map(|age| doc.evict_older_than(now - age))
                .unwrap_or(0);
            let pruned_references = doc.prune_dangling();
            (removed_by_count, removed_by_age, pruned_references)
        })
        .await;

    match result {
        Ok((removed_by_count, removed_by_age, pruned_references)) => {
            if removed_by_count + removed_by_age + pruned_references > 0 {
                info!(
                    domain = %domain,
                    removed_by_count,
                    removed_by_age,
                    pruned_references,
                    "Mirror trimmed"
                );
            }
            MirrorReport {
                domain,
                removed_by_count,
                removed_by_age,
                pruned_references,
                skipped: false,
            }
        }
        Err(e) => {
            warn!(domain = %domain, error = %e, "Mirror unreadable, skipping maintenance");
            MirrorReport::skipped(domain)
        }
    }
}

async fn mirror_passes(
    targets: Vec<(Arc<DurableMirror>, DomainConfig)>,
    now: DateTime<Utc>,
) -> Vec<MirrorReport> {
    let mut reports = Vec::with_capacity(targets.len());
    for (mirror, config) in targets {
        reports.push(mirror_pass(&mirror, &config, now).await);
    }
    reports
}

impl DomainCache {
    /// Drop expired entries from the entry store and the recency lists
    fn sweep(&self, domain: Domain, now: DateTime<Utc>) -> usize {
        let removed = self.store.sweep();
        let pruned = self.recency.prune_expired(now);
        if pruned > 0 {
            debug!(domain = %domain, pruned, "Expired recency entries dropped");
        }
        removed
    }

    /// Trim the entry store to its keep floor, then drop recency entries for
    /// the evicted keys and hold the recency lists to the same budget
    fn enforce_memory_budget(&self, domain: Domain) -> usize {
        let ceiling = self.config.memory_max_keys;
        let keep = self.config.memory_keep;

        let evicted: HashSet<String> = self.store.trim_oldest(ceiling, keep).into_iter().collect();
        let pruned = self.recency.remove_keys(&evicted) + self.recency.trim_oldest(ceiling, keep);

        if !evicted.is_empty() || pruned > 0 {
            info!(domain = %domain, removed = evicted.len(), pruned, "Entry store trimmed");
        }
        evicted.len()
    }
}

impl ChatCache {
    fn mirror_targets(&self) -> Vec<(Arc<DurableMirror>, DomainConfig)> {
        Domain::ALL
            .into_iter()
            .map(|domain| {
                let dc = self.domains.get(domain);
                (dc.mirror.clone(), dc.config.clone())
            })
            .collect()
    }

    fn mirror_pass_due(&self, now: DateTime<Utc>) -> bool {
        let last = *self
            .last_mirror_pass
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match last {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .map(|elapsed| elapsed >= self.config.maintenance.mirror_interval)
                .unwrap_or(false),
        }
    }

    fn mark_mirror_pass(&self, now: DateTime<Utc>) {
        *self
            .last_mirror_pass
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(now);
    }

    /// Trim every entry store that is over its key ceiling
    pub fn enforce_memory_budgets(&self) -> Vec<(Domain, usize)> {
        Domain::ALL
            .into_iter()
            .map(|domain| (domain, self.domains.get(domain).enforce_memory_budget(domain)))
            .collect()
    }

    /// Run the memory and mirror policies now, regardless of schedule
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let now = self.clock.now();
        let memory = self.enforce_memory_budgets();

        let mirror = mirror_passes(self.mirror_targets(), now).await;
        self.mark_mirror_pass(now);

        MaintenanceReport { memory, mirror }
    }

    /// Drop expired entries from every entry store and recency index
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        Domain::ALL
            .into_iter()
            .map(|domain| self.domains.get(domain).sweep(domain, now))
            .sum()
    }

    /// Called after each write. Every N-th write checks memory budgets and,
    /// when the interval has passed, starts a mirror pass in the background.
    pub(crate) fn after_write(&self) {
        let every = self.config.maintenance.check_every_writes.max(1);
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % every != 0 {
            return;
        }

        self.enforce_memory_budgets();

        let now = self.clock.now();
        if !self.mirror_pass_due(now) {
            return;
        }
        if self.mirror_pass_running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.mark_mirror_pass(now);

        debug!(writes, "Starting background mirror pass");
        let targets = self.mirror_targets();
        let running = self.mirror_pass_running.clone();
        self.runtime.spawn(async move {
            mirror_passes(targets, now).await;
            running.store(false, Ordering::SeqCst);
        });
    }

    /// Periodic TTL sweeps and maintenance. The task stops once the cache
    /// is dropped.
    pub fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        let period = Domain::ALL
            .into_iter()
            .map(|domain| self.config.domain(domain).sweep_interval)
            .min()
            .unwrap_or(Duration::from_secs(300))
            .max(Duration::from_secs(1));
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            let mut last_sweep = [None::<DateTime<Utc>>; 5];

            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    debug!("Cache dropped, scheduler exiting");
                    break;
                };

                let now = cache.clock.now();
                for (i, domain) in Domain::ALL.into_iter().enumerate() {
                    let every = cache.config.domain(domain).sweep_interval;
                    let due = last_sweep[i]
                        .map(|last| (now - last).to_std().map(|e| e >= every).unwrap_or(false))
                        .unwrap_or(true);
                    if due {
                        cache.domains.get(domain).sweep(domain, now);
                        last_sweep[i] = Some(now);
                    }
                }

                if cache.mirror_pass_due(now) {
                    if let Err(e) = cache.flush_pending().await {
                        error!("Failed to flush mirrors before maintenance: {}", e);
                    }
                    let report = cache.run_maintenance().await;
                    debug!(?report, "Scheduled maintenance finished");
                } else {
                    cache.enforce_memory_budgets();
                }
            }
        })
    }
}
