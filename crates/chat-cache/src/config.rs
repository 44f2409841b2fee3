//! Cache configuration with documented defaults

use crate::types::Domain;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Budgets and lifetimes for one domain
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Default entry TTL; `None` keeps entries until maintenance removes them
    pub ttl: Option<Duration>,
    /// How often the scheduler sweeps expired entries
    pub sweep_interval: Duration,
    /// Hard upper bound handed to the in-memory cache
    pub capacity: u64,
    /// Maximum length of each per-scope recency list
    pub recency_max_length: usize,
    /// Memory policy: trim once the entry store holds more than this many keys
    pub memory_max_keys: usize,
    /// Memory policy: keys left after a trim
    pub memory_keep: usize,
    /// Mirror policy: trim once the document holds more than this many entries
    pub mirror_max_entries: usize,
    /// Mirror policy: entries left after a count trim
    pub mirror_keep: usize,
    /// Mirror policy: drop entries older than this regardless of count
    pub mirror_max_age: Option<Duration>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            ttl: Some(Duration::from_secs(HOUR)),
            sweep_interval: Duration::from_secs(5 * MINUTE),
            capacity: 20_000,
            recency_max_length: 100,
            memory_max_keys: 10_000,
            memory_keep: 5_000,
            mirror_max_entries: 5_000,
            mirror_keep: 2_500,
            mirror_max_age: Some(Duration::from_secs(7 * DAY)),
        }
    }
}

impl DomainConfig {
    pub fn for_domain(domain: Domain) -> Self {
        let base = Self::default();
        match domain {
            Domain::Message => base,
            Domain::Event => Self {
                ttl: Some(Duration::from_secs(30 * MINUTE)),
                memory_max_keys: 5_000,
                memory_keep: 2_500,
                mirror_max_entries: 2_000,
                mirror_keep: 1_000,
                mirror_max_age: Some(Duration::from_secs(3 * DAY)),
                ..base
            },
            Domain::Contact => Self {
                ttl: Some(Duration::from_secs(DAY)),
                sweep_interval: Duration::from_secs(HOUR),
                capacity: 40_000,
                memory_max_keys: 20_000,
                memory_keep: 10_000,
                mirror_max_entries: 20_000,
                mirror_keep: 10_000,
                mirror_max_age: Some(Duration::from_secs(30 * DAY)),
                ..base
            },
            Domain::Chat => Self {
                ttl: Some(Duration::from_secs(6 * HOUR)),
                sweep_interval: Duration::from_secs(30 * MINUTE),
                mirror_max_age: Some(Duration::from_secs(30 * DAY)),
                ..base
            },
            // Stale group metadata stays usable, so it outlives the freshness window
            Domain::GroupMetadata => Self {
                ttl: Some(Duration::from_secs(DAY)),
                sweep_interval: Duration::from_secs(HOUR),
                capacity: 4_000,
                memory_max_keys: 2_000,
                memory_keep: 1_000,
                mirror_max_entries: 2_000,
                mirror_keep: 1_000,
                ..base
            },
        }
    }

    fn apply_overrides(&mut self, domain: Domain, lookup: &impl Fn(&str) -> Option<String>) {
        let prefix = format!("CACHE_{}", domain.as_str().to_ascii_uppercase());
        if let Some(secs) = parse::<u64>(lookup, &format!("{prefix}_TTL_SECS")) {
            self.ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(max) = parse::<usize>(lookup, &format!("{prefix}_MAX_KEYS")) {
            self.memory_max_keys = max;
            self.memory_keep = self.memory_keep.min(max / 2);
            self.capacity = self.capacity.max(max as u64);
        }
        if let Some(max) = parse::<usize>(lookup, &format!("{prefix}_MIRROR_MAX_ENTRIES")) {
            self.mirror_max_entries = max;
            self.mirror_keep = self.mirror_keep.min(max / 2);
        }
    }
}

/// When maintenance runs
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Check budgets on every N-th write
    pub check_every_writes: u64,
    /// Minimum time between two mirror passes
    pub mirror_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            check_every_writes: 100,
            mirror_interval: Duration::from_secs(DAY),
        }
    }
}

/// Configuration for a `ChatCache` instance
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding one mirror document per domain
    pub cache_dir: PathBuf,
    pub message: DomainConfig,
    pub event: DomainConfig,
    pub contact: DomainConfig,
    pub chat: DomainConfig,
    pub group_metadata: DomainConfig,
    /// Group metadata younger than this is served without calling the client
    pub group_max_age: Duration,
    /// Upper bound on a single external fetch
    pub fetch_timeout: Duration,
    /// Pause between fetches during `preload`
    pub preload_delay: Duration,
    pub maintenance: MaintenanceConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/chat"),
            message: DomainConfig::for_domain(Domain::Message),
            event: DomainConfig::for_domain(Domain::Event),
            contact: DomainConfig::for_domain(Domain::Contact),
            chat: DomainConfig::for_domain(Domain::Chat),
            group_metadata: DomainConfig::for_domain(Domain::GroupMetadata),
            group_max_age: Duration::from_secs(30 * MINUTE),
            fetch_timeout: Duration::from_secs(30),
            preload_delay: Duration::from_millis(500),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Defaults overridden by `CACHE_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse::<u64>(&lookup, "CACHE_GROUP_MAX_AGE_SECS") {
            config.group_max_age = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64>(&lookup, "CACHE_PRELOAD_DELAY_MS") {
            config.preload_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "CACHE_FETCH_TIMEOUT_SECS") {
            config.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(every) = parse::<u64>(&lookup, "CACHE_MAINTENANCE_EVERY") {
            config.maintenance.check_every_writes = every.max(1);
        }
        if let Some(secs) = parse::<u64>(&lookup, "CACHE_MIRROR_INTERVAL_SECS") {
            config.maintenance.mirror_interval = Duration::from_secs(secs);
        }

        for domain in Domain::ALL {
            config.domain_mut(domain).apply_overrides(domain, &lookup);
        }

        config
    }

    pub fn domain(&self, domain: Domain) -> &DomainConfig {
        match domain {
            Domain::Message => &self.message,
            Domain::Event => &self.event,
            Domain::Contact => &self.contact,
            Domain::Chat => &self.chat,
            Domain::GroupMetadata => &self.group_metadata,
        }
    }

    pub fn domain_mut(&mut self, domain: Domain) -> &mut DomainConfig {
        match domain {
            Domain::Message => &mut self.message,
            Domain::Event => &mut self.event,
            Domain::Contact => &mut self.contact,
            Domain::Chat => &mut self.chat,
            Domain::GroupMetadata => &mut self.group_metadata,
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|s| s.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.cache_dir, PathBuf::from("./cache/chat"));
        assert_eq!(config.group_max_age, Duration::from_secs(30 * 60));
        assert_eq!(config.maintenance.mirror_interval, Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.message.recency_max_length, 100);
        assert_eq!(config.event.ttl, Some(Duration::from_secs(30 * 60)));
    }

    #[test]
    fn test_group_metadata_outlives_freshness_window() {
        let config = CacheConfig::default();
        let ttl = config.group_metadata.ttl.unwrap();
        assert!(ttl > config.group_max_age);
    }

    #[test]
    fn test_keep_floors_below_ceilings() {
        let config = CacheConfig::default();
        for domain in Domain::ALL {
            let d = config.domain(domain);
            assert!(d.memory_keep < d.memory_max_keys, "{domain}");
            assert!(d.mirror_keep < d.mirror_max_entries, "{domain}");
        }
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CACHE_DIR", "/var/cache/bot"),
            ("CACHE_GROUP_MAX_AGE_SECS", "600"),
            ("CACHE_PRELOAD_DELAY_MS", "0"),
            ("CACHE_MESSAGE_TTL_SECS", "60"),
            ("CACHE_CONTACT_TTL_SECS", "0"),
            ("CACHE_EVENT_MAX_KEYS", "100"),
            ("CACHE_MAINTENANCE_EVERY", "0"),
        ]
        .into_iter()
        .collect();

        let config = CacheConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/bot"));
        assert_eq!(config.group_max_age, Duration::from_secs(600));
        assert_eq!(config.preload_delay, Duration::ZERO);
        assert_eq!(config.message.ttl, Some(Duration::from_secs(60)));
        assert_eq!(config.contact.ttl, None);
        assert_eq!(config.event.memory_max_keys, 100);
        assert_eq!(config.event.memory_keep, 50);
        assert_eq!(config.maintenance.check_every_writes, 1);
    }

    #[test]
    fn test_unparseable_env_falls_back() {
        let config = CacheConfig::from_lookup(|name| {
            (name == "CACHE_GROUP_MAX_AGE_SECS").then(|| "soon".to_string())
        });
        assert_eq!(config.group_max_age, Duration::from_secs(30 * 60));
    }
}
