//! Tiered cache for chat-platform data
//!
//! Messages, events, contacts, chats and group metadata are kept in three
//! tiers per domain: a TTL-bounded in-memory entry store, bounded
//! newest-first recency lists per conversation or event type, and a durable
//! JSON mirror on disk that survives restarts. Group metadata lookups read
//! through to the protocol client and fall back to stale copies when the
//! client fails.

mod cache;
mod clock;
mod config;
mod error;
mod fetch;
mod maintenance;
mod mirror;
mod recency;
mod stats;
mod store;
mod types;

pub use cache::ChatCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, DomainConfig, MaintenanceConfig};
pub use error::{CacheError, Result};
pub use fetch::{is_group_id, PreloadReport};
pub use maintenance::{MaintenanceReport, MirrorReport};
pub use mirror::{BlobStore, DurableMirror, FsBlobStore, MemoryBlobStore, MirrorDocument};
pub use recency::{RecencyIndex, RecencyList};
pub use stats::{CacheStats, DomainStats};
pub use store::EntryStore;
pub use types::{
    CacheEntry, ChatRecord, ContactRecord, Domain, EventPayload, FetchOutcome, FetchSource,
    GroupMetadata, MessageEnvelope, Payload, SearchCriteria,
};
