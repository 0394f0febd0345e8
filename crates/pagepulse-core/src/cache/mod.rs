//! Caching layer for pagepulse-core
//!
//! Provides the in-process TTL cache used to memoize configuration reads
//! and SELECT results.

pub mod ttl_cache;

pub use ttl_cache::{CacheEntry, CacheStats, TtlCache, DEFAULT_TTL};
