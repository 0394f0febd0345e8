//! pagepulse-core - Core library for pagepulse
//!
//! Provides the page-view write buffer, the TTL cache, the SQLite event store
//! and the cached read helpers built on top of them.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod query;
pub mod settings;
pub mod sink;
pub mod store;

pub use buffer::{BufferConfig, BufferStats, EventBuffer, FlushOutcome};
pub use cache::TtlCache;
pub use config::PulseConfig;
pub use error::CoreError;
pub use models::ViewEvent;
pub use query::CachedQueries;
pub use settings::SiteSettings;
pub use sink::EventSink;
pub use store::{SqliteEventStore, StoreConfig};
