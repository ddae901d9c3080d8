//! tilequota - durable disk quota accounting for tile caches.
//!
//! This library tracks how much storage each tile set of a tile cache is
//! using, keeps per-layer and global aggregates, records per-page usage
//! statistics, and answers "which page should be evicted next" under LRU
//! or LFU policies. All state lives in an embedded transactional store, so
//! the accounting survives crashes with committed updates only.
//!
//! # High-Level API
//!
//! ```ignore
//! use std::sync::Arc;
//! use tilequota::{DefaultCacheDirLocator, QuotaStore};
//!
//! let store = QuotaStore::open(&DefaultCacheDirLocator, Arc::new(calculator))?;
//!
//! let global = store.globally_used_quota()?;
//! println!("cache uses {}", global.to_nice_string());
//! ```

pub mod calculator;
pub mod config;
pub mod error;
pub mod page;
pub mod quota;
pub mod store;
pub mod tileset;

pub use calculator::{
    CacheDirLocator, DefaultCacheDirLocator, FixedCacheDirLocator, GridRect, TilePageCalculator,
};
pub use config::StoreConfig;
pub use error::StoreError;
pub use page::{PageStats, PageStatsPayload, TilePage};
pub use quota::Quota;
pub use store::{QuotaStore, UnitHandle};
pub use tileset::{TileSet, GLOBAL_QUOTA_ID};

/// Version of the tilequota library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
