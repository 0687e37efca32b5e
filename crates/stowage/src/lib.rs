//! Stowage - Two-tier object cache
//!
//! A bounded in-memory LRU tier in front of a durable on-disk tier:
//! - `MemoryCache`: cost, count and age limits over an O(1) recency list
//! - `DiskCache`: SQLite index with inline or file-backed values
//! - `TieredCache`: reads through memory to disk and promotes disk hits
//!
//! Configuration is loaded from TOML through `StowageConfig`.

pub mod tiered;

// Re-exports
pub use stowage_common::{
    DiskCacheConfig, Error, HashedKey, MemoryCacheConfig, ReleasePolicy, Result, StorageKey,
    StorageMode, StowageConfig, storage_key,
};
pub use stowage_disk::{DiskCache, ItemMeta, KvItem, KvStorage};
pub use stowage_memory::{CacheStats, MemoryCache, PressureSignal};
pub use tiered::TieredCache;
