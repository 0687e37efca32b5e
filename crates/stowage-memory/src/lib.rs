//! Stowage Memory - Bounded in-process LRU tier
//!
//! This crate implements the memory tier:
//! - O(1) insert, promote and evict over an arena-backed recency list
//! - Cost, count and age limits with periodic background trimming
//! - Configurable disposal of evicted values (inline, background, deferred)
//! - Pressure signals (memory warning, background transition)

pub mod cache;
mod lru;
mod release;

// Re-exports
pub use cache::{CacheStats, MemoryCache, PressureSignal};
pub use stowage_common::ReleasePolicy;
