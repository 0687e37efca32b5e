//! Stowage Common - Shared types and utilities
//!
//! This crate provides the pieces both cache tiers are built from:
//! - Error and configuration types
//! - The stable key hasher used to derive persisted keys and filenames
//! - Backoff primitives (lock-contention spin, reopen retry gate)
//! - Trim planning shared by the memory and disk stores
//! - Background workers (serial queue, fixed-delay periodic task)
//! - Wall clocks

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod trim;
pub mod worker;

// Re-exports
pub use backoff::{RetryGate, SpinBackoff};
pub use clock::{ManualClock, SystemClock, WallClock};
pub use config::{DiskCacheConfig, MemoryCacheConfig, ReleasePolicy, StorageMode, StowageConfig};
pub use error::{Error, Result};
pub use hash::{
    HashedKey, KeyRepr, StableHasher, StorageKey, filename_for_key, stable_hash, storage_key,
};
pub use trim::TrimPlan;
pub use worker::{Periodic, SerialQueue};
