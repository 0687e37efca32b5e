//! Stowage Disk - Durable on-disk key-value tier
//!
//! This crate implements the disk tier:
//! - An embedded SQLite index with inline values or per-value files
//! - Read-side healing of rows whose file went missing
//! - Size, count, age and threshold trims ordered by last access
//! - Whole-store removal through a trash directory purged in the background
//! - A thread-safe `DiskCache` with limits, auto-trim and async variants

pub mod cache;
pub mod error;
mod index;
pub mod item;
pub mod layout;
pub mod space;
pub mod storage;

// Re-exports
pub use cache::DiskCache;
pub use error::{KvError, KvResult};
pub use item::{ItemMeta, KvItem};
pub use storage::{KvStorage, TrimBudget};
pub use stowage_common::StorageMode;
