//! Trim planning shared by both stores
//!
//! Every trim starts with the same decision: a zero limit clears the store,
//! an aggregate already within the limit is a no-op, anything else evicts
//! least-recently-used entries until the aggregate fits.

use std::time::Duration;

/// First step of a cost, count, size or age trim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimPlan {
    /// Degenerate limit: remove everything
    ClearAll,
    /// Nothing to evict
    WithinLimit,
    /// Evict from the least-recently-used end
    Evict,
}

impl TrimPlan {
    /// Plan a trim of an additive aggregate (cost, count, size)
    #[must_use]
    pub const fn for_limit(total: u64, limit: u64) -> Self {
        if limit == 0 {
            Self::ClearAll
        } else if total <= limit {
            Self::WithinLimit
        } else {
            Self::Evict
        }
    }

    /// Plan an age trim given the age of the least-recently-used entry
    #[must_use]
    pub fn for_age(oldest: Option<Duration>, limit: Duration) -> Self {
        if limit.is_zero() {
            Self::ClearAll
        } else if oldest.is_some_and(|age| age > limit) {
            Self::Evict
        } else {
            Self::WithinLimit
        }
    }

    /// Plan against a signed limit as stored in the index
    ///
    /// Non-positive limits clear; `i64::MAX` means unlimited.
    #[must_use]
    pub fn for_signed_limit(total: i64, limit: i64) -> Self {
        if limit == i64::MAX {
            return Self::WithinLimit;
        }
        Self::for_limit(
            u64::try_from(total).unwrap_or(0),
            u64::try_from(limit).unwrap_or(0),
        )
    }
}
