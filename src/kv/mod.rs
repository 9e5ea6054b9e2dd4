//! The shared key-value store capability.
//!
//! Every piece of cross-worker coordination rides this surface: keyed
//! values with TTL, a recency-ordered index for listing, a membership
//! set for the kill-list, and `compare_and_swap` — the one primitive
//! with a cross-call atomicity guarantee, which `StatusStore::update`
//! is built on.

pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Store backend capability. All operations are single-key; only
/// `compare_and_swap` serializes against concurrent writers.
#[async_trait]
pub trait Kv: Send + Sync {
    /// Get a value by key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value, refreshing its TTL countdown.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically replace `key` with `new` only if it still holds `old`
    /// (`None` matches only an absent key). Returns false when another
    /// writer got there first. Values must be non-empty.
    async fn compare_and_swap(
        &self,
        key: &str,
        old: Option<&[u8]>,
        new: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Insert or re-score a member of a recency index.
    async fn index_put(
        &self,
        key: &str,
        member: &str,
        score: i64,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Remove a member from a recency index.
    async fn index_remove(&self, key: &str, member: &str) -> Result<()>;

    /// Members of a recency index, highest score first.
    async fn index_range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>>;

    /// Add a member to a set, refreshing the set's TTL.
    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set membership test.
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove a member from a set.
    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;
}
