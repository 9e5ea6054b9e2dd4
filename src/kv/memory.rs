//! In-memory store backend for tests and local development.
//!
//! One mutex guards all state, so `compare_and_swap` is trivially
//! atomic. Expiry is lazy: entries past their deadline are treated as
//! absent and dropped on the next touch.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::Result;
use crate::kv::Kv;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

struct IndexState {
    // member -> score
    members: HashMap<String, i64>,
    expires_at: Option<Instant>,
}

struct SetState {
    members: HashSet<String>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    indexes: HashMap<String, IndexState>,
    sets: HashMap<String, SetState>,
}

/// Mutex-guarded in-process backend.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

fn expired(expires_at: Option<Instant>) -> bool {
    expires_at.is_some_and(|at| at <= Instant::now())
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|d| Instant::now() + d)
}

impl Inner {
    fn live_value(&mut self, key: &str) -> Option<&Entry> {
        if self.values.get(key).is_some_and(|e| expired(e.expires_at)) {
            self.values.remove(key);
        }
        self.values.get(key)
    }

    fn live_index(&mut self, key: &str) -> Option<&mut IndexState> {
        if self.indexes.get(key).is_some_and(|s| expired(s.expires_at)) {
            self.indexes.remove(key);
        }
        self.indexes.get_mut(key)
    }

    fn live_set(&mut self, key: &str) -> Option<&mut SetState> {
        if self.sets.get(key).is_some_and(|s| expired(s.expires_at)) {
            self.sets.remove(key);
        }
        self.sets.get_mut(key)
    }

    fn index_entry(&mut self, key: &str) -> &mut IndexState {
        if self.indexes.get(key).is_some_and(|s| expired(s.expires_at)) {
            self.indexes.remove(key);
        }
        self.indexes
            .entry(key.to_string())
            .or_insert_with(|| IndexState {
                members: HashMap::new(),
                expires_at: None,
            })
    }

    fn set_entry(&mut self, key: &str) -> &mut SetState {
        if self.sets.get(key).is_some_and(|s| expired(s.expires_at)) {
            self.sets.remove(key);
        }
        self.sets.entry(key.to_string()).or_insert_with(|| SetState {
            members: HashSet::new(),
            expires_at: None,
        })
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.live_value(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.values.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let existed = inner.live_value(key).is_some();
        inner.values.remove(key);
        Ok(existed)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        old: Option<&[u8]>,
        new: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.live_value(key).map(|e| e.value.as_slice());
        if current != old {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            Entry {
                value: new.to_vec(),
                expires_at: deadline(ttl),
            },
        );
        Ok(true)
    }

    async fn index_put(
        &self,
        key: &str,
        member: &str,
        score: i64,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.index_entry(key);
        state.members.insert(member.to_string(), score);
        state.expires_at = deadline(ttl);
        Ok(())
    }

    async fn index_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.live_index(key) {
            state.members.remove(member);
        }
        Ok(())
    }

    async fn index_range(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(state) = inner.live_index(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(&String, &i64)> = state.members.iter().collect();
        // Highest score first; member as a stable tiebreak
        members.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        Ok(members
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.set_entry(key);
        state.members.insert(member.to_string());
        state.expires_at = deadline(ttl);
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .live_set(key)
            .is_some_and(|s| s.members.contains(member)))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.live_set(key) {
            state.members.remove(member);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_succeeds_only_against_current_value() {
        let kv = MemoryKv::new();
        kv.set("k", b"one".to_vec(), None).await.unwrap();

        assert!(
            kv.compare_and_swap("k", Some(b"one"), b"two", None)
                .await
                .unwrap()
        );
        assert!(
            !kv.compare_and_swap("k", Some(b"one"), b"three", None)
                .await
                .unwrap()
        );
        assert_eq!(kv.get("k").await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn cas_none_matches_only_absent_key() {
        let kv = MemoryKv::new();
        assert!(kv.compare_and_swap("k", None, b"v", None).await.unwrap());
        assert!(!kv.compare_and_swap("k", None, b"w", None).await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let kv = MemoryKv::new();
        kv.set("k", b"v".to_vec(), Some(Duration::from_nanos(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn index_range_is_most_recent_first() {
        let kv = MemoryKv::new();
        kv.index_put("idx", "a", 1, None).await.unwrap();
        kv.index_put("idx", "b", 3, None).await.unwrap();
        kv.index_put("idx", "c", 2, None).await.unwrap();

        let all = kv.index_range("idx", 0, 10).await.unwrap();
        assert_eq!(all, vec!["b", "c", "a"]);

        let page = kv.index_range("idx", 1, 1).await.unwrap();
        assert_eq!(page, vec!["c"]);
    }

    #[tokio::test]
    async fn index_put_rescores_existing_member() {
        let kv = MemoryKv::new();
        kv.index_put("idx", "a", 1, None).await.unwrap();
        kv.index_put("idx", "b", 2, None).await.unwrap();
        kv.index_put("idx", "a", 5, None).await.unwrap();

        let all = kv.index_range("idx", 0, 10).await.unwrap();
        assert_eq!(all, vec!["a", "b"]);
    }
}
