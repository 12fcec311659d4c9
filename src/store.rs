//! External key/value storage contract and the in-process implementation.
//!
//! The core only needs string get/set/delete plus bounded-list append, trim
//! and range on the history keys. Anything that speaks this contract (a
//! Redis client, for instance) can be swapped in behind the trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    /// Append to the tail of the list at `key`, creating it if absent.
    async fn rpush(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Trim the list to the inclusive range; negative indices count from the
    /// tail, Redis-style (`ltrim(key, -50, -1)` keeps the last 50).
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    strings: HashMap<String, String>,
    lists: HashMap<String, Vec<String>>,
}

/// In-process store backed by a `RwLock`ed map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Resolve a Redis-style inclusive range against a list of `len` items into
/// a half-open `start..stop`; negative indices count from the tail.
fn resolve_range(len: usize, start: i64, stop: i64) -> (usize, usize) {
    let len = len as i64;
    let adjust = |i: i64| if i < 0 { len + i } else { i };
    let start = adjust(start).clamp(0, len) as usize;
    let stop = (adjust(stop) + 1).clamp(0, len) as usize;
    (start, stop)
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .strings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.strings.remove(key);
        inner.lists.remove(key);
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .lists
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(list) = inner.lists.get_mut(key) {
            let (start, stop) = resolve_range(list.len(), start, stop);
            if start >= stop {
                list.clear();
            } else {
                *list = list[start..stop].to_vec();
            }
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let (start, stop) = resolve_range(list.len(), start, stop);
        if start >= stop {
            return Ok(Vec::new());
        }
        Ok(list[start..stop].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strings_roundtrip_and_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ltrim_keeps_last_n() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store.rpush("list", &i.to_string()).await.unwrap();
        }
        store.ltrim("list", -3, -1).await.unwrap();
        let items = store.lrange("list", 0, -1).await.unwrap();
        assert_eq!(items, vec!["7", "8", "9"]);
    }

    #[tokio::test]
    async fn lrange_bounds_are_clamped() {
        let store = MemoryStore::new();
        store.rpush("list", "a").await.unwrap();
        store.rpush("list", "b").await.unwrap();
        assert_eq!(store.lrange("list", 0, 49).await.unwrap(), vec!["a", "b"]);
        assert!(store.lrange("list", 5, 9).await.unwrap().is_empty());
        assert!(store.lrange("missing", 0, -1).await.unwrap().is_empty());
    }
}
