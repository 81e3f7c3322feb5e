//! In-process store, used when no storage path is configured.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{RoomStore, StoreError};

/// `HashMap`-backed [`RoomStore`]. Contents are lost with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        assert!(store.get("lobby").await.unwrap().is_none());

        store.put("lobby", b"{}".to_vec()).await.unwrap();
        assert_eq!(store.get("lobby").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(store.len().await, 1);

        store.delete("lobby").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_keys_sorted() {
        let store = MemoryStore::new();
        store.put("b", vec![]).await.unwrap();
        store.put("a", vec![]).await.unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
