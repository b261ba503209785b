//! In-memory object store

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::ObjectStore;
use crate::error::{BspError, Result};

/// Object store backed by a shared map; clones see the same objects
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_object(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| BspError::ObjectNotFound { key: key.into() })
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_listing_and_delete() {
        let store = MemoryObjectStore::new();
        for key in ["ck/1.finalized", "ck/1.h_0.metadata", "other/x"] {
            store.put_object(key, Bytes::from_static(b"v")).await.unwrap();
        }
        assert_eq!(store.list_objects("ck/").await.unwrap().len(), 2);
        assert_eq!(store.delete_prefix("ck/").await.unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert!(matches!(
            store.get_object("ck/1.finalized").await,
            Err(BspError::ObjectNotFound { .. })
        ));
    }
}
