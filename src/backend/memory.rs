use async_trait::async_trait;
use dashmap::DashMap;

use crate::blob::{Blob, Key};
use crate::error::BlobStoreResult;
use crate::store::{BlobStore, ListOptions};

/// A trivial in-process [`BlobStore`] backed by a [`DashMap`]. Not a
/// production terminal backend — it exists so the rest of the crate is
/// self-contained and testable without wiring an external service (§10.4).
#[derive(Default)]
pub struct MemoryBlobStore {
    entries: DashMap<Key, Blob>,
    // Insertion order is part of the observable contract for `list`, and
    // DashMap does not preserve it, so we track it separately.
    order: parking_lot::Mutex<Vec<Key>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &Key, _encrypted: bool) -> BlobStoreResult<Option<Blob>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn put(&self, key: &Key, value: Blob) -> BlobStoreResult<()> {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.lock().push(key.clone());
        }
        Ok(())
    }

    async fn delete(&self, key: &Key) -> BlobStoreResult<()> {
        if self.entries.remove(key).is_some() {
            self.order.lock().retain(|k| k != key);
        }
        Ok(())
    }

    async fn list(&self, options: ListOptions<'_>) -> BlobStoreResult<Vec<Key>> {
        let ordered = self.order.lock().clone();
        Ok(options.apply(ordered))
    }

    async fn url(&self, key: &Key) -> BlobStoreResult<Option<String>> {
        Ok(self.entries.get(key).map(|_| format!("mem://{key}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = MemoryBlobStore::new();
        let key = Key::new("file1");
        store.put(&key, Blob::new("content1", false)).await.unwrap();
        let got = store.get(&key, false).await.unwrap().unwrap();
        assert_eq!(got.data, "content1");
        assert!(!got.encrypted);
    }

    #[tokio::test]
    async fn delete_then_get_is_absent() {
        let store = MemoryBlobStore::new();
        let key = Key::new("file1");
        store.put(&key, Blob::new("content1", false)).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(store.get(&key, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_respects_insertion_order_and_early_stop() {
        let store = MemoryBlobStore::new();
        for key in ["a/1", "a/2", "a/3", "b/1"] {
            store.put(&Key::new(key), Blob::new("v", false)).await.unwrap();
        }
        let predicate = |k: &Key| k.starts_with("a/");
        let opts = ListOptions::new().with_prefix("").with_early_stop(&predicate);
        let listed = store.list(opts).await.unwrap();
        assert_eq!(listed, vec![Key::new("a/1"), Key::new("a/2"), Key::new("a/3")]);
    }
}
