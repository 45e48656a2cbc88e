//! JSON-packed storage (§4.7): each container is a JSON object mapping
//! logical key to payload, bounded by entry count rather than byte size.

use std::collections::HashMap;

use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::blob::{Blob, Key};
use crate::error::{BlobStoreResult, StorageError};
use crate::packed::{join_root, new_container_key};
use crate::store::{BlobStore, ListOptions};

#[derive(Clone, Debug)]
pub struct JsonPackedConfig {
    pub max_entries_per_container: usize,
    pub root: String,
    pub master_key: Option<String>,
}

impl Default for JsonPackedConfig {
    fn default() -> Self {
        Self { max_entries_per_container: 256, root: String::new(), master_key: None }
    }
}

impl JsonPackedConfig {
    fn master_key(&self) -> Key {
        match &self.master_key {
            Some(explicit) => Key::new(explicit.clone()),
            None => Key::new(join_root(&self.root, "jm-master.json")),
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct MasterEntry {
    parent_path: String,
    path: String,
    encrypted: bool,
}

#[derive(Clone)]
struct EntryRef {
    container: Key,
    encrypted: bool,
}

#[derive(Clone, Copy, Default)]
struct ContainerMeta {
    count: usize,
    encrypted: bool,
}

#[derive(Default)]
struct State {
    loaded: bool,
    entries: IndexMap<Key, EntryRef>,
    // `IndexMap`, not `HashMap`: allocation picks the "first container with
    // room" (§4.7), which only means something if iteration order is stable.
    containers: IndexMap<Key, ContainerMeta>,
}

/// Packs logical blobs as values of a JSON object in a container, bounded
/// by `max_entries_per_container` (§4.7). Unlike [`crate::packed::append`],
/// an emptied container is deleted outright rather than retained (§3,
/// explicit design decision).
pub struct JsonPacked<S> {
    inner: S,
    config: JsonPackedConfig,
    state: Mutex<State>,
}

impl<S: BlobStore> JsonPacked<S> {
    pub fn new(inner: S, config: JsonPackedConfig) -> Self {
        Self { inner, config, state: Mutex::new(State::default()) }
    }

    async fn ensure_loaded(&self, state: &mut State) -> BlobStoreResult<()> {
        if state.loaded {
            return Ok(());
        }
        let master_key = self.config.master_key();
        match self.inner.get(&master_key, true).await? {
            None => {
                state.loaded = true;
                Ok(())
            }
            Some(blob) => {
                let parsed: Vec<MasterEntry> = serde_json::from_str(&blob.data).map_err(|_| StorageError::MasterCorrupt)?;
                let mut entries = IndexMap::new();
                let mut containers: IndexMap<Key, ContainerMeta> = IndexMap::new();
                for row in parsed {
                    let key = Key::new(row.path.clone());
                    if entries.contains_key(&key) {
                        return Err(StorageError::MasterCorrupt.into());
                    }
                    let container = Key::new(row.parent_path.clone());
                    let meta = containers.entry(container.clone()).or_insert(ContainerMeta { count: 0, encrypted: row.encrypted });
                    if meta.encrypted != row.encrypted {
                        return Err(StorageError::MasterCorrupt.into());
                    }
                    meta.count += 1;
                    entries.insert(key, EntryRef { container, encrypted: row.encrypted });
                }
                // A container present in the master always has at least one entry.
                if containers.values().any(|meta| meta.count == 0) {
                    return Err(StorageError::MasterCorrupt.into());
                }
                state.entries = entries;
                state.containers = containers;
                state.loaded = true;
                Ok(())
            }
        }
    }

    async fn save_master(&self, state: &State) -> BlobStoreResult<()> {
        let rows: Vec<MasterEntry> = state
            .entries
            .iter()
            .map(|(key, entry)| MasterEntry { parent_path: entry.container.as_str().to_string(), path: key.as_str().to_string(), encrypted: entry.encrypted })
            .collect();
        let json = serde_json::to_string(&rows).expect("master entries are always serializable");
        self.inner.put(&self.config.master_key(), Blob::new(json, true)).await
    }

    /// Parses a container body as a JSON object. A corrupt body is treated
    /// as empty rather than failing the call, to preserve forward progress
    /// when a single entry corrupts (§7) — the cost is that a write landing
    /// on a corrupt container discards its other entries, which is logged.
    async fn load_container(&self, container: &Key, encrypted: bool) -> BlobStoreResult<HashMap<String, String>> {
        match self.inner.get(container, encrypted).await? {
            None => Ok(HashMap::new()),
            Some(blob) => match serde_json::from_str(&blob.data) {
                Ok(obj) => Ok(obj),
                Err(_) => {
                    warn!("json-packed container is corrupt; treating as empty and repairing on next write");
                    Ok(HashMap::new())
                }
            },
        }
    }

    fn find_container_with_room(&self, state: &State, encrypted: bool) -> Option<Key> {
        let limit = self.config.max_entries_per_container;
        state.containers.iter().find(|(_, meta)| meta.encrypted == encrypted && meta.count < limit).map(|(key, _)| key.clone())
    }

    pub async fn get(&self, key: &Key, _encrypted: bool) -> BlobStoreResult<Option<Blob>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let Some(entry) = state.entries.get(key).cloned() else {
            return Ok(None);
        };
        let obj = self.load_container(&entry.container, entry.encrypted).await?;
        Ok(obj.get(key.as_str()).map(|value| Blob::new(value.clone(), entry.encrypted)))
    }

    pub async fn put(&self, key: &Key, value: Blob) -> BlobStoreResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let container = match state.entries.get(key).cloned() {
            Some(existing) => existing.container,
            None => match self.find_container_with_room(&state, value.encrypted) {
                Some(container) => container,
                None => {
                    let container = new_container_key(&self.config.root);
                    state.containers.insert(container.clone(), ContainerMeta { count: 0, encrypted: value.encrypted });
                    container
                }
            },
        };

        let mut obj = self.load_container(&container, value.encrypted).await?;
        obj.insert(key.as_str().to_string(), value.data.clone());
        let count = obj.len();
        let json = serde_json::to_string(&obj).expect("json object of strings is always serializable");
        self.inner.put(&container, Blob::new(json, value.encrypted)).await?;

        state.containers.insert(container.clone(), ContainerMeta { count, encrypted: value.encrypted });
        state.entries.insert(key.clone(), EntryRef { container, encrypted: value.encrypted });
        self.save_master(&state).await?;
        debug!("json-packed: wrote key");
        Ok(())
    }

    pub async fn delete(&self, key: &Key) -> BlobStoreResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let Some(entry) = state.entries.get(key).cloned() else {
            return Ok(());
        };

        let mut obj = self.load_container(&entry.container, entry.encrypted).await?;
        obj.remove(key.as_str());
        if obj.is_empty() {
            self.inner.delete(&entry.container).await?;
            state.containers.shift_remove(&entry.container);
        } else {
            let count = obj.len();
            let json = serde_json::to_string(&obj).expect("json object of strings is always serializable");
            self.inner.put(&entry.container, Blob::new(json, entry.encrypted)).await?;
            state.containers.entry(entry.container.clone()).and_modify(|m| m.count = count);
        }
        state.entries.shift_remove(key);
        self.save_master(&state).await?;
        debug!("json-packed: deleted key");
        Ok(())
    }

    pub async fn list(&self, options: ListOptions<'_>) -> BlobStoreResult<Vec<Key>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(options.apply(state.entries.keys().cloned()))
    }

    /// Returns the physical container blob's URL for a logical key — the
    /// one way to get at a URL for packed content, since `url(key)` itself
    /// is always `UrlUnavailable` for a shared container (§4.5).
    pub async fn container_url(&self, key: &Key) -> BlobStoreResult<Option<String>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let Some(entry) = state.entries.get(key).cloned() else {
            return Ok(None);
        };
        self.inner.url(&entry.container).await
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for JsonPacked<S> {
    async fn get(&self, key: &Key, encrypted: bool) -> BlobStoreResult<Option<Blob>> {
        JsonPacked::get(self, key, encrypted).await
    }

    async fn put(&self, key: &Key, value: Blob) -> BlobStoreResult<()> {
        JsonPacked::put(self, key, value).await
    }

    async fn delete(&self, key: &Key) -> BlobStoreResult<()> {
        JsonPacked::delete(self, key).await
    }

    async fn list(&self, options: ListOptions<'_>) -> BlobStoreResult<Vec<Key>> {
        JsonPacked::list(self, options).await
    }

    async fn url(&self, _key: &Key) -> BlobStoreResult<Option<String>> {
        Err(StorageError::UrlUnavailable.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBlobStore;

    fn store(max_entries: usize) -> JsonPacked<MemoryBlobStore> {
        JsonPacked::new(MemoryBlobStore::new(), JsonPackedConfig { max_entries_per_container: max_entries, root: String::new(), master_key: None })
    }

    #[tokio::test]
    async fn round_trips_and_deletes() {
        let packed = store(256);
        let key = Key::new("file1");
        packed.put(&key, Blob::new("content1", false)).await.unwrap();
        assert_eq!(packed.get(&key, false).await.unwrap().unwrap().data, "content1");
        packed.put(&key, Blob::new("content2", false)).await.unwrap();
        assert_eq!(packed.get(&key, false).await.unwrap().unwrap().data, "content2");
        packed.delete(&key).await.unwrap();
        assert!(packed.get(&key, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn container_count_matches_entries_and_empty_container_is_removed() {
        let packed = store(2);
        let a = Key::new("a");
        let b = Key::new("b");
        let c = Key::new("c");
        packed.put(&a, Blob::new("va", false)).await.unwrap();
        packed.put(&b, Blob::new("vb", false)).await.unwrap();
        // container is full (max 2), c must land in a fresh container
        packed.put(&c, Blob::new("vc", false)).await.unwrap();

        let state = packed.state.lock().await;
        assert_eq!(state.containers.len(), 2);
        for meta in state.containers.values() {
            assert!(meta.count >= 1 && meta.count <= 2);
        }
        drop(state);

        packed.delete(&a).await.unwrap();
        packed.delete(&b).await.unwrap();
        let state = packed.state.lock().await;
        // the first container is now empty and must have been dropped entirely
        assert_eq!(state.containers.len(), 1);
    }

    #[tokio::test]
    async fn container_url_resolves_the_physical_blob() {
        let packed = store(256);
        let key = Key::new("file1");
        packed.put(&key, Blob::new("content1", false)).await.unwrap();
        let url = packed.container_url(&key).await.unwrap();
        assert!(url.is_some());
        assert!(packed.url(&key).await.is_err());
    }

    #[tokio::test]
    async fn master_reloads_across_instances() {
        let backend = std::sync::Arc::new(MemoryBlobStore::new());
        {
            let packed = JsonPacked::new(backend.clone(), JsonPackedConfig::default());
            packed.put(&Key::new("file1"), Blob::new("content1", false)).await.unwrap();
        }
        let reloaded = JsonPacked::new(backend, JsonPackedConfig::default());
        assert_eq!(reloaded.get(&Key::new("file1"), false).await.unwrap().unwrap().data, "content1");
    }
}
