//! Append-packed storage (§4.6): each container is the concatenation of its
//! entries' payloads; an entry is located by `(container, offset, length)`.

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
pub struct AppendPackedConfig {
    pub max_container_size: usize,
    pub root: String,
    pub master_key: Option<String>,
}

impl Default for AppendPackedConfig {
    fn default() -> Self {
        Self { max_container_size: 1 << 20, root: String::new(), master_key: None }
    }
}

impl AppendPackedConfig {
    fn master_key(&self) -> Key {
        match &self.master_key {
            Some(explicit) => Key::new(explicit.clone()),
            None => Key::new(join_root(&self.root, "ra-master.json")),
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct MasterEntry {
    parent_path: String,
    path: String,
    position: usize,
    length: usize,
    encrypted: bool,
}

#[derive(Clone)]
struct EntryRef {
    container: Key,
    offset: usize,
    length: usize,
    encrypted: bool,
}

#[derive(Clone, Copy, Default)]
struct ContainerMeta {
    size: usize,
    encrypted: bool,
}

#[derive(Default)]
struct State {
    loaded: bool,
    entries: IndexMap<Key, EntryRef>,
    // `IndexMap`, not `HashMap`: allocation picks the "first container with
    // room" (§4.6), which only means something if iteration order is stable.
    containers: IndexMap<Key, ContainerMeta>,
}

/// Packs arbitrary string blobs by offset/length into shared container
/// blobs bounded by `max_container_size` characters (§4.6). The master
/// index is reconstructed at load time from the persisted entries array:
/// since allocation never leaves gaps (A2), a container's size is simply
/// the sum of its entries' lengths (A3).
pub struct AppendPacked<S> {
    inner: S,
    config: AppendPackedConfig,
    state: Mutex<State>,
}

impl<S: BlobStore> AppendPacked<S> {
    pub fn new(inner: S, config: AppendPackedConfig) -> Self {
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
                    let meta = containers.entry(container.clone()).or_insert(ContainerMeta { size: 0, encrypted: row.encrypted });
                    if meta.encrypted != row.encrypted {
                        return Err(StorageError::MasterCorrupt.into());
                    }
                    meta.size += row.length;
                    entries.insert(key, EntryRef { container, offset: row.position, length: row.length, encrypted: row.encrypted });
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
            .map(|(key, entry)| MasterEntry {
                parent_path: entry.container.as_str().to_string(),
                path: key.as_str().to_string(),
                position: entry.offset,
                length: entry.length,
                encrypted: entry.encrypted,
            })
            .collect();
        let json = serde_json::to_string(&rows).expect("master entries are always serializable");
        self.inner.put(&self.config.master_key(), Blob::new(json, true)).await
    }

    fn find_container_with_room(&self, state: &State, encrypted: bool, needed: usize) -> Option<Key> {
        let limit = self.max_container_size_limit();
        state.containers.iter().find(|(_, meta)| meta.encrypted == encrypted && meta.size + needed <= limit).map(|(key, _)| key.clone())
    }

    fn max_container_size_limit(&self) -> usize {
        self.config.max_container_size
    }

    async fn load_body(&self, container: &Key, encrypted: bool) -> BlobStoreResult<String> {
        Ok(self.inner.get(container, encrypted).await?.map(|b| b.data).unwrap_or_default())
    }

    /// Removes the byte range `[offset, offset+length)` from `body` and
    /// shifts every other entry in the same container whose offset follows
    /// it down by `length` (§4.6 step 2-3).
    fn excise(state: &mut State, container: &Key, body: &str, offset: usize, length: usize) -> String {
        let mut excised = String::with_capacity(body.len() - length);
        excised.push_str(&body[..offset]);
        excised.push_str(&body[offset + length..]);
        for entry in state.entries.values_mut() {
            if entry.container == *container && entry.offset > offset {
                entry.offset -= length;
            }
        }
        excised
    }

    pub async fn get(&self, key: &Key, _encrypted: bool) -> BlobStoreResult<Option<Blob>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let Some(entry) = state.entries.get(key).cloned() else {
            return Ok(None);
        };
        let body = self.load_body(&entry.container, entry.encrypted).await?;
        if entry.offset + entry.length > body.len() {
            warn!("append-packed container shorter than indexed entry; treating key as absent");
            return Ok(None);
        }
        Ok(Some(Blob::new(body[entry.offset..entry.offset + entry.length].to_string(), entry.encrypted)))
    }

    pub async fn put(&self, key: &Key, value: Blob) -> BlobStoreResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let needed = value.data.len();

        if let Some(existing) = state.entries.get(key).cloned() {
            let body = self.load_body(&existing.container, existing.encrypted).await?;
            let excised = Self::excise(&mut state, &existing.container, &body, existing.offset, existing.length);
            let container_meta = state.containers.entry(existing.container.clone()).or_default();
            container_meta.size = excised.len();

            if excised.len() + needed <= self.max_container_size_limit() {
                let new_offset = excised.len();
                let mut combined = excised;
                combined.push_str(&value.data);
                self.inner.put(&existing.container, Blob::new(combined, value.encrypted)).await?;
                let meta = state.containers.get_mut(&existing.container).unwrap();
                meta.size = new_offset + needed;
                meta.encrypted = value.encrypted;
                state.entries.insert(
                    key.clone(),
                    EntryRef { container: existing.container.clone(), offset: new_offset, length: needed, encrypted: value.encrypted },
                );
            } else {
                self.inner.put(&existing.container, Blob::new(excised, existing.encrypted)).await?;
                state.entries.shift_remove(key);
                self.allocate_and_write(&mut state, key, value).await?;
            }
        } else {
            self.allocate_and_write(&mut state, key, value).await?;
        }

        self.save_master(&state).await?;
        debug!("append-packed: wrote key");
        Ok(())
    }

    async fn allocate_and_write(&self, state: &mut State, key: &Key, value: Blob) -> BlobStoreResult<()> {
        let needed = value.data.len();
        let container = match self.find_container_with_room(&*state, value.encrypted, needed) {
            Some(container) => container,
            None => {
                let container = new_container_key(&self.config.root);
                state.containers.insert(container.clone(), ContainerMeta { size: 0, encrypted: value.encrypted });
                container
            }
        };
        let existing_size = state.containers.get(&container).map(|m| m.size).unwrap_or(0);
        let mut body = if existing_size > 0 { self.load_body(&container, value.encrypted).await? } else { String::new() };
        let offset = body.len();
        body.push_str(&value.data);
        self.inner.put(&container, Blob::new(body, value.encrypted)).await?;
        state.containers.insert(container.clone(), ContainerMeta { size: offset + needed, encrypted: value.encrypted });
        state.entries.insert(key.clone(), EntryRef { container, offset, length: needed, encrypted: value.encrypted });
        Ok(())
    }

    pub async fn delete(&self, key: &Key) -> BlobStoreResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let Some(entry) = state.entries.get(key).cloned() else {
            return Ok(());
        };
        let body = self.load_body(&entry.container, entry.encrypted).await?;
        let excised = Self::excise(&mut state, &entry.container, &body, entry.offset, entry.length);
        self.inner.put(&entry.container, Blob::new(excised.clone(), entry.encrypted)).await?;
        // Empty containers are retained for reuse (explicit design decision, §3).
        state.containers.entry(entry.container.clone()).and_modify(|m| m.size = excised.len());
        state.entries.shift_remove(key);
        self.save_master(&state).await?;
        debug!("append-packed: deleted key");
        Ok(())
    }

    pub async fn list(&self, options: ListOptions<'_>) -> BlobStoreResult<Vec<Key>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(options.apply(state.entries.keys().cloned()))
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for AppendPacked<S> {
    async fn get(&self, key: &Key, encrypted: bool) -> BlobStoreResult<Option<Blob>> {
        AppendPacked::get(self, key, encrypted).await
    }

    async fn put(&self, key: &Key, value: Blob) -> BlobStoreResult<()> {
        AppendPacked::put(self, key, value).await
    }

    async fn delete(&self, key: &Key) -> BlobStoreResult<()> {
        AppendPacked::delete(self, key).await
    }

    async fn list(&self, options: ListOptions<'_>) -> BlobStoreResult<Vec<Key>> {
        AppendPacked::list(self, options).await
    }

    async fn url(&self, _key: &Key) -> BlobStoreResult<Option<String>> {
        Err(StorageError::UrlUnavailable.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBlobStore;

    fn store() -> AppendPacked<MemoryBlobStore> {
        AppendPacked::new(MemoryBlobStore::new(), AppendPackedConfig { max_container_size: 4096, root: String::new(), master_key: None })
    }

    #[tokio::test]
    async fn round_trip_update_and_delete() {
        let packed = store();
        let file1 = Key::new("file1");
        let file2 = Key::new("file2");

        packed.put(&file1, Blob::new("The quick brown fox", false)).await.unwrap();
        packed.put(&file2, Blob::new("Brown bear, brown bear.", false)).await.unwrap();
        packed.put(&file1, Blob::new("Cow jumps over the moon", false)).await.unwrap();

        assert_eq!(packed.get(&file2, false).await.unwrap().unwrap().data, "Brown bear, brown bear.");
        assert_eq!(packed.get(&file1, false).await.unwrap().unwrap().data, "Cow jumps over the moon");

        packed.delete(&file2).await.unwrap();
        assert!(packed.get(&file2, false).await.unwrap().is_none());
        assert_eq!(packed.get(&file1, false).await.unwrap().unwrap().data, "Cow jumps over the moon");
    }

    #[tokio::test]
    async fn entries_in_one_container_stay_disjoint() {
        let packed = store();
        for i in 0..5 {
            packed.put(&Key::new(format!("k{i}")), Blob::new(format!("payload-{i}"), false)).await.unwrap();
        }
        packed.put(&Key::new("k2"), Blob::new("updated-payload-2", false)).await.unwrap();

        let state = packed.state.lock().await;
        let mut by_container: HashMap<Key, Vec<(usize, usize)>> = HashMap::new();
        for entry in state.entries.values() {
            by_container.entry(entry.container.clone()).or_default().push((entry.offset, entry.length));
        }
        for ranges in by_container.values() {
            for (i, &(o1, l1)) in ranges.iter().enumerate() {
                for &(o2, l2) in ranges.iter().skip(i + 1) {
                    let disjoint = o1 + l1 <= o2 || o2 + l2 <= o1;
                    assert!(disjoint, "overlapping ranges in one container");
                }
            }
        }
    }

    #[tokio::test]
    async fn url_is_unavailable_for_packed_keys() {
        let packed = store();
        let key = Key::new("file1");
        packed.put(&key, Blob::new("content", false)).await.unwrap();
        assert!(packed.url(&key).await.is_err());
    }

    #[tokio::test]
    async fn master_reloads_across_instances() {
        let backend = std::sync::Arc::new(MemoryBlobStore::new());
        {
            let packed = AppendPacked::new(backend.clone(), AppendPackedConfig::default());
            packed.put(&Key::new("file1"), Blob::new("content1", false)).await.unwrap();
        }
        let reloaded = AppendPacked::new(backend, AppendPackedConfig::default());
        assert_eq!(reloaded.get(&Key::new("file1"), false).await.unwrap().unwrap().data, "content1");
    }
}
