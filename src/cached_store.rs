//! Write-through or write-deferred caching decorator (§4.3).
//!
//! [`CachedStore`] wraps any [`BlobStore`] and remembers, per key, enough
//! state to serve repeated reads without round-tripping to the backend and
//! to undo a pending mutation without ever having touched the backend
//! (`abort`). Whether a mutation reaches the backend immediately or waits
//! for an explicit [`CachedStore::flush`] is the `auto_flushing` knob in
//! [`CachedStoreConfig`] — [`crate::tx::TxStore`] always runs one of these
//! with `auto_flushing = false` so it can defer writes until commit.

use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, trace};
use parking_lot::RwLock;

use crate::blob::{Blob, Key};
use crate::error::BlobStoreResult;
use crate::store::{BlobStore, ListOptions};

/// Whether a key's content is known. `Unknown` is the state of a key that
/// was only ever seen via `list` (a "listed-but-unread" stub, §2) or that
/// has never been touched at all — both fall through to the backend on
/// `get`.
#[derive(Clone, Debug)]
enum Presence {
    Unknown,
    Present(Blob),
    Absent,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Modification {
    None,
    Updated,
    Deleted,
}

struct OriginalSnapshot {
    presence: Presence,
    encrypt: bool,
    /// Whether this key already had a cache entry before the mutation that
    /// triggered the snapshot. `false` means the entry was conjured purely
    /// to hold this mutation (never fetched, never listed) — on abort such
    /// an entry has no observable prior state and must be removed outright
    /// rather than reverted to `Presence::Unknown` (C2).
    existed_before: bool,
}

struct Entry {
    presence: Presence,
    modification: Modification,
    last_encrypt: bool,
    original: Option<OriginalSnapshot>,
}

impl Default for Entry {
    fn default() -> Self {
        Self { presence: Presence::Unknown, modification: Modification::None, last_encrypt: false, original: None }
    }
}

impl Entry {
    /// Snapshots the pre-mutation state exactly once; later mutations before
    /// a flush or abort reuse the first snapshot (C2).
    fn snapshot_if_needed(&mut self, existed_before: bool) {
        if self.original.is_none() {
            self.original = Some(OriginalSnapshot { presence: self.presence.clone(), encrypt: self.last_encrypt, existed_before });
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CachedStoreConfig {
    pub cache_file_urls: bool,
    pub auto_flushing: bool,
}

impl Default for CachedStoreConfig {
    fn default() -> Self {
        Self { cache_file_urls: true, auto_flushing: true }
    }
}

struct State {
    entries: HashMap<Key, Entry>,
    /// Keys in the order `list` should surface them: backend listing order,
    /// extended with any keys first touched via `put`.
    order: Vec<Key>,
    listed: bool,
    urls: HashMap<Key, Option<String>>,
}

pub struct CachedStore<S> {
    inner: S,
    config: CachedStoreConfig,
    state: RwLock<State>,
}

impl<S: BlobStore> CachedStore<S> {
    pub fn new(inner: S, config: CachedStoreConfig) -> Self {
        Self { inner, config, state: RwLock::new(State { entries: HashMap::new(), order: Vec::new(), listed: false, urls: HashMap::new() }) }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub async fn get(&self, key: &Key, encrypted: bool) -> BlobStoreResult<Option<Blob>> {
        {
            let state = self.state.read();
            if let Some(entry) = state.entries.get(key) {
                match &entry.presence {
                    Presence::Present(blob) => return Ok(Some(blob.clone())),
                    Presence::Absent => return Ok(None),
                    Presence::Unknown => {}
                }
            }
        }
        let fetched = self.inner.get(key, encrypted).await?;
        let mut state = self.state.write();
        let entry = state.entries.entry(key.clone()).or_default();
        entry.last_encrypt = encrypted;
        entry.presence = match &fetched {
            Some(blob) => Presence::Present(blob.clone()),
            None => Presence::Absent,
        };
        Ok(fetched)
    }

    pub async fn put(&self, key: &Key, value: Blob) -> BlobStoreResult<()> {
        {
            let mut state = self.state.write();
            let existed_before = state.entries.contains_key(key);
            if !existed_before {
                state.order.push(key.clone());
            }
            let entry = state.entries.entry(key.clone()).or_default();
            entry.snapshot_if_needed(existed_before);
            entry.last_encrypt = value.encrypted;
            entry.presence = Presence::Present(value);
            entry.modification = Modification::Updated;
        }
        if self.config.auto_flushing {
            self.flush(Some(key)).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, key: &Key) -> BlobStoreResult<()> {
        {
            let mut state = self.state.write();
            let existed_before = state.entries.contains_key(key);
            if !existed_before {
                state.order.push(key.clone());
            }
            let entry = state.entries.entry(key.clone()).or_default();
            entry.snapshot_if_needed(existed_before);
            entry.presence = Presence::Absent;
            entry.modification = Modification::Deleted;
        }
        if self.config.auto_flushing {
            self.flush(Some(key)).await?;
        }
        Ok(())
    }

    pub async fn list(&self, options: ListOptions<'_>) -> BlobStoreResult<Vec<Key>> {
        self.ensure_listed().await?;
        let state = self.state.read();
        let visible = state.order.iter().filter(|key| match state.entries.get(*key) {
            Some(entry) => !matches!(entry.presence, Presence::Absent),
            None => true,
        });
        Ok(options.apply(visible.cloned()))
    }

    async fn ensure_listed(&self) -> BlobStoreResult<()> {
        if self.state.read().listed {
            return Ok(());
        }
        let backend_keys = self.inner.list(ListOptions::new()).await?;
        let mut state = self.state.write();
        if state.listed {
            return Ok(());
        }
        for key in backend_keys {
            let known_deleted = state.entries.get(&key).is_some_and(|e| matches!(e.presence, Presence::Absent));
            if known_deleted || state.entries.contains_key(&key) {
                continue;
            }
            state.entries.insert(key.clone(), Entry::default());
            state.order.push(key);
        }
        state.listed = true;
        trace!("populated listing cache with {} stub entries", state.order.len());
        Ok(())
    }

    pub async fn url(&self, key: &Key) -> BlobStoreResult<Option<String>> {
        if self.config.cache_file_urls {
            if let Some(cached) = self.state.read().urls.get(key) {
                return Ok(cached.clone());
            }
        }
        let url = self.inner.url(key).await?;
        if self.config.cache_file_urls {
            self.state.write().urls.insert(key.clone(), url.clone());
        }
        Ok(url)
    }

    /// Applies the recorded modification for `key` (or every outstanding
    /// modification when `key` is `None`) to the backend, clearing the
    /// modification and its original snapshot on success.
    pub async fn flush(&self, key: Option<&Key>) -> BlobStoreResult<()> {
        let targets: Vec<Key> = match key {
            Some(k) => vec![k.clone()],
            None => {
                let state = self.state.read();
                state.entries.iter().filter(|(_, e)| e.modification != Modification::None).map(|(k, _)| k.clone()).collect()
            }
        };
        for target in targets {
            let action = {
                let state = self.state.read();
                state.entries.get(&target).map(|e| (e.modification, e.presence.clone()))
            };
            match action {
                Some((Modification::Updated, Presence::Present(blob))) => {
                    self.inner.put(&target, blob).await?;
                    debug!("flushed update for key");
                }
                Some((Modification::Deleted, _)) => {
                    self.inner.delete(&target).await?;
                    debug!("flushed delete for key");
                }
                _ => continue,
            }
            let mut state = self.state.write();
            if let Some(entry) = state.entries.get_mut(&target) {
                entry.modification = Modification::None;
                entry.original = None;
            }
        }
        Ok(())
    }

    /// Restores `key` (or every key with an outstanding modification) to its
    /// pre-mutation state without touching the backend (P3).
    pub async fn abort(&self, key: Option<&Key>) -> BlobStoreResult<()> {
        let mut state = self.state.write();
        let targets: Vec<Key> = match key {
            Some(k) => vec![k.clone()],
            None => state.entries.iter().filter(|(_, e)| e.modification != Modification::None).map(|(k, _)| k.clone()).collect(),
        };
        for target in targets {
            let existed_before = state.entries.get(&target).and_then(|e| e.original.as_ref()).is_none_or(|o| o.existed_before);
            if !existed_before {
                state.entries.remove(&target);
                state.order.retain(|k| k != &target);
                continue;
            }
            if let Some(entry) = state.entries.get_mut(&target) {
                if let Some(original) = entry.original.take() {
                    entry.presence = original.presence;
                    entry.last_encrypt = original.encrypt;
                }
                entry.modification = Modification::None;
            }
        }
        Ok(())
    }

    /// Forgets cached state for `key` (or everything). Always invalidates
    /// the full-listing flag, even when clearing a single key, per §4.3.
    pub fn clear(&self, key: Option<&Key>) {
        let mut state = self.state.write();
        match key {
            Some(k) => {
                state.entries.remove(k);
                state.order.retain(|o| o != k);
                state.urls.remove(k);
            }
            None => {
                state.entries.clear();
                state.order.clear();
                state.urls.clear();
            }
        }
        state.listed = false;
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for CachedStore<S> {
    async fn get(&self, key: &Key, encrypted: bool) -> BlobStoreResult<Option<Blob>> {
        CachedStore::get(self, key, encrypted).await
    }

    async fn put(&self, key: &Key, value: Blob) -> BlobStoreResult<()> {
        CachedStore::put(self, key, value).await
    }

    async fn delete(&self, key: &Key) -> BlobStoreResult<()> {
        CachedStore::delete(self, key).await
    }

    async fn list(&self, options: ListOptions<'_>) -> BlobStoreResult<Vec<Key>> {
        CachedStore::list(self, options).await
    }

    async fn url(&self, key: &Key) -> BlobStoreResult<Option<String>> {
        CachedStore::url(self, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBlobStore;

    fn deferred(inner: MemoryBlobStore) -> CachedStore<MemoryBlobStore> {
        CachedStore::new(inner, CachedStoreConfig { cache_file_urls: true, auto_flushing: false })
    }

    #[tokio::test]
    async fn get_put_get_round_trips_before_flush() {
        let cache = deferred(MemoryBlobStore::new());
        let key = Key::new("file1");
        assert!(cache.get(&key, false).await.unwrap().is_none());
        cache.put(&key, Blob::new("v1", false)).await.unwrap();
        assert_eq!(cache.get(&key, false).await.unwrap().unwrap().data, "v1");
    }

    #[tokio::test]
    async fn abort_of_never_before_seen_key_leaves_no_phantom_entry() {
        let cache = deferred(MemoryBlobStore::new());
        let key = Key::new("brand-new");
        cache.put(&key, Blob::new("v1", false)).await.unwrap();
        cache.abort(Some(&key)).await.unwrap();

        assert!(cache.get(&key, false).await.unwrap().is_none());
        assert!(!cache.list(ListOptions::new()).await.unwrap().contains(&key));
    }

    #[tokio::test]
    async fn abort_of_previously_listed_key_keeps_its_stub() {
        let backend = MemoryBlobStore::new();
        let key = Key::new("file1");
        backend.put(&key, Blob::new("content1", false)).await.unwrap();
        let cache = deferred(backend);
        let _ = cache.list(ListOptions::new()).await.unwrap();
        cache.delete(&key).await.unwrap();
        cache.abort(Some(&key)).await.unwrap();

        assert!(cache.list(ListOptions::new()).await.unwrap().contains(&key));
        assert_eq!(cache.get(&key, false).await.unwrap().unwrap().data, "content1");
    }

    #[tokio::test]
    async fn abort_restores_pre_mutation_value() {
        let backend = MemoryBlobStore::new();
        backend.put(&Key::new("file1"), Blob::new("content1", false)).await.unwrap();
        let cache = deferred(backend);
        let key = Key::new("file1");
        assert_eq!(cache.get(&key, false).await.unwrap().unwrap().data, "content1");
        cache.put(&key, Blob::new("content2", false)).await.unwrap();
        cache.abort(Some(&key)).await.unwrap();
        assert_eq!(cache.get(&key, false).await.unwrap().unwrap().data, "content1");
    }

    #[tokio::test]
    async fn deferred_flush_applies_exactly_once_per_key() {
        // 6 puts, 2 deletes, 12 gets, 1 list over two keys; before flush
        // nothing reaches the backend, after flush file1 is deleted and
        // file2 carries its last value.
        let backend = MemoryBlobStore::new();
        let cache = deferred(backend);
        let file1 = Key::new("file1");
        let file2 = Key::new("file2");

        for i in 0..3 {
            cache.put(&file1, Blob::new(format!("f1-{i}"), false)).await.unwrap();
            cache.put(&file2, Blob::new(format!("f2-{i}"), false)).await.unwrap();
        }
        for _ in 0..12 {
            cache.get(&file1, false).await.unwrap();
        }
        let _ = cache.list(ListOptions::new()).await.unwrap();
        cache.delete(&file1).await.unwrap();
        cache.delete(&file2).await.unwrap();
        cache.put(&file2, Blob::new("f2-final", false)).await.unwrap();

        assert_eq!(cache.inner.get(&file1, false).await.unwrap(), None);
        assert_eq!(cache.inner.get(&file2, false).await.unwrap(), None);

        cache.flush(None).await.unwrap();

        assert!(cache.inner.get(&file1, false).await.unwrap().is_none());
        assert_eq!(cache.inner.get(&file2, false).await.unwrap().unwrap().data, "f2-final");
    }

    #[tokio::test]
    async fn list_respects_early_stop_over_cached_stubs() {
        let backend = MemoryBlobStore::new();
        for key in ["a/1", "a/2", "a/3", "b/1"] {
            backend.put(&Key::new(key), Blob::new("v", false)).await.unwrap();
        }
        let cache = deferred(backend);
        let predicate = |k: &Key| k.starts_with("a/");
        let opts = ListOptions::new().with_early_stop(&predicate);
        let listed = cache.list(opts).await.unwrap();
        assert_eq!(listed, vec![Key::new("a/1"), Key::new("a/2"), Key::new("a/3")]);
    }

    #[tokio::test]
    async fn cleared_key_is_refetched_from_backend() {
        let backend = MemoryBlobStore::new();
        backend.put(&Key::new("file1"), Blob::new("content1", false)).await.unwrap();
        let cache = deferred(backend);
        let key = Key::new("file1");
        cache.get(&key, false).await.unwrap();
        cache.clear(Some(&key));
        assert_eq!(cache.get(&key, false).await.unwrap().unwrap().data, "content1");
    }
}
