use async_trait::async_trait;

use crate::blob::{Blob, Key};
use crate::error::BlobStoreResult;

/// Filters and early-termination for [`BlobStore::list`].
///
/// `early_stop` is consulted in the order keys are visited; listing stops
/// the first time it returns `false`, and that key is excluded from the
/// result — this is an early-terminate, not a filter.
#[derive(Default)]
pub struct ListOptions<'a> {
    pub prefix: Option<&'a str>,
    pub early_stop: Option<&'a (dyn Fn(&Key) -> bool + Send + Sync)>,
}

impl<'a> ListOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: &'a str) -> Self {
        self.prefix = Some(prefix);
        self
    }

    pub fn with_early_stop(mut self, predicate: &'a (dyn Fn(&Key) -> bool + Send + Sync)) -> Self {
        self.early_stop = Some(predicate);
        self
    }

    /// Applies `prefix` then `early_stop` to an already-ordered sequence of keys.
    pub fn apply(&self, keys: impl IntoIterator<Item = Key>) -> Vec<Key> {
        let mut out = Vec::new();
        for key in keys {
            if let Some(prefix) = self.prefix {
                if !key.starts_with(prefix) {
                    continue;
                }
            }
            if let Some(predicate) = self.early_stop {
                if !predicate(&key) {
                    break;
                }
            }
            out.push(key);
        }
        out
    }
}

/// The uniform contract every layer in the stack implements and wraps.
/// Every method is a suspension point (see the concurrency model) — the only
/// synchronous state transitions in this crate are lock bookkeeping and cache
/// bookkeeping that happen between these calls.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &Key, encrypted: bool) -> BlobStoreResult<Option<Blob>>;
    async fn put(&self, key: &Key, value: Blob) -> BlobStoreResult<()>;
    async fn delete(&self, key: &Key) -> BlobStoreResult<()>;
    async fn list(&self, options: ListOptions<'_>) -> BlobStoreResult<Vec<Key>>;
    async fn url(&self, key: &Key) -> BlobStoreResult<Option<String>>;
}

/// Lets a shared, reference-counted backend be handed to more than one
/// decorator at once (e.g. an [`crate::packed::append::AppendPacked`]
/// reopened against the same in-memory backend in a test).
#[async_trait]
impl<T: BlobStore + ?Sized> BlobStore for std::sync::Arc<T> {
    async fn get(&self, key: &Key, encrypted: bool) -> BlobStoreResult<Option<Blob>> {
        (**self).get(key, encrypted).await
    }

    async fn put(&self, key: &Key, value: Blob) -> BlobStoreResult<()> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &Key) -> BlobStoreResult<()> {
        (**self).delete(key).await
    }

    async fn list(&self, options: ListOptions<'_>) -> BlobStoreResult<Vec<Key>> {
        (**self).list(options).await
    }

    async fn url(&self, key: &Key) -> BlobStoreResult<Option<String>> {
        (**self).url(key).await
    }
}
