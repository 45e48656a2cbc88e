use async_trait::async_trait;
use tokio::sync::Notify;

use crate::blob::{Blob, Key};
use crate::error::{BlobStoreResult, LockError};
use crate::lock::lockable::new_owner_id;
use crate::lock::manager::{Holdings, LockManager};
use crate::store::{BlobStore, ListOptions};

/// A queued counterpart to [`crate::tx::TxStore`]'s fail-fast negotiation
/// (§9 "Fail-fast vs. queued locking"). Every call takes its own per-key
/// lock for the duration of the single operation and retries on
/// [`LockError::Denied`] instead of surfacing contention to the caller,
/// using a shared [`Notify`] as the wake-up channel so waiters don't poll.
pub struct ReadWriteLockBlobStore<S> {
    inner: S,
    locks: LockManager,
    notify: Notify,
}

impl<S: BlobStore> ReadWriteLockBlobStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, locks: LockManager::new(), notify: Notify::new() }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    async fn with_read<T, F, Fut>(&self, key: &Key, op: F) -> BlobStoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = BlobStoreResult<T>>,
    {
        let owner = new_owner_id();
        loop {
            // Register for the next wake-up before negotiating, not after a
            // denial: a `Notified` created here is guaranteed to observe a
            // `notify_waiters()` call that happens any time after this point,
            // even if it races the holder's release before we `.await` it.
            // Registering only in the `Err` arm would miss that wakeup.
            let notified = self.notify.notified();
            let mut holdings = Holdings::default();
            match self.locks.negotiate_read(owner, &mut holdings, key) {
                Ok(()) => {
                    let result = op().await;
                    self.locks.release_all(&mut holdings);
                    self.notify.notify_waiters();
                    return result;
                }
                Err(LockError::Denied) => {
                    notified.await;
                }
            }
        }
    }

    async fn with_write<T, F, Fut>(&self, key: &Key, op: F) -> BlobStoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = BlobStoreResult<T>>,
    {
        let owner = new_owner_id();
        loop {
            let notified = self.notify.notified();
            let mut holdings = Holdings::default();
            match self.locks.negotiate_write(owner, &mut holdings, key) {
                Ok(()) => {
                    let result = op().await;
                    self.locks.release_all(&mut holdings);
                    self.notify.notify_waiters();
                    return result;
                }
                Err(LockError::Denied) => {
                    notified.await;
                }
            }
        }
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for ReadWriteLockBlobStore<S> {
    async fn get(&self, key: &Key, encrypted: bool) -> BlobStoreResult<Option<Blob>> {
        self.with_read(key, || self.inner.get(key, encrypted)).await
    }

    async fn put(&self, key: &Key, value: Blob) -> BlobStoreResult<()> {
        self.with_write(key, || self.inner.put(key, value.clone())).await
    }

    async fn delete(&self, key: &Key) -> BlobStoreResult<()> {
        self.with_write(key, || self.inner.delete(key)).await
    }

    async fn list(&self, options: ListOptions<'_>) -> BlobStoreResult<Vec<Key>> {
        // Listing has no single key to negotiate on; delegate straight
        // through, consistent with §9's note that the backend is assumed to
        // sync its own list rather than being globally serialized here.
        self.inner.list(options).await
    }

    async fn url(&self, key: &Key) -> BlobStoreResult<Option<String>> {
        self.with_read(key, || self.inner.url(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBlobStore;
    use std::sync::Arc;
    use std::time::Duration;

    /// Wraps `put` with an artificial delay so the wrapping
    /// `ReadWriteLockBlobStore` is demonstrably still holding its write lock
    /// while the delay runs, forcing a genuinely concurrent second writer to
    /// queue rather than race in.
    struct SlowStore(MemoryBlobStore);

    #[async_trait]
    impl BlobStore for SlowStore {
        async fn get(&self, key: &Key, encrypted: bool) -> BlobStoreResult<Option<Blob>> {
            self.0.get(key, encrypted).await
        }
        async fn put(&self, key: &Key, value: Blob) -> BlobStoreResult<()> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.put(key, value).await
        }
        async fn delete(&self, key: &Key) -> BlobStoreResult<()> {
            self.0.delete(key).await
        }
        async fn list(&self, options: ListOptions<'_>) -> BlobStoreResult<Vec<Key>> {
            self.0.list(options).await
        }
        async fn url(&self, key: &Key) -> BlobStoreResult<Option<String>> {
            self.0.url(key).await
        }
    }

    #[tokio::test]
    async fn second_write_waits_and_observes_first_result() {
        let store = Arc::new(ReadWriteLockBlobStore::new(SlowStore(MemoryBlobStore::new())));
        let key = Key::new("file1");

        let store_a = store.clone();
        let key_a = key.clone();
        let first = tokio::spawn(async move { store_a.put(&key_a, Blob::new("first", false)).await });

        // Give the first write time to acquire the lock and enter its delay.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store.put(&key, Blob::new("second", false)).await;

        first.await.unwrap().unwrap();
        second.unwrap();

        let got = store.get(&key, false).await.unwrap().unwrap();
        assert_eq!(got.data, "second");
    }
}
