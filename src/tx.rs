//! Transactional isolation on top of a deferred-write-back cache (§4.4).
//!
//! [`TxStore`] wraps a [`CachedStore`] configured with `auto_flushing =
//! false` and negotiates per-key and per-listing locks through a
//! [`LockManager`] on behalf of each [`Transaction`]. Unlike
//! [`crate::lock::queued::ReadWriteLockBlobStore`], negotiation here is
//! fail-fast (§9): a denied lock surfaces to the caller immediately rather
//! than queueing, and `transact` is the only place that recovers, by
//! aborting and re-raising.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::blob::{Blob, Key};
use crate::cached_store::{CachedStore, CachedStoreConfig};
use crate::error::{BlobStoreResult, TransactionError};
use crate::lock::lockable::{new_owner_id, LockLevel};
use crate::lock::manager::{Holdings, LockManager};
use crate::store::{BlobStore, ListOptions};

/// A single transaction's view onto a [`TxStore`]. Every method first
/// asserts the transaction has not already committed or aborted
/// (`TransactionError::Expired`), then negotiates the lock the operation
/// needs before delegating to the owning store's cache.
pub struct Transaction<'a, S> {
    store: &'a TxStore<S>,
    owner: Uuid,
    holdings: Mutex<Holdings>,
    expired: AtomicBool,
}

impl<'a, S: BlobStore> Transaction<'a, S> {
    fn assert_active(&self) -> Result<(), TransactionError> {
        if self.expired.load(Ordering::Acquire) {
            Err(TransactionError::Expired)
        } else {
            Ok(())
        }
    }

    pub async fn get(&self, key: &Key, encrypted: bool) -> BlobStoreResult<Option<Blob>> {
        self.assert_active()?;
        self.store.locks.negotiate_read(self.owner, &mut self.holdings.lock(), key).map_err(TransactionError::from)?;
        self.store.cache.get(key, encrypted).await
    }

    pub async fn put(&self, key: &Key, value: Blob) -> BlobStoreResult<()> {
        self.assert_active()?;
        {
            let mut holdings = self.holdings.lock();
            self.store.locks.negotiate_write(self.owner, &mut holdings, key).map_err(TransactionError::from)?;
            // Conservative: a put may introduce a key a concurrent listing
            // hasn't seen yet, so it takes the list-write class too (§4.4).
            self.store.locks.negotiate_list_write(self.owner, &mut holdings).map_err(TransactionError::from)?;
        }
        self.store.cache.put(key, value).await
    }

    pub async fn delete(&self, key: &Key) -> BlobStoreResult<()> {
        self.assert_active()?;
        {
            let mut holdings = self.holdings.lock();
            self.store.locks.negotiate_write(self.owner, &mut holdings, key).map_err(TransactionError::from)?;
            self.store.locks.negotiate_list_write(self.owner, &mut holdings).map_err(TransactionError::from)?;
        }
        self.store.cache.delete(key).await
    }

    pub async fn list(&self, options: ListOptions<'_>) -> BlobStoreResult<Vec<Key>> {
        self.assert_active()?;
        self.store.locks.negotiate_list_read(self.owner, &mut self.holdings.lock()).map_err(TransactionError::from)?;
        self.store.cache.list(options).await
    }

    pub async fn url(&self, key: &Key) -> BlobStoreResult<Option<String>> {
        self.assert_active()?;
        self.store.locks.negotiate_read(self.owner, &mut self.holdings.lock(), key).map_err(TransactionError::from)?;
        self.store.cache.url(key).await
    }

    /// Flushes every key this transaction holds a Write lock for, then
    /// releases all locks (P4) and marks the transaction `EXPIRED`. Any
    /// further call on this transaction fails with
    /// `TransactionError::Expired`.
    pub async fn commit(&self) -> BlobStoreResult<()> {
        self.assert_active()?;
        let write_keys: Vec<Key> = self.holdings.lock().per_key.iter().filter(|(_, l)| l.level == LockLevel::Write).map(|(k, _)| k.clone()).collect();
        for key in &write_keys {
            self.store.cache.flush(Some(key)).await?;
        }
        self.store.locks.release_all(&mut self.holdings.lock());
        self.expired.store(true, Ordering::Release);
        debug!("committed transaction, flushed {} key(s)", write_keys.len());
        Ok(())
    }

    /// Rolls back every key this transaction holds a Write lock for to its
    /// pre-transaction value (P3), then releases all locks and marks the
    /// transaction `EXPIRED`. The backend is never touched — nothing was
    /// flushed yet.
    pub async fn abort(&self) -> BlobStoreResult<()> {
        self.assert_active()?;
        let write_keys: Vec<Key> = self.holdings.lock().per_key.iter().filter(|(_, l)| l.level == LockLevel::Write).map(|(k, _)| k.clone()).collect();
        for key in &write_keys {
            self.store.cache.abort(Some(key)).await?;
        }
        self.store.locks.release_all(&mut self.holdings.lock());
        self.expired.store(true, Ordering::Release);
        debug!("aborted transaction, rolled back {} key(s)", write_keys.len());
        Ok(())
    }
}

/// Wraps a [`CachedStore`] (always deferred) with a [`LockManager`] to give
/// every call per-key and per-listing isolation (§4.4). Implements
/// [`BlobStore`] directly: each direct call opens a single-shot transaction
/// around itself, committing on success and aborting on failure.
pub struct TxStore<S> {
    cache: CachedStore<S>,
    locks: LockManager,
}

impl<S: BlobStore> TxStore<S> {
    pub fn new(inner: S) -> Self {
        Self { cache: CachedStore::new(inner, CachedStoreConfig { cache_file_urls: true, auto_flushing: false }), locks: LockManager::new() }
    }

    pub fn begin(&self) -> Transaction<'_, S> {
        Transaction { store: self, owner: new_owner_id(), holdings: Mutex::new(Holdings::default()), expired: AtomicBool::new(false) }
    }

    /// Runs `body` inside a fresh transaction: commits if it returns `Ok`,
    /// aborts and re-raises if it returns `Err`.
    pub async fn transact<F, Fut, T>(&self, body: F) -> BlobStoreResult<T>
    where
        F: FnOnce(&Transaction<'_, S>) -> Fut,
        Fut: std::future::Future<Output = BlobStoreResult<T>>,
    {
        let tx = self.begin();
        match body(&tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                tx.abort().await?;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<S: BlobStore> BlobStore for TxStore<S> {
    async fn get(&self, key: &Key, encrypted: bool) -> BlobStoreResult<Option<Blob>> {
        self.transact(|tx| async move { tx.get(key, encrypted).await }).await
    }

    async fn put(&self, key: &Key, value: Blob) -> BlobStoreResult<()> {
        self.transact(|tx| async move { tx.put(key, value).await }).await
    }

    async fn delete(&self, key: &Key) -> BlobStoreResult<()> {
        self.transact(|tx| async move { tx.delete(key).await }).await
    }

    async fn list(&self, options: ListOptions<'_>) -> BlobStoreResult<Vec<Key>> {
        self.transact(|tx| async move { tx.list(options).await }).await
    }

    async fn url(&self, key: &Key) -> BlobStoreResult<Option<String>> {
        self.transact(|tx| async move { tx.url(key).await }).await
    }
}
