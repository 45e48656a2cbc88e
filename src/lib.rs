//! A layered, composable object store built out of small decorators around
//! a uniform blob-storage contract (`get`/`put`/`delete`/`list`/`url`).
//! Each decorator adds exactly one property and preserves the same
//! contract, so they compose in any order; the canonical stack is:
//!
//! ```text
//! Backend (external) -> CachedStore -> [PackedStore] -> TxStore
//! ```
//!
//! - [`lock`]: the shared-exclusive [`lock::Lockable`] primitive and its
//!   per-key [`lock::LockManager`], plus a queued, retry-on-contention
//!   wrapper for non-transactional callers.
//! - [`cached_store`]: a write-through or write-deferred cache with
//!   abort-safe original-value snapshots.
//! - [`tx`]: per-key transactional isolation on top of a deferred cache,
//!   with fail-fast lock negotiation and atomic commit/abort.
//! - [`packed`]: two ways to multiplex many small logical blobs into a
//!   bounded number of physical container blobs.
//! - [`backend`]: the minimal in-process reference backend the rest of the
//!   crate is tested against; production terminal backends are out of
//!   scope for this crate.

pub mod backend;
pub mod blob;
pub mod cached_store;
pub mod error;
pub mod lock;
pub mod packed;
pub mod store;
pub mod tx;

pub mod prelude {
    pub use crate::backend::MemoryBlobStore;
    pub use crate::blob::{Blob, Key};
    pub use crate::cached_store::{CachedStore, CachedStoreConfig};
    pub use crate::error::{BlobStoreError, BlobStoreResult, LockError, StorageError, TransactionError};
    pub use crate::lock::{LockManager, Lockable, ReadWriteLockBlobStore};
    pub use crate::packed::append::{AppendPacked, AppendPackedConfig};
    pub use crate::packed::json::{JsonPacked, JsonPackedConfig};
    pub use crate::store::{BlobStore, ListOptions};
    pub use crate::tx::{Transaction, TxStore};
}
