//! Shared-exclusive locking (§4.1-§4.2).
//!
//! [`Lockable`] mediates one key; [`LockManager`] is the lazy per-key map
//! plus the separate listing-lock pair. Both are fail-fast: contention
//! returns [`crate::error::LockError::Denied`] immediately rather than
//! queueing. [`queued::ReadWriteLockBlobStore`] layers a retry-on-`Denied`
//! wrapper on top for callers that want to wait instead (§9).

pub mod lockable;
pub mod manager;
pub mod queued;

pub use lockable::{Lock, LockLevel, Lockable};
pub use manager::{Holdings, LockManager};
pub use queued::ReadWriteLockBlobStore;
