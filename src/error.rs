use thiserror::Error;

/// Boxed error from the terminal backend. The core treats the backend as
/// abstract, so it can only carry the backend's error onward, not interpret it.
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of a lock negotiation. Raised synchronously; never retried by the
/// lock layer itself — see [`crate::lock`] module docs.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    #[error("lock denied due to contention")]
    Denied,
}

pub type LockResult<T> = std::result::Result<T, LockError>;

/// Failure of an operation issued through a [`crate::tx::TxStore`] transaction.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction has already committed or aborted")]
    Expired,
    #[error("lock denied due to contention")]
    Denied,
}

impl From<LockError> for TransactionError {
    fn from(_: LockError) -> Self {
        TransactionError::Denied
    }
}

pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

/// Failure of a packed-storage or backend-level operation.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("master index is present but could not be parsed")]
    MasterCorrupt,

    #[error("packed store operation issued before the master index was loaded")]
    NotLoaded,

    #[error("url is unavailable for a logical key packed into a shared container")]
    UrlUnavailable,

    #[error("backend error: {0}")]
    Backend(#[source] BackendError),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// The single error type shared by every [`crate::store::BlobStore`]
/// implementation, so layers compose regardless of stacking order.
#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type BlobStoreResult<T> = std::result::Result<T, BlobStoreError>;

impl BlobStoreError {
    pub fn backend<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        StorageError::Backend(Box::new(err)).into()
    }
}
