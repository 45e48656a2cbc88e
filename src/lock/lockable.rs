use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{LockError, LockResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockLevel {
    Read,
    Write,
}

/// An immutable lock token. Identity is by `id`; two locks are the "same
/// lock" iff their ids match, regardless of level — an upgrade produces a
/// new `Lock` value carrying the same id at `LockLevel::Write`.
#[derive(Clone, Copy, Debug)]
pub struct Lock {
    pub level: LockLevel,
    pub id: Uuid,
    pub created: u64,
}

impl PartialEq for Lock {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Lock {}

impl std::hash::Hash for Lock {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

fn monotonic_created() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    // `created` only needs to be monotonic within the process, not wall-clock
    // accurate, so a counter seeded once from the clock is enough and keeps
    // lock creation free of `SystemTime::now()` syscalls on the hot path.
    static EPOCH_NANOS: once_cell::sync::Lazy<u64> =
        once_cell::sync::Lazy::new(|| SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0));
    *EPOCH_NANOS + COUNTER.fetch_add(1, Ordering::Relaxed)
}

impl Lock {
    pub(crate) fn with_id(level: LockLevel, id: Uuid) -> Self {
        Self { level, id, created: monotonic_created() }
    }
}

/// Allocates a fresh transaction-scoped identity. One value of this is meant
/// to be reused as the `id` of every [`Lock`] a single transaction acquires,
/// across every key and the list locks — that shared identity is what makes
/// reentrancy and upgrade detection work.
pub fn new_owner_id() -> Uuid {
    Uuid::new_v4()
}

#[derive(Default)]
struct State {
    writer: Option<Lock>,
    readers: HashSet<Lock>,
}

/// Mediates shared-exclusive access to a single key. Acquisition is
/// opportunistic and fails fast — there is no queueing here; that is
/// layered on separately by [`crate::lock::queued`].
pub struct Lockable {
    state: Mutex<State>,
}

impl Lockable {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }

    pub fn create_and_acquire(&self, owner: Uuid, level: LockLevel) -> LockResult<Lock> {
        let mut state = self.state.lock();
        let request = Lock::with_id(level, owner);
        Self::try_admit(&mut state, request)
    }

    /// `lock` must already be a `Read` held by the caller. Returns a new
    /// `Write` lock carrying the same id, or the existing writer lock
    /// unchanged if the caller already holds the writer slot.
    pub fn upgrade(&self, lock: Lock) -> LockResult<Lock> {
        let mut state = self.state.lock();
        if let Some(writer) = state.writer {
            if writer.id == lock.id {
                return Ok(writer);
            }
            return Err(LockError::Denied);
        }
        // Any other reader denies the upgrade.
        if state.readers.iter().any(|r| r.id != lock.id) {
            return Err(LockError::Denied);
        }
        state.readers.remove(&lock);
        let upgraded = Lock::with_id(LockLevel::Write, lock.id);
        state.writer = Some(upgraded);
        Ok(upgraded)
    }

    pub fn release(&self, lock: Lock) {
        let mut state = self.state.lock();
        if state.writer.is_some_and(|w| w.id == lock.id) {
            state.writer = None;
        }
        state.readers.remove(&lock);
    }

    pub fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.writer.is_some() || !state.readers.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        !self.is_locked()
    }

    fn try_admit(state: &mut State, request: Lock) -> LockResult<Lock> {
        // A1
        if let Some(writer) = state.writer {
            if writer.id != request.id {
                return Err(LockError::Denied);
            }
        }
        match request.level {
            LockLevel::Read => {
                if state.writer.is_some_and(|w| w.id == request.id) {
                    // A writer implicitly grants read; do not also add a reader entry.
                    return Ok(state.writer.unwrap());
                }
                state.readers.insert(request);
                Ok(request)
            }
            LockLevel::Write => {
                // A2
                if state.readers.iter().any(|r| r.id != request.id) {
                    return Err(LockError::Denied);
                }
                state.readers.remove(&request);
                state.writer = Some(request);
                Ok(request)
            }
        }
    }
}

impl Default for Lockable {
    fn default() -> Self {
        Self::new()
    }
}
