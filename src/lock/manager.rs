use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::blob::Key;
use crate::error::LockResult;
use crate::lock::lockable::{Lock, LockLevel, Lockable};

/// The locks one transaction is currently holding, tracked so negotiation can
/// tell reentrant requests from fresh ones and release everything on
/// commit/abort.
#[derive(Default)]
pub struct Holdings {
    pub per_key: std::collections::HashMap<Key, Lock>,
    pub list_read: Option<Lock>,
    pub list_write: Option<Lock>,
}

/// Multiple concurrent list-reads coexist and multiple concurrent
/// list-writes coexist; a read must never observe a partial mutation and a
/// writer must never race a reader (§4.2). Kept as a flat sequence rather
/// than a count so each entry can be traced back to its owning transaction.
#[derive(Default)]
struct ListLocks {
    entries: Vec<Lock>,
}

impl ListLocks {
    fn negotiate_read(&mut self, owner: Uuid) -> LockResult<Lock> {
        if let Some(existing) = self.entries.iter().find(|l| l.id == owner && l.level == LockLevel::Read) {
            return Ok(*existing);
        }
        if self.entries.iter().any(|l| l.level == LockLevel::Write && l.id != owner) {
            return Err(crate::error::LockError::Denied);
        }
        let lock = Lock::with_id(LockLevel::Read, owner);
        self.entries.push(lock);
        Ok(lock)
    }

    fn negotiate_write(&mut self, owner: Uuid) -> LockResult<Lock> {
        if let Some(existing) = self.entries.iter().find(|l| l.id == owner && l.level == LockLevel::Write) {
            return Ok(*existing);
        }
        if self.entries.iter().any(|l| l.level == LockLevel::Read && l.id != owner) {
            return Err(crate::error::LockError::Denied);
        }
        let lock = Lock::with_id(LockLevel::Write, owner);
        self.entries.push(lock);
        Ok(lock)
    }

    fn release(&mut self, lock: Lock) {
        self.entries.retain(|l| l.id != lock.id || l.level != lock.level);
    }
}

/// A lazy map from [`Key`] to [`Lockable`], plus the two listing-lock
/// classes. This is the sole point of contention negotiation in the crate;
/// [`crate::tx::TxStore`] is the only intended caller.
#[derive(Default)]
pub struct LockManager {
    lockables: DashMap<Key, Arc<Lockable>>,
    list_locks: Mutex<ListLocks>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lockable_for(&self, key: &Key) -> Arc<Lockable> {
        self.lockables.entry(key.clone()).or_insert_with(|| Arc::new(Lockable::new())).clone()
    }

    pub fn negotiate_read(&self, owner: Uuid, holdings: &mut Holdings, key: &Key) -> LockResult<()> {
        if holdings.per_key.contains_key(key) {
            return Ok(());
        }
        let lockable = self.lockable_for(key);
        let lock = lockable.create_and_acquire(owner, LockLevel::Read)?;
        holdings.per_key.insert(key.clone(), lock);
        Ok(())
    }

    pub fn negotiate_write(&self, owner: Uuid, holdings: &mut Holdings, key: &Key) -> LockResult<()> {
        let lockable = self.lockable_for(key);
        match holdings.per_key.get(key) {
            Some(existing) if existing.level == LockLevel::Write => {}
            Some(existing) => {
                let upgraded = lockable.upgrade(*existing)?;
                holdings.per_key.insert(key.clone(), upgraded);
            }
            None => {
                let lock = lockable.create_and_acquire(owner, LockLevel::Write)?;
                holdings.per_key.insert(key.clone(), lock);
            }
        }
        Ok(())
    }

    pub fn negotiate_list_read(&self, owner: Uuid, holdings: &mut Holdings) -> LockResult<()> {
        let lock = self.list_locks.lock().negotiate_read(owner)?;
        holdings.list_read = Some(lock);
        Ok(())
    }

    pub fn negotiate_list_write(&self, owner: Uuid, holdings: &mut Holdings) -> LockResult<()> {
        let lock = self.list_locks.lock().negotiate_write(owner)?;
        holdings.list_write = Some(lock);
        Ok(())
    }

    /// Releases every lock a transaction holds and garbage-collects any
    /// [`Lockable`] left idle as a result.
    pub fn release_all(&self, holdings: &mut Holdings) {
        for (key, lock) in holdings.per_key.drain() {
            if let Some(lockable) = self.lockables.get(&key) {
                lockable.release(lock);
                if lockable.is_idle() {
                    drop(lockable);
                    self.lockables.remove_if(&key, |_, l| l.is_idle());
                }
            }
        }
        let mut list_locks = self.list_locks.lock();
        if let Some(lock) = holdings.list_read.take() {
            list_locks.release(lock);
        }
        if let Some(lock) = holdings.list_write.take() {
            list_locks.release(lock);
        }
    }

    #[cfg(test)]
    pub fn lockable_count(&self) -> usize {
        self.lockables.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::lockable::new_owner_id;

    #[test]
    fn reentrant_read_does_not_reacquire() {
        let mgr = LockManager::new();
        let owner = new_owner_id();
        let mut holdings = Holdings::default();
        let key = Key::new("a");
        mgr.negotiate_read(owner, &mut holdings, &key).unwrap();
        mgr.negotiate_read(owner, &mut holdings, &key).unwrap();
        assert_eq!(holdings.per_key.len(), 1);
    }

    #[test]
    fn write_then_other_read_denied_same_key() {
        let mgr = LockManager::new();
        let key = Key::new("a");
        let mut t1 = Holdings::default();
        mgr.negotiate_write(new_owner_id(), &mut t1, &key).unwrap();

        let mut t2 = Holdings::default();
        assert!(mgr.negotiate_read(new_owner_id(), &mut t2, &key).is_err());
    }

    #[test]
    fn lockable_is_collected_when_idle() {
        let mgr = LockManager::new();
        let key = Key::new("a");
        let mut holdings = Holdings::default();
        mgr.negotiate_write(new_owner_id(), &mut holdings, &key).unwrap();
        assert_eq!(mgr.lockable_count(), 1);
        mgr.release_all(&mut holdings);
        assert_eq!(mgr.lockable_count(), 0);
    }

    #[test]
    fn list_read_read_admit_but_list_write_excludes_other_reader() {
        let mgr = LockManager::new();
        let mut t1 = Holdings::default();
        let mut t2 = Holdings::default();
        mgr.negotiate_list_read(new_owner_id(), &mut t1).unwrap();
        mgr.negotiate_list_read(new_owner_id(), &mut t2).unwrap();

        let mut t3 = Holdings::default();
        assert!(mgr.negotiate_list_write(new_owner_id(), &mut t3).is_err());
    }

    #[test]
    fn list_write_write_admit_but_excludes_reader() {
        let mgr = LockManager::new();
        let mut t1 = Holdings::default();
        let mut t2 = Holdings::default();
        mgr.negotiate_list_write(new_owner_id(), &mut t1).unwrap();
        mgr.negotiate_list_write(new_owner_id(), &mut t2).unwrap();

        let mut t3 = Holdings::default();
        assert!(mgr.negotiate_list_read(new_owner_id(), &mut t3).is_err());
    }

    #[test]
    fn writer_may_additionally_take_list_read() {
        let mgr = LockManager::new();
        let owner = new_owner_id();
        let mut holdings = Holdings::default();
        mgr.negotiate_list_write(owner, &mut holdings).unwrap();
        mgr.negotiate_list_read(owner, &mut holdings).unwrap();
        assert!(holdings.list_read.is_some());
        assert!(holdings.list_write.is_some());
    }
}
