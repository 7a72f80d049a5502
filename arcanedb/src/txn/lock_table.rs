use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::config;
use crate::error::{CResult, Error};
use crate::txn::TxnId;

struct LockState {
    owner: Option<TxnId>,
    locked: bool,
    waiters: usize,
}

struct LockEntry {
    state: Mutex<LockState>,
    cv: Condvar,
}

/// A wait-queue lock map, one entry per currently contended key.
///
/// `lock` is re-entrant for the owning transaction. Contended acquisitions
/// wait on the entry's condvar for up to [`config::LOCK_TIMEOUT`] and take
/// ownership when woken by an unlock; timing out surfaces as
/// [`Error::Timeout`], which aborts the calling transaction. There is no
/// deadlock detection, the shared timeout is the safety net.
#[derive(Default)]
pub struct LockTable {
    entries: Mutex<HashMap<Vec<u8>, Arc<LockEntry>>>,
}

impl LockTable {
    pub fn new() -> LockTable {
        LockTable::default()
    }

    pub fn lock(&self, key: &[u8], txn_id: TxnId) -> CResult<()> {
        let entry = {
            let mut map = self.entries.lock();
            match map.entry(key.to_vec()) {
                MapEntry::Vacant(slot) => {
                    slot.insert(Arc::new(LockEntry {
                        state: Mutex::new(LockState {
                            owner: Some(txn_id),
                            locked: true,
                            waiters: 0,
                        }),
                        cv: Condvar::new(),
                    }));
                    return Ok(());
                }
                MapEntry::Occupied(slot) => {
                    let entry = slot.get().clone();
                    let mut state = entry.state.lock();
                    if state.owner == Some(txn_id) {
                        return Ok(());
                    }
                    if !state.locked {
                        // Freed but not yet garbage collected; barge in.
                        state.locked = true;
                        state.owner = Some(txn_id);
                        return Ok(());
                    }
                    // Register as a waiter while the map lock pins the entry,
                    // so unlock cannot remove it from under us.
                    state.waiters += 1;
                    drop(state);
                    entry
                }
            }
        };

        let mut state = entry.state.lock();
        let timed_out = entry.cv.wait_for(&mut state, config::LOCK_TIMEOUT).timed_out();
        state.waiters -= 1;
        if !timed_out && !state.locked {
            state.locked = true;
            state.owner = Some(txn_id);
            return Ok(());
        }
        let collectable = state.waiters == 0 && !state.locked;
        drop(state);
        if collectable {
            self.collect(key, &entry);
        }
        Err(Error::Timeout)
    }

    pub fn unlock(&self, key: &[u8], txn_id: TxnId) -> CResult<()> {
        let mut map = self.entries.lock();
        let entry = match map.get(key) {
            Some(entry) => entry.clone(),
            None => {
                return Err(Error::Internal(format!(
                    "unlock of a key that holds no lock by txn {}",
                    txn_id
                )))
            }
        };
        let mut state = entry.state.lock();
        if state.owner != Some(txn_id) {
            return Err(Error::Internal(format!(
                "unlock by txn {} which is not the owner {:?}",
                txn_id, state.owner
            )));
        }
        state.owner = None;
        state.locked = false;
        if state.waiters == 0 {
            drop(state);
            map.remove(key);
        } else {
            entry.cv.notify_one();
        }
        Ok(())
    }

    /// Removes a free, waiter-less entry left behind by a timed-out waiter.
    fn collect(&self, key: &[u8], entry: &Arc<LockEntry>) {
        let mut map = self.entries.lock();
        if let Some(current) = map.get(key) {
            if Arc::ptr_eq(current, entry) {
                let state = current.state.lock();
                if state.waiters == 0 && !state.locked {
                    drop(state);
                    map.remove(key);
                }
            }
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Hash-sharded [`LockTable`], the centralized lock manager.
pub struct ShardedLockTable {
    shards: Vec<LockTable>,
}

impl ShardedLockTable {
    pub fn new(shard_num: usize) -> ShardedLockTable {
        ShardedLockTable { shards: (0..shard_num).map(|_| LockTable::new()).collect() }
    }

    fn shard(&self, key: &[u8]) -> &LockTable {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    pub fn lock(&self, key: &[u8], txn_id: TxnId) -> CResult<()> {
        self.shard(key).lock(key, txn_id)
    }

    pub fn unlock(&self, key: &[u8], txn_id: TxnId) -> CResult<()> {
        self.shard(key).unlock(key, txn_id)
    }
}

impl Default for ShardedLockTable {
    fn default() -> Self {
        ShardedLockTable::new(config::LOCK_TABLE_SHARD_NUM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn lock_is_reentrant_for_the_owner() -> CResult<()> {
        let table = LockTable::new();
        table.lock(b"k", 1)?;
        table.lock(b"k", 1)?;
        table.unlock(b"k", 1)?;
        assert_eq!(table.entry_count(), 0);
        Ok(())
    }

    #[test]
    fn contended_lock_times_out() {
        let table = LockTable::new();
        table.lock(b"k", 1).unwrap();
        // The default timeout is long; this test relies on it being bounded.
        let started = std::time::Instant::now();
        assert_eq!(table.lock(b"k", 2), Err(Error::Timeout));
        assert!(started.elapsed() >= config::LOCK_TIMEOUT);
        // The owner still holds the lock.
        table.unlock(b"k", 1).unwrap();
        assert_eq!(table.entry_count(), 0);
    }

    #[test]
    fn unlock_hands_over_to_a_waiter() {
        let table = Arc::new(LockTable::new());
        table.lock(b"k", 1).unwrap();

        let waiter = {
            let table = table.clone();
            std::thread::spawn(move || table.lock(b"k", 2))
        };
        std::thread::sleep(Duration::from_millis(50));
        table.unlock(b"k", 1).unwrap();
        waiter.join().unwrap().unwrap();

        table.unlock(b"k", 2).unwrap();
        assert_eq!(table.entry_count(), 0);
    }

    #[test]
    fn unlock_by_non_owner_is_rejected() {
        let table = LockTable::new();
        table.lock(b"k", 1).unwrap();
        assert!(table.unlock(b"k", 2).is_err());
        assert!(table.unlock(b"missing", 1).is_err());
        table.unlock(b"k", 1).unwrap();
    }

    #[test]
    fn sharded_table_routes_keys_consistently() -> CResult<()> {
        let table = ShardedLockTable::new(4);
        for i in 0..64u64 {
            let key = format!("page#{}", i);
            table.lock(key.as_bytes(), i)?;
        }
        for i in 0..64u64 {
            let key = format!("page#{}", i);
            table.unlock(key.as_bytes(), i)?;
        }
        Ok(())
    }
}
