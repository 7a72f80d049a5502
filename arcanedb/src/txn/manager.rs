use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::BufferPool;
use crate::config;
use crate::txn::{
    CcProtocol, ShardedLockTable, TxnContext, TxnContext2Pl, TxnContextOcc, TxnId, TxnOptions,
    TxnTs, TxnType,
};
use crate::wal::LogStore;

/// The shared plumbing a transaction needs: the pool resolving pages and the
/// WAL sink, threaded through instead of living in process-wide singletons.
#[derive(Clone)]
pub struct DbContext {
    pub buffer_pool: Arc<BufferPool>,
    pub log_store: Option<Arc<LogStore>>,
}

/// The timestamp oracle: a monotonic counter owned by the database instance.
pub struct Tso {
    ts: AtomicU32,
}

impl Tso {
    pub fn new() -> Tso {
        Tso { ts: AtomicU32::new(0) }
    }

    pub fn request_ts(&self) -> TxnTs {
        self.ts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The most recently granted timestamp.
    pub fn current_ts(&self) -> TxnTs {
        self.ts.load(Ordering::Relaxed)
    }

    /// Never hand out timestamps at or below `ts` again; recovery calls this
    /// with the highest timestamp observed in the log.
    pub fn advance_to(&self, ts: TxnTs) {
        let mut current = self.ts.load(Ordering::Relaxed);
        while current < ts {
            match self.ts.compare_exchange(current, ts, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for Tso {
    fn default() -> Self {
        Tso::new()
    }
}

/// Tracks the timestamps of in-flight read-write transactions so read-only
/// transactions can pick a safe snapshot horizon.
#[derive(Default)]
pub struct SnapshotManager {
    inflight: Mutex<BTreeSet<TxnTs>>,
}

impl SnapshotManager {
    pub fn new() -> SnapshotManager {
        SnapshotManager::default()
    }

    pub fn register_ts(&self, ts: TxnTs) {
        self.inflight.lock().insert(ts);
    }

    pub fn commit_ts(&self, ts: TxnTs) {
        self.inflight.lock().remove(&ts);
    }

    pub fn min_inflight(&self) -> Option<TxnTs> {
        self.inflight.lock().iter().next().copied()
    }
}

/// Mints transaction ids and timestamps, tracks the snapshot horizon, and
/// owns the centralized lock table.
pub struct TxnManager {
    protocol: CcProtocol,
    tso: Tso,
    snapshots: SnapshotManager,
    lock_table: ShardedLockTable,
    ctx: DbContext,
}

impl TxnManager {
    pub fn new(protocol: CcProtocol, ctx: DbContext) -> TxnManager {
        TxnManager {
            protocol,
            tso: Tso::new(),
            snapshots: SnapshotManager::new(),
            lock_table: ShardedLockTable::new(config::LOCK_TABLE_SHARD_NUM),
            ctx,
        }
    }

    /// Begins a read-only transaction at the current snapshot horizon.
    pub fn begin_ro_txn(self: &Arc<Self>, opts: TxnOptions) -> Box<dyn TxnContext> {
        let ts = self.snapshot_ts();
        self.begin_ro_txn_with_ts(ts, opts)
    }

    /// Begins a read-only transaction pinned at `ts`.
    pub fn begin_ro_txn_with_ts(self: &Arc<Self>, ts: TxnTs, opts: TxnOptions) -> Box<dyn TxnContext> {
        let txn_id = mint_txn_id();
        match self.protocol {
            CcProtocol::Occ => {
                Box::new(TxnContextOcc::new(txn_id, ts, TxnType::ReadOnly, opts, self.clone()))
            }
            CcProtocol::TwoPl => {
                Box::new(TxnContext2Pl::new(txn_id, ts, TxnType::ReadOnly, opts, self.clone()))
            }
        }
    }

    /// Begins a read-write transaction with a fresh timestamp.
    pub fn begin_rw_txn(self: &Arc<Self>, opts: TxnOptions) -> Box<dyn TxnContext> {
        let txn_id = mint_txn_id();
        let ts = self.tso.request_ts();
        self.snapshots.register_ts(ts);
        match self.protocol {
            CcProtocol::Occ => {
                Box::new(TxnContextOcc::new(txn_id, ts, TxnType::ReadWrite, opts, self.clone()))
            }
            CcProtocol::TwoPl => {
                Box::new(TxnContext2Pl::new(txn_id, ts, TxnType::ReadWrite, opts, self.clone()))
            }
        }
    }

    /// A timestamp at or below which every visible version is committed:
    /// just under the oldest in-flight writer, or the latest granted
    /// timestamp when no writer is in flight.
    pub fn snapshot_ts(&self) -> TxnTs {
        match self.snapshots.min_inflight() {
            Some(ts) => ts.saturating_sub(1),
            None => self.tso.current_ts(),
        }
    }

    pub(crate) fn request_ts(&self) -> TxnTs {
        self.tso.request_ts()
    }

    pub(crate) fn retire_ts(&self, ts: TxnTs) {
        self.snapshots.commit_ts(ts);
    }

    pub fn advance_tso(&self, ts: TxnTs) {
        self.tso.advance_to(ts);
    }

    pub(crate) fn lock_table(&self) -> &ShardedLockTable {
        &self.lock_table
    }

    pub(crate) fn db_context(&self) -> &DbContext {
        &self.ctx
    }
}

fn mint_txn_id() -> TxnId {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tso_is_monotonic() {
        let tso = Tso::new();
        let a = tso.request_ts();
        let b = tso.request_ts();
        assert!(b > a);
        assert_eq!(tso.current_ts(), b);

        tso.advance_to(100);
        assert!(tso.request_ts() > 100);
        // Advancing backwards is a no-op.
        tso.advance_to(5);
        assert!(tso.current_ts() > 100);
    }

    #[test]
    fn snapshot_manager_tracks_the_minimum() {
        let snapshots = SnapshotManager::new();
        assert_eq!(snapshots.min_inflight(), None);
        snapshots.register_ts(7);
        snapshots.register_ts(3);
        assert_eq!(snapshots.min_inflight(), Some(3));
        snapshots.commit_ts(3);
        assert_eq!(snapshots.min_inflight(), Some(7));
        snapshots.commit_ts(7);
        assert_eq!(snapshots.min_inflight(), None);
    }
}
