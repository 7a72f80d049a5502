//! Transactions: timestamps, locks, and the OCC / 2PL context layers.

mod lock_table;
mod manager;
mod occ;
mod two_pl;

pub use lock_table::{LockTable, ShardedLockTable};
pub use manager::{DbContext, SnapshotManager, Tso, TxnManager};
pub use occ::TxnContextOcc;
pub use two_pl::TxnContext2Pl;

use crate::error::CResult;
use crate::page::RowView;
use crate::row::{Row, SortKeyRef};

/// Logical transaction timestamp. Monotonically increasing, minted by the
/// per-database [`Tso`].
///
/// The high bit is reserved as the lock marker: a version whose `write_ts`
/// carries the bit is an uncommitted intent. [`ABORTED_TXN_TS`] tags versions
/// of aborted transactions until compaction reaps them.
pub type TxnTs = u32;

/// Transaction id, minted randomly. Collisions are negligible.
pub type TxnId = u64;

pub const TXN_TS_LOCKED_BIT: TxnTs = 1 << 31;

/// The largest valid timestamp; also serves as the unbounded-snapshot
/// sentinel.
pub const MAX_TXN_TS: TxnTs = TXN_TS_LOCKED_BIT - 1;

/// Versions stamped with this timestamp belong to aborted transactions and
/// are invisible to every reader.
pub const ABORTED_TXN_TS: TxnTs = TxnTs::MAX;

pub fn mark_locked(ts: TxnTs) -> TxnTs {
    ts | TXN_TS_LOCKED_BIT
}

pub fn is_locked(ts: TxnTs) -> bool {
    ts != ABORTED_TXN_TS && ts & TXN_TS_LOCKED_BIT != 0
}

pub fn strip_locked(ts: TxnTs) -> TxnTs {
    ts & !TXN_TS_LOCKED_BIT
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnType {
    ReadOnly,
    ReadWrite,
}

/// Concurrency control protocol of a database instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CcProtocol {
    /// Hekaton-style optimistic concurrency control.
    Occ,
    /// Two-phase locking, read-committed serialized through row locks.
    TwoPl,
}

/// Where row locks live. The three strategies are observable-equivalent; the
/// choice only affects contention behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockManagerType {
    /// One sharded lock table shared by the whole database.
    Centralized,
    /// A lock table per page.
    Decentralized,
    /// Per-row latches. Served by the per-page table; see DESIGN.md.
    Inlined,
}

impl Default for LockManagerType {
    fn default() -> Self {
        LockManagerType::Centralized
    }
}

/// Per-transaction behavior knobs, fixed at `begin`.
#[derive(Clone, Debug)]
pub struct TxnOptions {
    /// Read-only transactions may bypass intent visibility and fall through
    /// to the latest committed version.
    pub ignore_lock: bool,
    /// Collapse the delta chain after every mutation.
    pub force_compaction: bool,
    /// Commit waits until the WAL has persisted the commit record.
    pub sync_commit: bool,
    /// Writers fail fast with `TxnConflict` when the newest version of the
    /// key is a foreign intent.
    pub check_intent_locked: bool,
    pub lock_manager: LockManagerType,
    pub enable_wal: bool,
    pub enable_flush: bool,
    /// Commit fast path: the transaction writes at most one edge and skips
    /// read-set recording and validation.
    pub only_single_edge_txn: bool,
}

impl Default for TxnOptions {
    fn default() -> Self {
        TxnOptions {
            ignore_lock: false,
            force_compaction: false,
            sync_commit: false,
            check_intent_locked: false,
            lock_manager: LockManagerType::default(),
            enable_wal: true,
            enable_flush: true,
            only_single_edge_txn: false,
        }
    }
}

/// A row surfaced by a transactional read: either a kept-alive view into a
/// page's delta chain, or bytes owned by the transaction's own write buffer.
pub enum TxnRowView {
    Page(RowView),
    Owned(Vec<u8>),
}

impl TxnRowView {
    pub fn row(&self) -> Row<'_> {
        match self {
            TxnRowView::Page(view) => view.row(),
            TxnRowView::Owned(bytes) => Row::new(bytes),
        }
    }

    /// The write timestamp of the version read, when it came from a page.
    pub fn ts(&self) -> Option<TxnTs> {
        match self {
            TxnRowView::Page(view) => Some(view.ts()),
            TxnRowView::Owned(_) => None,
        }
    }
}

/// A transaction context routing reads and writes through the page layer.
///
/// `commit_or_abort` consumes the transaction logically: afterwards only
/// `Drop` is expected. Outcomes map onto the error surface: `Ok(())` is a
/// commit, `Err(TxnAbort)` a validation/intent failure, `Err(TxnConflict)` a
/// fail-fast write-write conflict, `Err(Timeout)` a lock timeout.
pub trait TxnContext: Send {
    fn set_row(&mut self, page_id: &str, row: Row<'_>) -> CResult<()>;

    fn delete_row(&mut self, page_id: &str, sort_key: SortKeyRef<'_>) -> CResult<()>;

    fn get_row(&mut self, page_id: &str, sort_key: SortKeyRef<'_>) -> CResult<TxnRowView>;

    /// Sorted scan over every live row of a page visible to this transaction,
    /// including the transaction's own buffered writes.
    fn scan(&mut self, page_id: &str) -> CResult<Vec<TxnRowView>>;

    fn commit_or_abort(&mut self) -> CResult<()>;

    fn read_ts(&self) -> TxnTs;

    fn txn_type(&self) -> TxnType;

    fn txn_id(&self) -> TxnId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_bit_roundtrip() {
        assert!(is_locked(mark_locked(7)));
        assert_eq!(strip_locked(mark_locked(7)), 7);
        assert!(!is_locked(7));
        assert!(!is_locked(MAX_TXN_TS));
    }

    #[test]
    fn aborted_ts_is_not_a_lock() {
        // The aborted sentinel carries the high bit but must never be treated
        // as someone's intent.
        assert!(!is_locked(ABORTED_TXN_TS));
    }

    #[test]
    fn locked_ts_is_never_visible_to_plain_readers() {
        assert!(mark_locked(1) > MAX_TXN_TS);
        assert!(ABORTED_TXN_TS > MAX_TXN_TS);
    }
}
