//! Pages: versioned delta chains under a bw-tree style leaf.

mod delta;
mod leaf;
mod snapshot;
mod tree;

pub use delta::{DeltaNode, DeltaNodeBuilder};
pub use leaf::LeafPage;
pub use snapshot::PageSnapshot;
pub use tree::{PageType, TreePage};

use std::sync::Arc;

use crate::row::Row;
use crate::txn::{TxnId, TxnTs};
use crate::wal::{LogStore, Lsn};

/// Per-operation options threaded from the transaction layer into page code.
#[derive(Clone, Default)]
pub struct Options {
    pub txn_id: TxnId,
    /// Intents whose stripped timestamp equals `owner_ts` belong to the
    /// calling transaction and are skipped rather than reported as conflicts.
    pub owner_ts: Option<TxnTs>,
    /// Skip foreign intents instead of failing with `TxnConflict`. Only legal
    /// for read-only transactions holding a granted snapshot ts.
    pub ignore_lock: bool,
    pub disable_compaction: bool,
    /// Collapse the chain right after this mutation.
    pub force_compaction: bool,
    /// Fail the write fast when the newest version of the key is a foreign
    /// intent.
    pub check_intent_locked: bool,
    /// WAL sink; mutations are logged before they are published.
    pub log_store: Option<Arc<LogStore>>,
}

/// The result of a write: the WAL position it was assigned, zero when the
/// WAL is disabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteInfo {
    pub lsn: Lsn,
}

/// A row read out of a page. Keeps the backing [`DeltaNode`] alive so the
/// borrowed bytes outlive subsequent mutations and compactions of the page.
pub struct RowView {
    owner: Arc<DeltaNode>,
    offset: usize,
    in_versions: bool,
    ts: TxnTs,
}

impl RowView {
    pub(crate) fn new(owner: Arc<DeltaNode>, offset: usize, in_versions: bool, ts: TxnTs) -> Self {
        RowView { owner, offset, in_versions, ts }
    }

    pub fn row(&self) -> Row<'_> {
        let buf = if self.in_versions { self.owner.version_buffer() } else { self.owner.buffer() };
        Row::new(&buf[self.offset..])
    }

    /// Write timestamp of the version read.
    pub fn ts(&self) -> TxnTs {
        self.ts
    }
}

/// Scan behavior for [`LeafPage::range_filter`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanOptions {
    /// Yield rows in sort-key order. Unsorted mode yields keys in the order
    /// the chain walk encounters them; only valid when the caller does not
    /// require order.
    pub sorted: bool,
}
