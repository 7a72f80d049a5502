use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::config;
use crate::error::{CResult, Error};
use crate::page::delta::Lookup;
use crate::page::{DeltaNode, DeltaNodeBuilder, Options, PageSnapshot, RowView, ScanOptions, WriteInfo};
use crate::row::{Row, SortKey, SortKeyRef};
use crate::txn::{is_locked, strip_locked, LockTable, TxnTs};
use crate::wal::{LogPayload, Lsn};

/// A bw-tree leaf: a page key mapped to a chain of versioned delta nodes.
///
/// Writers serialize on the page write latch. Readers never take it: they grab
/// a kept-alive snapshot of the head pointer and walk the chain, so a
/// concurrent publish or compaction cannot pull rows out from under them.
/// Publishing is always prepend-then-swap: the new node's `previous` is set to
/// the current head before the head moves.
pub struct LeafPage {
    page_id: String,
    write_mu: Mutex<()>,
    head: ArcSwapOption<DeltaNode>,
    /// Row locks for the decentralized lock manager strategy.
    lock_table: LockTable,
    /// WAL position covering every update applied to this page.
    lsn: AtomicU64,
    flushed_lsn: AtomicU64,
    /// Bumped by every mutation; lets the flusher detect re-dirtying even
    /// when the WAL is disabled.
    epoch: AtomicU64,
    dirty: AtomicBool,
    in_flusher: AtomicBool,
}

impl LeafPage {
    pub fn new(page_id: impl Into<String>) -> LeafPage {
        LeafPage {
            page_id: page_id.into(),
            write_mu: Mutex::new(()),
            head: ArcSwapOption::from(None),
            lock_table: LockTable::new(),
            lsn: AtomicU64::new(0),
            flushed_lsn: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            in_flusher: AtomicBool::new(false),
        }
    }

    pub fn page_id(&self) -> &str {
        &self.page_id
    }

    /// Upserts `row` at `write_ts`. A row with the same sort key is
    /// overwritten; the superseded version stays reachable for readers below
    /// `write_ts`.
    pub fn set_row(&self, row: Row<'_>, write_ts: TxnTs, opts: &Options) -> CResult<WriteInfo> {
        let _guard = self.write_mu.lock();
        if opts.check_intent_locked {
            self.check_intent(row.sort_key(), write_ts)?;
        }
        let info = self.log_write(opts, || LogPayload::SetRow {
            txn_id: opts.txn_id,
            page_id: self.page_id.clone(),
            write_ts,
            row: row.as_slice().to_vec(),
        })?;
        let delta = DeltaNode::new_single_set(row, write_ts);
        self.publish(delta, opts);
        Ok(info)
    }

    /// Writes a tombstone for `sort_key` at `write_ts`.
    pub fn delete_row(
        &self,
        sort_key: SortKeyRef<'_>,
        write_ts: TxnTs,
        opts: &Options,
    ) -> CResult<WriteInfo> {
        let _guard = self.write_mu.lock();
        if opts.check_intent_locked {
            self.check_intent(sort_key, write_ts)?;
        }
        let info = self.log_write(opts, || LogPayload::DeleteRow {
            txn_id: opts.txn_id,
            page_id: self.page_id.clone(),
            write_ts,
            sort_key: sort_key.as_slice().to_vec(),
        })?;
        let delta = DeltaNode::new_single_delete(sort_key, write_ts);
        self.publish(delta, opts);
        Ok(info)
    }

    /// Rewrites the newest version of `sort_key` to `target_ts` in place:
    /// commit stamps intents with their commit ts, abort stamps them with
    /// the aborted sentinel.
    pub fn set_ts(
        &self,
        sort_key: SortKeyRef<'_>,
        target_ts: TxnTs,
        opts: &Options,
    ) -> CResult<WriteInfo> {
        let _guard = self.write_mu.lock();
        let info = self.log_write(opts, || LogPayload::SetTs {
            txn_id: opts.txn_id,
            page_id: self.page_id.clone(),
            commit_ts: target_ts,
            sort_key: sort_key.as_slice().to_vec(),
        })?;
        let mut current = self.head.load_full();
        let mut stamped = false;
        while let Some(node) = current {
            if node.stamp_newest(sort_key, target_ts) {
                stamped = true;
                break;
            }
            current = node.previous().cloned();
        }
        if !stamped {
            return Err(Error::Internal(format!(
                "set_ts on page {} found no version for the key",
                self.page_id
            )));
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
        Ok(info)
    }

    /// Reads the newest version of `sort_key` visible at `read_ts`.
    ///
    /// Walking head to tail, the first version at or below `read_ts` wins.
    /// A foreign intent on the key surfaces as `TxnConflict` unless
    /// `opts.ignore_lock` is set; the intents of `opts.owner_ts` itself are
    /// skipped, so a validating transaction reads what it read before its own
    /// writes. A visible tombstone surfaces as `Deleted`.
    pub fn get_row(
        &self,
        sort_key: SortKeyRef<'_>,
        read_ts: TxnTs,
        opts: &Options,
    ) -> CResult<RowView> {
        let mut current = self.head.load_full();
        while let Some(node) = current {
            match node.point_lookup(sort_key, read_ts, opts.owner_ts, opts.ignore_lock) {
                Lookup::Found { offset, in_versions, ts } => {
                    return Ok(RowView::new(node, offset, in_versions, ts))
                }
                Lookup::Deleted => return Err(Error::Deleted),
                Lookup::Conflict => return Err(Error::TxnConflict),
                Lookup::Miss => current = node.previous().cloned(),
            }
        }
        Err(Error::NotFound)
    }

    /// Folds the chain into the set of live rows visible at `read_ts`,
    /// applying `filter`. Sorted mode yields sort-key-ascending order;
    /// unsorted mode yields keys as the chain walk encounters them.
    pub fn range_filter<F: Fn(Row<'_>) -> bool>(
        &self,
        read_ts: TxnTs,
        opts: &Options,
        scan_opts: ScanOptions,
        filter: F,
    ) -> CResult<Vec<RowView>> {
        let mut decided: BTreeMap<SortKey, Option<RowView>> = BTreeMap::new();
        let mut encounter_order: Vec<SortKey> = Vec::new();
        let mut current = self.head.load_full();
        while let Some(node) = current {
            for index in 0..node.len() {
                let key = node.row_at(index).sort_key().to_owned();
                if decided.contains_key(&key) {
                    continue;
                }
                match node.lookup_at(index, read_ts, opts.owner_ts, opts.ignore_lock) {
                    Lookup::Found { offset, in_versions, ts } => {
                        let view = RowView::new(node.clone(), offset, in_versions, ts);
                        decided.insert(key.clone(), Some(view));
                        encounter_order.push(key);
                    }
                    Lookup::Deleted => {
                        decided.insert(key.clone(), None);
                        encounter_order.push(key);
                    }
                    Lookup::Conflict => return Err(Error::TxnConflict),
                    Lookup::Miss => {}
                }
            }
            current = node.previous().cloned();
        }

        let views = if scan_opts.sorted {
            decided.into_values().flatten().filter(|view| filter(view.row())).collect()
        } else {
            encounter_order
                .into_iter()
                .filter_map(|key| decided.remove(&key).flatten())
                .filter(|view| filter(view.row()))
                .collect()
        };
        Ok(views)
    }

    /// Captures the current head and LSN. The snapshot keeps the whole chain
    /// alive until dropped.
    pub fn get_page_snapshot(&self) -> PageSnapshot {
        let _guard = self.write_mu.lock();
        PageSnapshot::new(
            self.head.load_full(),
            self.lsn.load(Ordering::Acquire),
            self.epoch.load(Ordering::Acquire),
        )
    }

    /// Replaces the page content with a deserialized snapshot; the page LSN
    /// becomes the snapshot's LSN. Used when loading the base blob.
    pub fn install_snapshot(&self, data: &[u8]) -> CResult<()> {
        let (node, lsn) = PageSnapshot::deserialize(data)?;
        let _guard = self.write_mu.lock();
        self.head.store(node.map(Arc::new));
        self.lsn.store(lsn, Ordering::Release);
        self.flushed_lsn.store(lsn, Ordering::Release);
        Ok(())
    }

    /// Prepends a deserialized delta blob on top of the current content.
    /// Blobs must be applied oldest first.
    pub fn prepend_delta_blob(&self, data: &[u8]) -> CResult<()> {
        let (node, lsn) = PageSnapshot::deserialize(data)?;
        let _guard = self.write_mu.lock();
        if let Some(mut node) = node {
            node.set_previous(self.head.load_full());
            self.head.store(Some(Arc::new(node)));
        }
        let current = self.lsn.load(Ordering::Acquire);
        self.lsn.store(current.max(lsn), Ordering::Release);
        self.flushed_lsn.store(current.max(lsn), Ordering::Release);
        Ok(())
    }

    /// Current delta chain depth; introspection for tests and debugging.
    pub fn delta_length(&self) -> usize {
        self.head.load_full().map_or(0, |node| node.total_length())
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn.load(Ordering::Acquire)
    }

    /// Raises the page LSN without logging; recovery replay uses this so a
    /// later flush does not regress below already-replayed records.
    pub fn advance_lsn(&self, lsn: Lsn) {
        let mut current = self.lsn.load(Ordering::Acquire);
        while current < lsn {
            match self.lsn.compare_exchange(current, lsn, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// A page can leave the cache only when no update is waiting on or inside
    /// the flusher.
    pub fn is_evictable(&self) -> bool {
        !self.dirty.load(Ordering::Acquire) && !self.in_flusher.load(Ordering::Acquire)
    }

    /// Claims the in-flusher flag; only the winning caller enqueues the page.
    pub fn try_mark_in_flusher(&self) -> bool {
        self.in_flusher
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Called by the flusher once a snapshot has been persisted. Returns true
    /// when the page was re-dirtied during the flush and must be re-enqueued;
    /// in that case the in-flusher flag stays claimed.
    pub fn finish_flush(&self, snapshot: &PageSnapshot) -> bool {
        let _guard = self.write_mu.lock();
        self.flushed_lsn.store(snapshot.lsn(), Ordering::Release);
        if self.epoch.load(Ordering::Acquire) != snapshot.epoch() {
            return true;
        }
        self.dirty.store(false, Ordering::Release);
        self.in_flusher.store(false, Ordering::Release);
        false
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.lock_table
    }

    fn log_write(
        &self,
        opts: &Options,
        payload: impl FnOnce() -> LogPayload,
    ) -> CResult<WriteInfo> {
        let mut info = WriteInfo::default();
        if let Some(log_store) = &opts.log_store {
            let range = log_store.append(&[payload().encode()])?[0];
            // The page LSN is raised before the new content becomes visible,
            // so a concurrent flush snapshot can only over-wait, never
            // under-wait, on the WAL.
            self.advance_lsn(range.end_lsn);
            info.lsn = range.end_lsn;
        }
        Ok(info)
    }

    /// Prepend-then-swap publication of a freshly built node, followed by the
    /// compaction policy.
    fn publish(&self, mut delta: DeltaNode, opts: &Options) {
        delta.set_previous(self.head.load_full());
        let delta = Arc::new(delta);
        self.head.store(Some(delta.clone()));
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
        self.maybe_compact(opts, &delta);
    }

    /// Writers may not stack intents over a foreign one when
    /// `check_intent_locked` is requested.
    fn check_intent(&self, sort_key: SortKeyRef<'_>, write_ts: TxnTs) -> CResult<()> {
        let mut current = self.head.load_full();
        while let Some(node) = current {
            if let Some(ts) = node.newest_ts_of(sort_key) {
                if is_locked(ts) && strip_locked(ts) != strip_locked(write_ts) {
                    return Err(Error::TxnConflict);
                }
                return Ok(());
            }
            current = node.previous().cloned();
        }
        Ok(())
    }

    fn maybe_compact(&self, opts: &Options, head: &Arc<DeltaNode>) {
        if opts.disable_compaction {
            return;
        }
        if !opts.force_compaction && head.total_length() <= config::BWTREE_DELTA_CHAIN_LENGTH {
            return;
        }
        let mut builder = DeltaNodeBuilder::new();
        let mut current: Option<Arc<DeltaNode>> = Some(head.clone());
        while let Some(node) = current {
            builder.add_delta_node(&node);
            current = node.previous().cloned();
        }
        let delta_count = builder.delta_count();
        let compacted = builder.generate();
        log::debug!(
            "compacted page {}: {} deltas into {} rows",
            self.page_id,
            delta_count,
            compacted.len()
        );
        // The old head stays reachable through any snapshot a reader already
        // captured; it drains once those readers finish.
        self.head.store(Some(Arc::new(compacted)));
    }
}
