use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::cache::PageHolder;
use crate::error::{CResult, Error};
use crate::page::{Options, ScanOptions};
use crate::row::{Row, SortKey, SortKeyRef};
use crate::txn::{
    mark_locked, LockManagerType, TxnContext, TxnId, TxnManager, TxnOptions, TxnRowView, TxnTs,
    TxnType, ABORTED_TXN_TS,
};
use crate::wal::{LogPayload, Lsn};

type RowKey = (String, SortKey);

/// A Hekaton-style optimistic transaction.
///
/// Writes are buffered in a transaction-owned write set and only touch pages
/// at commit, as intents carrying `mark_locked(read_ts)`. Reads go to the
/// pages at `read_ts` and record the observed version timestamp. Commit runs
/// the four-step protocol: write intents, acquire a commit timestamp,
/// validate the read set at that timestamp, then stamp the intents with it.
/// Any failure stamps the written intents aborted instead. Row locks are
/// taken on first touch per key and always released, on every path.
pub struct TxnContextOcc {
    txn_id: TxnId,
    read_ts: TxnTs,
    txn_type: TxnType,
    opts: TxnOptions,
    manager: Arc<TxnManager>,
    pages: HashMap<String, PageHolder>,
    /// `None` values are deletes. Row bytes are copied into the transaction
    /// so they outlive whatever buffer the caller handed in.
    write_set: HashMap<RowKey, Option<Vec<u8>>>,
    /// Version timestamps observed by reads against the real pages; `None`
    /// records a read that found nothing.
    read_set: HashMap<RowKey, Option<TxnTs>>,
    lock_set: HashSet<RowKey>,
    /// Set when a lock acquisition failed; the commit turns into an abort.
    poisoned: bool,
    finished: bool,
}

impl TxnContextOcc {
    pub(crate) fn new(
        txn_id: TxnId,
        read_ts: TxnTs,
        txn_type: TxnType,
        opts: TxnOptions,
        manager: Arc<TxnManager>,
    ) -> TxnContextOcc {
        TxnContextOcc {
            txn_id,
            read_ts,
            txn_type,
            opts,
            manager,
            pages: HashMap::new(),
            write_set: HashMap::new(),
            read_set: HashMap::new(),
            lock_set: HashSet::new(),
            poisoned: false,
            finished: false,
        }
    }

    fn ensure_page(&mut self, page_id: &str) -> CResult<PageHolder> {
        if let Some(holder) = self.pages.get(page_id) {
            return Ok(holder.clone());
        }
        let holder = self.manager.db_context().buffer_pool.get_page(page_id)?;
        self.pages.insert(page_id.to_owned(), holder.clone());
        Ok(holder)
    }

    fn page_opts(&self) -> Options {
        Options {
            txn_id: self.txn_id,
            owner_ts: None,
            ignore_lock: false,
            disable_compaction: false,
            force_compaction: self.opts.force_compaction,
            check_intent_locked: self.opts.check_intent_locked,
            log_store: if self.opts.enable_wal {
                self.manager.db_context().log_store.clone()
            } else {
                None
            },
        }
    }

    fn acquire_lock(&mut self, page_id: &str, sort_key: SortKeyRef<'_>) -> CResult<()> {
        let key = (page_id.to_owned(), sort_key.to_owned());
        if self.lock_set.contains(&key) {
            return Ok(());
        }
        let result = match self.opts.lock_manager {
            LockManagerType::Centralized => {
                self.manager.lock_table().lock(&composite_key(page_id, sort_key), self.txn_id)
            }
            LockManagerType::Decentralized | LockManagerType::Inlined => {
                self.ensure_page(page_id)?.lock_table().lock(sort_key.as_slice(), self.txn_id)
            }
        };
        match result {
            Ok(()) => {
                self.lock_set.insert(key);
                Ok(())
            }
            Err(err) => {
                self.poisoned = true;
                Err(err)
            }
        }
    }

    fn release_locks(&mut self) {
        for (page_id, sort_key) in std::mem::take(&mut self.lock_set) {
            let result = match self.opts.lock_manager {
                LockManagerType::Centralized => self
                    .manager
                    .lock_table()
                    .unlock(&composite_key(&page_id, sort_key.as_ref()), self.txn_id),
                LockManagerType::Decentralized | LockManagerType::Inlined => {
                    match self.pages.get(&page_id) {
                        Some(holder) => {
                            holder.lock_table().unlock(sort_key.as_slice(), self.txn_id)
                        }
                        None => Err(Error::Internal("lock held on an unknown page".to_owned())),
                    }
                }
            };
            if let Err(err) = result {
                log::error!("txn {} failed to release a row lock: {}", self.txn_id, err);
            }
        }
    }

    fn log_occ_record(&self, payload: LogPayload) -> CResult<Lsn> {
        match (&self.manager.db_context().log_store, self.opts.enable_wal) {
            (Some(log_store), true) => Ok(log_store.append(&[payload.encode()])?[0].end_lsn),
            _ => Ok(0),
        }
    }

    fn write_intents(&mut self, written: &mut Vec<RowKey>) -> CResult<()> {
        let keys: Vec<RowKey> = self.write_set.keys().cloned().collect();
        let opts = self.page_opts();
        for key in keys {
            let holder = self.ensure_page(&key.0)?;
            let value = self.write_set.get(&key).cloned().flatten();
            let write_ts = mark_locked(self.read_ts);
            match value {
                Some(bytes) => holder.set_row(Row::new(&bytes), write_ts, &opts)?,
                None => holder.delete_row(key.1.as_ref(), write_ts, &opts)?,
            };
            written.push(key);
        }
        Ok(())
    }

    /// Re-reads every recorded read at `commit_ts`, with our own intents
    /// counting as the previously read value. The commit is serializable only
    /// if every observation is unchanged.
    fn validate_reads(&mut self, commit_ts: TxnTs) -> CResult<bool> {
        let entries: Vec<(RowKey, Option<TxnTs>)> =
            self.read_set.iter().map(|(k, v)| (k.clone(), *v)).collect();
        let opts = Options { owner_ts: Some(self.read_ts), ..self.page_opts() };
        for ((page_id, sort_key), expected) in entries {
            let holder = self.ensure_page(&page_id)?;
            let result = holder.get_row(sort_key.as_ref(), commit_ts, &opts);
            let matches = match (&expected, &result) {
                (Some(ts), Ok(view)) => view.ts() == *ts,
                (None, Err(err)) => err.is_not_found(),
                _ => false,
            };
            if !matches {
                log::info!(
                    "txn {} read validation failed on page {} (expected {:?})",
                    self.txn_id,
                    page_id,
                    expected
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn commit_intents(&mut self, commit_ts: TxnTs) -> CResult<()> {
        let keys: Vec<RowKey> = self.write_set.keys().cloned().collect();
        let opts = self.page_opts();
        for (page_id, sort_key) in keys {
            let holder = self.ensure_page(&page_id)?;
            holder.set_ts(sort_key.as_ref(), commit_ts, &opts)?;
        }
        Ok(())
    }

    fn abort_intents(&mut self, written: &[RowKey]) {
        let opts = self.page_opts();
        for (page_id, sort_key) in written {
            let result = match self.pages.get(page_id) {
                Some(holder) => holder.set_ts(sort_key.as_ref(), ABORTED_TXN_TS, &opts),
                None => Err(Error::Internal("intent written to an unknown page".to_owned())),
            };
            if let Err(err) = result {
                log::error!(
                    "txn {} failed to abort an intent on page {}: {}",
                    self.txn_id,
                    page_id,
                    err
                );
            }
        }
        if let Err(err) = self.log_occ_record(LogPayload::OccAbort { txn_id: self.txn_id }) {
            log::error!("txn {} failed to log its abort: {}", self.txn_id, err);
        }
    }

    fn commit_inner(&mut self) -> CResult<()> {
        if self.poisoned {
            return Err(Error::TxnAbort);
        }
        self.log_occ_record(LogPayload::OccBegin { txn_id: self.txn_id, read_ts: self.read_ts })?;

        let mut written = Vec::new();
        if let Err(err) = self.write_intents(&mut written) {
            self.abort_intents(&written);
            // Fail-fast conflicts surface as-is so callers can retry.
            return match err {
                Error::TxnConflict | Error::Timeout => Err(err),
                _ => Err(Error::TxnAbort),
            };
        }

        let commit_ts = self.manager.request_ts();

        if !self.opts.only_single_edge_txn && !self.validate_reads(commit_ts).unwrap_or(false) {
            self.abort_intents(&written);
            return Err(Error::TxnAbort);
        }

        // The durable commit record is the commit point; stamping the intents
        // below is redone by recovery if we crash in between.
        let commit_lsn =
            self.log_occ_record(LogPayload::OccCommit { txn_id: self.txn_id, commit_ts })?;
        if self.opts.sync_commit {
            if let Some(log_store) = &self.manager.db_context().log_store {
                log_store.wait_for_persist(commit_lsn);
            }
        }

        if let Err(err) = self.commit_intents(commit_ts) {
            log::error!("txn {} failed to stamp a committed intent: {}", self.txn_id, err);
            return Err(err);
        }
        Ok(())
    }

    fn enqueue_dirty_pages(&self) {
        if !self.opts.enable_flush {
            return;
        }
        let pool = &self.manager.db_context().buffer_pool;
        for holder in self.pages.values() {
            if holder.is_dirty() {
                pool.try_insert_dirty_page(holder);
            }
        }
    }
}

impl TxnContext for TxnContextOcc {
    fn set_row(&mut self, page_id: &str, row: Row<'_>) -> CResult<()> {
        if self.txn_type == TxnType::ReadOnly {
            return Err(Error::Internal("write in a read-only transaction".to_owned()));
        }
        self.acquire_lock(page_id, row.sort_key())?;
        self.write_set
            .insert((page_id.to_owned(), row.sort_key().to_owned()), Some(row.as_slice().to_vec()));
        Ok(())
    }

    fn delete_row(&mut self, page_id: &str, sort_key: SortKeyRef<'_>) -> CResult<()> {
        if self.txn_type == TxnType::ReadOnly {
            return Err(Error::Internal("write in a read-only transaction".to_owned()));
        }
        self.acquire_lock(page_id, sort_key)?;
        self.write_set.insert((page_id.to_owned(), sort_key.to_owned()), None);
        Ok(())
    }

    fn get_row(&mut self, page_id: &str, sort_key: SortKeyRef<'_>) -> CResult<TxnRowView> {
        if self.txn_type == TxnType::ReadOnly {
            let opts = Options { ignore_lock: self.opts.ignore_lock, ..self.page_opts() };
            let view = self
                .ensure_page(page_id)?
                .get_row(sort_key, self.read_ts, &opts)
                .map_err(|err| if err == Error::Deleted { Error::NotFound } else { err })?;
            return Ok(TxnRowView::Page(view));
        }

        // Our own buffered writes win over everything on the page.
        let key = (page_id.to_owned(), sort_key.to_owned());
        if let Some(buffered) = self.write_set.get(&key) {
            return match buffered {
                Some(bytes) => Ok(TxnRowView::Owned(bytes.clone())),
                None => Err(Error::NotFound),
            };
        }

        // The read set records what we saw on the real page, not in the
        // write buffer; validation replays exactly these observations.
        let opts = self.page_opts();
        let holder = self.ensure_page(page_id)?;
        match holder.get_row(sort_key, self.read_ts, &opts) {
            Ok(view) => {
                if !self.opts.only_single_edge_txn {
                    self.read_set.insert(key, Some(view.ts()));
                }
                Ok(TxnRowView::Page(view))
            }
            Err(err) if err.is_not_found() => {
                if !self.opts.only_single_edge_txn {
                    self.read_set.insert(key, None);
                }
                Err(Error::NotFound)
            }
            Err(err) => Err(err),
        }
    }

    fn scan(&mut self, page_id: &str) -> CResult<Vec<TxnRowView>> {
        let opts = match self.txn_type {
            TxnType::ReadOnly => Options { ignore_lock: self.opts.ignore_lock, ..self.page_opts() },
            TxnType::ReadWrite => Options { owner_ts: Some(self.read_ts), ..self.page_opts() },
        };
        let holder = self.ensure_page(page_id)?;
        let views =
            holder.range_filter(self.read_ts, &opts, ScanOptions { sorted: true }, |_| true)?;

        if self.txn_type == TxnType::ReadOnly || self.write_set.is_empty() {
            return Ok(views.into_iter().map(TxnRowView::Page).collect());
        }

        // Overlay our buffered writes for this page.
        let mut merged: std::collections::BTreeMap<SortKey, TxnRowView> = views
            .into_iter()
            .map(|view| (view.row().sort_key().to_owned(), TxnRowView::Page(view)))
            .collect();
        for ((write_page, sort_key), value) in &self.write_set {
            if write_page != page_id {
                continue;
            }
            match value {
                Some(bytes) => {
                    merged.insert(sort_key.clone(), TxnRowView::Owned(bytes.clone()));
                }
                None => {
                    merged.remove(sort_key);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    fn commit_or_abort(&mut self) -> CResult<()> {
        if self.finished {
            return Err(Error::Internal("transaction already finished".to_owned()));
        }
        self.finished = true;
        if self.txn_type == TxnType::ReadOnly {
            return Ok(());
        }
        let result = self.commit_inner();
        if let Err(err) = &result {
            log::info!("txn {} (read ts {}) did not commit: {}", self.txn_id, self.read_ts, err);
        }
        self.release_locks();
        self.manager.retire_ts(self.read_ts);
        self.enqueue_dirty_pages();
        result
    }

    fn read_ts(&self) -> TxnTs {
        self.read_ts
    }

    fn txn_type(&self) -> TxnType {
        self.txn_type
    }

    fn txn_id(&self) -> TxnId {
        self.txn_id
    }
}

impl Drop for TxnContextOcc {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // An abandoned transaction never wrote intents; releasing its locks
        // and retiring its timestamp is enough.
        self.release_locks();
        if self.txn_type == TxnType::ReadWrite {
            self.manager.retire_ts(self.read_ts);
        }
    }
}

pub(crate) fn composite_key(page_id: &str, sort_key: SortKeyRef<'_>) -> Vec<u8> {
    let mut key = Vec::with_capacity(page_id.len() + 1 + sort_key.as_slice().len());
    key.extend_from_slice(page_id.as_bytes());
    key.push(b'#');
    key.extend_from_slice(sort_key.as_slice());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BufferPool;
    use crate::row::{Column, Schema, Value, ValueType};
    use crate::txn::{CcProtocol, DbContext};

    fn manager() -> Arc<TxnManager> {
        let ctx = DbContext {
            buffer_pool: Arc::new(BufferPool::new(None, None).unwrap()),
            log_store: None,
        };
        Arc::new(TxnManager::new(CcProtocol::Occ, ctx))
    }

    fn schema() -> Schema {
        Schema::new(
            0,
            vec![
                Column::new(0, "id", ValueType::Int64),
                Column::new(1, "value", ValueType::String),
            ],
            1,
        )
        .unwrap()
    }

    fn row_bytes(id: i64, value: &str) -> Vec<u8> {
        Row::serialize(&[Value::Int64(id), Value::String(value)], &schema()).unwrap()
    }

    fn key(id: i64) -> SortKey {
        SortKey::new(&[Value::Int64(id)])
    }

    fn value_of(view: &TxnRowView) -> String {
        match view.row().get_prop(1, &schema()).unwrap() {
            crate::row::OwnedValue::String(value) => value,
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn reads_see_own_buffered_writes() -> CResult<()> {
        let manager = manager();
        let mut txn = manager.begin_rw_txn(TxnOptions::default());

        let bytes = row_bytes(1, "buffered");
        txn.set_row("t", Row::new(&bytes))?;
        assert_eq!(value_of(&txn.get_row("t", key(1).as_ref())?), "buffered");

        txn.delete_row("t", key(1).as_ref())?;
        assert_eq!(txn.get_row("t", key(1).as_ref()).err(), Some(Error::NotFound));
        txn.commit_or_abort()?;
        Ok(())
    }

    #[test]
    fn nothing_is_visible_before_commit() -> CResult<()> {
        let manager = manager();
        let mut writer = manager.begin_rw_txn(TxnOptions::default());
        let bytes = row_bytes(1, "pending");
        writer.set_row("t", Row::new(&bytes))?;

        let mut reader = manager.begin_ro_txn(TxnOptions { ignore_lock: true, ..TxnOptions::default() });
        assert_eq!(reader.get_row("t", key(1).as_ref()).err(), Some(Error::NotFound));

        writer.commit_or_abort()?;
        let mut reader = manager.begin_ro_txn(TxnOptions { ignore_lock: true, ..TxnOptions::default() });
        assert_eq!(value_of(&reader.get_row("t", key(1).as_ref())?), "pending");
        Ok(())
    }

    #[test]
    fn stale_read_aborts_validation() -> CResult<()> {
        let manager = manager();
        let mut setup = manager.begin_rw_txn(TxnOptions::default());
        let bytes = row_bytes(1, "v1");
        setup.set_row("t", Row::new(&bytes))?;
        setup.commit_or_abort()?;

        let mut stale = manager.begin_rw_txn(TxnOptions::default());
        stale.get_row("t", key(1).as_ref())?;

        let mut winner = manager.begin_rw_txn(TxnOptions::default());
        let bytes = row_bytes(1, "v2");
        winner.set_row("t", Row::new(&bytes))?;
        winner.commit_or_abort()?;

        assert_eq!(stale.commit_or_abort().err(), Some(Error::TxnAbort));
        Ok(())
    }

    #[test]
    fn existence_flip_aborts_validation() -> CResult<()> {
        let manager = manager();
        let mut observer = manager.begin_rw_txn(TxnOptions::default());
        assert_eq!(observer.get_row("t", key(5).as_ref()).err(), Some(Error::NotFound));

        let mut creator = manager.begin_rw_txn(TxnOptions::default());
        let bytes = row_bytes(5, "appeared");
        creator.set_row("t", Row::new(&bytes))?;
        creator.commit_or_abort()?;

        assert_eq!(observer.commit_or_abort().err(), Some(Error::TxnAbort));
        Ok(())
    }

    #[test]
    fn lock_timeout_poisons_the_transaction() -> CResult<()> {
        let manager = manager();
        let bytes = row_bytes(1, "held");

        let mut holder = manager.begin_rw_txn(TxnOptions::default());
        holder.set_row("t", Row::new(&bytes))?;

        let mut waiter = manager.begin_rw_txn(TxnOptions::default());
        assert_eq!(waiter.set_row("t", Row::new(&bytes)).err(), Some(Error::Timeout));
        // The timed out transaction can only abort now.
        assert_eq!(waiter.commit_or_abort().err(), Some(Error::TxnAbort));

        holder.commit_or_abort()?;
        Ok(())
    }

    #[test]
    fn read_only_transactions_reject_writes() {
        let manager = manager();
        let mut txn = manager.begin_ro_txn(TxnOptions::default());
        let bytes = row_bytes(1, "nope");
        assert!(txn.set_row("t", Row::new(&bytes)).is_err());
        assert!(txn.delete_row("t", key(1).as_ref()).is_err());
        txn.commit_or_abort().unwrap();
    }

    #[test]
    fn decentralized_locks_behave_like_centralized() -> CResult<()> {
        let manager = manager();
        let opts =
            TxnOptions { lock_manager: LockManagerType::Decentralized, ..TxnOptions::default() };
        let bytes = row_bytes(1, "per-page");

        let mut txn = manager.begin_rw_txn(opts.clone());
        txn.set_row("t", Row::new(&bytes))?;
        txn.commit_or_abort()?;

        let mut reader = manager.begin_ro_txn(opts);
        assert_eq!(value_of(&reader.get_row("t", key(1).as_ref())?), "per-page");
        Ok(())
    }

    #[test]
    fn scan_merges_buffered_writes_over_page_rows() -> CResult<()> {
        let manager = manager();
        let mut setup = manager.begin_rw_txn(TxnOptions::default());
        for id in [1i64, 2, 3] {
            let bytes = row_bytes(id, "committed");
            setup.set_row("t", Row::new(&bytes))?;
        }
        setup.commit_or_abort()?;

        let mut txn = manager.begin_rw_txn(TxnOptions::default());
        let bytes = row_bytes(2, "overwritten");
        txn.set_row("t", Row::new(&bytes))?;
        txn.delete_row("t", key(3).as_ref())?;
        let bytes = row_bytes(4, "fresh");
        txn.set_row("t", Row::new(&bytes))?;

        let values: Vec<String> = txn.scan("t")?.iter().map(value_of).collect();
        assert_eq!(values, vec!["committed", "overwritten", "fresh"]);
        txn.commit_or_abort()?;
        Ok(())
    }
}
