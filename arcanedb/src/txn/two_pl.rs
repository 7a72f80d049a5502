use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::cache::PageHolder;
use crate::error::{CResult, Error};
use crate::page::{Options, ScanOptions};
use crate::row::{Row, SortKey, SortKeyRef};
use crate::txn::occ::composite_key;
use crate::txn::{
    LockManagerType, TxnContext, TxnId, TxnManager, TxnOptions, TxnRowView, TxnTs, TxnType,
};
use crate::wal::Lsn;

/// A two-phase-locking transaction: read committed, serialized through row
/// locks.
///
/// Read-write transactions take the row lock on first touch of each key,
/// reads included, and write straight to the pages at `txn_ts`. Read-only
/// transactions skip locks entirely and read at their snapshot timestamp.
/// Commit releases every lock and retires the timestamp; there is no
/// validation phase.
pub struct TxnContext2Pl {
    txn_id: TxnId,
    /// The snapshot ts for read-only transactions, the write ts otherwise.
    txn_ts: TxnTs,
    txn_type: TxnType,
    opts: TxnOptions,
    manager: Arc<TxnManager>,
    pages: HashMap<String, PageHolder>,
    lock_set: HashSet<(String, SortKey)>,
    last_lsn: Lsn,
    /// Set when a lock acquisition timed out; the commit turns into an abort.
    poisoned: bool,
    finished: bool,
}

impl TxnContext2Pl {
    pub(crate) fn new(
        txn_id: TxnId,
        txn_ts: TxnTs,
        txn_type: TxnType,
        opts: TxnOptions,
        manager: Arc<TxnManager>,
    ) -> TxnContext2Pl {
        TxnContext2Pl {
            txn_id,
            txn_ts,
            txn_type,
            opts,
            manager,
            pages: HashMap::new(),
            lock_set: HashSet::new(),
            last_lsn: 0,
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
            force_compaction: self.opts.force_compaction,
            log_store: if self.opts.enable_wal {
                self.manager.db_context().log_store.clone()
            } else {
                None
            },
            ..Options::default()
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

    fn mark_dirty(&self, holder: &PageHolder) {
        if self.opts.enable_flush {
            self.manager.db_context().buffer_pool.try_insert_dirty_page(holder);
        }
    }
}

impl TxnContext for TxnContext2Pl {
    fn set_row(&mut self, page_id: &str, row: Row<'_>) -> CResult<()> {
        if self.txn_type == TxnType::ReadOnly {
            return Err(Error::Internal("write in a read-only transaction".to_owned()));
        }
        self.acquire_lock(page_id, row.sort_key())?;
        let holder = self.ensure_page(page_id)?;
        let info = holder.set_row(row, self.txn_ts, &self.page_opts())?;
        self.last_lsn = self.last_lsn.max(info.lsn);
        self.mark_dirty(&holder);
        Ok(())
    }

    fn delete_row(&mut self, page_id: &str, sort_key: SortKeyRef<'_>) -> CResult<()> {
        if self.txn_type == TxnType::ReadOnly {
            return Err(Error::Internal("write in a read-only transaction".to_owned()));
        }
        self.acquire_lock(page_id, sort_key)?;
        let holder = self.ensure_page(page_id)?;
        let info = holder.delete_row(sort_key, self.txn_ts, &self.page_opts())?;
        self.last_lsn = self.last_lsn.max(info.lsn);
        self.mark_dirty(&holder);
        Ok(())
    }

    fn get_row(&mut self, page_id: &str, sort_key: SortKeyRef<'_>) -> CResult<TxnRowView> {
        let mut opts = self.page_opts();
        if self.txn_type == TxnType::ReadWrite {
            self.acquire_lock(page_id, sort_key)?;
        } else {
            opts.ignore_lock = self.opts.ignore_lock;
        }
        let view = self
            .ensure_page(page_id)?
            .get_row(sort_key, self.txn_ts, &opts)
            .map_err(not_found)?;
        Ok(TxnRowView::Page(view))
    }

    fn scan(&mut self, page_id: &str) -> CResult<Vec<TxnRowView>> {
        let mut opts = self.page_opts();
        if self.txn_type == TxnType::ReadOnly {
            opts.ignore_lock = self.opts.ignore_lock;
        }
        let holder = self.ensure_page(page_id)?;
        let views =
            holder.range_filter(self.txn_ts, &opts, ScanOptions { sorted: true }, |_| true)?;
        Ok(views.into_iter().map(TxnRowView::Page).collect())
    }

    fn commit_or_abort(&mut self) -> CResult<()> {
        if self.finished {
            return Err(Error::Internal("transaction already finished".to_owned()));
        }
        self.finished = true;
        if self.txn_type == TxnType::ReadOnly {
            return Ok(());
        }
        if !self.poisoned && self.opts.sync_commit {
            if let Some(log_store) = &self.manager.db_context().log_store {
                log_store.wait_for_persist(self.last_lsn);
            }
        }
        self.release_locks();
        self.manager.retire_ts(self.txn_ts);
        if self.poisoned {
            return Err(Error::TxnAbort);
        }
        Ok(())
    }

    fn read_ts(&self) -> TxnTs {
        self.txn_ts
    }

    fn txn_type(&self) -> TxnType {
        self.txn_type
    }

    fn txn_id(&self) -> TxnId {
        self.txn_id
    }
}

impl Drop for TxnContext2Pl {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.release_locks();
        if self.txn_type == TxnType::ReadWrite {
            self.manager.retire_ts(self.txn_ts);
        }
    }
}

fn not_found(err: Error) -> Error {
    if err == Error::Deleted {
        Error::NotFound
    } else {
        err
    }
}
