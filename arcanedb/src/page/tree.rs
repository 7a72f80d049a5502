use crate::error::{CResult, Error};
use crate::page::{LeafPage, Options, PageSnapshot, RowView, ScanOptions, WriteInfo};
use crate::row::{Row, SortKeyRef};
use crate::txn::{LockTable, TxnTs};
use crate::wal::Lsn;

/// What a page holds. Internal pages are reserved for the multi-level tree
/// and carry no behavior yet; the discriminator exists so callers and the
/// persisted format already distinguish the two.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageType {
    Leaf,
    Internal,
}

/// A page as the buffer pool sees it: the leaf/internal discriminator plus
/// the leaf implementation.
pub struct TreePage {
    page_type: PageType,
    leaf: LeafPage,
}

impl TreePage {
    pub fn new_leaf(page_id: impl Into<String>) -> TreePage {
        TreePage { page_type: PageType::Leaf, leaf: LeafPage::new(page_id) }
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn page_id(&self) -> &str {
        self.leaf.page_id()
    }

    fn leaf(&self) -> CResult<&LeafPage> {
        match self.page_type {
            PageType::Leaf => Ok(&self.leaf),
            PageType::Internal => {
                Err(Error::Internal("internal pages are not implemented".to_owned()))
            }
        }
    }

    pub fn set_row(&self, row: Row<'_>, write_ts: TxnTs, opts: &Options) -> CResult<WriteInfo> {
        self.leaf()?.set_row(row, write_ts, opts)
    }

    pub fn delete_row(
        &self,
        sort_key: SortKeyRef<'_>,
        write_ts: TxnTs,
        opts: &Options,
    ) -> CResult<WriteInfo> {
        self.leaf()?.delete_row(sort_key, write_ts, opts)
    }

    pub fn set_ts(
        &self,
        sort_key: SortKeyRef<'_>,
        target_ts: TxnTs,
        opts: &Options,
    ) -> CResult<WriteInfo> {
        self.leaf()?.set_ts(sort_key, target_ts, opts)
    }

    pub fn get_row(
        &self,
        sort_key: SortKeyRef<'_>,
        read_ts: TxnTs,
        opts: &Options,
    ) -> CResult<RowView> {
        self.leaf()?.get_row(sort_key, read_ts, opts)
    }

    pub fn range_filter<F: Fn(Row<'_>) -> bool>(
        &self,
        read_ts: TxnTs,
        opts: &Options,
        scan_opts: ScanOptions,
        filter: F,
    ) -> CResult<Vec<RowView>> {
        self.leaf()?.range_filter(read_ts, opts, scan_opts, filter)
    }

    pub fn get_page_snapshot(&self) -> PageSnapshot {
        self.leaf.get_page_snapshot()
    }

    pub fn install_snapshot(&self, data: &[u8]) -> CResult<()> {
        self.leaf.install_snapshot(data)
    }

    pub fn prepend_delta_blob(&self, data: &[u8]) -> CResult<()> {
        self.leaf.prepend_delta_blob(data)
    }

    pub fn lock_table(&self) -> &LockTable {
        self.leaf.lock_table()
    }

    pub fn lsn(&self) -> Lsn {
        self.leaf.lsn()
    }

    pub fn advance_lsn(&self, lsn: Lsn) {
        self.leaf.advance_lsn(lsn)
    }

    pub fn is_dirty(&self) -> bool {
        self.leaf.is_dirty()
    }

    pub fn is_evictable(&self) -> bool {
        self.leaf.is_evictable()
    }

    pub fn try_mark_in_flusher(&self) -> bool {
        self.leaf.try_mark_in_flusher()
    }

    pub fn finish_flush(&self, snapshot: &PageSnapshot) -> bool {
        self.leaf.finish_flush(snapshot)
    }

    pub fn delta_length(&self) -> usize {
        self.leaf.delta_length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pages_are_leaves() {
        let page = TreePage::new_leaf("p");
        assert_eq!(page.page_type(), PageType::Leaf);
        assert_eq!(page.page_id(), "p");
        assert!(page.is_evictable());
    }
}
