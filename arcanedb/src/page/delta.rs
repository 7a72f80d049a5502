use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::row::{Row, SortKey, SortKeyRef};
use crate::txn::{is_locked, strip_locked, TxnTs, ABORTED_TXN_TS};

const ENTRY_DELETED_BIT: u32 = 1 << 31;
const ENTRY_OFFSET_MASK: u32 = ENTRY_DELETED_BIT - 1;

/// One version slot: the high bit of `control_bit` flags a tombstone, the low
/// 31 bits are the byte offset of the row within the owning buffer. The write
/// timestamp is atomic so a commit can stamp it in place while readers hold
/// the node.
pub(crate) struct Entry {
    control_bit: u32,
    write_ts: AtomicU32,
}

impl Entry {
    fn new(offset: usize, deleted: bool, ts: TxnTs) -> Entry {
        debug_assert!(offset <= ENTRY_OFFSET_MASK as usize);
        let mut control_bit = offset as u32;
        if deleted {
            control_bit |= ENTRY_DELETED_BIT;
        }
        Entry { control_bit, write_ts: AtomicU32::new(ts) }
    }

    pub(crate) fn offset(&self) -> usize {
        (self.control_bit & ENTRY_OFFSET_MASK) as usize
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.control_bit & ENTRY_DELETED_BIT != 0
    }

    pub(crate) fn ts(&self) -> TxnTs {
        self.write_ts.load(Ordering::Acquire)
    }

    fn set_ts(&self, ts: TxnTs) {
        self.write_ts.store(ts, Ordering::Release);
    }

    pub(crate) fn control_bit(&self) -> u32 {
        self.control_bit
    }

    pub(crate) fn from_raw(control_bit: u32, ts: TxnTs) -> Entry {
        Entry { control_bit, write_ts: AtomicU32::new(ts) }
    }
}

/// Outcome of a point lookup within a single node.
pub(crate) enum Lookup {
    /// A visible row: its offset, whether it lives in the old-version buffer,
    /// and its write timestamp.
    Found { offset: usize, in_versions: bool, ts: TxnTs },
    /// The first visible version is a tombstone.
    Deleted,
    /// The newest version is an intent of another transaction.
    Conflict,
    /// Nothing visible here; the caller continues down the chain.
    Miss,
}

/// An immutable batch of versioned row mutations.
///
/// Holds a buffer of concatenated newest-version rows with one [`Entry`] per
/// row, sorted by sort key, plus an optional old-version buffer whose entries
/// parallel the newest-version vector per key. Nodes link into a chain through
/// `previous`; readers that captured a node keep the whole suffix of the chain
/// alive.
pub struct DeltaNode {
    buffer: Vec<u8>,
    version_buffer: Vec<u8>,
    rows: Vec<Entry>,
    versions: Vec<Vec<Entry>>,
    previous: Option<Arc<DeltaNode>>,
    total_length: usize,
}

impl DeltaNode {
    /// A one-entry node carrying a full row.
    pub fn new_single_set(row: Row<'_>, write_ts: TxnTs) -> DeltaNode {
        DeltaNode {
            buffer: row.as_slice().to_vec(),
            version_buffer: Vec::new(),
            rows: vec![Entry::new(0, false, write_ts)],
            versions: Vec::new(),
            previous: None,
            total_length: 1,
        }
    }

    /// A one-entry tombstone node. Only the sort-key portion of the row is
    /// materialized.
    pub fn new_single_delete(sort_key: SortKeyRef<'_>, write_ts: TxnTs) -> DeltaNode {
        DeltaNode {
            buffer: Row::serialize_only_sort_key(sort_key),
            version_buffer: Vec::new(),
            rows: vec![Entry::new(0, true, write_ts)],
            versions: Vec::new(),
            previous: None,
            total_length: 1,
        }
    }

    pub(crate) fn from_parts(
        buffer: Vec<u8>,
        version_buffer: Vec<u8>,
        rows: Vec<Entry>,
        versions: Vec<Vec<Entry>>,
    ) -> DeltaNode {
        DeltaNode { buffer, version_buffer, rows, versions, previous: None, total_length: 1 }
    }

    /// Links this node in front of `previous`. Must happen before the node is
    /// published to readers.
    pub fn set_previous(&mut self, previous: Option<Arc<DeltaNode>>) {
        self.total_length = previous.as_ref().map_or(0, |p| p.total_length()) + 1;
        self.previous = previous;
    }

    pub fn previous(&self) -> Option<&Arc<DeltaNode>> {
        self.previous.as_ref()
    }

    /// Number of distinct keys in this node.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Chain depth counted from this node to the tail.
    pub fn total_length(&self) -> usize {
        self.total_length
    }

    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub(crate) fn version_buffer(&self) -> &[u8] {
        &self.version_buffer
    }

    pub(crate) fn row_at(&self, index: usize) -> Row<'_> {
        Row::new(&self.buffer[self.rows[index].offset()..])
    }

    pub(crate) fn entries(&self) -> &[Entry] {
        &self.rows
    }

    fn find(&self, sort_key: SortKeyRef<'_>) -> Option<usize> {
        let target = sort_key.as_slice();
        let index = self
            .rows
            .partition_point(|entry| self.key_of(entry).as_slice() < target);
        if index < self.rows.len() && self.key_of(&self.rows[index]).as_slice() == target {
            Some(index)
        } else {
            None
        }
    }

    fn key_of(&self, entry: &Entry) -> SortKeyRef<'_> {
        Row::new(&self.buffer[entry.offset()..]).sort_key()
    }

    /// Point read of `sort_key` within this node.
    ///
    /// Versions are visited newest first. Aborted versions are skipped; own
    /// intents (stripped ts equal to `owner_ts`) fall through to the version
    /// below, as do all intents when `ignore_lock` is set.
    pub(crate) fn point_lookup(
        &self,
        sort_key: SortKeyRef<'_>,
        read_ts: TxnTs,
        owner_ts: Option<TxnTs>,
        ignore_lock: bool,
    ) -> Lookup {
        match self.find(sort_key) {
            Some(index) => self.lookup_at(index, read_ts, owner_ts, ignore_lock),
            None => Lookup::Miss,
        }
    }

    pub(crate) fn lookup_at(
        &self,
        index: usize,
        read_ts: TxnTs,
        owner_ts: Option<TxnTs>,
        ignore_lock: bool,
    ) -> Lookup {
        if let Some(result) = Self::probe(&self.rows[index], false, read_ts, owner_ts, ignore_lock)
        {
            return result;
        }
        if !self.versions.is_empty() {
            for entry in &self.versions[index] {
                if let Some(result) = Self::probe(entry, true, read_ts, owner_ts, ignore_lock) {
                    return result;
                }
            }
        }
        Lookup::Miss
    }

    fn probe(
        entry: &Entry,
        in_versions: bool,
        read_ts: TxnTs,
        owner_ts: Option<TxnTs>,
        ignore_lock: bool,
    ) -> Option<Lookup> {
        let ts = entry.ts();
        if ts == ABORTED_TXN_TS {
            return None;
        }
        if is_locked(ts) {
            if owner_ts == Some(strip_locked(ts)) || ignore_lock {
                return None;
            }
            return Some(Lookup::Conflict);
        }
        if ts > read_ts {
            return None;
        }
        if entry.is_deleted() {
            Some(Lookup::Deleted)
        } else {
            Some(Lookup::Found { offset: entry.offset(), in_versions, ts })
        }
    }

    /// Write timestamp of the newest version of `sort_key` held by this node,
    /// if any.
    pub(crate) fn newest_ts_of(&self, sort_key: SortKeyRef<'_>) -> Option<TxnTs> {
        self.find(sort_key).map(|index| self.rows[index].ts())
    }

    /// Rewrites the write timestamp of the newest version of `sort_key`.
    /// Returns false when the key is not present in this node.
    pub(crate) fn stamp_newest(&self, sort_key: SortKeyRef<'_>, ts: TxnTs) -> bool {
        match self.find(sort_key) {
            Some(index) => {
                self.rows[index].set_ts(ts);
                true
            }
            None => false,
        }
    }

    /// Streams `(row, is_deleted, write_ts)` over every version held by this
    /// node, newest version of each key first.
    pub fn traverse<V: FnMut(Row<'_>, bool, TxnTs)>(&self, mut visitor: V) {
        for (index, entry) in self.rows.iter().enumerate() {
            visitor(self.row_at(index), entry.is_deleted(), entry.ts());
            if self.versions.is_empty() {
                continue;
            }
            for version in &self.versions[index] {
                visitor(
                    Row::new(&self.version_buffer[version.offset()..]),
                    version.is_deleted(),
                    version.ts(),
                );
            }
        }
    }
}

struct BuildEntry {
    bytes: Vec<u8>,
    deleted: bool,
    ts: TxnTs,
}

/// Builds one compacted [`DeltaNode`] out of a chain walked newest to oldest.
///
/// All non-aborted versions of each key are preserved: the newest becomes the
/// primary entry, the rest go into the per-key version chain. Given identical
/// input nodes the output is byte-identical.
#[derive(Default)]
pub struct DeltaNodeBuilder {
    map: BTreeMap<SortKey, Vec<BuildEntry>>,
    delta_count: usize,
}

impl DeltaNodeBuilder {
    pub fn new() -> DeltaNodeBuilder {
        DeltaNodeBuilder::default()
    }

    /// Folds `node` in. Nodes must be added newest first so that per-key
    /// version lists stay ordered newest to oldest.
    pub fn add_delta_node(&mut self, node: &DeltaNode) {
        node.traverse(|row, deleted, ts| {
            if ts == ABORTED_TXN_TS {
                return;
            }
            self.map.entry(row.sort_key().to_owned()).or_default().push(BuildEntry {
                bytes: row.as_slice().to_vec(),
                deleted,
                ts,
            });
        });
        self.delta_count += 1;
    }

    pub fn row_count(&self) -> usize {
        self.map.len()
    }

    pub fn delta_count(&self) -> usize {
        self.delta_count
    }

    pub fn generate(self) -> DeltaNode {
        let mut buffer = Vec::new();
        let mut version_buffer = Vec::new();
        let mut rows = Vec::with_capacity(self.map.len());
        let mut versions: Vec<Vec<Entry>> = Vec::with_capacity(self.map.len());
        let mut has_versions = false;
        for (_, build_entries) in self.map {
            let newest = &build_entries[0];
            rows.push(Entry::new(buffer.len(), newest.deleted, newest.ts));
            buffer.extend_from_slice(&newest.bytes);

            let mut old = Vec::new();
            for entry in &build_entries[1..] {
                old.push(Entry::new(version_buffer.len(), entry.deleted, entry.ts));
                version_buffer.extend_from_slice(&entry.bytes);
            }
            has_versions = has_versions || !old.is_empty();
            versions.push(old);
        }
        if !has_versions {
            versions.clear();
        }
        DeltaNode::from_parts(buffer, version_buffer, rows, versions)
    }
}
