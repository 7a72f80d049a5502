use std::sync::Arc;

use bytes::BufMut;

use crate::codec::decode_u16_le;
use crate::error::{CResult, Error};
use crate::page::delta::Entry;
use crate::page::{DeltaNode, DeltaNodeBuilder};
use crate::row::ROW_SORT_KEY_OFFSET;
use crate::wal::Lsn;

/// Snapshot format version for leaf pages. The version doubles as the page
/// type discriminator: an internal-page layout, once implemented, gets its
/// own version constant.
pub const SNAPSHOT_VERSION_LEAF: u16 = 1;

/// An immutable capture of a page's head pointer together with the LSN the
/// page had at capture time.
///
/// `serialize` produces a self-describing blob:
/// `| version u16 | entry_count u32 | buffer_len u32 | buffer | entries... |
///  lsn u64 |`
/// where each entry is `| control_bit u32 | write_ts u32 |`. The chain is
/// collapsed through the compaction builder first, and only the newest
/// non-aborted version of each key is persisted; superseded versions exist
/// solely for live readers and never survive a restart.
pub struct PageSnapshot {
    node: Option<Arc<DeltaNode>>,
    lsn: Lsn,
    epoch: u64,
}

impl PageSnapshot {
    pub(crate) fn new(node: Option<Arc<DeltaNode>>, lsn: Lsn, epoch: u64) -> PageSnapshot {
        PageSnapshot { node, lsn, epoch }
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut builder = DeltaNodeBuilder::new();
        let mut current = self.node.clone();
        while let Some(node) = current {
            builder.add_delta_node(&node);
            current = node.previous().cloned();
        }
        let collapsed = builder.generate();

        let buffer = collapsed.buffer();
        let entries = collapsed.entries();
        let mut out =
            Vec::with_capacity(2 + 4 + 4 + buffer.len() + entries.len() * 8 + 8);
        out.put_u16_le(SNAPSHOT_VERSION_LEAF);
        out.put_u32_le(entries.len() as u32);
        out.put_u32_le(buffer.len() as u32);
        out.put_slice(buffer);
        for entry in entries {
            out.put_u32_le(entry.control_bit());
            out.put_u32_le(entry.ts());
        }
        out.put_u64_le(self.lsn);
        out
    }

    /// Reconstructs the delta node and LSN held by a serialized snapshot.
    /// An empty snapshot yields `None`.
    pub fn deserialize(data: &[u8]) -> CResult<(Option<DeltaNode>, Lsn)> {
        let mut reader = BlobReader { data, pos: 0 };
        let version = reader.read_u16()?;
        if version != SNAPSHOT_VERSION_LEAF {
            return Err(Error::Corrupted(format!("unsupported page snapshot version {}", version)));
        }
        let entry_count = reader.read_u32()? as usize;
        let buffer_len = reader.read_u32()? as usize;
        let buffer = reader.take(buffer_len)?.to_vec();
        let mut rows = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let control_bit = reader.read_u32()?;
            let write_ts = reader.read_u32()?;
            let entry = Entry::from_raw(control_bit, write_ts);
            // The entries index an untrusted buffer; every row a later read
            // could touch must fit before the node is installed, the same
            // bounds discipline the row codec applies.
            let offset = entry.offset();
            if buffer.len() < offset + ROW_SORT_KEY_OFFSET {
                return Err(Error::Corrupted(format!(
                    "page snapshot entry at offset {} leaves no room for a row header in a \
                     buffer of {} bytes",
                    offset,
                    buffer.len()
                )));
            }
            let total = decode_u16_le(&buffer, offset)? as usize;
            let sort_key_len = decode_u16_le(&buffer, offset + 2)? as usize;
            if total < ROW_SORT_KEY_OFFSET + sort_key_len || buffer.len() < offset + total {
                return Err(Error::Corrupted(format!(
                    "page snapshot row at offset {} declares {} bytes ({} of sort key) but \
                     only {} remain",
                    offset,
                    total,
                    sort_key_len,
                    buffer.len() - offset
                )));
            }
            rows.push(entry);
        }
        let lsn = reader.read_u64()?;
        if entry_count == 0 {
            return Ok((None, lsn));
        }
        Ok((Some(DeltaNode::from_parts(buffer, Vec::new(), rows, Vec::new())), lsn))
    }
}

struct BlobReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    fn take(&mut self, n: usize) -> CResult<&'a [u8]> {
        if self.data.len() < self.pos + n {
            return Err(Error::EndOfBuf);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u16(&mut self) -> CResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> CResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> CResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Column, Row, Schema, SortKey, Value, ValueType};
    use crate::txn::ABORTED_TXN_TS;

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

    fn chain_of(rows: Vec<(i64, &str, u32)>) -> Option<Arc<DeltaNode>> {
        let mut head: Option<Arc<DeltaNode>> = None;
        for (id, value, ts) in rows {
            let bytes =
                Row::serialize(&[Value::Int64(id), Value::String(value)], &schema()).unwrap();
            let mut node = DeltaNode::new_single_set(Row::new(&bytes), ts);
            node.set_previous(head.take());
            head = Some(Arc::new(node));
        }
        head
    }

    #[test]
    fn roundtrip_restores_rows_and_lsn() -> CResult<()> {
        let head = chain_of(vec![(1, "a", 1), (2, "b", 2), (1, "a2", 3)]);
        let snapshot = PageSnapshot::new(head, 777, 3);
        let blob = snapshot.serialize();

        let (node, lsn) = PageSnapshot::deserialize(&blob)?;
        assert_eq!(lsn, 777);
        let node = node.unwrap();
        assert_eq!(node.len(), 2);
        // Newest version of key 1 survived.
        let key = SortKey::new(&[Value::Int64(1)]);
        assert_eq!(node.newest_ts_of(key.as_ref()), Some(3));
        Ok(())
    }

    #[test]
    fn empty_page_serializes_to_empty_snapshot() -> CResult<()> {
        let blob = PageSnapshot::new(None, 0, 0).serialize();
        let (node, lsn) = PageSnapshot::deserialize(&blob)?;
        assert!(node.is_none());
        assert_eq!(lsn, 0);
        Ok(())
    }

    #[test]
    fn aborted_versions_do_not_survive_serialization() -> CResult<()> {
        let head = chain_of(vec![(1, "dead", ABORTED_TXN_TS)]);
        let blob = PageSnapshot::new(head, 9, 1).serialize();
        let (node, _) = PageSnapshot::deserialize(&blob)?;
        assert!(node.is_none());
        Ok(())
    }

    #[test]
    fn serialization_is_deterministic() {
        let a = PageSnapshot::new(chain_of(vec![(3, "c", 1), (1, "a", 2)]), 5, 2).serialize();
        let b = PageSnapshot::new(chain_of(vec![(3, "c", 1), (1, "a", 2)]), 5, 2).serialize();
        assert_eq!(a, b);
    }

    #[test]
    fn corrupt_blobs_are_rejected() {
        let blob = PageSnapshot::new(chain_of(vec![(1, "a", 1)]), 0, 1).serialize();
        assert!(PageSnapshot::deserialize(&blob[..blob.len() - 1]).is_err());
        let mut wrong_version = blob.clone();
        wrong_version[0] = 0xee;
        assert!(PageSnapshot::deserialize(&wrong_version).is_err());
    }

    /// Builds a blob by hand so the entries can lie about their offsets.
    fn forged_blob(buffer: &[u8], entries: &[(u32, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u16_le(SNAPSHOT_VERSION_LEAF);
        out.put_u32_le(entries.len() as u32);
        out.put_u32_le(buffer.len() as u32);
        out.put_slice(buffer);
        for (control_bit, write_ts) in entries {
            out.put_u32_le(*control_bit);
            out.put_u32_le(*write_ts);
        }
        out.put_u64_le(0);
        out
    }

    #[test]
    fn entries_pointing_at_truncated_rows_are_rejected() {
        let row = Row::serialize(&[Value::Int64(1), Value::String("abc")], &schema()).unwrap();

        // An entry into an empty buffer.
        let blob = forged_blob(&[], &[(0, 1)]);
        assert!(matches!(PageSnapshot::deserialize(&blob), Err(Error::Corrupted(_))));

        // An in-range offset with no room left for a row header.
        let blob = forged_blob(&row, &[(row.len() as u32 - 1, 1)]);
        assert!(matches!(PageSnapshot::deserialize(&blob), Err(Error::Corrupted(_))));

        // The header fits, but the row's declared length runs past the end of
        // the truncated body.
        let blob = forged_blob(&row[..6], &[(0, 1)]);
        assert!(matches!(PageSnapshot::deserialize(&blob), Err(Error::Corrupted(_))));

        // An intact row at the same offset still deserializes.
        let blob = forged_blob(&row, &[(0, 1)]);
        let (node, _) = PageSnapshot::deserialize(&blob).unwrap();
        let key = SortKey::new(&[Value::Int64(1)]);
        assert_eq!(node.unwrap().newest_ts_of(key.as_ref()), Some(1));
    }
}
