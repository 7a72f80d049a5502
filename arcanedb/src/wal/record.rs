use bytes::BufMut;

use crate::codec::decode_u16_le;
use crate::error::{CResult, Error};
use crate::txn::{TxnId, TxnTs};

const TYPE_SET_ROW: u8 = 0;
const TYPE_DELETE_ROW: u8 = 1;
const TYPE_SET_TS: u8 = 2;
const TYPE_OCC_BEGIN: u8 = 3;
const TYPE_OCC_COMMIT: u8 = 4;
const TYPE_OCC_ABORT: u8 = 5;

/// A typed log record payload.
///
/// Wire format: a one-byte type, then the fields below in order. `page_id`
/// and `sort_key` carry a u16 length prefix; the row of a `SetRow` record is
/// the remainder of the payload (rows are self-describing).
#[derive(Clone, Debug, PartialEq)]
pub enum LogPayload {
    /// `| type | txn_id u64 | page_id | write_ts u32 | row |`
    SetRow { txn_id: TxnId, page_id: String, write_ts: TxnTs, row: Vec<u8> },
    /// `| type | txn_id u64 | page_id | write_ts u32 | sort_key |`
    DeleteRow { txn_id: TxnId, page_id: String, write_ts: TxnTs, sort_key: Vec<u8> },
    /// `| type | txn_id u64 | page_id | commit_ts u32 | sort_key |`
    SetTs { txn_id: TxnId, page_id: String, commit_ts: TxnTs, sort_key: Vec<u8> },
    /// `| type | txn_id u64 | read_ts u32 |`
    OccBegin { txn_id: TxnId, read_ts: TxnTs },
    /// `| type | txn_id u64 | commit_ts u32 |`
    OccCommit { txn_id: TxnId, commit_ts: TxnTs },
    /// `| type | txn_id u64 |`
    OccAbort { txn_id: TxnId },
}

impl LogPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            LogPayload::SetRow { txn_id, page_id, write_ts, row } => {
                buf.put_u8(TYPE_SET_ROW);
                buf.put_u64_le(*txn_id);
                put_string(&mut buf, page_id.as_bytes());
                buf.put_u32_le(*write_ts);
                buf.put_slice(row);
            }
            LogPayload::DeleteRow { txn_id, page_id, write_ts, sort_key } => {
                buf.put_u8(TYPE_DELETE_ROW);
                buf.put_u64_le(*txn_id);
                put_string(&mut buf, page_id.as_bytes());
                buf.put_u32_le(*write_ts);
                put_string(&mut buf, sort_key);
            }
            LogPayload::SetTs { txn_id, page_id, commit_ts, sort_key } => {
                buf.put_u8(TYPE_SET_TS);
                buf.put_u64_le(*txn_id);
                put_string(&mut buf, page_id.as_bytes());
                buf.put_u32_le(*commit_ts);
                put_string(&mut buf, sort_key);
            }
            LogPayload::OccBegin { txn_id, read_ts } => {
                buf.put_u8(TYPE_OCC_BEGIN);
                buf.put_u64_le(*txn_id);
                buf.put_u32_le(*read_ts);
            }
            LogPayload::OccCommit { txn_id, commit_ts } => {
                buf.put_u8(TYPE_OCC_COMMIT);
                buf.put_u64_le(*txn_id);
                buf.put_u32_le(*commit_ts);
            }
            LogPayload::OccAbort { txn_id } => {
                buf.put_u8(TYPE_OCC_ABORT);
                buf.put_u64_le(*txn_id);
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> CResult<LogPayload> {
        let mut reader = PayloadReader { buf, pos: 0 };
        let record_type = reader.take(1)?[0];
        let txn_id = reader.read_u64()?;
        let payload = match record_type {
            TYPE_SET_ROW => {
                let page_id = reader.read_string()?;
                let write_ts = reader.read_u32()?;
                LogPayload::SetRow { txn_id, page_id, write_ts, row: reader.rest().to_vec() }
            }
            TYPE_DELETE_ROW => {
                let page_id = reader.read_string()?;
                let write_ts = reader.read_u32()?;
                let sort_key = reader.read_bytes()?;
                LogPayload::DeleteRow { txn_id, page_id, write_ts, sort_key }
            }
            TYPE_SET_TS => {
                let page_id = reader.read_string()?;
                let commit_ts = reader.read_u32()?;
                let sort_key = reader.read_bytes()?;
                LogPayload::SetTs { txn_id, page_id, commit_ts, sort_key }
            }
            TYPE_OCC_BEGIN => LogPayload::OccBegin { txn_id, read_ts: reader.read_u32()? },
            TYPE_OCC_COMMIT => LogPayload::OccCommit { txn_id, commit_ts: reader.read_u32()? },
            TYPE_OCC_ABORT => LogPayload::OccAbort { txn_id },
            t => return Err(Error::Corrupted(format!("unknown log record type {}", t))),
        };
        Ok(payload)
    }
}

fn put_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);
}

struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn take(&mut self, n: usize) -> CResult<&'a [u8]> {
        if self.buf.len() < self.pos + n {
            return Err(Error::EndOfBuf);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u32(&mut self) -> CResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> CResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn read_bytes(&mut self) -> CResult<Vec<u8>> {
        let len = decode_u16_le(self.take(2)?, 0)? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn read_string(&mut self) -> CResult<String> {
        Ok(String::from_utf8(self.read_bytes()?)?)
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::mark_locked;

    #[test]
    fn roundtrip_every_record_type() -> CResult<()> {
        let records = vec![
            LogPayload::SetRow {
                txn_id: 7,
                page_id: "1E".to_owned(),
                write_ts: mark_locked(3),
                row: vec![1, 2, 3, 4],
            },
            LogPayload::DeleteRow {
                txn_id: 7,
                page_id: "1E".to_owned(),
                write_ts: 9,
                sort_key: vec![0xff, 0x00],
            },
            LogPayload::SetTs {
                txn_id: 7,
                page_id: "2V".to_owned(),
                commit_ts: 11,
                sort_key: vec![],
            },
            LogPayload::OccBegin { txn_id: 1, read_ts: 2 },
            LogPayload::OccCommit { txn_id: 1, commit_ts: 5 },
            LogPayload::OccAbort { txn_id: 1 },
        ];
        for record in records {
            assert_eq!(LogPayload::decode(&record.encode())?, record);
        }
        Ok(())
    }

    #[test]
    fn truncated_payload_fails_to_decode() {
        let buf = LogPayload::OccCommit { txn_id: 1, commit_ts: 5 }.encode();
        assert_eq!(LogPayload::decode(&buf[..buf.len() - 1]), Err(Error::EndOfBuf));
        assert!(LogPayload::decode(&[42]).is_err());
    }
}
