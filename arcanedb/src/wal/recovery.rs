use std::collections::{HashMap, HashSet};

use crate::cache::BufferPool;
use crate::error::CResult;
use crate::page::Options;
use crate::row::{Row, SortKeyRef};
use crate::txn::{is_locked, strip_locked, TxnId, TxnTs, ABORTED_TXN_TS};
use crate::wal::{LogPayload, LogReader};

#[derive(Debug, Default)]
pub struct RecoveryStats {
    /// Records applied to pages; records below a page's flushed LSN are
    /// skipped.
    pub applied_records: usize,
    /// Transactions whose leftover intents were stamped aborted.
    pub reaped_txns: usize,
    /// Transactions whose commit record was found and whose remaining
    /// intents were stamped with their commit timestamp.
    pub finished_txns: usize,
    /// The highest timestamp seen anywhere in the log; the TSO must restart
    /// above it.
    pub max_ts: TxnTs,
}

#[derive(Default)]
struct TxnState {
    /// Intents written but not yet stamped, as (page id, sort key).
    intents: Vec<(String, Vec<u8>)>,
    commit_ts: Option<TxnTs>,
}

/// Replays the log against the last-flushed page snapshots.
///
/// Records are applied in log order to pages resolved through the buffer
/// pool; a record whose LSN lies below the owning page's restored LSN is
/// already covered by the flushed base and skipped. Once the scan completes,
/// transactions that logged a commit record get any still-locked intents
/// stamped with their commit timestamp, and transactions that never decided
/// get theirs stamped aborted, so no reader can conflict on a dead intent.
///
/// Replay itself never appends to the log: re-running recovery after another
/// crash reaches the same state.
pub fn recover(buffer_pool: &BufferPool, reader: LogReader) -> CResult<RecoveryStats> {
    let mut stats = RecoveryStats::default();
    let mut txns: HashMap<TxnId, TxnState> = HashMap::new();
    let mut touched: HashSet<String> = HashSet::new();
    let opts = Options::default();

    for (range, payload) in reader {
        let payload = LogPayload::decode(&payload)?;
        match payload {
            LogPayload::SetRow { txn_id, page_id, write_ts, row } => {
                observe_ts(&mut stats, write_ts);
                let page = buffer_pool.get_page(&page_id)?;
                if range.start_lsn >= page.lsn() {
                    page.set_row(Row::new(&row), write_ts, &opts)?;
                    page.advance_lsn(range.end_lsn);
                    stats.applied_records += 1;
                    touched.insert(page_id.clone());
                }
                if is_locked(write_ts) {
                    let sort_key = Row::new(&row).sort_key().as_slice().to_vec();
                    txns.entry(txn_id).or_default().intents.push((page_id, sort_key));
                }
            }
            LogPayload::DeleteRow { txn_id, page_id, write_ts, sort_key } => {
                observe_ts(&mut stats, write_ts);
                let page = buffer_pool.get_page(&page_id)?;
                if range.start_lsn >= page.lsn() {
                    page.delete_row(SortKeyRef::new(&sort_key), write_ts, &opts)?;
                    page.advance_lsn(range.end_lsn);
                    stats.applied_records += 1;
                    touched.insert(page_id.clone());
                }
                if is_locked(write_ts) {
                    txns.entry(txn_id).or_default().intents.push((page_id, sort_key));
                }
            }
            LogPayload::SetTs { txn_id, page_id, commit_ts, sort_key } => {
                observe_ts(&mut stats, commit_ts);
                let page = buffer_pool.get_page(&page_id)?;
                if range.start_lsn >= page.lsn() {
                    if let Err(err) = page.set_ts(SortKeyRef::new(&sort_key), commit_ts, &opts) {
                        log::error!(
                            "recovery could not stamp a version on page {}: {}",
                            page_id,
                            err
                        );
                    } else {
                        page.advance_lsn(range.end_lsn);
                        stats.applied_records += 1;
                        touched.insert(page_id.clone());
                    }
                }
                if let Some(state) = txns.get_mut(&txn_id) {
                    state.intents.retain(|(p, sk)| p != &page_id || sk != &sort_key);
                }
            }
            LogPayload::OccBegin { txn_id, read_ts } => {
                observe_ts(&mut stats, read_ts);
                txns.entry(txn_id).or_default();
            }
            LogPayload::OccCommit { txn_id, commit_ts } => {
                observe_ts(&mut stats, commit_ts);
                txns.entry(txn_id).or_default().commit_ts = Some(commit_ts);
            }
            LogPayload::OccAbort { txn_id } => {
                // Its intents were stamped aborted by SetTs records already;
                // anything remaining is reaped below.
                txns.entry(txn_id).or_default().commit_ts = None;
            }
        }
    }

    // Settle transactions the crash cut short.
    for (txn_id, state) in txns {
        if state.intents.is_empty() {
            continue;
        }
        let (target_ts, finished) = match state.commit_ts {
            Some(commit_ts) => (commit_ts, true),
            None => (ABORTED_TXN_TS, false),
        };
        for (page_id, sort_key) in &state.intents {
            let page = buffer_pool.get_page(page_id)?;
            if let Err(err) = page.set_ts(SortKeyRef::new(sort_key), target_ts, &opts) {
                log::error!(
                    "recovery could not settle an intent of txn {} on page {}: {}",
                    txn_id,
                    page_id,
                    err
                );
            } else {
                touched.insert(page_id.clone());
            }
        }
        if finished {
            stats.finished_txns += 1;
            log::info!("recovery finished commit of txn {}", txn_id);
        } else {
            stats.reaped_txns += 1;
            log::info!("recovery aborted unfinished txn {}", txn_id);
        }
    }

    // Replayed pages are dirty; hand them to the flusher so the next
    // checkpoint shrinks the replay window.
    for page_id in touched {
        let page = buffer_pool.get_page(&page_id)?;
        buffer_pool.try_insert_dirty_page(&page);
    }

    Ok(stats)
}

fn observe_ts(stats: &mut RecoveryStats, ts: TxnTs) {
    if ts == ABORTED_TXN_TS {
        return;
    }
    stats.max_ts = stats.max_ts.max(strip_locked(ts));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BufferPool;
    use crate::error::Error;
    use crate::row::{Column, Schema, SortKey, Value, ValueType};
    use crate::txn::mark_locked;
    use crate::wal::{LogStore, LogStoreOptions};

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

    fn append(store: &LogStore, payload: LogPayload) {
        store.append(&[payload.encode()]).unwrap();
    }

    #[test]
    fn committed_txn_replays_to_its_commit_ts() -> CResult<()> {
        let dir = tempdir::TempDir::new("recovery")?;
        {
            let store = LogStore::open(dir.path(), LogStoreOptions::default())?;
            append(&store, LogPayload::OccBegin { txn_id: 1, read_ts: 5 });
            append(
                &store,
                LogPayload::SetRow {
                    txn_id: 1,
                    page_id: "1E".into(),
                    write_ts: mark_locked(5),
                    row: row_bytes(2, "edge"),
                },
            );
            append(&store, LogPayload::OccCommit { txn_id: 1, commit_ts: 6 });
            append(
                &store,
                LogPayload::SetTs {
                    txn_id: 1,
                    page_id: "1E".into(),
                    commit_ts: 6,
                    sort_key: key(2).as_slice().to_vec(),
                },
            );
            store.flush();
        }

        let pool = BufferPool::new(None, None)?;
        let stats = recover(&pool, LogReader::open(&dir.path().join("LOG"))?)?;
        assert_eq!(stats.applied_records, 2);
        assert_eq!(stats.max_ts, 6);

        let page = pool.get_page("1E")?;
        let view = page.get_row(key(2).as_ref(), 6, &Options::default())?;
        assert_eq!(view.ts(), 6);
        Ok(())
    }

    #[test]
    fn unfinished_txn_is_reaped() -> CResult<()> {
        let dir = tempdir::TempDir::new("recovery")?;
        {
            let store = LogStore::open(dir.path(), LogStoreOptions::default())?;
            append(&store, LogPayload::OccBegin { txn_id: 9, read_ts: 3 });
            append(
                &store,
                LogPayload::SetRow {
                    txn_id: 9,
                    page_id: "1E".into(),
                    write_ts: mark_locked(3),
                    row: row_bytes(4, "orphan"),
                },
            );
            // Crash: no commit or abort record.
            store.flush();
        }

        let pool = BufferPool::new(None, None)?;
        let stats = recover(&pool, LogReader::open(&dir.path().join("LOG"))?)?;
        assert_eq!(stats.reaped_txns, 1);

        // The orphaned intent is invisible instead of conflicting forever.
        let page = pool.get_page("1E")?;
        assert_eq!(
            page.get_row(key(4).as_ref(), 9, &Options::default()).err(),
            Some(Error::NotFound)
        );
        Ok(())
    }

    #[test]
    fn commit_cut_short_is_finished_by_replay() -> CResult<()> {
        let dir = tempdir::TempDir::new("recovery")?;
        {
            let store = LogStore::open(dir.path(), LogStoreOptions::default())?;
            append(&store, LogPayload::OccBegin { txn_id: 2, read_ts: 7 });
            append(
                &store,
                LogPayload::SetRow {
                    txn_id: 2,
                    page_id: "1E".into(),
                    write_ts: mark_locked(7),
                    row: row_bytes(5, "decided"),
                },
            );
            // The commit record made it out, the SetTs stamp did not.
            append(&store, LogPayload::OccCommit { txn_id: 2, commit_ts: 8 });
            store.flush();
        }

        let pool = BufferPool::new(None, None)?;
        let stats = recover(&pool, LogReader::open(&dir.path().join("LOG"))?)?;
        assert_eq!(stats.finished_txns, 1);

        let page = pool.get_page("1E")?;
        let view = page.get_row(key(5).as_ref(), 8, &Options::default())?;
        assert_eq!(view.ts(), 8);
        Ok(())
    }
}
