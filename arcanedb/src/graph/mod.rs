//! The weighted graph surface of the engine.
//!
//! Vertices and edges are rows in leaf pages: a vertex lives under page key
//! `<id>V` keyed by its id, and all outgoing edges of a vertex cluster under
//! page key `<src>E` keyed by the destination id, which is what makes
//! "read/mutate the edges of a vertex" a single-page access.

use std::path::Path;
use std::sync::Arc;

use crate::cache::BufferPool;
use crate::error::{CResult, Error};
use crate::pstore::KvPageStore;
use crate::row::{Column, OwnedValue, Row, Schema, SortKey, Value, ValueType};
use crate::storage::log_cask::LogCask;
use crate::txn::{CcProtocol, DbContext, TxnContext, TxnManager, TxnOptions};
use crate::wal::{recover, LogReader, LogStore, LogStoreOptions};

pub type VertexId = i64;

const VERTEX_ID_COLUMN: u32 = 0;
const VALUE_COLUMN: u32 = 1;

/// Database-wide knobs, fixed at open.
#[derive(Clone, Debug)]
pub struct DbOptions {
    /// Log every mutation to the WAL and replay it on open.
    pub enable_wal: bool,
    /// Persist dirty pages through the background flusher.
    pub enable_flush: bool,
    /// fsync WAL segments as they are written.
    pub sync_log: bool,
    pub protocol: CcProtocol,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            enable_wal: true,
            enable_flush: true,
            sync_log: true,
            protocol: CcProtocol::Occ,
        }
    }
}

/// An embeddable transactional graph database.
///
/// Vertices carry an id and a value, edges carry a source, a destination and
/// a value. All access goes through transactions obtained from
/// [`WeightedGraphDB::begin_rw_txn`] / [`WeightedGraphDB::begin_ro_txn`].
pub struct WeightedGraphDB {
    txn_manager: Arc<TxnManager>,
    ctx: DbContext,
    schema: Arc<Schema>,
}

impl WeightedGraphDB {
    /// Opens (or creates) a database under the `name` directory. With both
    /// the WAL and the flusher disabled no files are touched and the database
    /// lives purely in memory.
    pub fn open(name: impl AsRef<Path>, options: DbOptions) -> CResult<WeightedGraphDB> {
        let root = name.as_ref();

        let log_store = if options.enable_wal {
            Some(Arc::new(LogStore::open(
                &root.join("wal"),
                LogStoreOptions { sync_on_flush: options.sync_log, ..LogStoreOptions::default() },
            )?))
        } else {
            None
        };
        let page_store = if options.enable_flush {
            let cask = LogCask::new(root.join("pages").join("kv"))?;
            Some(Arc::new(KvPageStore::new(cask)) as Arc<dyn crate::pstore::PageStore>)
        } else {
            None
        };

        let buffer_pool = Arc::new(BufferPool::new(page_store, log_store.clone())?);
        let ctx = DbContext { buffer_pool, log_store };
        let txn_manager = Arc::new(TxnManager::new(options.protocol, ctx.clone()));

        if options.enable_wal {
            let reader = LogReader::open(&root.join("wal").join("LOG"))?;
            let stats = recover(&ctx.buffer_pool, reader)?;
            txn_manager.advance_tso(stats.max_ts);
            if stats.applied_records > 0 {
                log::info!(
                    "recovered {} records, finished {} and reaped {} transactions",
                    stats.applied_records,
                    stats.finished_txns,
                    stats.reaped_txns
                );
            }
        }

        Ok(WeightedGraphDB {
            txn_manager,
            ctx,
            schema: Arc::new(graph_schema()?),
        })
    }

    /// Begins a read-only transaction at a consistent snapshot. Snapshot
    /// readers bypass intent visibility, falling through to the latest
    /// committed version.
    pub fn begin_ro_txn(&self, options: TxnOptions) -> Transaction {
        let options = TxnOptions { ignore_lock: true, ..options };
        Transaction { context: self.txn_manager.begin_ro_txn(options), schema: self.schema.clone() }
    }

    /// Begins a read-write transaction.
    pub fn begin_rw_txn(&self, options: TxnOptions) -> Transaction {
        Transaction { context: self.txn_manager.begin_rw_txn(options), schema: self.schema.clone() }
    }

    /// Like [`WeightedGraphDB::begin_rw_txn`], additionally warming the edge
    /// page of `vertex_hint` so the transaction's first touch does not pay
    /// the load.
    pub fn begin_rw_txn_with_hint(
        &self,
        options: TxnOptions,
        vertex_hint: Option<VertexId>,
    ) -> Transaction {
        if let Some(vertex) = vertex_hint {
            if let Err(err) = self.ctx.buffer_pool.get_page(&edge_page_key(vertex)) {
                log::error!("failed to warm the edge page of vertex {}: {}", vertex, err);
            }
        }
        self.begin_rw_txn(options)
    }

    /// Drains every dirty page to the page store.
    pub fn force_flush(&self) {
        self.ctx.buffer_pool.force_flush_all_pages();
    }

    /// Depth of the delta chain backing the edge page of `src`.
    #[doc(hidden)]
    pub fn debug_edge_chain_length(&self, src: VertexId) -> CResult<usize> {
        Ok(self.ctx.buffer_pool.get_page(&edge_page_key(src))?.delta_length())
    }
}

fn graph_schema() -> CResult<Schema> {
    Schema::new(
        0,
        vec![
            Column::new(VERTEX_ID_COLUMN, "vertex_id", ValueType::Int64),
            Column::new(VALUE_COLUMN, "value", ValueType::String),
        ],
        1,
    )
}

fn vertex_page_key(vertex: VertexId) -> String {
    format!("{}V", vertex)
}

fn edge_page_key(src: VertexId) -> String {
    format!("{}E", src)
}

fn id_sort_key(id: VertexId) -> SortKey {
    SortKey::new(&[Value::Int64(id)])
}

/// A transaction over the graph. Commit consumes it; dropping an uncommitted
/// transaction releases its locks without publishing anything.
pub struct Transaction {
    context: Box<dyn TxnContext>,
    schema: Arc<Schema>,
}

impl Transaction {
    pub fn insert_vertex(&mut self, vertex: VertexId, value: &str) -> CResult<()> {
        let buf =
            Row::serialize(&[Value::Int64(vertex), Value::String(value)], &self.schema)?;
        self.context.set_row(&vertex_page_key(vertex), Row::new(&buf))
    }

    pub fn delete_vertex(&mut self, vertex: VertexId) -> CResult<()> {
        self.context.delete_row(&vertex_page_key(vertex), id_sort_key(vertex).as_ref())
    }

    pub fn insert_edge(&mut self, src: VertexId, dst: VertexId, value: &str) -> CResult<()> {
        let buf = Row::serialize(&[Value::Int64(dst), Value::String(value)], &self.schema)?;
        self.context.set_row(&edge_page_key(src), Row::new(&buf))
    }

    pub fn delete_edge(&mut self, src: VertexId, dst: VertexId) -> CResult<()> {
        self.context.delete_row(&edge_page_key(src), id_sort_key(dst).as_ref())
    }

    pub fn get_vertex(&mut self, vertex: VertexId) -> CResult<String> {
        let view = self.context.get_row(&vertex_page_key(vertex), id_sort_key(vertex).as_ref())?;
        value_of(&view.row(), &self.schema)
    }

    pub fn get_edge(&mut self, src: VertexId, dst: VertexId) -> CResult<String> {
        let view = self.context.get_row(&edge_page_key(src), id_sort_key(dst).as_ref())?;
        value_of(&view.row(), &self.schema)
    }

    /// Iterates the outgoing edges of `src` in destination order, as
    /// `(dst, value)` pairs. The iterator observes the transaction's own
    /// uncommitted writes.
    pub fn edge_iterator(&mut self, src: VertexId) -> CResult<EdgeIterator> {
        let views = self.context.scan(&edge_page_key(src))?;
        let mut edges = Vec::with_capacity(views.len());
        for view in views {
            let row = view.row();
            let dst = match row.get_prop(VERTEX_ID_COLUMN, &self.schema)? {
                OwnedValue::Int64(dst) => dst,
                other => {
                    return Err(Error::Corrupted(format!(
                        "edge destination decoded as {:?}",
                        other
                    )))
                }
            };
            edges.push((dst, value_of(&row, &self.schema)?));
        }
        Ok(EdgeIterator { inner: edges.into_iter() })
    }

    /// Commits (or aborts) the transaction. `Ok(())` is a commit;
    /// `Err(TxnAbort)`, `Err(TxnConflict)` and `Err(Timeout)` report why the
    /// transaction did not commit, with all locks released and intents
    /// cleaned up either way.
    pub fn commit(mut self) -> CResult<()> {
        self.context.commit_or_abort()
    }
}

fn value_of(row: &Row<'_>, schema: &Schema) -> CResult<String> {
    match row.get_prop(VALUE_COLUMN, schema)? {
        OwnedValue::String(value) => Ok(value),
        other => Err(Error::Corrupted(format!("value column decoded as {:?}", other))),
    }
}

/// Sorted iterator over the outgoing edges of one vertex.
pub struct EdgeIterator {
    inner: std::vec::IntoIter<(VertexId, String)>,
}

impl Iterator for EdgeIterator {
    type Item = (VertexId, String);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_db() -> WeightedGraphDB {
        WeightedGraphDB::open(
            "unused",
            DbOptions { enable_wal: false, enable_flush: false, ..DbOptions::default() },
        )
        .unwrap()
    }

    #[test]
    fn vertex_crud() -> CResult<()> {
        let db = memory_db();
        let mut txn = db.begin_rw_txn(TxnOptions::default());
        txn.insert_vertex(1, "alpha")?;
        assert_eq!(txn.get_vertex(1)?, "alpha");
        txn.commit()?;

        let mut txn = db.begin_rw_txn(TxnOptions::default());
        txn.delete_vertex(1)?;
        txn.commit()?;

        let mut txn = db.begin_ro_txn(TxnOptions::default());
        assert_eq!(txn.get_vertex(1).err(), Some(Error::NotFound));
        Ok(())
    }

    #[test]
    fn edges_cluster_under_their_source() -> CResult<()> {
        let db = memory_db();
        let mut txn = db.begin_rw_txn(TxnOptions::default());
        txn.insert_edge(1, 3, "c")?;
        txn.insert_edge(1, 2, "b")?;
        txn.insert_edge(2, 1, "back")?;
        txn.commit()?;

        let mut txn = db.begin_ro_txn(TxnOptions::default());
        let edges: Vec<(VertexId, String)> = txn.edge_iterator(1)?.collect();
        assert_eq!(edges, vec![(2, "b".to_owned()), (3, "c".to_owned())]);
        assert_eq!(txn.edge_iterator(2)?.count(), 1);
        assert_eq!(txn.edge_iterator(3)?.count(), 0);
        Ok(())
    }

    #[test]
    fn hinted_begin_warms_the_edge_page() -> CResult<()> {
        let db = memory_db();
        let mut txn = db.begin_rw_txn_with_hint(TxnOptions::default(), Some(1));
        txn.insert_edge(1, 2, "warm")?;
        txn.commit()?;
        assert_eq!(db.debug_edge_chain_length(1)?, 1);
        Ok(())
    }

    #[test]
    fn uncommitted_writes_are_visible_to_their_own_iterator() -> CResult<()> {
        let db = memory_db();
        let mut txn = db.begin_rw_txn(TxnOptions::default());
        txn.insert_edge(1, 2, "mine")?;
        let edges: Vec<(VertexId, String)> = txn.edge_iterator(1)?.collect();
        assert_eq!(edges, vec![(2, "mine".to_owned())]);
        txn.commit()?;
        Ok(())
    }

    #[test]
    fn two_pl_protocol_serves_the_same_surface() -> CResult<()> {
        let db = WeightedGraphDB::open(
            "unused",
            DbOptions {
                enable_wal: false,
                enable_flush: false,
                protocol: CcProtocol::TwoPl,
                ..DbOptions::default()
            },
        )?;
        let mut txn = db.begin_rw_txn(TxnOptions::default());
        txn.insert_edge(1, 2, "a")?;
        assert_eq!(txn.get_edge(1, 2)?, "a");
        txn.commit()?;

        let mut txn = db.begin_ro_txn(TxnOptions::default());
        assert_eq!(txn.get_edge(1, 2)?, "a");
        Ok(())
    }
}
