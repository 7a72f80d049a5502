//! `arcanedb` is an embeddable transactional storage engine for graph-style
//! workloads, where the dominant access pattern is "given a vertex, read or
//! mutate its outgoing edges".
//!
//! Edges of one vertex cluster in a single leaf page: a versioned delta
//! chain with in-place compaction, published through an atomic head pointer
//! so readers never block writers. Around the leaves sit a sharded buffer
//! pool with single-flight loading and asynchronous flushing, a segmented
//! write-ahead log with lock-free reservation, a sharded wait-queue lock
//! table, and two transaction layers over the same pages: Hekaton-style OCC
//! and two-phase locking.
//!
//! ## Getting started
//!
//! ```no_run
//! use arcanedb::error::CResult;
//! use arcanedb::graph::{DbOptions, WeightedGraphDB};
//! use arcanedb::txn::TxnOptions;
//!
//! fn main() -> CResult<()> {
//!     let db = WeightedGraphDB::open("./graph-db", DbOptions::default())?;
//!
//!     let mut txn = db.begin_rw_txn(TxnOptions::default());
//!     txn.insert_vertex(1, "alice")?;
//!     txn.insert_vertex(2, "bob")?;
//!     txn.insert_edge(1, 2, "follows")?;
//!     txn.commit()?;
//!
//!     let mut txn = db.begin_ro_txn(TxnOptions::default());
//!     assert_eq!(txn.get_edge(1, 2)?, "follows");
//!     for (dst, value) in txn.edge_iterator(1)? {
//!         println!("1 -> {}: {}", dst, value);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod graph;
pub mod page;
pub mod pstore;
pub mod row;
pub mod storage;
pub mod txn;
pub mod wal;

pub use error::{CResult, Error};
pub use graph::{DbOptions, WeightedGraphDB};
