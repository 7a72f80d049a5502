//! Write-ahead logging: a lock-free segmented log ring plus the typed
//! records the page and transaction layers append to it.

mod log_store;
mod record;
mod recovery;

pub use log_store::{LogReader, LogStore, LogStoreOptions};
pub use record::LogPayload;
pub use recovery::{recover, RecoveryStats};

/// Byte offset into the logical log. Totally ordered; the persistent LSN is
/// monotonic nondecreasing.
pub type Lsn = u64;

/// The log positions assigned to one appended record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LsnRange {
    pub start_lsn: Lsn,
    /// One past the last byte of the record.
    pub end_lsn: Lsn,
}
