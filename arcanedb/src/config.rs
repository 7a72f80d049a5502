use std::time::Duration;

/// Compact a delta chain once its depth exceeds this length.
pub const BWTREE_DELTA_CHAIN_LENGTH: usize = 8;

/// Number of buffer pool shards.
pub const CACHE_SHARD_NUM: usize = 16;

/// Total buffer pool charge across all shards, in bytes.
pub const CACHE_CAPACITY: usize = 64 << 20;

/// Cache charge accounted to one resident page.
pub const PAGE_CHARGE: usize = 4096;

/// Number of flusher shards, each owning one worker thread.
pub const FLUSHER_SHARD_NUM: usize = 4;

/// Number of lock table shards.
pub const LOCK_TABLE_SHARD_NUM: usize = 16;

/// How long a lock acquisition waits before giving up with `Timeout`.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Number of segments in the WAL ring.
pub const LOG_SEGMENT_NUM: usize = 16;

/// Size of a single WAL segment buffer, in bytes.
pub const LOG_SEGMENT_SIZE: usize = 16 << 10;
