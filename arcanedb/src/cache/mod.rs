//! The buffer pool and its asynchronous flusher.

mod buffer_pool;
mod flusher;
mod single_flight;

pub use buffer_pool::{BufferPool, PageHolder};
pub use flusher::Flusher;
pub(crate) use single_flight::SingleFlight;
