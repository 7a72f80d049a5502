use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cache::PageHolder;
use crate::error::CResult;
use crate::pstore::PageStore;
use crate::wal::LogStore;

struct ShardState {
    queue: VecDeque<PageHolder>,
    busy: bool,
}

struct FlusherShard {
    state: Mutex<ShardState>,
    cv: Condvar,
    idle_cv: Condvar,
    stop: AtomicBool,
    page_store: Arc<dyn PageStore>,
    log_store: Option<Arc<LogStore>>,
}

impl FlusherShard {
    fn enqueue(&self, page: PageHolder) {
        let mut state = self.state.lock();
        state.queue.push_back(page);
        self.cv.notify_one();
    }

    fn work_loop(&self) {
        loop {
            let page = {
                let mut state = self.state.lock();
                loop {
                    if let Some(page) = state.queue.pop_front() {
                        state.busy = true;
                        break Some(page);
                    }
                    if self.stop.load(Ordering::Acquire) {
                        break None;
                    }
                    self.cv.wait(&mut state);
                }
            };
            let page = match page {
                Some(page) => page,
                None => break,
            };

            self.flush_page(&page);

            let mut state = self.state.lock();
            state.busy = false;
            if state.queue.is_empty() {
                self.idle_cv.notify_all();
            }
        }
    }

    /// Persists one dirty page: snapshot it, honor the WAL rule by waiting
    /// for the log to cover the snapshot, replace the base blob, then clear
    /// the dirty state. A page re-dirtied mid-flush goes right back into the
    /// queue.
    fn flush_page(&self, page: &PageHolder) {
        let snapshot = page.get_page_snapshot();
        if let Some(log_store) = &self.log_store {
            log_store.wait_for_persist(snapshot.lsn());
        }
        let data = snapshot.serialize();
        match self.page_store.update_replacement(page.page_id(), &data) {
            Ok(()) => {
                if page.finish_flush(&snapshot) {
                    self.enqueue(page.clone());
                }
            }
            Err(err) => {
                log::error!("flush of page {} failed: {}", page.page_id(), err);
                if self.stop.load(Ordering::Acquire) {
                    // Shutting down with a failing store; the WAL still
                    // covers this page.
                    return;
                }
                std::thread::sleep(Duration::from_millis(10));
                self.enqueue(page.clone());
            }
        }
    }

    fn drain(&self) {
        let mut state = self.state.lock();
        while !state.queue.is_empty() || state.busy {
            self.idle_cv.wait(&mut state);
        }
    }
}

/// A fixed set of worker shards draining dirty pages to the page store.
/// Shutdown is cooperative: each worker finishes the pages still queued on
/// its shard before exiting.
pub struct Flusher {
    shards: Vec<Arc<FlusherShard>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Flusher {
    pub fn new(
        shard_num: usize,
        page_store: Arc<dyn PageStore>,
        log_store: Option<Arc<LogStore>>,
    ) -> CResult<Flusher> {
        let shards: Vec<Arc<FlusherShard>> = (0..shard_num)
            .map(|_| {
                Arc::new(FlusherShard {
                    state: Mutex::new(ShardState { queue: VecDeque::new(), busy: false }),
                    cv: Condvar::new(),
                    idle_cv: Condvar::new(),
                    stop: AtomicBool::new(false),
                    page_store: page_store.clone(),
                    log_store: log_store.clone(),
                })
            })
            .collect();
        let mut workers = Vec::with_capacity(shard_num);
        for (i, shard) in shards.iter().enumerate() {
            let shard = shard.clone();
            let worker = std::thread::Builder::new()
                .name(format!("arcanedb-flusher-{}", i))
                .spawn(move || shard.work_loop())?;
            workers.push(worker);
        }
        Ok(Flusher { shards, workers: Mutex::new(workers) })
    }

    /// Queues a dirty page for flushing. The in-flusher flag makes this a
    /// no-op while the page is already queued or being flushed.
    pub fn try_insert_dirty_page(&self, page: &PageHolder) {
        if !page.try_mark_in_flusher() {
            return;
        }
        let mut hasher = DefaultHasher::new();
        page.page_id().hash(&mut hasher);
        let shard = &self.shards[(hasher.finish() % self.shards.len() as u64) as usize];
        shard.enqueue(page.clone());
    }

    /// Blocks until every shard has drained to quiescence.
    pub fn force_flush_all_pages(&self) {
        for shard in &self.shards {
            shard.drain();
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        for shard in &self.shards {
            shard.stop.store(true, Ordering::Release);
            shard.cv.notify_all();
        }
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
    }
}
