use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::cache::{Flusher, SingleFlight};
use crate::config;
use crate::error::{CResult, Error};
use crate::page::TreePage;
use crate::pstore::{PageStore, RawPageType};
use crate::wal::LogStore;

/// A ref-counted handle keeping a page resident. Eviction only considers
/// pages whose sole remaining reference is the cache's own.
pub type PageHolder = Arc<TreePage>;

struct Shard {
    cache: LruCache<String, PageHolder>,
    charge: usize,
}

/// A sharded LRU of pages keyed by page id.
///
/// Missing pages are loaded through a single-flight group, so at most one
/// loader per key hits the page store; a `NotFound` from the store yields a
/// fresh empty page. Each shard accounts a fixed charge per resident page and
/// evicts from the cold end once its share of the capacity is exceeded,
/// skipping pages that are held, dirty, or sitting in the flusher.
pub struct BufferPool {
    shards: Vec<Mutex<Shard>>,
    shard_capacity: usize,
    load_group: SingleFlight<PageHolder>,
    page_store: Option<Arc<dyn PageStore>>,
    flusher: Option<Flusher>,
}

impl BufferPool {
    pub fn new(
        page_store: Option<Arc<dyn PageStore>>,
        log_store: Option<Arc<LogStore>>,
    ) -> CResult<BufferPool> {
        Self::with_capacity(page_store, log_store, config::CACHE_CAPACITY)
    }

    pub fn with_capacity(
        page_store: Option<Arc<dyn PageStore>>,
        log_store: Option<Arc<LogStore>>,
        capacity: usize,
    ) -> CResult<BufferPool> {
        let shard_num = config::CACHE_SHARD_NUM;
        let flusher = match &page_store {
            Some(store) => {
                Some(Flusher::new(config::FLUSHER_SHARD_NUM, store.clone(), log_store)?)
            }
            None => None,
        };
        Ok(BufferPool {
            shards: (0..shard_num)
                .map(|_| Mutex::new(Shard { cache: LruCache::unbounded(), charge: 0 }))
                .collect(),
            shard_capacity: (capacity / shard_num).max(config::PAGE_CHARGE),
            load_group: SingleFlight::new(),
            page_store,
            flusher,
        })
    }

    /// Fetches the page for `page_id`, loading it from the page store on a
    /// miss. The returned holder keeps the page alive across eviction.
    pub fn get_page(&self, page_id: &str) -> CResult<PageHolder> {
        if let Some(holder) = self.lookup(page_id) {
            return Ok(holder);
        }
        self.load_group.work(page_id, || {
            // A racing loader may have finished while we queued behind it.
            if let Some(holder) = self.lookup(page_id) {
                return Ok(holder);
            }
            let page = TreePage::new_leaf(page_id);
            if let Some(store) = &self.page_store {
                match store.read_page(page_id) {
                    Ok(raw_pages) => {
                        // Blobs come back head-first; apply them oldest
                        // first, base before deltas.
                        for raw in raw_pages.iter().rev() {
                            match raw.page_type {
                                RawPageType::Base => page.install_snapshot(&raw.data)?,
                                RawPageType::Delta => page.prepend_delta_blob(&raw.data)?,
                            }
                        }
                    }
                    Err(Error::NotFound) => {}
                    Err(err) => return Err(err),
                }
            }
            let holder = Arc::new(page);
            self.insert(page_id, holder.clone());
            Ok(holder)
        })
    }

    /// Hands a dirty page to the flusher. At most one enqueue per dirty
    /// epoch; a no-op when flushing is disabled.
    pub fn try_insert_dirty_page(&self, holder: &PageHolder) {
        if let Some(flusher) = &self.flusher {
            flusher.try_insert_dirty_page(holder);
        }
    }

    /// Drains every flusher shard to quiescence.
    pub fn force_flush_all_pages(&self) {
        if let Some(flusher) = &self.flusher {
            flusher.force_flush_all_pages();
        }
    }

    fn shard(&self, page_id: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        page_id.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    fn lookup(&self, page_id: &str) -> Option<PageHolder> {
        self.shard(page_id).lock().cache.get(page_id).cloned()
    }

    fn insert(&self, page_id: &str, holder: PageHolder) {
        let mut shard = self.shard(page_id).lock();
        if shard.cache.push(page_id.to_owned(), holder).is_none() {
            shard.charge += config::PAGE_CHARGE;
        }
        while shard.charge > self.shard_capacity {
            if !Self::evict_one(&mut shard) {
                break;
            }
        }
    }

    /// Pops the coldest evictable page. Pinned, dirty, and in-flusher pages
    /// rotate back to the warm end; gives up after one full rotation.
    fn evict_one(shard: &mut Shard) -> bool {
        for _ in 0..shard.cache.len() {
            match shard.cache.pop_lru() {
                Some((page_id, holder)) => {
                    if Arc::strong_count(&holder) == 1 && holder.is_evictable() {
                        shard.charge -= config::PAGE_CHARGE;
                        log::debug!("evicted page {}", page_id);
                        return true;
                    }
                    shard.cache.push(page_id, holder);
                }
                None => return false,
            }
        }
        false
    }

    #[cfg(test)]
    fn resident_pages(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().cache.len()).sum()
    }
}
