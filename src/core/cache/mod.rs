//! Shared page cache with request coalescing
//!
//! Pages are keyed by (file, page index) and held until evicted by
//! least-recent access. A miss registers a pending fetch; every concurrent
//! reader of the same key awaits that one fetch instead of issuing its own.
//!
//! # Locking
//!
//! - `pending` guards the coalescing decision (hit / join / start)
//! - `resident` guards entries and the eviction order
//!
//! Both are held only for bookkeeping, never across a network call, and are
//! always taken in that order.
//!
//! # Cancellation
//!
//! The pending table holds weak references to the shared fetch futures. A
//! fetch whose waiters have all gone away is dropped (and with it the
//! request); a fetch with any live waiter runs to completion.

mod eviction;

use self::eviction::EvictionOrder;
use crate::core::config::VfsConfig;
use crate::core::error::{CacheError, Result};
use crate::core::fetcher::RangeFetcher;
use crate::core::page::{FileId, Page, PageKey, RemoteFile};
use ahash::AHashMap;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

type PageFuture = BoxFuture<'static, Result<Arc<Page>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// A reader is waiting on this page
    Demand,
    /// Speculative load; not counted as a hit or miss
    Prefetch,
}

struct PendingFetch {
    id: u64,
    future: WeakShared<PageFuture>,
}

struct CacheEntry {
    page: Arc<Page>,
    stamp: u64,
    pins: u32,
    generation: u64,
}

/// Proof of a pin taken with [`PageCache::pin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinToken {
    key: PageKey,
    generation: u64,
}

impl PinToken {
    pub fn key(&self) -> PageKey {
        self.key
    }
}

enum Insert {
    Cached { evicted: u64 },
    /// Every resident entry is pinned; the page is served but not kept
    Uncached,
}

#[derive(Default)]
struct Resident {
    entries: AHashMap<PageKey, CacheEntry>,
    order: EvictionOrder,
    bytes: usize,
    clock: u64,
    /// Source of generation numbers; only ever increases
    epoch: u64,
    /// Generation of files without an entry in `generations`
    base_generation: u64,
    generations: AHashMap<FileId, u64>,
    /// CRC32 of each page as first fetched in the current generation
    digests: AHashMap<PageKey, u32>,
}

impl Resident {
    fn generation(&self, file: FileId) -> u64 {
        self.generations
            .get(&file)
            .copied()
            .unwrap_or(self.base_generation)
    }

    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn lookup(&mut self, key: PageKey, touch: bool) -> Option<Arc<Page>> {
        let stamp = if touch { self.clock + 1 } else { 0 };
        let entry = self.entries.get_mut(&key)?;
        if touch {
            self.order.touch(key, entry.stamp, stamp);
            entry.stamp = stamp;
            self.clock = stamp;
        }
        Some(Arc::clone(&entry.page))
    }

    fn remove(&mut self, key: PageKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(&key)?;
        self.order.remove(key, entry.stamp);
        self.bytes -= entry.page.len();
        Some(entry)
    }

    fn verify_digest(&mut self, page: &Page) -> std::result::Result<(), CacheError> {
        let digest = crc32fast::hash(page.data());
        match self.digests.entry(page.key()) {
            Entry::Occupied(known) if *known.get() != digest => Err(CacheError::Corrupt {
                key: page.key(),
                reason: format!(
                    "content changed since first fetch (crc32 {:08x} -> {:08x})",
                    known.get(),
                    digest
                ),
            }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(digest);
                Ok(())
            }
        }
    }

    fn insert(&mut self, page: Arc<Page>, capacity: usize, stamp: u64) -> Insert {
        let key = page.key();
        if self.entries.contains_key(&key) {
            return Insert::Cached { evicted: 0 };
        }

        let len = page.len();
        if len > capacity {
            return Insert::Uncached;
        }

        let mut evicted = 0;
        while self.bytes + len > capacity {
            let entries = &self.entries;
            let victim = self
                .order
                .oldest_where(|k| entries.get(k).map_or(false, |e| e.pins == 0));
            match victim {
                Some(victim) => {
                    trace!("evicting page {}", victim);
                    self.remove(victim);
                    evicted += 1;
                }
                None => return Insert::Uncached,
            }
        }

        let generation = self.generation(key.file);
        self.order.insert(key, stamp);
        self.bytes += len;
        self.entries.insert(
            key,
            CacheEntry {
                page,
                stamp,
                pins: 0,
                generation,
            },
        );
        Insert::Cached { evicted }
    }

    fn drop_pages(&mut self, file: FileId) -> usize {
        let keys: Vec<PageKey> = self
            .entries
            .keys()
            .filter(|key| key.file == file)
            .copied()
            .collect();
        for key in &keys {
            self.remove(*key);
        }
        self.digests.retain(|key, _| key.file != file);
        keys.len()
    }

    fn invalidate(&mut self, file: FileId) -> usize {
        let removed = self.drop_pages(file);
        let generation = self.next_epoch();
        self.generations.insert(file, generation);
        removed
    }

    /// Drop everything held for `file`, its generation included
    ///
    /// Raising the base generation keeps fetches still in flight for the
    /// file from being inserted once its entry is gone.
    fn forget(&mut self, file: FileId) -> usize {
        let removed = self.drop_pages(file);
        self.generations.remove(&file);
        self.base_generation = self.next_epoch();
        removed
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    fetches: AtomicU64,
    prefetches: AtomicU64,
    evictions: AtomicU64,
    uncached: AtomicU64,
}

/// Page cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Demand reads served from memory
    pub hits: u64,
    /// Demand reads that started a remote fetch
    pub misses: u64,
    /// Demand reads that joined a fetch already in flight
    pub coalesced: u64,
    /// Remote fetches started, prefetches included
    pub fetches: u64,
    /// Remote fetches started by the prefetcher
    pub prefetches: u64,
    /// Resident pages dropped to make room for new ones
    pub evictions: u64,
    /// Pages served without being kept because all entries were pinned
    pub uncached: u64,
    pub resident_bytes: usize,
    pub resident_pages: usize,
    pub capacity_bytes: usize,
}

impl CacheStats {
    /// Demand hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

struct CacheInner {
    capacity_bytes: usize,
    page_size: usize,
    fetcher: Arc<dyn RangeFetcher>,
    pending: Mutex<AHashMap<PageKey, PendingFetch>>,
    resident: Mutex<Resident>,
    next_fetch_id: AtomicU64,
    counters: Counters,
}

impl CacheInner {
    async fn fetch_page(&self, file: &RemoteFile, key: PageKey) -> Result<Arc<Page>> {
        let offset = key.index * self.page_size as u64;
        let expected = file.page_len(key.index, self.page_size);
        trace!("fetching page {} ({} bytes at {})", key, expected, offset);

        let data = self.fetcher.fetch(file, offset, expected).await?;
        if data.len() != expected {
            return Err(CacheError::Corrupt {
                key,
                reason: format!("expected {} bytes, fetched {}", expected, data.len()),
            }
            .into());
        }
        Ok(Arc::new(Page::new(key, data)))
    }

    fn finish_fetch(
        &self,
        key: PageKey,
        id: u64,
        generation: u64,
        origin: Origin,
        result: Result<Arc<Page>>,
    ) -> Result<Arc<Page>> {
        let mut pending = self.pending.lock();
        if pending.get(&key).map_or(false, |p| p.id == id) {
            pending.remove(&key);
        }

        let page = match result {
            Ok(page) => page,
            Err(err) => {
                debug!("fetch of page {} failed: {}", key, err);
                return Err(err);
            }
        };

        let mut resident = self.resident.lock();
        if resident.generation(key.file) != generation {
            debug!("page {} outlived an invalidation, not caching it", key);
            return Ok(page);
        }
        resident.verify_digest(&page)?;

        let stamp = match origin {
            Origin::Demand => resident.tick(),
            Origin::Prefetch => resident.clock,
        };
        match resident.insert(Arc::clone(&page), self.capacity_bytes, stamp) {
            Insert::Cached { evicted } => {
                if evicted > 0 {
                    self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
                    debug!("inserted page {}, evicted {} page(s)", key, evicted);
                }
            }
            Insert::Uncached => {
                self.counters.uncached.fetch_add(1, Ordering::Relaxed);
                debug!("no unpinned room for page {}, serving it uncached", key);
            }
        }
        Ok(page)
    }
}

/// Capacity-bounded page cache shared by every handle of a VFS
///
/// Cloning is cheap and yields another reference to the same cache.
#[derive(Clone)]
pub struct PageCache {
    inner: Arc<CacheInner>,
}

impl PageCache {
    pub fn new(capacity_bytes: usize, page_size: usize, fetcher: Arc<dyn RangeFetcher>) -> Self {
        PageCache {
            inner: Arc::new(CacheInner {
                capacity_bytes,
                page_size,
                fetcher,
                pending: Mutex::new(AHashMap::new()),
                resident: Mutex::new(Resident::default()),
                next_fetch_id: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    pub fn from_config(config: &VfsConfig, fetcher: Arc<dyn RangeFetcher>) -> Self {
        Self::new(config.cache_capacity(), config.page_size_bytes(), fetcher)
    }

    pub fn capacity_bytes(&self) -> usize {
        self.inner.capacity_bytes
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    pub fn fetcher(&self) -> &Arc<dyn RangeFetcher> {
        &self.inner.fetcher
    }

    pub fn resident_bytes(&self) -> usize {
        self.inner.resident.lock().bytes
    }

    pub fn resident_pages(&self) -> usize {
        self.inner.resident.lock().entries.len()
    }

    pub fn contains(&self, key: PageKey) -> bool {
        self.inner.resident.lock().entries.contains_key(&key)
    }

    /// Fetches currently in flight with at least one live waiter
    pub fn pending_fetches(&self) -> usize {
        self.inner
            .pending
            .lock()
            .values()
            .filter(|p| p.future.upgrade().is_some())
            .count()
    }

    /// Page `index` of `file`, fetching it on a miss
    pub async fn get(&self, file: &Arc<RemoteFile>, index: u64) -> Result<Arc<Page>> {
        self.load(file, index, Origin::Demand).await
    }

    /// Like [`get`](Self::get) but kept out of hit/miss accounting and
    /// inserted without refreshing recency
    pub async fn prefetch(&self, file: &Arc<RemoteFile>, index: u64) -> Result<Arc<Page>> {
        self.load(file, index, Origin::Prefetch).await
    }

    async fn load(&self, file: &Arc<RemoteFile>, index: u64, origin: Origin) -> Result<Arc<Page>> {
        let key = PageKey::new(file.id(), index);
        let pages = file.page_count(self.inner.page_size);
        if index >= pages {
            return Err(CacheError::OutOfRange { key, pages }.into());
        }

        let counters = &self.inner.counters;
        let shared = {
            let mut pending = self.inner.pending.lock();

            let hit = self
                .inner
                .resident
                .lock()
                .lookup(key, origin == Origin::Demand);
            if let Some(page) = hit {
                if origin == Origin::Demand {
                    counters.hits.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(page);
            }

            match pending.get(&key).and_then(|p| p.future.upgrade()) {
                Some(in_flight) => {
                    if origin == Origin::Demand {
                        counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    }
                    trace!("joining in-flight fetch of page {}", key);
                    in_flight
                }
                None => {
                    match origin {
                        Origin::Demand => counters.misses.fetch_add(1, Ordering::Relaxed),
                        Origin::Prefetch => counters.prefetches.fetch_add(1, Ordering::Relaxed),
                    };
                    counters.fetches.fetch_add(1, Ordering::Relaxed);

                    let (id, future) = self.start_fetch(Arc::clone(file), key, origin);
                    if let Some(weak) = future.downgrade() {
                        pending.insert(key, PendingFetch { id, future: weak });
                    }
                    future
                }
            }
        };

        shared.await
    }

    /// Build the shared fetch future; caller holds the pending lock
    fn start_fetch(
        &self,
        file: Arc<RemoteFile>,
        key: PageKey,
        origin: Origin,
    ) -> (u64, Shared<PageFuture>) {
        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let generation = self.inner.resident.lock().generation(key.file);
        let inner = Arc::clone(&self.inner);

        let future: PageFuture = async move {
            let result = inner.fetch_page(&file, key).await;
            inner.finish_fetch(key, id, generation, origin, result)
        }
        .boxed();

        (id, future.shared())
    }

    /// Keep a resident page from being evicted until [`unpin`](Self::unpin)
    pub fn pin(&self, key: PageKey) -> Option<PinToken> {
        let mut resident = self.inner.resident.lock();
        let entry = resident.entries.get_mut(&key)?;
        entry.pins += 1;
        Some(PinToken {
            key,
            generation: entry.generation,
        })
    }

    pub fn unpin(&self, token: PinToken) {
        let mut resident = self.inner.resident.lock();
        if let Some(entry) = resident.entries.get_mut(&token.key) {
            // Invalidation replaced the entry the token was taken on
            if entry.generation == token.generation {
                entry.pins = entry.pins.saturating_sub(1);
            }
        }
    }

    pub fn is_pinned(&self, key: PageKey) -> bool {
        self.inner
            .resident
            .lock()
            .entries
            .get(&key)
            .map_or(false, |e| e.pins > 0)
    }

    /// Drop every resident page of `file`
    ///
    /// Fetches already in flight still complete for their waiters but are
    /// not inserted.
    pub fn invalidate(&self, file: FileId) {
        let mut pending = self.inner.pending.lock();
        pending.retain(|key, _| key.file != file);
        let removed = self.inner.resident.lock().invalidate(file);
        debug!("invalidated file {}: dropped {} page(s)", file, removed);
    }

    /// Release all state kept for `file`: pages, digests and generation
    ///
    /// Called once no handle has the file open. Like
    /// [`invalidate`](Self::invalidate), fetches in flight are not inserted.
    pub fn forget(&self, file: FileId) {
        let mut pending = self.inner.pending.lock();
        pending.retain(|key, _| key.file != file);
        let removed = self.inner.resident.lock().forget(file);
        debug!("forgot file {}: dropped {} page(s)", file, removed);
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.inner.counters;
        let (resident_bytes, resident_pages) = {
            let resident = self.inner.resident.lock();
            (resident.bytes, resident.entries.len())
        };
        CacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            fetches: counters.fetches.load(Ordering::Relaxed),
            prefetches: counters.prefetches.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            uncached: counters.uncached.load(Ordering::Relaxed),
            resident_bytes,
            resident_pages,
            capacity_bytes: self.inner.capacity_bytes,
        }
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("capacity_bytes", &self.inner.capacity_bytes)
            .field("page_size", &self.inner.page_size)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{FetchError, VfsError};
    use crate::core::fetcher::MemoryFetcher;
    use std::time::Duration;

    const PAGE: usize = 4096;
    const URL: &str = "mem://test.db";

    fn page_pattern(pages: usize) -> Vec<u8> {
        (0..pages * PAGE).map(|i| (i / PAGE) as u8 + 1).collect()
    }

    fn setup(capacity_pages: usize, file_pages: usize) -> (Arc<MemoryFetcher>, PageCache, Arc<RemoteFile>) {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(URL, page_pattern(file_pages));
        let cache = PageCache::new(capacity_pages * PAGE, PAGE, fetcher.clone());
        let file = Arc::new(RemoteFile::new(URL, (file_pages * PAGE) as u64, true));
        (fetcher, cache, file)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let (fetcher, cache, file) = setup(4, 4);

        let first = cache.get(&file, 1).await.unwrap();
        let second = cache.get(&file, 1).await.unwrap();

        assert_eq!(first.data()[0], 2);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fetcher.fetch_count(), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.resident_bytes, PAGE);
    }

    #[tokio::test]
    async fn test_two_page_capacity_evicts_oldest() {
        let (fetcher, cache, file) = setup(2, 4);

        for index in 0..3 {
            cache.get(&file, index).await.unwrap();
        }
        assert!(!cache.contains(PageKey::new(file.id(), 0)));
        assert!(cache.contains(PageKey::new(file.id(), 1)));
        assert!(cache.contains(PageKey::new(file.id(), 2)));
        assert_eq!(fetcher.fetch_count(), 3);

        cache.get(&file, 0).await.unwrap();
        assert_eq!(fetcher.fetch_count(), 4);
        assert_eq!(fetcher.fetches_at(URL, 0), 2);
        assert!(cache.resident_bytes() <= cache.capacity_bytes());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_coalesce() {
        let (fetcher, cache, file) = setup(4, 4);
        fetcher.pause();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let file = Arc::clone(&file);
                tokio::spawn(async move { cache.get(&file, 2).await })
            })
            .collect();

        wait_until(|| cache.stats().misses + cache.stats().coalesced == 16).await;
        assert_eq!(fetcher.fetch_count(), 1);
        fetcher.resume();

        for task in tasks {
            let page = task.await.unwrap().unwrap();
            assert_eq!(page.data()[0], 3);
        }

        let stats = cache.stats();
        assert_eq!(fetcher.fetch_count(), 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.coalesced, 15);
        assert_eq!(cache.pending_fetches(), 0);
    }

    #[tokio::test]
    async fn test_pinned_entries_survive_pressure() {
        let (_fetcher, cache, file) = setup(2, 4);

        cache.get(&file, 0).await.unwrap();
        let token = cache.pin(PageKey::new(file.id(), 0)).unwrap();
        cache.get(&file, 1).await.unwrap();
        cache.get(&file, 2).await.unwrap();

        assert!(cache.contains(PageKey::new(file.id(), 0)));
        assert!(!cache.contains(PageKey::new(file.id(), 1)));

        cache.unpin(token);
        assert!(!cache.is_pinned(PageKey::new(file.id(), 0)));
        cache.get(&file, 3).await.unwrap();
        assert!(!cache.contains(PageKey::new(file.id(), 0)));
    }

    #[tokio::test]
    async fn test_all_pinned_serves_uncached() {
        let (_fetcher, cache, file) = setup(1, 4);

        cache.get(&file, 0).await.unwrap();
        cache.pin(PageKey::new(file.id(), 0)).unwrap();

        let page = cache.get(&file, 1).await.unwrap();
        assert_eq!(page.data()[0], 2);
        assert!(!cache.contains(PageKey::new(file.id(), 1)));
        assert_eq!(cache.stats().uncached, 1);
        assert_eq!(cache.resident_bytes(), PAGE);
    }

    #[tokio::test]
    async fn test_prefetched_ties_break_on_lowest_index() {
        let (_fetcher, cache, file) = setup(3, 12);

        cache.prefetch(&file, 6).await.unwrap();
        cache.prefetch(&file, 5).await.unwrap();
        cache.get(&file, 9).await.unwrap();

        // 5 and 6 share the same stamp; the lower index goes first
        cache.get(&file, 1).await.unwrap();
        assert!(!cache.contains(PageKey::new(file.id(), 5)));
        assert!(cache.contains(PageKey::new(file.id(), 6)));

        cache.get(&file, 2).await.unwrap();
        assert!(!cache.contains(PageKey::new(file.id(), 6)));

        let stats = cache.stats();
        assert_eq!(stats.prefetches, 2);
        assert_eq!(stats.misses, 3);
    }

    #[tokio::test]
    async fn test_fetch_errors_propagate_and_are_not_cached() {
        let (fetcher, cache, file) = setup(2, 2);
        fetcher.fail_next(URL, FetchError::unavailable(4, "HTTP 503"));

        let err = cache.get(&file, 0).await.unwrap_err();
        assert!(matches!(err, VfsError::Fetch(FetchError::Unavailable { .. })));
        assert!(!cache.contains(PageKey::new(file.id(), 0)));

        cache.get(&file, 0).await.unwrap();
        assert_eq!(fetcher.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_short_page_is_corrupt() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(URL, vec![1u8; 10_000]);
        let cache = PageCache::new(4 * PAGE, PAGE, fetcher.clone());
        // Opened believing the object is three full pages
        let file = Arc::new(RemoteFile::new(URL, 3 * PAGE as u64, true));

        let err = cache.get(&file, 2).await.unwrap_err();
        assert!(matches!(err, VfsError::Cache(CacheError::Corrupt { .. })));
        assert!(!cache.contains(PageKey::new(file.id(), 2)));
    }

    #[tokio::test]
    async fn test_changed_content_is_corrupt() {
        let (fetcher, cache, file) = setup(1, 2);

        cache.get(&file, 0).await.unwrap();
        cache.get(&file, 1).await.unwrap(); // evicts page 0
        fetcher.insert(URL, vec![0xEE; 2 * PAGE]);

        let err = cache.get(&file, 0).await.unwrap_err();
        assert!(matches!(err, VfsError::Cache(CacheError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_invalidate_resets_file() {
        let (fetcher, cache, file) = setup(2, 2);

        cache.get(&file, 0).await.unwrap();
        cache.invalidate(file.id());
        assert_eq!(cache.resident_pages(), 0);
        assert_eq!(cache.resident_bytes(), 0);

        fetcher.insert(URL, vec![0xEE; 2 * PAGE]);
        let page = cache.get(&file, 0).await.unwrap();
        assert_eq!(page.data()[0], 0xEE);
    }

    #[tokio::test]
    async fn test_invalidate_during_fetch_skips_insert() {
        let (fetcher, cache, file) = setup(2, 2);
        fetcher.pause();

        let task = {
            let cache = cache.clone();
            let file = Arc::clone(&file);
            tokio::spawn(async move { cache.get(&file, 0).await })
        };
        wait_until(|| fetcher.fetch_count() == 1).await;

        cache.invalidate(file.id());
        fetcher.resume();

        assert!(task.await.unwrap().is_ok());
        assert!(!cache.contains(PageKey::new(file.id(), 0)));
    }

    #[tokio::test]
    async fn test_forget_releases_file_state() {
        let (_fetcher, cache, file) = setup(1, 3);

        cache.invalidate(file.id());
        for index in 0..3 {
            cache.get(&file, index).await.unwrap();
        }
        {
            // Evicted pages keep their digests
            let resident = cache.inner.resident.lock();
            assert_eq!(resident.entries.len(), 1);
            assert_eq!(resident.digests.len(), 3);
            assert_eq!(resident.generations.len(), 1);
        }

        cache.forget(file.id());
        let resident = cache.inner.resident.lock();
        assert!(resident.digests.is_empty());
        assert!(resident.generations.is_empty());
        assert!(resident.entries.is_empty());
        assert_eq!(resident.bytes, 0);
    }

    #[tokio::test]
    async fn test_forget_during_fetch_skips_insert() {
        let (fetcher, cache, file) = setup(2, 2);
        fetcher.pause();

        let task = {
            let cache = cache.clone();
            let file = Arc::clone(&file);
            tokio::spawn(async move { cache.get(&file, 0).await })
        };
        wait_until(|| fetcher.fetch_count() == 1).await;

        cache.forget(file.id());
        fetcher.resume();

        assert!(task.await.unwrap().is_ok());
        assert!(!cache.contains(PageKey::new(file.id(), 0)));
        assert!(cache.inner.resident.lock().digests.is_empty());
    }

    #[tokio::test]
    async fn test_evictions_are_counted() {
        let (_fetcher, cache, file) = setup(2, 4);

        for index in 0..4 {
            cache.get(&file, index).await.unwrap();
        }
        assert_eq!(cache.stats().evictions, 2);
    }

    #[tokio::test]
    async fn test_out_of_range_page() {
        let (fetcher, cache, file) = setup(2, 2);
        let err = cache.get(&file, 2).await.unwrap_err();
        assert!(matches!(
            err,
            VfsError::Cache(CacheError::OutOfRange { pages: 2, .. })
        ));
        assert_eq!(fetcher.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_fetch_is_cancelled() {
        let (fetcher, cache, file) = setup(2, 2);
        fetcher.pause();

        let task = {
            let cache = cache.clone();
            let file = Arc::clone(&file);
            tokio::spawn(async move { cache.get(&file, 0).await })
        };
        wait_until(|| fetcher.fetch_count() == 1).await;
        assert_eq!(cache.pending_fetches(), 1);

        task.abort();
        let _ = task.await;
        assert_eq!(cache.pending_fetches(), 0);

        fetcher.resume();
        cache.get(&file, 0).await.unwrap();
        assert_eq!(fetcher.fetch_count(), 2);
        assert_eq!(fetcher.completed_count(), 1);
    }
}
