//! Sequential read-ahead
//!
//! Watches the page indices each file is read at. Once the last `window`
//! distinct accesses share one positive stride, the next `depth` pages along
//! that stride are loaded into the cache in the background. Prefetch never
//! blocks or fails a read; its errors are logged and dropped.

use crate::core::cache::PageCache;
use crate::core::page::{FileId, PageKey, RemoteFile};
use ahash::AHashMap;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Files whose access history is remembered at once
const TRACKED_FILES: usize = 64;

#[derive(Debug, Default)]
struct AccessHistory {
    recent: VecDeque<u64>,
    /// Highest page index already handed to the cache
    issued_through: Option<u64>,
}

impl AccessHistory {
    fn record(&mut self, index: u64, window: usize) -> bool {
        if self.recent.back() == Some(&index) {
            return false;
        }
        self.recent.push_back(index);
        while self.recent.len() > window {
            self.recent.pop_front();
        }
        true
    }

    /// Common positive stride of the full window, if there is one
    fn stride(&self, window: usize) -> Option<u64> {
        if self.recent.len() < window {
            return None;
        }
        let mut strides = self
            .recent
            .iter()
            .zip(self.recent.iter().skip(1))
            .map(|(a, b)| b.checked_sub(*a));

        let first = strides.next()??;
        if first == 0 {
            return None;
        }
        strides
            .all(|s| s == Some(first))
            .then_some(first)
    }
}

struct PrefetchState {
    histories: LruCache<FileId, AccessHistory>,
    tasks: AHashMap<FileId, Vec<JoinHandle<()>>>,
}

pub struct Prefetcher {
    cache: PageCache,
    runtime: Handle,
    depth: u64,
    window: usize,
    state: Mutex<PrefetchState>,
    issued: AtomicU64,
}

impl Prefetcher {
    pub fn new(cache: PageCache, runtime: Handle, depth: u32, window: u32) -> Self {
        let tracked = NonZeroUsize::new(TRACKED_FILES).unwrap_or(NonZeroUsize::MIN);
        Prefetcher {
            cache,
            runtime,
            depth: depth as u64,
            window: (window as usize).max(2),
            state: Mutex::new(PrefetchState {
                histories: LruCache::new(tracked),
                tasks: AHashMap::new(),
            }),
            issued: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.depth > 0
    }

    /// Page loads handed to the cache so far
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Record a read of page `index` and schedule read-ahead if it extends a
    /// stride
    pub fn on_access(&self, file: &Arc<RemoteFile>, index: u64) {
        if !self.is_enabled() {
            return;
        }

        let mut state = self.state.lock();
        let history = state
            .histories
            .get_or_insert_mut(file.id(), AccessHistory::default);
        if !history.record(index, self.window) {
            return;
        }

        let Some(stride) = history.stride(self.window) else {
            history.issued_through = None;
            return;
        };

        let pages = file.page_count(self.cache.page_size());
        let mut targets = Vec::new();
        for step in 1..=self.depth {
            let Some(target) = stride
                .checked_mul(step)
                .and_then(|offset| index.checked_add(offset))
            else {
                break;
            };
            if target >= pages {
                break;
            }
            if history.issued_through.map_or(false, |through| target <= through) {
                continue;
            }
            history.issued_through = Some(target);
            if !self.cache.contains(PageKey::new(file.id(), target)) {
                targets.push(target);
            }
        }

        if targets.is_empty() {
            return;
        }
        trace!("stride {} on {}: prefetching {:?}", stride, file.url(), targets);

        let tasks = state.tasks.entry(file.id()).or_default();
        tasks.retain(|task| !task.is_finished());
        for target in targets {
            self.issued.fetch_add(1, Ordering::Relaxed);
            let cache = self.cache.clone();
            let file = Arc::clone(file);
            tasks.push(self.runtime.spawn(async move {
                if let Err(err) = cache.prefetch(&file, target).await {
                    debug!("prefetch of page {} of {} failed: {}", target, file.url(), err);
                }
            }));
        }
    }

    /// Drop the history of `file` and cancel its outstanding prefetches
    pub fn forget(&self, file: FileId) {
        let mut state = self.state.lock();
        state.histories.pop(&file);
        if let Some(tasks) = state.tasks.remove(&file) {
            let live = tasks.iter().filter(|task| !task.is_finished()).count();
            for task in tasks {
                task.abort();
            }
            if live > 0 {
                debug!("cancelled {} prefetch(es) for file {}", live, file);
            }
        }
    }
}

impl std::fmt::Debug for Prefetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prefetcher")
            .field("depth", &self.depth)
            .field("window", &self.window)
            .field("issued", &self.issued())
            .finish()
    }
}
