//! In-process object store implementing [`RangeFetcher`]
//!
//! Used by the test suites and benches, and by embedders that already hold a
//! database image in memory. Supports scripted failures, a pause gate to hold
//! fetches in flight, and per-range request counters.

use super::{clamp_range, RangeFetcher};
use crate::core::error::FetchError;
use crate::core::page::RemoteFile;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug)]
pub struct MemoryFetcher {
    objects: RwLock<HashMap<String, Bytes>>,
    /// Errors returned (in order) by the next fetches of a URL
    scripted: Mutex<HashMap<String, VecDeque<FetchError>>>,
    /// Range request counts keyed by (url, offset)
    ranges: Mutex<HashMap<(String, u64), u64>>,
    latency: Mutex<Option<Duration>>,
    gate: watch::Sender<bool>,
    fetches_started: AtomicU64,
    fetches_completed: AtomicU64,
    size_requests: AtomicU64,
}

impl Default for MemoryFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFetcher {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        MemoryFetcher {
            objects: RwLock::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            ranges: Mutex::new(HashMap::new()),
            latency: Mutex::new(None),
            gate,
            fetches_started: AtomicU64::new(0),
            fetches_completed: AtomicU64::new(0),
            size_requests: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        self.objects.write().insert(url.into(), data.into());
    }

    pub fn remove(&self, url: &str) -> Option<Bytes> {
        self.objects.write().remove(url)
    }

    /// Make the next fetch of `url` fail with `err`
    pub fn fail_next(&self, url: &str, err: FetchError) {
        self.scripted
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Hold every fetch that starts from now on until [`resume`](Self::resume)
    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    /// Range requests that reached the store
    pub fn fetch_count(&self) -> u64 {
        self.fetches_started.load(Ordering::SeqCst)
    }

    /// Range requests that ran to completion (not cancelled mid-flight)
    pub fn completed_count(&self) -> u64 {
        self.fetches_completed.load(Ordering::SeqCst)
    }

    pub fn size_request_count(&self) -> u64 {
        self.size_requests.load(Ordering::SeqCst)
    }

    /// Range requests for `url` starting at `offset`
    pub fn fetches_at(&self, url: &str, offset: u64) -> u64 {
        self.ranges
            .lock()
            .get(&(url.to_string(), offset))
            .copied()
            .unwrap_or(0)
    }

    pub fn reset_counters(&self) {
        self.fetches_started.store(0, Ordering::SeqCst);
        self.fetches_completed.store(0, Ordering::SeqCst);
        self.size_requests.store(0, Ordering::SeqCst);
        self.ranges.lock().clear();
    }

    async fn wait_for_gate(&self) {
        let mut rx = self.gate.subscribe();
        // Sender lives in self, so this only fails if self is gone
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl RangeFetcher for MemoryFetcher {
    async fn object_size(&self, url: &str) -> Result<u64, FetchError> {
        self.size_requests.fetch_add(1, Ordering::SeqCst);
        self.objects
            .read()
            .get(url)
            .map(|data| data.len() as u64)
            .ok_or_else(|| FetchError::NotFound(url.to_string()))
    }

    async fn fetch(&self, file: &RemoteFile, offset: u64, len: usize) -> Result<Bytes, FetchError> {
        self.fetches_started.fetch_add(1, Ordering::SeqCst);
        *self
            .ranges
            .lock()
            .entry((file.url().to_string(), offset))
            .or_insert(0) += 1;

        self.wait_for_gate().await;
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self
            .scripted
            .lock()
            .get_mut(file.url())
            .and_then(|queue| queue.pop_front());
        if let Some(err) = scripted {
            self.fetches_completed.fetch_add(1, Ordering::SeqCst);
            return Err(err);
        }

        let data = self
            .objects
            .read()
            .get(file.url())
            .cloned()
            .ok_or_else(|| FetchError::NotFound(file.url().to_string()))?;

        self.fetches_completed.fetch_add(1, Ordering::SeqCst);
        match clamp_range(file, offset, len) {
            Some((start, end)) => {
                let end = (end as usize).min(data.len().saturating_sub(1));
                if start as usize > end {
                    return Ok(Bytes::new());
                }
                Ok(data.slice(start as usize..=end))
            }
            None => Ok(Bytes::new()),
        }
    }
}
