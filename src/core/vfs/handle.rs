//! Open file handles
//!
//! A [`FileHandle`] is what one SQLite connection holds for one remote
//! database. All handles on the same URL share an [`OpenFile`]: the remote
//! file description, the optional write overlay, and the lock table.

use super::lock::{LockLevel, LockTable};
use super::vfs::WebVfs;
use crate::core::cache::PinToken;
use crate::core::error::{LockError, Result, VfsError};
use crate::core::overlay::Overlay;
use crate::core::page::{Page, PageKey, RemoteFile};
use ahash::AHashMap;
use futures::future::try_join_all;
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use std::os::raw::c_int;
use std::sync::Arc;
use tracing::{trace, warn};

/// How the caller asked for the file to be opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub read_write: bool,
    pub create: bool,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn read_write() -> Self {
        OpenOptions {
            read_write: true,
            create: false,
        }
    }
}

/// State shared by every handle on one remote file
#[derive(Debug)]
pub struct OpenFile {
    pub(crate) remote: Arc<RemoteFile>,
    pub(crate) overlay: Mutex<Option<Overlay>>,
    pub(crate) locks: Mutex<LockTable>,
}

impl OpenFile {
    pub(crate) fn new(remote: Arc<RemoteFile>, overlay: Option<Overlay>) -> Self {
        OpenFile {
            remote,
            overlay: Mutex::new(overlay),
            locks: Mutex::new(LockTable::new()),
        }
    }

    pub fn remote(&self) -> &Arc<RemoteFile> {
        &self.remote
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Open,
    Closed,
}

/// Result of a read that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Complete,
    /// Read ran past EOF; `filled` bytes are data, the rest is zeroed
    Short { filled: usize },
}

pub struct FileHandle {
    id: u64,
    vfs: Arc<WebVfs>,
    file: Arc<OpenFile>,
    state: HandleState,
    lock: LockLevel,
    writable: bool,
    /// Pin on page 0, which every transaction reads first
    header_pin: Option<PinToken>,
}

impl FileHandle {
    pub(crate) fn new(id: u64, vfs: Arc<WebVfs>, file: Arc<OpenFile>, writable: bool) -> Self {
        FileHandle {
            id,
            vfs,
            file,
            state: HandleState::Open,
            lock: LockLevel::None,
            writable,
            header_pin: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn remote(&self) -> &Arc<RemoteFile> {
        self.file.remote()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn lock_level(&self) -> LockLevel {
        self.lock
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            HandleState::Open => Ok(()),
            HandleState::Closed => Err(VfsError::Closed),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.writable {
            Ok(())
        } else {
            Err(VfsError::ReadOnly)
        }
    }

    fn page_size(&self) -> u64 {
        self.vfs.cache().page_size() as u64
    }

    /// Load remote pages through the shared cache, blocking until all arrive
    fn load_pages(&self, indices: Vec<u64>) -> Result<AHashMap<u64, Arc<Page>>> {
        if indices.is_empty() {
            return Ok(AHashMap::new());
        }
        let cache = self.vfs.cache().clone();
        let remote = Arc::clone(self.file.remote());
        let pages = self
            .vfs
            .executor()
            .block_on(async move {
                try_join_all(indices.iter().map(|&index| cache.get(&remote, index))).await
            })??;

        Ok(pages
            .into_iter()
            .map(|page| (page.key().index, page))
            .collect())
    }

    /// Fill `buf` from `offset`
    ///
    /// Bytes past EOF are zeroed and reported as a short read.
    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<ReadOutcome> {
        self.ensure_open()?;
        let page_size = self.page_size();
        let remote = Arc::clone(self.file.remote());

        let (size, base_limit, local) = match self.file.overlay.lock().as_ref() {
            Some(overlay) => {
                let end = offset.saturating_add(buf.len() as u64);
                let local: AHashMap<u64, Vec<u8>> = page_range(offset, end, page_size)
                    .filter_map(|index| overlay.page(index).map(|p| (index, p.to_vec())))
                    .collect();
                (overlay.size(), overlay.base_limit(), local)
            }
            None => (remote.size(), remote.size(), AHashMap::new()),
        };

        if offset >= size {
            buf.fill(0);
            return Ok(ReadOutcome::Short { filled: 0 });
        }
        let end = size.min(offset + buf.len() as u64);
        let filled = (end - offset) as usize;

        let base_end = base_limit.min(remote.size());
        let wanted: Vec<u64> = page_range(offset, end, page_size)
            .filter(|index| !local.contains_key(index) && index * page_size < base_end)
            .collect();
        trace!(
            "handle {} read {} bytes at {} ({} remote page(s))",
            self.id,
            buf.len(),
            offset,
            wanted.len()
        );
        let fetched = self.load_pages(wanted.clone())?;

        for index in page_range(offset, end, page_size) {
            let page_start = index * page_size;
            let from = offset.max(page_start);
            let to = end.min(page_start + page_size);
            let out = &mut buf[(from - offset) as usize..(to - offset) as usize];
            let at = (from - page_start) as usize;

            if let Some(page) = local.get(&index) {
                out.copy_from_slice(&page[at..at + out.len()]);
                continue;
            }

            out.fill(0);
            if let Some(page) = fetched.get(&index) {
                let visible = (base_end - page_start).min(page.len() as u64) as usize;
                if at < visible {
                    let n = (visible - at).min(out.len());
                    out[..n].copy_from_slice(&page.data()[at..at + n]);
                }
            }
        }
        buf[filled..].fill(0);

        if let Some(&last) = wanted.last() {
            self.vfs.prefetcher().on_access(&remote, last);
        }
        if self.header_pin.is_none() && wanted.first() == Some(&0) {
            self.header_pin = self.vfs.cache().pin(PageKey::new(remote.id(), 0));
            if let Some(engine) = fetched.get(&0).and_then(|p| header_page_size(p.data())) {
                if engine as u64 > page_size {
                    warn!(
                        "{} uses {} byte pages, larger than the {} byte fetch size; \
                         every database page costs several requests",
                        remote.url(),
                        engine,
                        page_size
                    );
                }
            }
        }

        if filled < buf.len() {
            Ok(ReadOutcome::Short { filled })
        } else {
            Ok(ReadOutcome::Complete)
        }
    }

    /// Write into the overlay; the remote object is never modified
    pub fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.ensure_writable()?;
        let remote_pages = self.file.remote().page_count(self.page_size() as usize);

        let missing: Vec<u64> = self
            .file
            .overlay
            .lock()
            .as_ref()
            .map(|overlay| overlay.missing_base_pages(offset, data.len()))
            .unwrap_or_default()
            .into_iter()
            .filter(|&index| index < remote_pages)
            .collect();
        let base = self.load_pages(missing)?;

        let mut overlay = self.file.overlay.lock();
        let overlay = overlay.as_mut().ok_or(VfsError::ReadOnly)?;
        overlay.write(offset, data, |index| base.get(&index).map(|p| p.data().clone()));
        trace!("handle {} wrote {} bytes at {}", self.id, data.len(), offset);
        Ok(())
    }

    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.ensure_writable()?;
        let mut overlay = self.file.overlay.lock();
        overlay.as_mut().ok_or(VfsError::ReadOnly)?.truncate(size);
        Ok(())
    }

    /// Nothing to flush: the remote store is authoritative and the overlay
    /// lives in memory
    pub fn sync(&self) -> Result<()> {
        self.ensure_open()
    }

    pub fn size(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(match self.file.overlay.lock().as_ref() {
            Some(overlay) => overlay.size(),
            None => self.file.remote().size(),
        })
    }

    pub fn lock(&mut self, level: LockLevel) -> Result<()> {
        self.ensure_open()?;
        if level <= self.lock {
            return Ok(());
        }
        if !self.writable {
            if level > LockLevel::Shared {
                return Err(LockError::Unsupported(level.name()).into());
            }
            self.lock = level;
            return Ok(());
        }
        self.file.locks.lock().acquire(&mut self.lock, level)?;
        Ok(())
    }

    pub fn unlock(&mut self, level: LockLevel) -> Result<()> {
        self.ensure_open()?;
        self.release_lock(level);
        Ok(())
    }

    fn release_lock(&mut self, level: LockLevel) {
        if level >= self.lock {
            return;
        }
        if self.writable {
            self.file.locks.lock().release(&mut self.lock, level);
        } else {
            self.lock = level;
        }
    }

    /// Whether any handle on this file holds RESERVED or above
    pub fn check_reserved_lock(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.writable && self.file.locks.lock().is_reserved())
    }

    pub fn device_characteristics(&self) -> c_int {
        if self.writable {
            ffi::SQLITE_IOCAP_POWERSAFE_OVERWRITE | ffi::SQLITE_IOCAP_SAFE_APPEND
        } else {
            ffi::SQLITE_IOCAP_IMMUTABLE | ffi::SQLITE_IOCAP_POWERSAFE_OVERWRITE
        }
    }

    pub fn sector_size(&self) -> c_int {
        self.page_size().min(64 * 1024) as c_int
    }

    /// Release locks and pins; other handles' cache entries are untouched
    pub fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.release_lock(LockLevel::None);
        if let Some(token) = self.header_pin.take() {
            self.vfs.cache().unpin(token);
        }
        self.state = HandleState::Closed;
        self.vfs.release(&self.file);
        trace!("handle {} closed", self.id);
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.state == HandleState::Open {
            let _ = self.close();
        }
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("id", &self.id)
            .field("url", &self.file.remote().url())
            .field("state", &self.state)
            .field("lock", &self.lock)
            .field("writable", &self.writable)
            .finish()
    }
}

/// Database page size recorded in a SQLite header (big-endian at offset 16)
fn header_page_size(header: &[u8]) -> Option<u32> {
    if !header.starts_with(b"SQLite format 3\0") || header.len() < 18 {
        return None;
    }
    match u16::from_be_bytes([header[16], header[17]]) {
        1 => Some(65536),
        size if size >= 512 && size.is_power_of_two() => Some(size as u32),
        _ => None,
    }
}

/// Page indices overlapping `[start, end)`
fn page_range(start: u64, end: u64, page_size: u64) -> impl Iterator<Item = u64> {
    let first = start / page_size;
    let last = if end > start {
        (end - 1) / page_size + 1
    } else {
        first
    };
    first..last
}
