//! SQLite VFS implementation
//!
//! Implements the sqlite3_vfs interface on top of remote objects fetched by
//! HTTP range requests. Only main database files are served remotely; every
//! other file SQLite asks for (journals, temp files) and the VFS utility
//! callbacks are delegated to the default VFS found at registration time.

use super::handle::{FileHandle, OpenFile, OpenOptions};
use crate::core::cache::{CacheStats, PageCache};
use crate::core::config::VfsConfig;
use crate::core::error::{FetchError, OpenError, Result, VfsError};
use crate::core::executor::BlockingExecutor;
use crate::core::fetcher::{HttpRangeFetcher, RangeFetcher};
use crate::core::overlay::Overlay;
use crate::core::page::{FileId, RemoteFile};
use crate::core::prefetch::Prefetcher;
use ahash::AHashMap;
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use serde::Serialize;
use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct FileEntry {
    file: Arc<OpenFile>,
    handles: usize,
}

#[derive(Default)]
struct FileTable {
    open: AHashMap<FileId, FileEntry>,
}

/// VFS statistics
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VfsStats {
    pub cache: CacheStats,
    pub prefetch_issued: u64,
    pub open_files: usize,
}

/// Remote-backed VFS instance
///
/// Owns the page cache, the prefetcher and the I/O runtime. Handles keep the
/// instance alive, so it outlives every file opened through it.
pub struct WebVfs {
    config: VfsConfig,
    fetcher: Arc<dyn RangeFetcher>,
    cache: PageCache,
    prefetcher: Prefetcher,
    files: Mutex<FileTable>,
    next_handle: AtomicU64,
    executor: BlockingExecutor,
}

impl WebVfs {
    /// Create a VFS fetching over HTTP
    pub fn new(config: VfsConfig) -> Result<Arc<Self>> {
        let fetcher = HttpRangeFetcher::new(&config)?;
        Self::with_fetcher(config, Arc::new(fetcher))
    }

    /// Create a VFS over any [`RangeFetcher`]
    pub fn with_fetcher(config: VfsConfig, fetcher: Arc<dyn RangeFetcher>) -> Result<Arc<Self>> {
        config.check()?;
        let executor = BlockingExecutor::new(config.worker_threads as usize)?;
        let cache = PageCache::from_config(&config, Arc::clone(&fetcher));
        let prefetcher = Prefetcher::new(
            cache.clone(),
            executor.handle().clone(),
            config.prefetch_depth,
            config.prefetch_window,
        );

        Ok(Arc::new(WebVfs {
            config,
            fetcher,
            cache,
            prefetcher,
            files: Mutex::new(FileTable::default()),
            next_handle: AtomicU64::new(1),
            executor,
        }))
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn prefetcher(&self) -> &Prefetcher {
        &self.prefetcher
    }

    pub fn executor(&self) -> &BlockingExecutor {
        &self.executor
    }

    pub fn open_files(&self) -> usize {
        self.files.lock().open.len()
    }

    pub fn stats(&self) -> VfsStats {
        VfsStats {
            cache: self.cache.stats(),
            prefetch_issued: self.prefetcher.issued(),
            open_files: self.open_files(),
        }
    }

    /// Open the remote database at `url`
    ///
    /// Without an overlay every handle is read-only, whatever was asked for.
    pub fn open(self: &Arc<Self>, url: &str, options: OpenOptions) -> Result<FileHandle> {
        let id = FileId::for_url(url);
        let existing = self.files.lock().open.get(&id).map(|e| Arc::clone(&e.file));

        let file = match existing {
            Some(file) => file,
            None => Arc::new(self.describe(url, options)?),
        };

        let file = {
            let mut files = self.files.lock();
            let fresh = !files.open.contains_key(&id);
            if fresh {
                // The object may have been republished since pages of an
                // earlier open were cached, even at the same size
                self.cache.invalidate(id);
            }
            let entry = files.open.entry(id).or_insert(FileEntry { file, handles: 0 });
            entry.handles += 1;
            Arc::clone(&entry.file)
        };

        let writable = file.overlay.lock().is_some();
        if options.read_write && !writable {
            debug!("{} opened read-only: no write overlay configured", url);
        }

        let handle_id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        debug!("handle {} opened {} ({} bytes)", handle_id, url, file.remote().size());
        Ok(FileHandle::new(handle_id, Arc::clone(self), file, writable))
    }

    /// Query the remote size and build the shared file state
    fn describe(&self, url: &str, options: OpenOptions) -> Result<OpenFile> {
        let fetcher = Arc::clone(&self.fetcher);
        let owned = url.to_string();
        let size = match self
            .executor
            .block_on(async move { fetcher.object_size(&owned).await })?
        {
            Ok(size) => size,
            Err(FetchError::NotFound(reason)) if options.create => {
                return Err(OpenError::Unsupported(format!(
                    "cannot create remote database {} ({})",
                    url, reason
                ))
                .into())
            }
            Err(FetchError::NotFound(reason)) => return Err(OpenError::NotFound(reason).into()),
            Err(err) => return Err(err.into()),
        };

        let overlay = self
            .config
            .overlay
            .then(|| Overlay::new(self.cache.page_size(), size));
        let remote = Arc::new(RemoteFile::new(url, size, overlay.is_none()));
        Ok(OpenFile::new(remote, overlay))
    }

    /// Called by a handle as it closes
    pub(crate) fn release(&self, file: &Arc<OpenFile>) {
        let id = file.remote().id();
        let mut files = self.files.lock();
        let last = match files.open.get_mut(&id) {
            Some(entry) if Arc::ptr_eq(&entry.file, file) => {
                entry.handles = entry.handles.saturating_sub(1);
                entry.handles == 0
            }
            _ => false,
        };
        if last {
            files.open.remove(&id);
            self.prefetcher.forget(id);
            self.cache.forget(id);
            debug!("last handle on {} closed", file.remote().url());
        }
    }
}

impl std::fmt::Debug for WebVfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebVfs")
            .field("name", &self.config.vfs_name)
            .field("cache", &self.cache)
            .field("open_files", &self.open_files())
            .finish()
    }
}

// Registration

/// Data behind `pAppData` of the registered `sqlite3_vfs`
pub(crate) struct VfsAppData {
    pub vfs: Arc<WebVfs>,
    /// Default VFS that non-database files are delegated to
    pub parent: *mut ffi::sqlite3_vfs,
}

struct Registration {
    vfs: Arc<WebVfs>,
    raw: *mut ffi::sqlite3_vfs,
    app_data: *mut VfsAppData,
    /// Backs `zName`; must outlive `raw`
    _name: CString,
}

// Raw pointers are only dereferenced by SQLite and under REGISTRATION
unsafe impl Send for Registration {}

static REGISTRATION: Mutex<Option<Registration>> = parking_lot::const_mutex(None);

/// Register the web VFS with SQLite, fetching over HTTP
///
/// Idempotent: while a VFS is registered, further calls return it unchanged.
pub fn register_vfs(config: VfsConfig) -> Result<Arc<WebVfs>> {
    register_with(config, |config| {
        let fetcher: Arc<dyn RangeFetcher> = Arc::new(HttpRangeFetcher::new(config)?);
        Ok(fetcher)
    })
}

/// Register the web VFS with SQLite over a caller-supplied fetcher
pub fn register_vfs_with(config: VfsConfig, fetcher: Arc<dyn RangeFetcher>) -> Result<Arc<WebVfs>> {
    register_with(config, move |_| Ok(fetcher))
}

fn register_with<F>(config: VfsConfig, make_fetcher: F) -> Result<Arc<WebVfs>>
where
    F: FnOnce(&VfsConfig) -> Result<Arc<dyn RangeFetcher>>,
{
    let mut registration = REGISTRATION.lock();
    if let Some(existing) = registration.as_ref() {
        if existing.vfs.config() != &config {
            warn!(
                "VFS '{}' already registered; ignoring new configuration",
                existing.vfs.config().vfs_name
            );
        }
        return Ok(Arc::clone(&existing.vfs));
    }

    config.check()?;
    let name = CString::new(config.vfs_name.as_str())
        .map_err(|e| VfsError::Config(format!("invalid VFS name: {}", e)))?;
    let make_default = config.make_default;
    let fetcher = make_fetcher(&config)?;
    let vfs = WebVfs::with_fetcher(config, fetcher)?;

    let parent = unsafe { ffi::sqlite3_vfs_find(ptr::null()) };
    if parent.is_null() {
        return Err(VfsError::Registration(ffi::SQLITE_ERROR));
    }
    let (parent_file_size, parent_pathname) = unsafe { ((*parent).szOsFile, (*parent).mxPathname) };

    let app_data = Box::into_raw(Box::new(VfsAppData {
        vfs: Arc::clone(&vfs),
        parent,
    }));

    // Delegated opens construct the parent's file object in our slot
    let file_size = (std::mem::size_of::<super::file::WebFile>() as c_int).max(parent_file_size);

    let raw = Box::into_raw(Box::new(ffi::sqlite3_vfs {
        iVersion: 2,
        szOsFile: file_size,
        mxPathname: parent_pathname.max(1024),
        pNext: ptr::null_mut(),
        zName: name.as_ptr(),
        pAppData: app_data as *mut c_void,
        xOpen: Some(vfs_open),
        xDelete: Some(vfs_delete),
        xAccess: Some(vfs_access),
        xFullPathname: Some(vfs_full_pathname),
        xDlOpen: None,
        xDlError: None,
        xDlSym: None,
        xDlClose: None,
        xRandomness: Some(vfs_randomness),
        xSleep: Some(vfs_sleep),
        xCurrentTime: Some(vfs_current_time),
        xGetLastError: Some(vfs_get_last_error),
        xCurrentTimeInt64: Some(vfs_current_time_int64),
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    }));

    unsafe {
        let rc = ffi::sqlite3_vfs_register(raw, make_default as c_int);
        if rc != ffi::SQLITE_OK {
            drop(Box::from_raw(raw));
            drop(Box::from_raw(app_data));
            return Err(VfsError::Registration(rc));
        }
    }

    info!(
        "registered VFS '{}' (cache {} bytes, page {} bytes)",
        vfs.config().vfs_name,
        vfs.cache().capacity_bytes(),
        vfs.cache().page_size()
    );
    *registration = Some(Registration {
        vfs: Arc::clone(&vfs),
        raw,
        app_data,
        _name: name,
    });
    Ok(vfs)
}

/// Unregister the web VFS and tear down its cache
///
/// Refused with `SQLITE_BUSY` while any database is still open through it.
pub fn unregister_vfs() -> Result<()> {
    let mut registration = REGISTRATION.lock();
    let Some(current) = registration.as_ref() else {
        return Ok(());
    };
    if current.vfs.open_files() > 0 {
        return Err(VfsError::Registration(ffi::SQLITE_BUSY));
    }

    unsafe {
        let rc = ffi::sqlite3_vfs_unregister(current.raw);
        if rc != ffi::SQLITE_OK {
            return Err(VfsError::Registration(rc));
        }
    }

    if let Some(current) = registration.take() {
        unsafe {
            drop(Box::from_raw(current.raw));
            drop(Box::from_raw(current.app_data));
        }
        info!("unregistered VFS '{}'", current.vfs.config().vfs_name);
    }
    Ok(())
}

/// The currently registered VFS, if any
pub fn registered_vfs() -> Option<Arc<WebVfs>> {
    REGISTRATION.lock().as_ref().map(|r| Arc::clone(&r.vfs))
}

pub(crate) unsafe fn app_data<'a>(vfs: *mut ffi::sqlite3_vfs) -> Option<&'a VfsAppData> {
    if vfs.is_null() {
        return None;
    }
    ((*vfs).pAppData as *const VfsAppData).as_ref()
}

unsafe fn parent_of(vfs: *mut ffi::sqlite3_vfs) -> Option<*mut ffi::sqlite3_vfs> {
    app_data(vfs).map(|app| app.parent)
}

// VFS callback functions

unsafe extern "C" fn vfs_open(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    super::file::file_open(vfs, z_name, file, flags, p_out_flags)
}

unsafe extern "C" fn vfs_delete(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    sync_dir: c_int,
) -> c_int {
    match parent_of(vfs) {
        Some(parent) => match (*parent).xDelete {
            Some(delete) => delete(parent, z_name, sync_dir),
            None => ffi::SQLITE_IOERR_DELETE,
        },
        None => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn vfs_access(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    flags: c_int,
    p_res_out: *mut c_int,
) -> c_int {
    match parent_of(vfs) {
        Some(parent) => match (*parent).xAccess {
            Some(access) => access(parent, z_name, flags, p_res_out),
            None => {
                *p_res_out = 0;
                ffi::SQLITE_OK
            }
        },
        None => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn vfs_full_pathname(
    _vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    n_out: c_int,
    z_out: *mut c_char,
) -> c_int {
    // Names are locators, not paths; keep them verbatim. Journal names built
    // from them land in the filesystem root, so writable connections use
    // journal_mode=MEMORY
    let len = libc::strlen(z_name);
    if len >= n_out as usize {
        return ffi::SQLITE_CANTOPEN;
    }

    libc::strcpy(z_out, z_name);
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_randomness(
    vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_out: *mut c_char,
) -> c_int {
    match parent_of(vfs).and_then(|parent| (*parent).xRandomness.map(|f| (parent, f))) {
        Some((parent, randomness)) => randomness(parent, n_byte, z_out),
        None => 0,
    }
}

unsafe extern "C" fn vfs_sleep(vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    match parent_of(vfs).and_then(|parent| (*parent).xSleep.map(|f| (parent, f))) {
        Some((parent, sleep)) => sleep(parent, microseconds),
        None => {
            std::thread::sleep(std::time::Duration::from_micros(microseconds.max(0) as u64));
            microseconds
        }
    }
}

unsafe extern "C" fn vfs_current_time(vfs: *mut ffi::sqlite3_vfs, p_time_out: *mut f64) -> c_int {
    match parent_of(vfs).and_then(|parent| (*parent).xCurrentTime.map(|f| (parent, f))) {
        Some((parent, current_time)) => current_time(parent, p_time_out),
        None => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn vfs_current_time_int64(
    vfs: *mut ffi::sqlite3_vfs,
    p_time_out: *mut ffi::sqlite3_int64,
) -> c_int {
    let parent = match parent_of(vfs) {
        Some(parent) => parent,
        None => return ffi::SQLITE_ERROR,
    };
    if (*parent).iVersion >= 2 {
        if let Some(current_time) = (*parent).xCurrentTimeInt64 {
            return current_time(parent, p_time_out);
        }
    }

    // Julian day in milliseconds from the f64 variant
    let mut days = 0.0f64;
    let rc = vfs_current_time(vfs, &mut days);
    if rc == ffi::SQLITE_OK {
        *p_time_out = (days * 86_400_000.0) as ffi::sqlite3_int64;
    }
    rc
}

unsafe extern "C" fn vfs_get_last_error(
    vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_err_msg: *mut c_char,
) -> c_int {
    match parent_of(vfs).and_then(|parent| (*parent).xGetLastError.map(|f| (parent, f))) {
        Some((parent, last_error)) => last_error(parent, n_byte, z_err_msg),
        None => 0,
    }
}
