//! SQLite file I/O methods implementation
//!
//! Implements sqlite3_io_methods over a [`FileHandle`]. Databases are named
//! with a URI carrying the remote location in a `web_url` parameter, e.g.
//! `file:/__web__?vfs=web&mode=ro&immutable=1&web_url=https%3A%2F%2F...`.
//! A name that is itself a URL is accepted as well.

use super::handle::{FileHandle, OpenOptions, ReadOutcome};
use super::lock::LockLevel;
use super::vfs::app_data;
use crate::core::error::{OpenError, VfsError};
use libsqlite3_sys as ffi;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use tracing::{debug, warn};

/// URI parameter holding the remote location
pub const URL_PARAMETER: &str = "web_url";
const URL_PARAMETER_C: &[u8] = b"web_url\0";

/// Web-backed SQLite file
#[repr(C)]
pub struct WebFile {
    /// Base sqlite3_file structure (MUST be first field)
    pub base: ffi::sqlite3_file,
    /// Owned handle, null until opened and after close
    pub handle: *mut FileHandle,
}

static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 1,
    xClose: Some(file_close),
    xRead: Some(file_read),
    xWrite: Some(file_write),
    xTruncate: Some(file_truncate),
    xSync: Some(file_sync),
    xFileSize: Some(file_file_size),
    xLock: Some(file_lock),
    xUnlock: Some(file_unlock),
    xCheckReservedLock: Some(file_check_reserved_lock),
    xFileControl: Some(file_file_control),
    xSectorSize: Some(file_sector_size),
    xDeviceCharacteristics: Some(file_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

unsafe fn handle_of<'a>(file: *mut ffi::sqlite3_file) -> Option<&'a mut FileHandle> {
    (*(file as *mut WebFile)).handle.as_mut()
}

fn report(op: &str, err: &VfsError) -> c_int {
    debug!("{} failed: {}", op, err);
    err.sqlite_code()
}

// File I/O method implementations

unsafe extern "C" fn file_close(file: *mut ffi::sqlite3_file) -> c_int {
    let web_file = &mut *(file as *mut WebFile);
    if web_file.handle.is_null() {
        return ffi::SQLITE_OK;
    }

    let mut handle = Box::from_raw(web_file.handle);
    web_file.handle = ptr::null_mut();
    match handle.close() {
        Ok(()) => ffi::SQLITE_OK,
        Err(err) => report("close", &err),
    }
}

unsafe extern "C" fn file_read(
    file: *mut ffi::sqlite3_file,
    buf: *mut c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let Some(handle) = handle_of(file) else {
        return ffi::SQLITE_MISUSE;
    };
    if offset < 0 || amt < 0 {
        return ffi::SQLITE_IOERR_READ;
    }

    let buf = std::slice::from_raw_parts_mut(buf as *mut u8, amt as usize);
    match handle.read(buf, offset as u64) {
        Ok(ReadOutcome::Complete) => ffi::SQLITE_OK,
        Ok(ReadOutcome::Short { .. }) => ffi::SQLITE_IOERR_SHORT_READ,
        Err(err) => report("read", &err),
    }
}

unsafe extern "C" fn file_write(
    file: *mut ffi::sqlite3_file,
    buf: *const c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let Some(handle) = handle_of(file) else {
        return ffi::SQLITE_MISUSE;
    };
    if offset < 0 || amt < 0 {
        return ffi::SQLITE_IOERR_WRITE;
    }

    let data = std::slice::from_raw_parts(buf as *const u8, amt as usize);
    match handle.write(data, offset as u64) {
        Ok(()) => ffi::SQLITE_OK,
        Err(err) => report("write", &err),
    }
}

unsafe extern "C" fn file_truncate(
    file: *mut ffi::sqlite3_file,
    size: ffi::sqlite3_int64,
) -> c_int {
    let Some(handle) = handle_of(file) else {
        return ffi::SQLITE_MISUSE;
    };
    if size < 0 {
        return ffi::SQLITE_IOERR_TRUNCATE;
    }

    match handle.truncate(size as u64) {
        Ok(()) => ffi::SQLITE_OK,
        Err(err) => report("truncate", &err),
    }
}

unsafe extern "C" fn file_sync(file: *mut ffi::sqlite3_file, _flags: c_int) -> c_int {
    match handle_of(file) {
        Some(handle) => match handle.sync() {
            Ok(()) => ffi::SQLITE_OK,
            Err(err) => report("sync", &err),
        },
        None => ffi::SQLITE_MISUSE,
    }
}

unsafe extern "C" fn file_file_size(
    file: *mut ffi::sqlite3_file,
    p_size: *mut ffi::sqlite3_int64,
) -> c_int {
    let Some(handle) = handle_of(file) else {
        return ffi::SQLITE_MISUSE;
    };

    match handle.size() {
        Ok(size) => {
            *p_size = size as ffi::sqlite3_int64;
            ffi::SQLITE_OK
        }
        Err(err) => report("size", &err),
    }
}

unsafe extern "C" fn file_lock(file: *mut ffi::sqlite3_file, lock_type: c_int) -> c_int {
    let (Some(handle), Some(level)) = (handle_of(file), LockLevel::from_raw(lock_type)) else {
        return ffi::SQLITE_MISUSE;
    };

    match handle.lock(level) {
        Ok(()) => ffi::SQLITE_OK,
        Err(err) => report("lock", &err),
    }
}

unsafe extern "C" fn file_unlock(file: *mut ffi::sqlite3_file, lock_type: c_int) -> c_int {
    let (Some(handle), Some(level)) = (handle_of(file), LockLevel::from_raw(lock_type)) else {
        return ffi::SQLITE_MISUSE;
    };

    match handle.unlock(level) {
        Ok(()) => ffi::SQLITE_OK,
        Err(err) => report("unlock", &err),
    }
}

unsafe extern "C" fn file_check_reserved_lock(
    file: *mut ffi::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    let Some(handle) = handle_of(file) else {
        return ffi::SQLITE_MISUSE;
    };

    match handle.check_reserved_lock() {
        Ok(reserved) => {
            *p_res_out = reserved as c_int;
            ffi::SQLITE_OK
        }
        Err(err) => report("check reserved lock", &err),
    }
}

unsafe extern "C" fn file_file_control(
    _file: *mut ffi::sqlite3_file,
    _op: c_int,
    _p_arg: *mut c_void,
) -> c_int {
    ffi::SQLITE_NOTFOUND
}

unsafe extern "C" fn file_sector_size(file: *mut ffi::sqlite3_file) -> c_int {
    handle_of(file).map_or(512, |handle| handle.sector_size())
}

unsafe extern "C" fn file_device_characteristics(file: *mut ffi::sqlite3_file) -> c_int {
    handle_of(file).map_or(0, |handle| handle.device_characteristics())
}

/// Remote location named by `z_name`
unsafe fn remote_url(z_name: *const c_char) -> Result<String, OpenError> {
    if z_name.is_null() {
        return Err(OpenError::InvalidLocator(String::new()));
    }

    let param = ffi::sqlite3_uri_parameter(z_name, URL_PARAMETER_C.as_ptr() as *const c_char);
    if !param.is_null() {
        if let Ok(url) = CStr::from_ptr(param).to_str() {
            if !url.is_empty() {
                return Ok(url.to_string());
            }
        }
    }

    url_from_name(&CStr::from_ptr(z_name).to_string_lossy())
}

/// Fallback for databases opened by URL instead of by URI parameter
fn url_from_name(name: &str) -> Result<String, OpenError> {
    if name.contains("://") {
        Ok(name.to_string())
    } else {
        Err(OpenError::InvalidLocator(name.to_string()))
    }
}

// VFS open callback

pub unsafe fn file_open(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    let Some(app) = app_data(vfs) else {
        return ffi::SQLITE_ERROR;
    };

    if flags & ffi::SQLITE_OPEN_MAIN_DB == 0 {
        let parent = app.parent;
        return match (*parent).xOpen {
            Some(open) => open(parent, z_name, file, flags, p_out_flags),
            None => ffi::SQLITE_CANTOPEN,
        };
    }

    // SQLite skips xClose when pMethods is left null
    let web_file = &mut *(file as *mut WebFile);
    web_file.base.pMethods = ptr::null();
    web_file.handle = ptr::null_mut();

    let url = match remote_url(z_name) {
        Ok(url) => url,
        Err(err) => {
            warn!("cannot open database: {}", err);
            return VfsError::from(err).sqlite_code();
        }
    };

    let options = OpenOptions {
        read_write: flags & ffi::SQLITE_OPEN_READWRITE != 0,
        create: flags & ffi::SQLITE_OPEN_CREATE != 0,
    };
    let handle = match app.vfs.open(&url, options) {
        Ok(handle) => handle,
        Err(err) => {
            warn!("cannot open {}: {}", url, err);
            return err.sqlite_code();
        }
    };

    let writable = handle.is_writable();
    web_file.handle = Box::into_raw(Box::new(handle));
    web_file.base.pMethods = &IO_METHODS;

    if !p_out_flags.is_null() {
        *p_out_flags = if writable {
            flags
        } else {
            (flags & !(ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE)) | ffi::SQLITE_OPEN_READONLY
        };
    }

    ffi::SQLITE_OK
}
