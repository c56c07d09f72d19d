//! Error taxonomy for the web VFS
//!
//! Every failure that can reach SQLite is a [`VfsError`]. Each internal kind
//! maps to exactly one SQLite result code through [`VfsError::sqlite_code`].

use crate::core::page::PageKey;
use libsqlite3_sys as ffi;
use std::os::raw::c_int;
use thiserror::Error;

/// `SQLITE_IOERR_DATA`: page content failed verification
pub const SQLITE_IOERR_DATA: c_int = ffi::SQLITE_IOERR | (32 << 8);

/// Failures of the range fetcher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Transient failures exhausted the retry budget
    #[error("remote object unavailable after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: u32, reason: String },

    /// 404/410, or the object no longer has the size it was opened with
    #[error("remote object not found: {0}")]
    NotFound(String),

    /// Any other non-retryable HTTP status
    #[error("remote request for {url} rejected with HTTP {status}")]
    Rejected { url: String, status: u16 },
}

impl FetchError {
    pub fn unavailable(attempts: u32, reason: impl Into<String>) -> Self {
        FetchError::Unavailable {
            attempts,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    #[error("remote database does not exist: {0}")]
    NotFound(String),

    #[error("unsupported open request: {0}")]
    Unsupported(String),

    #[error("no remote URL in database name '{0}' (expected a web_url URI parameter)")]
    InvalidLocator(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Lock levels above SHARED need a write overlay
    #[error("lock level {0} requires a write overlay")]
    Unsupported(&'static str),

    #[error("lock level {0} is held by another handle")]
    Busy(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Size or digest mismatch on a fetched page
    #[error("page {key} is corrupt: {reason}")]
    Corrupt { key: PageKey, reason: String },

    #[error("page {key} is past the end of the file ({pages} pages)")]
    OutOfRange { key: PageKey, pages: u64 },
}

/// Configuration loading and validation failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<validator::ValidationErrors> for ConfigError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ConfigError::Invalid(errors.to_string())
    }
}

/// Umbrella error carried through the page-I/O path
///
/// `Clone` because one coalesced fetch result is handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VfsError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Open(#[from] OpenError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("handle is read-only")]
    ReadOnly,

    #[error("handle is closed")]
    Closed,

    #[error("worker pool error: {0}")]
    Executor(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("VFS registration failed: {0}")]
    Registration(i32),

    #[error("SQLite error: {0}")]
    Sqlite(String),
}

impl From<ConfigError> for VfsError {
    fn from(err: ConfigError) -> Self {
        VfsError::Config(err.to_string())
    }
}

impl From<rusqlite::Error> for VfsError {
    fn from(err: rusqlite::Error) -> Self {
        VfsError::Sqlite(err.to_string())
    }
}

impl VfsError {
    /// SQLite result code reported for this error
    pub fn sqlite_code(&self) -> c_int {
        match self {
            VfsError::Fetch(FetchError::Unavailable { .. }) => ffi::SQLITE_IOERR_READ,
            VfsError::Fetch(FetchError::Rejected { .. }) => ffi::SQLITE_IOERR_READ,
            VfsError::Fetch(FetchError::NotFound(_)) => ffi::SQLITE_CANTOPEN,
            VfsError::Open(OpenError::NotFound(_)) => ffi::SQLITE_CANTOPEN,
            VfsError::Open(OpenError::InvalidLocator(_)) => ffi::SQLITE_CANTOPEN,
            VfsError::Open(OpenError::Unsupported(_)) => ffi::SQLITE_READONLY,
            VfsError::Lock(LockError::Unsupported(_)) => ffi::SQLITE_READONLY,
            VfsError::Lock(LockError::Busy(_)) => ffi::SQLITE_BUSY,
            VfsError::Cache(CacheError::Corrupt { .. }) => SQLITE_IOERR_DATA,
            VfsError::Cache(CacheError::OutOfRange { .. }) => ffi::SQLITE_IOERR_READ,
            VfsError::ReadOnly => ffi::SQLITE_READONLY,
            VfsError::Closed => ffi::SQLITE_MISUSE,
            VfsError::Executor(_) => ffi::SQLITE_IOERR,
            VfsError::Config(_) | VfsError::Registration(_) | VfsError::Sqlite(_) => {
                ffi::SQLITE_ERROR
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, VfsError>;
