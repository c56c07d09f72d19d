//! # sqlite-web-vfs - Query Remote SQLite Databases in Place
//!
//! `sqlite-web-vfs` is a SQLite VFS that reads database files straight from
//! an HTTP(S) object store using range requests, so a database can be queried
//! without downloading it first.
//!
//! - **Page-granular fetching** with a shared, capacity-bounded LRU cache
//! - **Request coalescing**: concurrent misses on a page share one request
//! - **Sequential read-ahead** once a stride is detected
//! - **Retry with backoff** for transient network failures
//! - **Optional write overlay** keeping local modifications in memory
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sqlite_web_vfs::{connect, Result, VfsConfig};
//!
//! # fn main() -> Result<()> {
//! let conn = connect("https://example.com/data/catalog.db", VfsConfig::default())?;
//!
//! let count: i64 = conn
//!     .query_row("SELECT count(*) FROM products", [], |row| row.get(0))
//!     .map_err(sqlite_web_vfs::VfsError::from)?;
//! println!("{} products", count);
//! # Ok(())
//! # }
//! ```
//!
//! ## Opening by URI
//!
//! Once registered, any SQLite binding can open a remote database through a
//! URI naming the VFS and carrying the percent-encoded location:
//!
//! ```text
//! file:/__web__?vfs=web&mode=ro&immutable=1&web_url=https%3A%2F%2Fexample.com%2Fdata.db
//! ```
//!
//! [`database_uri`] builds such URIs.
//!
//! Journal and WAL files are not served remotely; SQLite names them after
//! the database (`/__web__-journal`) and the default VFS creates them at that
//! path. A writable connection opened from a raw URI must therefore run
//! `PRAGMA journal_mode = MEMORY` before its first write.
//! [`open_connection`] does this and refuses the connection if SQLite does
//! not accept it.

pub mod core;

pub use crate::core::{
    cache::{CacheStats, PageCache, PinToken},
    config::{VfsConfig, DEFAULT_VFS_NAME},
    error::{CacheError, ConfigError, FetchError, LockError, OpenError, Result, VfsError},
    fetcher::{HttpRangeFetcher, MemoryFetcher, RangeFetcher, RetryPolicy},
    page::{FileId, Page, PageKey, RemoteFile},
    vfs::{
        register_vfs, register_vfs_with, registered_vfs, unregister_vfs, FileHandle, HandleState,
        LockLevel, OpenOptions, ReadOutcome, VfsStats, WebVfs, URL_PARAMETER,
    },
};

use rusqlite::{Connection, OpenFlags};
use tracing::debug;

/// Placeholder path used in database URIs; the location is in `web_url`
pub const PLACEHOLDER_PATH: &str = "/__web__";

/// Register the VFS (if needed) and open the database at `url`
///
/// Read-only unless `config.overlay` is set, in which case writes land in
/// the in-memory overlay and the journal is kept in memory too.
pub fn connect(url: &str, config: VfsConfig) -> Result<Connection> {
    let vfs = register_vfs(config)?;
    let config = vfs.config();
    open_connection(url, &config.vfs_name, config.overlay)
}

/// Open `url` through an already registered VFS named `vfs_name`
pub fn open_connection(url: &str, vfs_name: &str, writable: bool) -> Result<Connection> {
    let uri = database_uri(url, vfs_name, !writable);
    let flags = if writable {
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI
    } else {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI
    };
    debug!("opening {}", uri);

    let conn = Connection::open_with_flags(&uri, flags)?;
    if writable {
        // Journal names derive from the placeholder path, which is no
        // place for a file
        let mode = conn.pragma_update_and_check(None, "journal_mode", "MEMORY", |row| {
            row.get::<_, String>(0)
        })?;
        if !mode.eq_ignore_ascii_case("memory") {
            return Err(OpenError::Unsupported(format!(
                "journal_mode stayed '{}' for {}; writable opens need MEMORY",
                mode, url
            ))
            .into());
        }
    }
    Ok(conn)
}

/// SQLite URI that opens `url` through the VFS named `vfs_name`
pub fn database_uri(url: &str, vfs_name: &str, read_only: bool) -> String {
    let mode = if read_only { "&mode=ro&immutable=1" } else { "" };
    format!(
        "file:{}?vfs={}{}&{}={}",
        PLACEHOLDER_PATH,
        encode_component(vfs_name),
        mode,
        URL_PARAMETER,
        encode_component(url)
    )
}

/// Percent-encode everything outside the RFC 3986 unreserved set
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}
