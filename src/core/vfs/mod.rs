//! SQLite VFS (Virtual File System) over remote objects
//!
//! This module provides a custom SQLite VFS that lets SQLite read database
//! files straight from an HTTP(S) object store. This enables:
//!
//! - Read-only queries against a remote database with no download step
//! - Page-granular fetching with shared caching and read-ahead
//! - Optional local writes into an in-memory overlay

mod file;
mod handle;
mod lock;
mod vfs;

#[cfg(test)]
mod tests;

pub use file::{WebFile, URL_PARAMETER};
pub use handle::{FileHandle, HandleState, OpenFile, OpenOptions, ReadOutcome};
pub use lock::{LockLevel, LockTable};
pub use vfs::{register_vfs, register_vfs_with, registered_vfs, unregister_vfs, VfsStats, WebVfs};
