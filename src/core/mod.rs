//! Core of the web VFS: remote fetching, the shared page cache, read-ahead,
//! the write overlay, and the SQLite adapter on top

pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod fetcher;
pub mod overlay;
pub mod page;
pub mod prefetch;
pub mod vfs;

pub use cache::{CacheStats, PageCache, PinToken};
pub use config::VfsConfig;
pub use error::{CacheError, ConfigError, FetchError, LockError, OpenError, Result, VfsError};
pub use executor::BlockingExecutor;
pub use fetcher::{HttpRangeFetcher, MemoryFetcher, RangeFetcher, RetryPolicy};
pub use overlay::Overlay;
pub use page::{FileId, Page, PageKey, RemoteFile};
pub use prefetch::Prefetcher;
