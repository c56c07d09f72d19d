//! Byte-range access to remote objects
//!
//! [`RangeFetcher`] is the seam between the page cache and the network.
//! [`HttpRangeFetcher`] talks HTTP range requests with retry and backoff;
//! [`MemoryFetcher`] serves objects from memory for tests and embedding.

mod http;
mod memory;
mod retry;

pub use http::HttpRangeFetcher;
pub use memory::MemoryFetcher;
pub use retry::{Attempt, RetryPolicy};

use crate::core::error::FetchError;
use crate::core::page::RemoteFile;
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
pub trait RangeFetcher: Send + Sync + 'static {
    /// Total size of the object at `url`
    async fn object_size(&self, url: &str) -> Result<u64, FetchError>;

    /// Read `len` bytes at `offset`
    ///
    /// Ranges running past the known size are clamped, so the tail page
    /// comes back short. Offsets at or past EOF return an empty buffer.
    async fn fetch(&self, file: &RemoteFile, offset: u64, len: usize) -> Result<Bytes, FetchError>;
}

/// Clamp a requested range to the file, returning the inclusive end offset
pub(crate) fn clamp_range(file: &RemoteFile, offset: u64, len: usize) -> Option<(u64, u64)> {
    if len == 0 || offset >= file.size() {
        return None;
    }
    let end = (offset + len as u64).min(file.size());
    Some((offset, end - 1))
}
