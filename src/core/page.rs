//! Remote files and the fixed-size pages cut from them

use bytes::Bytes;
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// Stable identifier of a remote object, derived from its URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(u64);

impl FileId {
    pub fn for_url(url: &str) -> Self {
        FileId(xxh3_64(url.as_bytes()))
    }

    pub const fn from_raw(raw: u64) -> Self {
        FileId(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Cache key: (file, page index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    pub file: FileId,
    pub index: u64,
}

impl PageKey {
    pub const fn new(file: FileId, index: u64) -> Self {
        PageKey { file, index }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file, self.index)
    }
}

/// A remote object opened through the VFS
///
/// Immutable once opened; shared by every handle on the same URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    id: FileId,
    url: String,
    size: u64,
    read_only: bool,
}

impl RemoteFile {
    pub fn new(url: impl Into<String>, size: u64, read_only: bool) -> Self {
        let url = url.into();
        RemoteFile {
            id: FileId::for_url(&url),
            url,
            size,
            read_only,
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Size in bytes as reported when the file was opened
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of pages covering the file; the last one may be short
    pub fn page_count(&self, page_size: usize) -> u64 {
        self.size.div_ceil(page_size as u64)
    }

    /// Byte length of page `index` (short at EOF, zero past it)
    pub fn page_len(&self, index: u64, page_size: usize) -> usize {
        let start = index.saturating_mul(page_size as u64);
        if start >= self.size {
            0
        } else {
            (self.size - start).min(page_size as u64) as usize
        }
    }
}

/// Immutable snapshot of one page of remote data
///
/// Local modifications never touch a `Page`; the overlay copies it first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    key: PageKey,
    data: Bytes,
}

impl Page {
    pub fn new(key: PageKey, data: Bytes) -> Self {
        Page { key, data }
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
