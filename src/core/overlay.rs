//! Local write overlay
//!
//! Writes never reach the remote object. When overlay mode is enabled each
//! open file gets an `Overlay` holding whole copies of every page written so
//! far; reads prefer overlay pages and fall back to the remote base.
//!
//! Truncation only moves two marks: the logical size, and `base_limit`, past
//! which remote bytes read as zero even if the file later grows again.

use bytes::Bytes;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct Overlay {
    page_size: usize,
    pages: BTreeMap<u64, Vec<u8>>,
    size: u64,
    base_limit: u64,
}

impl Overlay {
    pub fn new(page_size: usize, base_size: u64) -> Self {
        Overlay {
            page_size,
            pages: BTreeMap::new(),
            size: base_size,
            base_limit: base_size,
        }
    }

    /// Logical file size including local writes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Remote bytes at or past this offset read as zero
    pub fn base_limit(&self) -> u64 {
        self.base_limit
    }

    pub fn page(&self, index: u64) -> Option<&[u8]> {
        self.pages.get(&index).map(Vec::as_slice)
    }

    pub fn dirty_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn dirty_bytes(&self) -> usize {
        self.pages.len() * self.page_size
    }

    /// Pages a write at `offset` only partly covers and that still have to
    /// be copied from the remote base first
    pub fn missing_base_pages(&self, offset: u64, len: usize) -> Vec<u64> {
        let page_size = self.page_size as u64;
        let end = offset + len as u64;
        page_span(offset, len, self.page_size)
            .filter(|index| !self.pages.contains_key(index))
            .filter(|index| index * page_size < self.base_limit)
            .filter(|index| {
                let start = index * page_size;
                offset > start || end < start + page_size
            })
            .collect()
    }

    /// Apply a write; `base` supplies remote content for pages not yet in
    /// the overlay (`None` means zeros)
    pub fn write<F>(&mut self, offset: u64, data: &[u8], mut base: F)
    where
        F: FnMut(u64) -> Option<Bytes>,
    {
        let page_size = self.page_size as u64;
        let mut written = 0usize;

        for index in page_span(offset, data.len(), self.page_size) {
            let page_start = index * page_size;
            let base_limit = self.base_limit;
            let buf = self.pages.entry(index).or_insert_with(|| {
                let mut buf = vec![0u8; page_size as usize];
                if let Some(remote) = base(index) {
                    let visible = base_limit.saturating_sub(page_start).min(remote.len() as u64);
                    buf[..visible as usize].copy_from_slice(&remote[..visible as usize]);
                }
                buf
            });

            let at = (offset + written as u64).saturating_sub(page_start) as usize;
            let n = (self.page_size - at).min(data.len() - written);
            buf[at..at + n].copy_from_slice(&data[written..written + n]);
            written += n;
        }

        self.size = self.size.max(offset + data.len() as u64);
    }

    pub fn truncate(&mut self, size: u64) {
        let page_size = self.page_size as u64;
        self.pages.retain(|index, _| index * page_size < size);

        let tail = (size % page_size) as usize;
        if tail != 0 {
            if let Some(last) = self.pages.get_mut(&(size / page_size)) {
                last[tail..].fill(0);
            }
        }

        self.size = size;
        self.base_limit = self.base_limit.min(size);
    }
}

/// Page indices overlapped by `len` bytes at `offset`
fn page_span(offset: u64, len: usize, page_size: usize) -> impl Iterator<Item = u64> {
    let page_size = page_size as u64;
    let first = offset / page_size;
    let last = if len == 0 {
        first
    } else {
        (offset + len as u64 - 1) / page_size + 1
    };
    first..last
}
