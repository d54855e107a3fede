//! Paged append-only write buffer
//!
//! Assembles outgoing bytes into fixed-size pages drawn from a
//! [`BufferManager`], chained in FIFO order and never reused mid-stream.
//! The send path walks the chain in bounded scatter/gather batches; an
//! explicit contiguous copy is available but never taken implicitly.

use bytes::Bytes;

use std::sync::Arc;

use crate::alloc::NativeBuf;
use crate::error::Result;
use crate::manager::BufferManager;

/// Size of one write-stream page.
pub const PAGE_SIZE: usize = 4096;

/// One page of the chain: a manager buffer plus how much of it is live.
///
/// Invariant: `len <= buf.len()`, and `buf.len()` is always [`PAGE_SIZE`].
struct Page {
    buf: NativeBuf,
    len: usize,
}

/// Append-only, page-chained byte buffer for scatter/gather sends.
///
/// Not seekable; bytes only accumulate. Pages go back to the producing
/// manager when the stream drops, so a stream must not outlive its
/// manager's socket.
pub struct WriteStream {
    pages: Vec<Page>,
    len: usize,
    manager: Arc<BufferManager>,
}

impl WriteStream {
    /// Create an empty stream drawing pages from `manager`.
    #[must_use]
    pub fn new(manager: Arc<BufferManager>) -> Self {
        Self {
            pages: Vec::new(),
            len: 0,
            manager,
        }
    }

    /// Total bytes written so far.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been written yet.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pages in the chain.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Append one byte.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        let index = self.ensure_capacity()?;
        let page = &mut self.pages[index];
        page.buf.as_mut_slice()[page.len] = value;
        page.len += 1;
        self.len += 1;
        Ok(())
    }

    /// Append a byte slice, growing the page chain as needed.
    pub fn write_all(&mut self, mut src: &[u8]) -> Result<()> {
        let total = src.len();
        while !src.is_empty() {
            let index = self.ensure_capacity()?;
            let page = &mut self.pages[index];
            let take = (PAGE_SIZE - page.len).min(src.len());
            page.buf.as_mut_slice()[page.len..page.len + take].copy_from_slice(&src[..take]);
            page.len += take;
            src = &src[take..];
        }
        self.len += total;
        Ok(())
    }

    /// Copy every page's live bytes, in chain order, into one freshly
    /// allocated contiguous buffer.
    ///
    /// The send path never calls this; it exists for callers that need an
    /// explicit contiguous view.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.len);
        for page in &self.pages {
            out.extend_from_slice(&page.buf.as_slice()[..page.len]);
        }
        Bytes::from(out)
    }

    /// Live bytes of each page, chain (FIFO) order.
    pub(crate) fn page_slices(&self) -> impl Iterator<Item = &[u8]> {
        self.pages.iter().map(|page| &page.buf.as_slice()[..page.len])
    }

    /// Index of a page with spare capacity, linking a fresh page onto the
    /// chain when the current one is full.
    fn ensure_capacity(&mut self) -> Result<usize> {
        let full = self.pages.last().map_or(true, |page| page.len == PAGE_SIZE);
        if full {
            let buf = self.manager.take_buffer(PAGE_SIZE)?;
            self.pages.push(Page { buf, len: 0 });
        }
        Ok(self.pages.len() - 1)
    }
}

impl Drop for WriteStream {
    fn drop(&mut self) {
        // Pages always carry the canonical page size, so returns cannot
        // fail with a class mismatch.
        for page in self.pages.drain(..) {
            let _ = self.manager.return_buffer(page.buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::HeapAlloc;

    fn stream() -> WriteStream {
        let manager = BufferManager::new(1 << 20, 8192, Arc::new(HeapAlloc)).unwrap();
        WriteStream::new(Arc::new(manager))
    }

    #[test]
    fn page_boundaries_link_new_pages() {
        let mut s = stream();
        s.write_all(&[0xAA; PAGE_SIZE]).unwrap();
        assert_eq!(s.page_count(), 1);
        s.write_u8(0xBB).unwrap();
        assert_eq!(s.page_count(), 2);
        assert_eq!(s.len(), PAGE_SIZE + 1);
    }

    #[test]
    fn to_bytes_preserves_chain_order() {
        let mut s = stream();
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        s.write_all(&data).unwrap();
        assert_eq!(&s.to_bytes()[..], &data[..]);
    }
}
