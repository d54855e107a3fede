//! Recyclable single-buffer read wrapper
//!
//! Wraps exactly one received native buffer. Release is idempotent: an
//! atomic exchange of the length to a sentinel guarantees the native buffer
//! is freed at most once, however many times the wrapper is dropped or
//! released. The emptied core goes back to its socket's single-slot recycle
//! cache so steady-state receives allocate nothing.

use std::io::SeekFrom;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::alloc::NativeBuf;
use crate::error::{Result, StageError};
use crate::socket::SocketShared;

/// Length sentinel marking a released core.
const RELEASED: i64 = -1;

/// The recyclable heart of a [`ReadStream`]: buffer, length and cursor.
pub(crate) struct ReadCore {
    buf: Option<NativeBuf>,
    len: AtomicI64,
    pos: i64,
}

impl ReadCore {
    pub(crate) fn new(buf: NativeBuf) -> Result<Self> {
        if buf.is_empty() {
            return Err(StageError::invalid_argument("buf", "must not be empty"));
        }
        let len = buf.len() as i64;
        Ok(Self {
            buf: Some(buf),
            len: AtomicI64::new(len),
            pos: 0,
        })
    }

    /// Reactivate a released core for the next received message.
    pub(crate) fn reinitialize(&mut self, buf: NativeBuf) -> Result<()> {
        if buf.is_empty() {
            return Err(StageError::invalid_argument("buf", "must not be empty"));
        }
        self.len.store(buf.len() as i64, Ordering::Release);
        self.pos = 0;
        self.buf = Some(buf);
        Ok(())
    }

    /// Idempotent release: the first caller gets the buffer back, every
    /// later one gets nothing.
    pub(crate) fn release(&mut self) -> Option<NativeBuf> {
        let len = self.len.swap(RELEASED, Ordering::AcqRel);
        if len > 0 {
            self.buf.take()
        } else {
            None
        }
    }

    fn data(&self) -> Option<&[u8]> {
        if self.len.load(Ordering::Acquire) <= 0 {
            return None;
        }
        self.buf.as_ref().map(NativeBuf::as_slice)
    }
}

/// Seekable read stream over one received message.
///
/// Bounds-checked integer reads return `None` instead of failing when
/// insufficient bytes remain, and positions past either end are allowed;
/// reads from there simply produce nothing.
pub struct ReadStream {
    core: Option<Box<ReadCore>>,
    shared: Arc<SocketShared>,
}

impl ReadStream {
    pub(crate) fn new(core: Box<ReadCore>, shared: Arc<SocketShared>) -> Self {
        Self {
            core: Some(core),
            shared,
        }
    }

    /// Length of the wrapped message, or 0 once released.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core
            .as_deref()
            .map_or(0, |core| core.len.load(Ordering::Acquire).max(0) as usize)
    }

    /// Whether no readable bytes remain at the current position.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current cursor position.
    #[must_use]
    pub fn position(&self) -> i64 {
        self.core.as_deref().map_or(0, |core| core.pos)
    }

    /// Readable bytes between the cursor and the end of the message.
    #[must_use]
    pub fn remaining(&self) -> usize {
        let Some(core) = self.core.as_deref() else {
            return 0;
        };
        let len = core.len.load(Ordering::Acquire);
        (len - core.pos).max(0) as usize
    }

    /// Read one byte and advance.
    pub fn read_u8(&mut self) -> Option<u8> {
        let core = self.core.as_deref_mut()?;
        let data = core.data()?;
        let pos = usize::try_from(core.pos).ok()?;
        let byte = *data.get(pos)?;
        core.pos += 1;
        Some(byte)
    }

    /// Copy as many bytes as remain (up to `dst.len()`) and advance.
    /// Returns the number of bytes copied.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let Some(core) = self.core.as_deref_mut() else {
            return 0;
        };
        let Some(data) = core.data() else {
            return 0;
        };
        let Ok(pos) = usize::try_from(core.pos) else {
            return 0;
        };
        if pos >= data.len() {
            return 0;
        }
        let count = dst.len().min(data.len() - pos);
        dst[..count].copy_from_slice(&data[pos..pos + count]);
        core.pos += count as i64;
        count
    }

    /// Read a native-endian `i32`, or `None` when fewer than 4 bytes
    /// remain.
    pub fn read_i32(&mut self) -> Option<i32> {
        self.read_array().map(i32::from_ne_bytes)
    }

    /// Read a native-endian `i64`, or `None` when fewer than 8 bytes
    /// remain.
    pub fn read_i64(&mut self) -> Option<i64> {
        self.read_array().map(i64::from_ne_bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let core = self.core.as_deref_mut()?;
        let data = core.data()?;
        let pos = usize::try_from(core.pos).ok()?;
        let bytes = data.get(pos..pos + N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        core.pos += N as i64;
        Some(out)
    }

    /// Move the cursor by absolute offset, relative offset, or from the
    /// end. Returns the new position.
    pub fn seek(&mut self, from: SeekFrom) -> i64 {
        let Some(core) = self.core.as_deref_mut() else {
            return 0;
        };
        let len = core.len.load(Ordering::Acquire).max(0);
        core.pos = match from {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => core.pos + offset,
            SeekFrom::End(offset) => len + offset,
        };
        core.pos
    }

    /// Release the wrapped native buffer and recycle the core.
    ///
    /// Safe to call any number of times; the buffer is freed exactly once.
    /// Dropping the stream does the same thing.
    pub fn release(&mut self) {
        let Some(mut core) = self.core.take() else {
            return;
        };
        if let Some(buf) = core.release() {
            self.shared.free_received(buf);
        }
        self.shared.recycle(core);
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.release();
    }
}
