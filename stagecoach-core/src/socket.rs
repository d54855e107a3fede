//! Staging surface bound to one native socket
//!
//! [`StagedSocket`] is what the transport layer sees: write/read stream
//! factories, the batched scatter/gather send loop, the bounded-retry
//! receive loop, and the `clear` hook that releases all pooled native
//! memory when the socket closes.
//!
//! Transient "would block" signals are retried with a bounded busy spin;
//! exhausting the retries surfaces a partial byte count (send) or "no data
//! yet" (receive), never an error. Any other native failure propagates
//! immediately, named and described.

use std::io::IoSlice;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::alloc::{NativeAlloc, NativeBuf};
use crate::error::{Result, StageError};
use crate::manager::BufferManager;
use crate::read::{ReadCore, ReadStream};
use crate::transport::{IoFlags, SocketHandle, Transport, TransportError};
use crate::write::WriteStream;

/// Upper bound on scatter/gather descriptors per native send.
pub const MAX_VECTORS: usize = 20;

/// Bounded busy-spin retries applied to transient "would block" signals.
const MAX_IO_RETRIES: u32 = 10;

/// Adapter exposing a transport's allocation half on its own.
struct TransportAlloc(Arc<dyn Transport>);

impl NativeAlloc for TransportAlloc {
    fn alloc(&self, size: usize) -> Result<NativeBuf> {
        self.0.alloc(size)
    }

    fn free(&self, buf: NativeBuf) {
        self.0.free(buf);
    }
}

/// State shared between a socket and the read streams it hands out.
pub(crate) struct SocketShared {
    transport: Arc<dyn Transport>,
    handle: SocketHandle,
    /// Single-slot recycle cache. Optimal when a stream is released before
    /// the next receive, in which case every receive reuses the same core.
    recycled: Mutex<Option<Box<ReadCore>>>,
}

impl SocketShared {
    pub(crate) fn free_received(&self, buf: NativeBuf) {
        self.transport.free(buf);
    }

    pub(crate) fn recycle(&self, core: Box<ReadCore>) {
        let mut slot = self.recycled.lock();
        if slot.is_none() {
            *slot = Some(core);
        }
    }
}

/// The buffer staging layer of one native socket.
pub struct StagedSocket {
    shared: Arc<SocketShared>,
    manager: Arc<BufferManager>,
}

impl StagedSocket {
    /// Default byte ceiling of the buffer pool.
    pub const DEFAULT_POOL_BYTES: i64 = 128;
    /// Default largest pooled buffer size.
    pub const DEFAULT_BUFFER_SIZE: usize = 2048;

    /// Bind a staging layer to `handle`, pooling up to `max_pool_bytes`
    /// across buffer classes no larger than `max_buffer_size`.
    pub fn new(
        transport: Arc<dyn Transport>,
        handle: SocketHandle,
        max_pool_bytes: i64,
        max_buffer_size: usize,
    ) -> Result<Self> {
        let manager = BufferManager::new(
            max_pool_bytes,
            max_buffer_size,
            Arc::new(TransportAlloc(transport.clone())),
        )?;
        Ok(Self {
            shared: Arc::new(SocketShared {
                transport,
                handle,
                recycled: Mutex::new(None),
            }),
            manager: Arc::new(manager),
        })
    }

    /// Bind with the default pool configuration.
    pub fn with_defaults(transport: Arc<dyn Transport>, handle: SocketHandle) -> Result<Self> {
        Self::new(
            transport,
            handle,
            Self::DEFAULT_POOL_BYTES,
            Self::DEFAULT_BUFFER_SIZE,
        )
    }

    /// The native handle this layer stages for.
    #[must_use]
    pub fn handle(&self) -> SocketHandle {
        self.shared.handle
    }

    /// The tiered buffer manager backing this socket.
    #[must_use]
    pub fn manager(&self) -> &Arc<BufferManager> {
        &self.manager
    }

    /// Create an empty write stream drawing pages from this socket's
    /// manager.
    #[must_use]
    pub fn send_stream(&self) -> WriteStream {
        WriteStream::new(self.manager.clone())
    }

    /// Send a write stream's page chain in scatter/gather batches.
    ///
    /// Issues one native send per batch of up to [`MAX_VECTORS`] pages,
    /// FIFO order. A batch hitting "would block" is busy-spun and reissued
    /// up to a bounded retry count; exhaustion returns the bytes sent so
    /// far. Any other native failure propagates immediately.
    pub fn send(&self, stream: &WriteStream, flags: IoFlags) -> Result<usize> {
        let mut sent = 0usize;
        let mut pages = stream.page_slices().peekable();

        while pages.peek().is_some() {
            let batch: SmallVec<[IoSlice<'_>; MAX_VECTORS]> =
                pages.by_ref().take(MAX_VECTORS).map(IoSlice::new).collect();

            let mut retries = 0;
            loop {
                match self
                    .shared
                    .transport
                    .send_vectored(self.shared.handle, &batch, flags)
                {
                    Ok(count) => {
                        trace!(
                            "[SOCKET] sent batch of {} pages, {count} bytes",
                            batch.len()
                        );
                        sent += count;
                        break;
                    }
                    Err(TransportError::WouldBlock) => {
                        if retries >= MAX_IO_RETRIES {
                            debug!("[SOCKET] send retries exhausted after {sent} bytes");
                            return Ok(sent);
                        }
                        retries += 1;
                        std::hint::spin_loop();
                    }
                    Err(TransportError::Native { code }) => {
                        return Err(self.native_err("send_vectored", code));
                    }
                }
            }
        }

        Ok(sent)
    }

    /// Receive one message as a seekable stream.
    ///
    /// `Ok(None)` means no data yet: either `DontWait` was set, or the
    /// bounded retry budget ran out. The recycled read core is reused when
    /// available, so steady-state receives allocate nothing.
    pub fn receive_stream(&self, flags: IoFlags) -> Result<Option<ReadStream>> {
        let Some(buf) = self.receive_buf(flags)? else {
            return Ok(None);
        };

        let core = match self.shared.recycled.lock().take() {
            Some(mut core) => {
                core.reinitialize(buf)?;
                core
            }
            None => Box::new(ReadCore::new(buf)?),
        };

        Ok(Some(ReadStream::new(core, self.shared.clone())))
    }

    /// Receive one message as a freshly allocated contiguous byte vector,
    /// freeing the native buffer immediately.
    pub fn receive(&self, flags: IoFlags) -> Result<Option<Vec<u8>>> {
        let Some(buf) = self.receive_buf(flags)? else {
            return Ok(None);
        };
        let out = buf.as_slice().to_vec();
        self.shared.transport.free(buf);
        Ok(Some(out))
    }

    /// Close hook: free every buffer this socket pooled.
    pub fn clear(&self) {
        self.manager.clear();
        debug!("[SOCKET] staging cleared for handle {:?}", self.shared.handle);
    }

    fn receive_buf(&self, flags: IoFlags) -> Result<Option<NativeBuf>> {
        let mut retries = 0;
        loop {
            match self.shared.transport.recv(self.shared.handle, flags) {
                Ok(buf) => return Ok(Some(buf)),
                Err(TransportError::WouldBlock) => {
                    if flags == IoFlags::DontWait || retries >= MAX_IO_RETRIES {
                        return Ok(None);
                    }
                    retries += 1;
                    std::hint::spin_loop();
                }
                Err(TransportError::Native { code }) => {
                    return Err(self.native_err("recv", code));
                }
            }
        }
    }

    fn native_err(&self, op: &'static str, code: i32) -> StageError {
        StageError::native(op, code, self.shared.transport.describe(code))
    }
}
