//! In-process transport for exercising the staging layer without a native
//! library.
//!
//! Pairs of handles share a registry of message queues: a vectored send on
//! one handle gathers its parts into a single message on the peer's queue,
//! and a receive pops one message into a freshly allocated native buffer
//! the receiver owns. No serialization, network, or syscall overhead —
//! just the same ownership contract the real native library imposes.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::alloc::{HeapAlloc, NativeAlloc, NativeBuf};
use crate::error::Result;
use crate::transport::{codes, IoFlags, SocketHandle, Transport, TransportError, TransportResult};

/// In-memory loopback transport.
///
/// Handles are created in pairs; each handle's sends land on its peer's
/// queue. Queues are unbounded, so sends never block; receives report
/// "would block" when the queue is empty.
pub struct MemTransport {
    heap: HeapAlloc,
    queues: Mutex<HashMap<SocketHandle, VecDeque<Bytes>>>,
    next_handle: AtomicI32,
}

impl MemTransport {
    /// Create an empty transport with no endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: HeapAlloc,
            queues: Mutex::new(HashMap::new()),
            next_handle: AtomicI32::new(0),
        }
    }

    /// Open a connected pair of handles.
    ///
    /// Peers are adjacent even/odd handles, so the peer of `h` is `h ^ 1`.
    pub fn pair(&self) -> (SocketHandle, SocketHandle) {
        let base = self.next_handle.fetch_add(2, Ordering::Relaxed);
        let (a, b) = (SocketHandle(base), SocketHandle(base | 1));
        let mut queues = self.queues.lock();
        queues.insert(a, VecDeque::new());
        queues.insert(b, VecDeque::new());
        (a, b)
    }

    /// Close a handle, dropping its pending messages.
    pub fn close(&self, handle: SocketHandle) {
        self.queues.lock().remove(&handle);
    }

    /// Messages waiting on `handle`.
    #[must_use]
    pub fn pending(&self, handle: SocketHandle) -> usize {
        self.queues.lock().get(&handle).map_or(0, VecDeque::len)
    }

    const fn peer(handle: SocketHandle) -> SocketHandle {
        SocketHandle(handle.0 ^ 1)
    }
}

impl Default for MemTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeAlloc for MemTransport {
    fn alloc(&self, size: usize) -> Result<NativeBuf> {
        self.heap.alloc(size)
    }

    fn free(&self, buf: NativeBuf) {
        self.heap.free(buf);
    }
}

impl Transport for MemTransport {
    fn send_vectored(
        &self,
        handle: SocketHandle,
        parts: &[IoSlice<'_>],
        _flags: IoFlags,
    ) -> TransportResult<usize> {
        let peer = Self::peer(handle);
        let mut message = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            message.extend_from_slice(part);
        }
        let count = message.len();

        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(&peer) else {
            return Err(TransportError::Native { code: codes::EBADF });
        };
        queue.push_back(Bytes::from(message));
        Ok(count)
    }

    fn recv(&self, handle: SocketHandle, _flags: IoFlags) -> TransportResult<NativeBuf> {
        let message = {
            let mut queues = self.queues.lock();
            let Some(queue) = queues.get_mut(&handle) else {
                return Err(TransportError::Native { code: codes::EBADF });
            };
            let Some(message) = queue.pop_front() else {
                return Err(TransportError::WouldBlock);
            };
            message
        };

        let mut buf = self
            .heap
            .alloc(message.len())
            .map_err(|_| TransportError::Native { code: codes::EMSGSIZE })?;
        buf.as_mut_slice().copy_from_slice(&message);
        Ok(buf)
    }
}
