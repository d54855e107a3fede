//! The seam between the staging layer and the native messaging library.
//!
//! The staging layer never talks to a wire format itself: bytes it stages
//! are handed unmodified to a [`Transport`], which models the handful of
//! native entry points the layer consumes. Everything else the native
//! library does (socket construction, option marshaling, symbol loading)
//! stays on the other side of this trait.

use std::io::IoSlice;

use hashbrown::HashMap;
use once_cell::sync::Lazy;

use crate::alloc::{NativeAlloc, NativeBuf};

/// Identifier of one native socket, opaque to this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle(pub i32);

/// Send/receive flags understood by the native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoFlags {
    /// Block until the transport's own timeout expires.
    #[default]
    Wait,
    /// Surface "no data yet" immediately instead of blocking.
    DontWait,
}

/// Outcome classification of one native call.
#[derive(Debug, PartialEq, Eq)]
pub enum TransportError {
    /// The operation would block; the caller should retry shortly.
    WouldBlock,
    /// Any other native failure, identified by its error code.
    Native {
        /// The native error code.
        code: i32,
    },
}

/// Result type of native calls.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Well-known native error codes surfaced by transports.
pub mod codes {
    /// Operation would block.
    pub const EAGAIN: i32 = 11;
    /// Bad socket handle.
    pub const EBADF: i32 = 9;
    /// Message too long for the transport.
    pub const EMSGSIZE: i32 = 90;
    /// The library is shutting down.
    pub const ETERM: i32 = 156_384_765;
}

static CODE_TEXT: Lazy<HashMap<i32, &'static str>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert(codes::EAGAIN, "resource temporarily unavailable");
    map.insert(codes::EBADF, "bad socket handle");
    map.insert(codes::EMSGSIZE, "message too long");
    map.insert(codes::ETERM, "library is terminating");
    map
});

/// Default translation of a native error code to text.
#[must_use]
pub fn describe_code(code: i32) -> String {
    CODE_TEXT
        .get(&code)
        .map_or_else(|| format!("unknown native error {code}"), |s| (*s).to_string())
}

/// Native entry points consumed by the staging layer.
///
/// The allocation half is split into [`NativeAlloc`] so the buffer manager
/// can be driven without a full transport behind it.
pub trait Transport: NativeAlloc {
    /// One scatter/gather send: transmit `parts` as a single logical
    /// message on `handle`.
    fn send_vectored(
        &self,
        handle: SocketHandle,
        parts: &[IoSlice<'_>],
        flags: IoFlags,
    ) -> TransportResult<usize>;

    /// Receive one message; the returned buffer is owned by the caller and
    /// must go back to [`NativeAlloc::free`].
    fn recv(&self, handle: SocketHandle, flags: IoFlags) -> TransportResult<NativeBuf>;

    /// Translate a native error code into a human-readable description.
    fn describe(&self, code: i32) -> String {
        describe_code(code)
    }
}
