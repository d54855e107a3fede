//! Stagecoach Core
//!
//! Runtime-agnostic buffer pooling and staging kernel for native messaging
//! transports:
//! - Native buffer primitives and the allocation seam (`alloc`)
//! - Thread-affinitized low-lock object pool (`pool`)
//! - Tiered buffer manager with adaptive quota tuning (`manager`)
//! - Paged append-only write buffer for scatter/gather sends (`write`)
//! - Recyclable single-buffer read wrapper (`read`)
//! - Staging surface bound to one native socket (`socket`)
//! - The native-library seam and an in-memory stand-in (`transport`, `mem`)
//! - Error types (`error`)

// Raw memory handling is confined to `alloc` (buffer blocks) and `pool`
// (lock-free slot storage); everything else is safe Rust.
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]

pub mod alloc;
pub mod error;
pub mod manager;
pub mod mem;
pub mod pool;
pub mod read;
pub mod socket;
pub mod transport;
pub mod write;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::alloc::{HeapAlloc, NativeAlloc, NativeBuf};
    pub use crate::error::{Result, StageError};
    pub use crate::manager::BufferManager;
    pub use crate::mem::MemTransport;
    pub use crate::pool::{GlobalPool, SyncPool};
    pub use crate::read::ReadStream;
    pub use crate::socket::StagedSocket;
    pub use crate::transport::{IoFlags, SocketHandle, Transport};
    pub use crate::write::WriteStream;
}
