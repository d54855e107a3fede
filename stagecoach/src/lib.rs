//! # Stagecoach
//!
//! Buffer pooling and staging layer for native messaging transports.
//!
//! ## Architecture
//!
//! Stagecoach supplies, recycles, and batches native memory for socket
//! send/receive paths:
//!
//! - **`stagecoach-core`**: thread-affinitized pools, the tiered buffer
//!   manager, paged write streams and recyclable read streams
//! - **`stagecoach`**: public API surface (this crate)
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use stagecoach::prelude::*;
//!
//! # fn example() -> stagecoach::Result<()> {
//! // An in-memory transport stands in for the native library.
//! let transport = Arc::new(MemTransport::new());
//! let (tx, rx) = transport.pair();
//!
//! let sender = StagedSocket::with_defaults(transport.clone(), tx)?;
//! let receiver = StagedSocket::with_defaults(transport, rx)?;
//!
//! // Stage bytes into pooled pages and send them as one message.
//! let mut stream = sender.send_stream();
//! stream.write_all(b"hello world")?;
//! sender.send(&stream, IoFlags::Wait)?;
//!
//! // Receive, read, and release; the buffer goes back to the native side.
//! if let Some(mut msg) = receiver.receive_stream(IoFlags::DontWait)? {
//!     let mut out = vec![0u8; msg.len()];
//!     msg.read(&mut out);
//!     assert_eq!(out, b"hello world");
//! }
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```
//!
//! ## Performance
//!
//! - **Low-lock pooling**: steady-state same-thread take/return touches no
//!   locks once a thread is promoted
//! - **Adaptive quotas**: per-class budgets follow observed miss/peak
//!   statistics under a fixed byte ceiling
//! - **Scatter/gather**: page chains go out in bounded vectored batches,
//!   never copied into one contiguous buffer on the send path
//!
//! ## Safety
//!
//! - `unsafe` code is isolated to `stagecoach-core`'s `alloc` and `pool`
//!   modules
//! - Streams release their native memory deterministically on drop

#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export core types
pub use bytes::Bytes;

pub use stagecoach_core::error::{Result, StageError};
pub use stagecoach_core::{alloc, error, manager, mem, pool, read, socket, transport, write};

/// Convenience re-exports of the commonly used surface.
pub mod prelude {
    pub use stagecoach_core::prelude::*;
}

pub mod dev_tracing;
