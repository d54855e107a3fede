//! Round-trip a message through the staging layer over the in-memory
//! transport.
//!
//! Run with `RUST_LOG=trace cargo run --example mem_roundtrip` to watch
//! pool promotion and batch sends happen.

use std::sync::Arc;

use stagecoach::prelude::*;

fn main() -> stagecoach::Result<()> {
    stagecoach::dev_tracing::init_tracing();

    let transport = Arc::new(MemTransport::new());
    let (tx, rx) = transport.pair();

    let sender = StagedSocket::new(transport.clone(), tx, 1 << 20, 8192)?;
    let receiver = StagedSocket::new(transport, rx, 1 << 20, 8192)?;

    // Stage a multi-page payload.
    let payload: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
    let mut stream = sender.send_stream();
    stream.write_all(&payload)?;
    println!(
        "staged {} bytes across {} pages",
        stream.len(),
        stream.page_count()
    );

    let sent = sender.send(&stream, IoFlags::Wait)?;
    println!("sent {sent} bytes");

    let mut msg = receiver
        .receive_stream(IoFlags::Wait)?
        .expect("message waiting");
    let mut out = vec![0u8; msg.len()];
    msg.read(&mut out);
    assert_eq!(out, payload);
    println!("received {} bytes intact", out.len());

    // Releasing the stream frees the native buffer; clearing the sockets
    // frees every pooled page.
    msg.release();
    sender.clear();
    receiver.clear();
    Ok(())
}
