//! Basic usage example for the msgpak wire protocol.

use bytes::BytesMut;
use msgpak_wire::{
    compose, parse, validate_task_command, EnvelopeError, EnvelopeKeys, Frame, FrameDecoder,
    ProtocolCommand, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== MsgPak Wire Protocol Example ===\n");

    let long_lived = "example-shared-key-0123456789";
    let secret = "5b1f0c6e2a";
    let keys = EnvelopeKeys::session(long_lived, secret);

    // 1. Compose an envelope
    println!("1. Composing a REPORT envelope...");
    let blob = compose("REPORT", "hello", &keys, DEFAULT_MAX_MESSAGE_SIZE)?;
    println!("   Archived blob size: {} bytes", blob.len());

    // 2. Put it in a transport frame and decode it again
    println!("\n2. Framing...");
    let encoded = Frame::text(blob).encode(DEFAULT_MAX_FRAME_SIZE)?;
    println!("   Encoded frame size: {} bytes", encoded.len());

    let mut buf = BytesMut::from(encoded.as_ref());
    let mut decoder = FrameDecoder::new();
    if let Some(frame) = decoder.decode(&mut buf)? {
        let parsed = parse(frame.payload_text()?, &keys, DEFAULT_MAX_MESSAGE_SIZE)?;
        println!("   Command: {}", parsed.cmd);
        println!("   Data: {}", parsed.data);
    }

    // 3. A different secret cannot read the envelope
    println!("\n3. Parsing with a stale secret...");
    let blob = compose("REPORT", "hello", &keys, DEFAULT_MAX_MESSAGE_SIZE)?;
    let stale = EnvelopeKeys::session(long_lived, "0000");
    match parse(&blob, &stale, DEFAULT_MAX_MESSAGE_SIZE) {
        Err(EnvelopeError::InvalidChecksum) => println!("   Rejected: invalid checksum"),
        other => println!("   Unexpected: {:?}", other),
    }

    // 4. Command namespace
    println!("\n4. Command namespace...");
    for cmd in ["<PING>", "<ERR:UNHANDLED>", "REPORT"] {
        match ProtocolCommand::parse(cmd) {
            Some(p) => println!("   {} is a protocol command ({:?})", cmd, p),
            None => println!("   {} is an application command", cmd),
        }
    }
    for cmd in ["REPORT", "DO:THIS", "ping"] {
        match validate_task_command(cmd, &[]) {
            Ok(c) => println!("   task {} accepted", c),
            Err(e) => println!("   task {} rejected: {}", cmd, e),
        }
    }

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
