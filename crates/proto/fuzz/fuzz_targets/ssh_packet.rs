//! Fuzz target for SSH packet framing.
//!
//! Feeds random input to the single-packet parser, the streaming decoder and
//! the plaintext inbound pipeline looking for panics, unbounded allocation
//! and stalls.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use sluice_proto::ssh::packet::{Packet, PacketDecoder};
use sluice_proto::ssh::pipeline::Inbound;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        let reparsed =
            Packet::from_bytes(&packet.to_bytes()).expect("Re-framed packet must parse");
        assert_eq!(packet.payload(), reparsed.payload());
    }

    // Split the input at an arbitrary point; the decoder must not care
    let split = data.first().map_or(0, |b| *b as usize).min(data.len());
    let mut decoder = PacketDecoder::new(64 * 1024);
    if decoder.feed(&data[..split]).is_ok() {
        let _ = decoder.feed(&data[split..]);
    }

    let mut inbound = Inbound::new(64 * 1024, 4096);
    inbound.feed(data);
    while let Ok(Some(_)) = inbound.next_payload() {}
});
