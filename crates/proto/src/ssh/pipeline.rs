//! Send and receive pipelines.
//!
//! The layers between a message payload and the byte stream are explicit
//! stages, assembled once per connection and driven in order:
//!
//! ```text
//! send:     payload -> [compress] -> [frame] -> [seal]   -> bytes
//! receive:  bytes   -> [open]     -> [deframe] -> [decompress] -> payload
//! ```
//!
//! Every stage takes one unit in and yields zero or more units out
//! ([`Stage`]). The receive side starts with a pull-based source, the
//! [`PacketOpener`], which releases one packet per pull; a caller that arms
//! keys after seeing NEWKEYS therefore never has later bytes decrypted with
//! stale state.

use crate::ssh::compression::{Compressor, Decompressor};
use crate::ssh::crypto::DirectionKeys;
use crate::ssh::packet::{Packet, PacketDecoder};
use crate::ssh::transport::{PacketOpener, PacketSealer};
use sluice_platform::{SluiceError, SluiceResult};

/// One transform step: a unit in, zero or more units out.
pub trait Stage {
    /// Processes one unit.
    fn process(&mut self, input: Vec<u8>) -> SluiceResult<Vec<Vec<u8>>>;
}

/// Runs `input` through `stages` in order.
fn run(stages: &mut [&mut dyn Stage], input: Vec<u8>) -> SluiceResult<Vec<Vec<u8>>> {
    let mut units = vec![input];
    for stage in stages.iter_mut() {
        let mut next = Vec::with_capacity(units.len());
        for unit in units {
            next.extend(stage.process(unit)?);
        }
        units = next;
    }
    Ok(units)
}

impl Stage for Compressor {
    fn process(&mut self, input: Vec<u8>) -> SluiceResult<Vec<Vec<u8>>> {
        Ok(vec![self.compress(&input)?])
    }
}

impl Stage for Decompressor {
    fn process(&mut self, input: Vec<u8>) -> SluiceResult<Vec<Vec<u8>>> {
        Ok(vec![self.decompress(&input)?])
    }
}

impl Stage for PacketSealer {
    fn process(&mut self, input: Vec<u8>) -> SluiceResult<Vec<Vec<u8>>> {
        Ok(vec![self.seal(&input)?])
    }
}

impl Stage for PacketDecoder {
    fn process(&mut self, input: Vec<u8>) -> SluiceResult<Vec<Vec<u8>>> {
        Ok(self
            .feed(&input)?
            .into_iter()
            .map(Packet::into_payload)
            .collect())
    }
}

/// Outbound framing stage: pads a payload to the current block size.
#[derive(Debug)]
pub struct Framer {
    block_size: usize,
}

impl Framer {
    /// Creates a framer for the given block size.
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }

    /// Changes the block size used for later packets.
    pub fn set_block_size(&mut self, block_size: usize) {
        self.block_size = block_size;
    }
}

impl Stage for Framer {
    fn process(&mut self, input: Vec<u8>) -> SluiceResult<Vec<Vec<u8>>> {
        Ok(vec![Packet::with_block_size(input, self.block_size).to_bytes()])
    }
}

/// Client-to-server pipeline.
#[derive(Debug)]
pub struct Outbound {
    compressor: Compressor,
    framer: Framer,
    sealer: PacketSealer,
}

impl Default for Outbound {
    fn default() -> Self {
        Self::new()
    }
}

impl Outbound {
    /// Creates an inert pipeline.
    pub fn new() -> Self {
        let sealer = PacketSealer::new();
        Self {
            compressor: Compressor::new(),
            framer: Framer::new(sealer.block_size()),
            sealer,
        }
    }

    /// Turns one message payload into wire bytes.
    pub fn send(&mut self, payload: Vec<u8>) -> SluiceResult<Vec<u8>> {
        let mut stages: [&mut dyn Stage; 3] =
            [&mut self.compressor, &mut self.framer, &mut self.sealer];
        Ok(run(&mut stages, payload)?.concat())
    }

    /// Installs client-to-server keys.
    pub fn arm(&mut self, keys: &DirectionKeys) -> SluiceResult<()> {
        self.sealer.arm(keys)?;
        self.framer.set_block_size(self.sealer.block_size());
        Ok(())
    }

    /// Switches on compression.
    pub fn activate_compression(&mut self) {
        self.compressor.activate();
    }

    /// Returns true once keys are installed.
    pub fn is_armed(&self) -> bool {
        self.sealer.is_armed()
    }

    /// Returns true once compression is on.
    pub fn is_compressing(&self) -> bool {
        self.compressor.is_active()
    }

    /// Sequence number of the next outbound packet.
    pub fn sequence(&self) -> u32 {
        self.sealer.sequence()
    }
}

/// Server-to-client pipeline.
#[derive(Debug)]
pub struct Inbound {
    opener: PacketOpener,
    deframer: PacketDecoder,
    decompressor: Decompressor,
}

impl Inbound {
    /// Creates an inert pipeline.
    ///
    /// `max_packet_length` bounds both the framed packet and one inflated
    /// payload; `inflate_buffer_size` bounds each inflate step.
    pub fn new(max_packet_length: usize, inflate_buffer_size: usize) -> Self {
        Self {
            opener: PacketOpener::new(max_packet_length),
            deframer: PacketDecoder::new(max_packet_length),
            decompressor: Decompressor::new(inflate_buffer_size, max_packet_length),
        }
    }

    /// Appends received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.opener.feed(data);
    }

    /// Returns the next message payload, if a whole packet has arrived.
    ///
    /// # Errors
    ///
    /// Propagates framing, integrity and inflate failures. All of them are
    /// fatal for the connection.
    pub fn next_payload(&mut self) -> SluiceResult<Option<Vec<u8>>> {
        let packet = match self.opener.next_packet()? {
            Some(packet) => packet,
            None => return Ok(None),
        };
        let mut stages: [&mut dyn Stage; 2] = [&mut self.deframer, &mut self.decompressor];
        let mut payloads = run(&mut stages, packet)?;
        if payloads.len() != 1 || !self.deframer.is_idle() {
            return Err(SluiceError::Protocol(
                "Opened packet did not frame to exactly one payload".to_string(),
            ));
        }
        Ok(payloads.pop())
    }

    /// Installs server-to-client keys.
    pub fn arm(&mut self, keys: &DirectionKeys) -> SluiceResult<()> {
        self.opener.arm(keys)
    }

    /// Switches on decompression.
    pub fn activate_compression(&mut self) {
        self.decompressor.activate();
    }

    /// Returns true once keys are installed.
    pub fn is_armed(&self) -> bool {
        self.opener.is_armed()
    }

    /// Returns true once decompression is on.
    pub fn is_compressing(&self) -> bool {
        self.decompressor.is_active()
    }

    /// Sequence number expected on the next inbound packet.
    pub fn sequence(&self) -> u32 {
        self.opener.sequence()
    }

    /// Number of received bytes not yet returned as a payload.
    pub fn buffered(&self) -> usize {
        self.opener.buffered()
    }
}
