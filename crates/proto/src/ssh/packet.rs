//! SSH binary packet framing (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (added by the transport layer once keys are active)
//! ```
//!
//! `packet_length` excludes itself and the MAC. The whole unencrypted packet,
//! length field included, is a multiple of the block size (8 before a cipher
//! is active) and carries at least 4 bytes of random padding.
//!
//! Outbound payloads are framed with [`Packet::with_block_size`]. Inbound bytes
//! go through [`PacketDecoder`], which accepts input split at any boundary.
//!
//! # Example
//!
//! ```rust
//! use sluice_proto::ssh::packet::{Packet, PacketDecoder};
//!
//! let bytes = Packet::new(b"SSH_MSG payload".to_vec()).to_bytes();
//!
//! let mut decoder = PacketDecoder::new(1 << 16);
//! let (head, tail) = bytes.split_at(3);
//! assert!(decoder.feed(head).unwrap().is_empty());
//! let packets = decoder.feed(tail).unwrap();
//! assert_eq!(packets[0].payload(), b"SSH_MSG payload");
//! ```

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use sluice_platform::{SluiceError, SluiceResult};

/// Block size used before any cipher is active.
pub const DEFAULT_BLOCK_SIZE: usize = 8;

/// Default upper bound for an inbound `packet_length`.
///
/// RFC 4253 requires at least 35000 bytes; servers commonly send up to the
/// channel maximum packet size plus headers.
pub const DEFAULT_MAX_PACKET_LENGTH: usize = 256 * 1024;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// Length of the `packet_length` field plus the `padding_length` byte.
pub const HEADER_LEN: usize = 5;

/// SSH binary packet without its MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

/// Returns the smallest padding length (at least 4) that aligns a packet
/// carrying `payload_len` bytes to `block_size`.
///
/// # Example
///
/// ```rust
/// use sluice_proto::ssh::packet::padding_length;
///
/// // 5 header bytes + 3 payload = 8, so a full extra block of padding is needed
/// assert_eq!(padding_length(3, 8), 8);
/// assert_eq!(padding_length(6, 8), 5);
/// ```
pub fn padding_length(payload_len: usize, block_size: usize) -> usize {
    let block_size = block_size.max(DEFAULT_BLOCK_SIZE);
    let unpadded = HEADER_LEN + payload_len;
    let mut padding = block_size - unpadded % block_size;
    if padding < MIN_PADDING_LEN as usize {
        padding += block_size;
    }
    padding
}

impl Packet {
    /// Frames a payload for the default 8-byte block size.
    pub fn new(payload: Vec<u8>) -> Self {
        Self::with_block_size(payload, DEFAULT_BLOCK_SIZE)
    }

    /// Frames a payload for the given cipher block size.
    ///
    /// Padding is filled from the thread-local CSPRNG.
    pub fn with_block_size(payload: Vec<u8>, block_size: usize) -> Self {
        let mut padding = vec![0u8; padding_length(payload.len(), block_size)];
        rand::thread_rng().fill_bytes(&mut padding);
        Self { payload, padding }
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Consumes the packet and returns its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the total framed length including the length field.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + self.padding.len()
    }

    /// Serializes this packet to wire format (without MAC).
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);

        buf.to_vec()
    }

    /// Parses exactly one complete packet.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Protocol`] if the data is shorter than declared,
    /// the padding is shorter than 4 bytes, or trailing bytes remain.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(SluiceError::Protocol(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                HEADER_LEN
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;
        if buf.len() != packet_length {
            return Err(SluiceError::Protocol(format!(
                "Packet length mismatch: declared {}, got {} bytes",
                packet_length,
                buf.len()
            )));
        }

        let padding_length = buf.get_u8() as usize;
        validate_padding(packet_length, padding_length)?;

        let payload_length = packet_length - 1 - padding_length;
        let payload = buf[..payload_length].to_vec();
        buf.advance(payload_length);
        let padding = buf.to_vec();

        Ok(Self { payload, padding })
    }
}

fn validate_padding(packet_length: usize, padding_length: usize) -> SluiceResult<()> {
    if padding_length < MIN_PADDING_LEN as usize {
        return Err(SluiceError::Protocol(format!(
            "Padding too short: {} bytes (minimum {})",
            padding_length, MIN_PADDING_LEN
        )));
    }
    if packet_length < 1 + padding_length {
        return Err(SluiceError::Protocol(format!(
            "Invalid packet: packet_length ({}) too small for padding ({})",
            packet_length, padding_length
        )));
    }
    Ok(())
}

/// Receive-side framer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Collecting the 4-byte length.
    AwaitingLength,
    /// Length known, waiting for the padding-length byte.
    AwaitingPaddingLength,
    /// Filling the payload buffer.
    AwaitingPayload,
    /// Filling the padding buffer.
    AwaitingPadding,
}

/// Incremental packet de-framer.
///
/// Input may contain a fraction of a packet, exactly one, or several; partial
/// data stays buffered until the next [`feed`](Self::feed).
#[derive(Debug)]
pub struct PacketDecoder {
    state: DecodeState,
    max_packet_length: usize,
    length_buf: [u8; 4],
    length_filled: usize,
    packet_length: usize,
    payload: Vec<u8>,
    payload_len: usize,
    padding: Vec<u8>,
    padding_len: usize,
}

impl PacketDecoder {
    /// Creates a decoder that rejects packets longer than `max_packet_length`.
    pub fn new(max_packet_length: usize) -> Self {
        Self {
            state: DecodeState::AwaitingLength,
            max_packet_length,
            length_buf: [0; 4],
            length_filled: 0,
            packet_length: 0,
            payload: Vec::new(),
            payload_len: 0,
            padding: Vec::new(),
            padding_len: 0,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Returns true when no partial packet is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::AwaitingLength && self.length_filled == 0
    }

    /// Feeds bytes and returns every packet completed by them, in order.
    pub fn feed(&mut self, mut data: &[u8]) -> SluiceResult<Vec<Packet>> {
        let mut packets = Vec::new();

        while !data.is_empty() {
            match self.state {
                DecodeState::AwaitingLength => {
                    let n = (4 - self.length_filled).min(data.len());
                    self.length_buf[self.length_filled..self.length_filled + n]
                        .copy_from_slice(&data[..n]);
                    self.length_filled += n;
                    data = &data[n..];

                    if self.length_filled == 4 {
                        let length = u32::from_be_bytes(self.length_buf) as usize;
                        if length > self.max_packet_length {
                            return Err(SluiceError::Protocol(format!(
                                "Packet too large: {} bytes (maximum {})",
                                length, self.max_packet_length
                            )));
                        }
                        if length < 1 + MIN_PADDING_LEN as usize {
                            return Err(SluiceError::Protocol(format!(
                                "Packet too small: {} bytes",
                                length
                            )));
                        }
                        self.length_filled = 0;
                        self.packet_length = length;
                        self.state = DecodeState::AwaitingPaddingLength;
                    }
                }
                DecodeState::AwaitingPaddingLength => {
                    let padding_len = data[0] as usize;
                    data = &data[1..];
                    validate_padding(self.packet_length, padding_len)?;

                    self.payload_len = self.packet_length - 1 - padding_len;
                    self.padding_len = padding_len;
                    self.payload = Vec::with_capacity(self.payload_len);
                    self.padding = Vec::with_capacity(padding_len);
                    self.state = if self.payload_len == 0 {
                        DecodeState::AwaitingPadding
                    } else {
                        DecodeState::AwaitingPayload
                    };
                }
                DecodeState::AwaitingPayload => {
                    let n = (self.payload_len - self.payload.len()).min(data.len());
                    self.payload.extend_from_slice(&data[..n]);
                    data = &data[n..];
                    if self.payload.len() == self.payload_len {
                        self.state = DecodeState::AwaitingPadding;
                    }
                }
                DecodeState::AwaitingPadding => {
                    let n = (self.padding_len - self.padding.len()).min(data.len());
                    self.padding.extend_from_slice(&data[..n]);
                    data = &data[n..];
                    if self.padding.len() == self.padding_len {
                        packets.push(Packet {
                            payload: std::mem::take(&mut self.payload),
                            padding: std::mem::take(&mut self.padding),
                        });
                        self.state = DecodeState::AwaitingLength;
                    }
                }
            }
        }

        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_packet_new() {
        let packet = Packet::new(b"Hello, SSH!".to_vec());
        assert_eq!(packet.payload(), b"Hello, SSH!");
        assert!(packet.padding().len() >= MIN_PADDING_LEN as usize);
    }

    #[test]
    fn test_packet_alignment() {
        for block in [8usize, 16] {
            for len in 0..64 {
                let packet = Packet::with_block_size(vec![0x42; len], block);
                assert_eq!(packet.wire_len() % block, 0, "len {} block {}", len, block);
                let pad = packet.padding().len();
                assert!(pad >= 4 && pad < 4 + block, "padding {} not minimal", pad);
            }
        }
    }

    #[test]
    fn test_padding_is_random() {
        let a = Packet::new(vec![1; 3]);
        let b = Packet::new(vec![1; 3]);
        // 8 random bytes colliding is practically impossible
        assert_ne!(a.padding(), b.padding());
    }

    #[test]
    fn test_packet_round_trip() {
        let packet = Packet::new(b"Test SSH packet payload".to_vec());
        let parsed = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_packet_from_bytes_rejects_trailing_data() {
        let mut bytes = Packet::new(b"x".to_vec()).to_bytes();
        bytes.push(0);
        assert!(Packet::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_packet_invalid_padding_too_short() {
        let data = vec![0, 0, 0, 8, 2, b'H', b'e', b'l', b'l', b'o', 0, 0];
        match Packet::from_bytes(&data) {
            Err(SluiceError::Protocol(msg)) => assert!(msg.contains("Padding too short")),
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_decoder_several_packets_one_chunk() {
        let mut stream = Vec::new();
        for payload in [&b"one"[..], b"two", b"three"] {
            stream.extend(Packet::new(payload.to_vec()).to_bytes());
        }
        let mut decoder = PacketDecoder::new(DEFAULT_MAX_PACKET_LENGTH);
        let packets = decoder.feed(&stream).unwrap();
        let payloads: Vec<&[u8]> = packets.iter().map(|p| p.payload()).collect();
        assert_eq!(payloads, vec![&b"one"[..], b"two", b"three"]);
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_decoder_states() {
        let bytes = Packet::new(b"abc".to_vec()).to_bytes();
        let mut decoder = PacketDecoder::new(DEFAULT_MAX_PACKET_LENGTH);
        decoder.feed(&bytes[..2]).unwrap();
        assert_eq!(decoder.state(), DecodeState::AwaitingLength);
        decoder.feed(&bytes[2..4]).unwrap();
        assert_eq!(decoder.state(), DecodeState::AwaitingPaddingLength);
        decoder.feed(&bytes[4..6]).unwrap();
        assert_eq!(decoder.state(), DecodeState::AwaitingPayload);
        decoder.feed(&bytes[6..9]).unwrap();
        assert_eq!(decoder.state(), DecodeState::AwaitingPadding);
        let done = decoder.feed(&bytes[9..]).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(decoder.state(), DecodeState::AwaitingLength);
    }

    #[test]
    fn test_decoder_rejects_oversized_length() {
        let mut decoder = PacketDecoder::new(1024);
        let err = decoder.feed(&[0, 0, 0x10, 0, 4]).unwrap_err();
        assert!(err.to_string().contains("Packet too large"));
    }

    #[test]
    fn test_decoder_rejects_padding_beyond_length() {
        let mut decoder = PacketDecoder::new(1024);
        assert!(decoder.feed(&[0, 0, 0, 8, 200]).is_err());
    }

    proptest! {
        #[test]
        fn prop_framing_survives_any_split(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..600), 1..5),
            cuts in proptest::collection::vec(1usize..97, 1..40),
        ) {
            let mut stream = Vec::new();
            for p in &payloads {
                stream.extend(Packet::new(p.clone()).to_bytes());
            }

            let mut decoder = PacketDecoder::new(DEFAULT_MAX_PACKET_LENGTH);
            let mut out = Vec::new();
            let mut rest = &stream[..];
            let mut i = 0;
            while !rest.is_empty() {
                let n = cuts[i % cuts.len()].min(rest.len());
                out.extend(decoder.feed(&rest[..n]).unwrap());
                rest = &rest[n..];
                i += 1;
            }

            let got: Vec<Vec<u8>> = out.into_iter().map(Packet::into_payload).collect();
            prop_assert_eq!(got, payloads);
        }
    }
}
