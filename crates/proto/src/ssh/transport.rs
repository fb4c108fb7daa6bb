//! Per-direction packet protection (RFC 4253 Section 6.3 and 6.4).
//!
//! Each direction owns one context that is inert until keys are armed. While
//! inert it still frames and counts packets, so sequence numbers line up with
//! the peer from the very first binary packet.
//!
//! # Sealing (outbound)
//!
//! ```text
//! mac    = MAC(key, uint32 seq || plaintext_packet)
//! output = ENCRYPT(plaintext_packet) || mac
//! seq    = seq + 1
//! ```
//!
//! # Opening (inbound)
//!
//! The first cipher block is decrypted alone to learn `packet_length`, the rest
//! is decrypted once it has fully arrived, and the trailing MAC is checked. The
//! sequence counter advances even when the MAC check fails; the failure itself
//! is fatal for the connection.
//!
//! [`PacketOpener::next_packet`] yields at most one packet per call. Callers
//! process it before pulling again, which lets NEWKEYS arm the opener before
//! any byte of the next packet is interpreted.

use crate::ssh::crypto::{CipherContext, DirectionKeys, MacKey};
use crate::ssh::packet::{DEFAULT_BLOCK_SIZE, HEADER_LEN, MIN_PADDING_LEN};
use bytes::BytesMut;
use sluice_platform::{SluiceError, SluiceResult};
use tracing::trace;

/// Cipher and MAC state for one armed direction.
#[derive(Debug)]
struct ArmedKeys {
    cipher: CipherContext,
    mac: MacKey,
}

impl ArmedKeys {
    fn encrypting(keys: &DirectionKeys) -> SluiceResult<Self> {
        Ok(Self {
            cipher: CipherContext::encryptor(keys.cipher, &keys.encryption_key, &keys.iv)?,
            mac: MacKey::new(keys.mac, &keys.integrity_key)?,
        })
    }

    fn decrypting(keys: &DirectionKeys) -> SluiceResult<Self> {
        Ok(Self {
            cipher: CipherContext::decryptor(keys.cipher, &keys.encryption_key, &keys.iv)?,
            mac: MacKey::new(keys.mac, &keys.integrity_key)?,
        })
    }
}

/// Outbound protection context.
#[derive(Debug, Default)]
pub struct PacketSealer {
    keys: Option<ArmedKeys>,
    sequence: u32,
}

impl PacketSealer {
    /// Creates an inert sealer at sequence number 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the client-to-server keys; later packets are encrypted and MAC'd.
    pub fn arm(&mut self, keys: &DirectionKeys) -> SluiceResult<()> {
        self.keys = Some(ArmedKeys::encrypting(keys)?);
        trace!(sequence = self.sequence, cipher = keys.cipher.name(), "Outbound keys armed");
        Ok(())
    }

    /// Returns true once keys are installed.
    pub fn is_armed(&self) -> bool {
        self.keys.is_some()
    }

    /// Block size that outbound packets must be padded to.
    pub fn block_size(&self) -> usize {
        self.keys
            .as_ref()
            .map_or(DEFAULT_BLOCK_SIZE, |k| k.cipher.block_size().max(DEFAULT_BLOCK_SIZE))
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Protects one framed plaintext packet.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Crypto`] if the packet is not block aligned.
    pub fn seal(&mut self, packet: &[u8]) -> SluiceResult<Vec<u8>> {
        let sequence = self.sequence;
        let sealed = match &mut self.keys {
            None => packet.to_vec(),
            Some(keys) => {
                let tag = keys.mac.compute(sequence, packet);
                let mut out = packet.to_vec();
                keys.cipher.apply(&mut out)?;
                out.extend_from_slice(&tag);
                out
            }
        };
        self.sequence = sequence.wrapping_add(1);
        trace!(sequence, len = sealed.len(), "Sealed packet");
        Ok(sealed)
    }
}

/// First block of a packet whose remainder has not fully arrived.
#[derive(Debug)]
struct PartialPacket {
    head: Vec<u8>,
    packet_length: usize,
}

/// Inbound protection context.
#[derive(Debug)]
pub struct PacketOpener {
    keys: Option<ArmedKeys>,
    sequence: u32,
    buffer: BytesMut,
    partial: Option<PartialPacket>,
    max_packet_length: usize,
}

impl PacketOpener {
    /// Creates an inert opener that rejects packets longer than `max_packet_length`.
    pub fn new(max_packet_length: usize) -> Self {
        Self {
            keys: None,
            sequence: 0,
            buffer: BytesMut::new(),
            partial: None,
            max_packet_length,
        }
    }

    /// Installs the server-to-client keys.
    ///
    /// Bytes already buffered but not yet returned are decrypted with them.
    pub fn arm(&mut self, keys: &DirectionKeys) -> SluiceResult<()> {
        if self.partial.is_some() {
            return Err(SluiceError::Protocol(
                "Keys armed in the middle of an inbound packet".to_string(),
            ));
        }
        self.keys = Some(ArmedKeys::decrypting(keys)?);
        trace!(sequence = self.sequence, cipher = keys.cipher.name(), "Inbound keys armed");
        Ok(())
    }

    /// Returns true once keys are installed.
    pub fn is_armed(&self) -> bool {
        self.keys.is_some()
    }

    /// Sequence number expected on the next packet.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Number of received bytes not yet returned as a packet.
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.partial.as_ref().map_or(0, |p| p.head.len())
    }

    /// Appends received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn block_size(&self) -> usize {
        self.keys
            .as_ref()
            .map_or(DEFAULT_BLOCK_SIZE, |k| k.cipher.block_size().max(DEFAULT_BLOCK_SIZE))
    }

    fn mac_size(&self) -> usize {
        self.keys.as_ref().map_or(0, |k| k.mac.tag_size())
    }

    /// Returns the next complete plaintext packet (length field included), if
    /// one has fully arrived.
    ///
    /// # Errors
    ///
    /// - [`SluiceError::Protocol`] for an impossible or oversized length
    /// - [`SluiceError::Integrity`] if the MAC does not verify
    pub fn next_packet(&mut self) -> SluiceResult<Option<Vec<u8>>> {
        let block_size = self.block_size();

        if self.partial.is_none() {
            if self.buffer.len() < block_size {
                return Ok(None);
            }
            let mut head = self.buffer.split_to(block_size).to_vec();
            if let Some(keys) = &mut self.keys {
                keys.cipher.apply(&mut head)?;
            }
            let packet_length =
                u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
            self.check_length(packet_length, block_size)?;
            self.partial = Some(PartialPacket {
                head,
                packet_length,
            });
        }

        let (head_len, packet_length) = match &self.partial {
            Some(p) => (p.head.len(), p.packet_length),
            None => return Ok(None),
        };
        let remaining = (4 + packet_length).saturating_sub(head_len);
        let mac_size = self.mac_size();
        if self.buffer.len() < remaining + mac_size {
            return Ok(None);
        }

        let mut packet = match self.partial.take() {
            Some(p) => p.head,
            None => return Ok(None),
        };
        let mut rest = self.buffer.split_to(remaining).to_vec();
        let tag = self.buffer.split_to(mac_size);

        let sequence = self.sequence;
        self.sequence = sequence.wrapping_add(1);

        if let Some(keys) = &mut self.keys {
            keys.cipher.apply(&mut rest)?;
            packet.extend_from_slice(&rest);
            keys.mac.verify(sequence, &packet, &tag)?;
        } else {
            packet.extend_from_slice(&rest);
        }

        trace!(sequence, len = packet.len(), "Opened packet");
        Ok(Some(packet))
    }

    fn check_length(&self, packet_length: usize, block_size: usize) -> SluiceResult<()> {
        if packet_length > self.max_packet_length {
            return Err(SluiceError::Protocol(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_length, self.max_packet_length
            )));
        }
        if packet_length < 1 + MIN_PADDING_LEN as usize || 4 + packet_length < HEADER_LEN {
            return Err(SluiceError::Protocol(format!(
                "Packet too small: {} bytes",
                packet_length
            )));
        }
        if self.keys.is_some() && (4 + packet_length) % block_size != 0 {
            return Err(SluiceError::Protocol(format!(
                "Packet length {} not aligned to cipher block size {}",
                packet_length, block_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, Direction, MacAlgorithm};
    use crate::ssh::packet::Packet;
    use sluice_platform::FailureCategory;

    fn keys(cipher: CipherAlgorithm, mac: MacAlgorithm) -> DirectionKeys {
        DirectionKeys::derive(
            &[0x5a; 256],
            &[0x01; 20],
            &[0x02; 20],
            Direction::ServerToClient,
            cipher,
            mac,
        )
    }

    fn armed_pair(cipher: CipherAlgorithm, mac: MacAlgorithm) -> (PacketSealer, PacketOpener) {
        let k = keys(cipher, mac);
        let mut sealer = PacketSealer::new();
        let mut opener = PacketOpener::new(1 << 16);
        sealer.arm(&k).unwrap();
        opener.arm(&k).unwrap();
        (sealer, opener)
    }

    #[test]
    fn test_inert_contexts_pass_through_and_count() {
        let mut sealer = PacketSealer::new();
        let mut opener = PacketOpener::new(1 << 16);
        let packet = Packet::new(b"plain".to_vec()).to_bytes();

        let sealed = sealer.seal(&packet).unwrap();
        assert_eq!(sealed, packet);
        assert_eq!(sealer.sequence(), 1);

        opener.feed(&sealed);
        assert_eq!(opener.next_packet().unwrap().unwrap(), packet);
        assert_eq!(opener.sequence(), 1);
        assert!(opener.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_round_trip_every_cipher() {
        for cipher in [
            CipherAlgorithm::Aes128Ctr,
            CipherAlgorithm::Aes128Cbc,
            CipherAlgorithm::TripleDesCtr,
            CipherAlgorithm::TripleDesCbc,
            CipherAlgorithm::BlowfishCbc,
        ] {
            for mac in [
                MacAlgorithm::HmacMd5,
                MacAlgorithm::HmacSha1,
                MacAlgorithm::HmacSha256,
            ] {
                let (mut sealer, mut opener) = armed_pair(cipher, mac);
                let mut wire = Vec::new();
                let mut sent = Vec::new();
                for i in 0..4u8 {
                    let packet =
                        Packet::with_block_size(vec![i; 10 + i as usize * 7], sealer.block_size())
                            .to_bytes();
                    wire.extend(sealer.seal(&packet).unwrap());
                    sent.push(packet);
                }

                for chunk in wire.chunks(5) {
                    opener.feed(chunk);
                }
                for packet in &sent {
                    assert_eq!(&opener.next_packet().unwrap().unwrap(), packet);
                }
                assert!(opener.next_packet().unwrap().is_none());
                assert_eq!(opener.sequence(), 4);
            }
        }
    }

    #[test]
    fn test_partial_arrival_waits() {
        let (mut sealer, mut opener) = armed_pair(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha1);
        let packet = Packet::with_block_size(vec![7; 40], 16).to_bytes();
        let wire = sealer.seal(&packet).unwrap();

        opener.feed(&wire[..20]);
        assert!(opener.next_packet().unwrap().is_none());
        opener.feed(&wire[20..wire.len() - 1]);
        assert!(opener.next_packet().unwrap().is_none());
        opener.feed(&wire[wire.len() - 1..]);
        assert_eq!(opener.next_packet().unwrap().unwrap(), packet);
    }

    #[test]
    fn test_any_flipped_byte_is_detected() {
        let packet = Packet::with_block_size(b"integrity".to_vec(), 16).to_bytes();
        let (mut sealer, _) = armed_pair(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha1);
        let wire = sealer.seal(&packet).unwrap();

        for i in 0..wire.len() {
            let (_, mut opener) = armed_pair(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha1);
            let mut corrupted = wire.clone();
            corrupted[i] ^= 0x01;
            opener.feed(&corrupted);
            // A flipped length byte may surface as a framing error instead
            match opener.next_packet() {
                Ok(Some(_)) => panic!("corruption at byte {} accepted", i),
                Ok(None) | Err(_) => {}
            }
        }
    }

    #[test]
    fn test_mac_failure_is_integrity_error_and_counts() {
        let (mut sealer, mut opener) = armed_pair(CipherAlgorithm::Aes128Cbc, MacAlgorithm::HmacSha256);
        let packet = Packet::with_block_size(vec![1; 30], 16).to_bytes();
        let mut wire = sealer.seal(&packet).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;

        opener.feed(&wire);
        let err = opener.next_packet().unwrap_err();
        assert!(matches!(err, SluiceError::Integrity(_)));
        assert_eq!(err.category(), FailureCategory::Crypto);
        assert_eq!(opener.sequence(), 1);
    }

    #[test]
    fn test_sequence_numbers_bind_mac() {
        let (mut sealer, mut opener) = armed_pair(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacMd5);
        let packet = Packet::with_block_size(vec![3; 12], 16).to_bytes();
        let _skipped = sealer.seal(&packet).unwrap();
        let second = sealer.seal(&packet).unwrap();

        // Opener expects sequence 0 but receives the packet sealed at 1
        opener.feed(&second);
        assert!(opener.next_packet().is_err());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut opener = PacketOpener::new(1024);
        let mut bytes = vec![0, 0, 0x10, 0];
        bytes.extend([0u8; 12]);
        opener.feed(&bytes);
        let err = opener.next_packet().unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_arming_mid_packet_rejected() {
        let mut opener = PacketOpener::new(1024);
        opener.feed(&Packet::new(vec![0; 40]).to_bytes()[..10]);
        assert!(opener.next_packet().unwrap().is_none());
        let k = keys(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha1);
        assert!(opener.arm(&k).is_err());
    }
}
