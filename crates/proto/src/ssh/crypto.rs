//! SSH symmetric cryptography.
//!
//! This module implements the block ciphers and MAC algorithms negotiated in
//! KEXINIT:
//! - aes128-ctr, aes128-cbc
//! - 3des-ctr, 3des-cbc
//! - blowfish-cbc
//! - hmac-md5, hmac-sha1, hmac-sha2-256
//!
//! Cipher contexts keep their chaining state (CBC IV, CTR counter) between
//! packets, so one context is created per direction and lives as long as the keys.
//!
//! # Example
//!
//! ```rust
//! use sluice_proto::ssh::crypto::{CipherAlgorithm, CipherContext, MacAlgorithm, MacKey};
//!
//! let alg = CipherAlgorithm::Aes128Ctr;
//! let key = vec![7u8; alg.key_size()];
//! let iv = vec![9u8; alg.block_size()];
//!
//! let mut enc = CipherContext::encryptor(alg, &key, &iv).unwrap();
//! let mut dec = CipherContext::decryptor(alg, &key, &iv).unwrap();
//! let mut block = *b"sixteen byte msg";
//! enc.apply(&mut block).unwrap();
//! dec.apply(&mut block).unwrap();
//! assert_eq!(&block, b"sixteen byte msg");
//!
//! let mac = MacKey::new(MacAlgorithm::HmacSha1, &[1u8; 20]).unwrap();
//! let tag = mac.compute(0, b"packet");
//! assert!(mac.verify(0, b"packet", &tag).is_ok());
//! ```

use crate::ssh::kex_dh::derive_key;
use aes::Aes128;
use blowfish::Blowfish;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use des::TdesEde3;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::Sha256;
use sluice_platform::{SluiceError, SluiceResult};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type TdesCtr = ctr::Ctr64BE<TdesEde3>;

/// Cipher names in default preference order.
pub const SUPPORTED_CIPHERS: &[&str] = &[
    "aes128-ctr",
    "aes128-cbc",
    "3des-ctr",
    "3des-cbc",
    "blowfish-cbc",
];

/// MAC names in default preference order.
pub const SUPPORTED_MACS: &[&str] = &["hmac-md5", "hmac-sha1", "hmac-sha2-256"];

/// Cipher algorithm for SSH packet encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// AES-128 in counter mode
    Aes128Ctr,
    /// AES-128 in CBC mode
    Aes128Cbc,
    /// Triple DES (EDE, three keys) in counter mode
    TripleDesCtr,
    /// Triple DES (EDE, three keys) in CBC mode
    TripleDesCbc,
    /// Blowfish with a 128-bit key in CBC mode
    BlowfishCbc,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::TripleDesCtr => "3des-ctr",
            CipherAlgorithm::TripleDesCbc => "3des-cbc",
            CipherAlgorithm::BlowfishCbc => "blowfish-cbc",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::TripleDesCtr | CipherAlgorithm::TripleDesCbc => 24,
            CipherAlgorithm::BlowfishCbc => 16,
        }
    }

    /// Returns the block size in bytes, which is also the IV size.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::TripleDesCtr
            | CipherAlgorithm::TripleDesCbc
            | CipherAlgorithm::BlowfishCbc => 8,
        }
    }

    /// Parses cipher algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes128-cbc" => Some(CipherAlgorithm::Aes128Cbc),
            "3des-ctr" => Some(CipherAlgorithm::TripleDesCtr),
            "3des-cbc" => Some(CipherAlgorithm::TripleDesCbc),
            "blowfish-cbc" => Some(CipherAlgorithm::BlowfishCbc),
            _ => None,
        }
    }
}

enum CipherInner {
    Aes128Ctr(Aes128Ctr),
    Aes128CbcEnc(cbc::Encryptor<Aes128>),
    Aes128CbcDec(cbc::Decryptor<Aes128>),
    TdesCtr(TdesCtr),
    TdesCbcEnc(cbc::Encryptor<TdesEde3>),
    TdesCbcDec(cbc::Decryptor<TdesEde3>),
    BlowfishCbcEnc(cbc::Encryptor<Blowfish>),
    BlowfishCbcDec(cbc::Decryptor<Blowfish>),
}

/// Keyed cipher state for one direction.
pub struct CipherContext {
    algorithm: CipherAlgorithm,
    inner: CipherInner,
}

impl std::fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherContext")
            .field("algorithm", &self.algorithm.name())
            .field("state", &"<redacted>")
            .finish()
    }
}

fn key_error(alg: CipherAlgorithm) -> SluiceError {
    SluiceError::Crypto(format!("Invalid key or IV length for {}", alg.name()))
}

impl CipherContext {
    /// Creates an encrypting context.
    pub fn encryptor(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SluiceResult<Self> {
        let err = |_| key_error(algorithm);
        let inner = match algorithm {
            CipherAlgorithm::Aes128Ctr => {
                CipherInner::Aes128Ctr(Aes128Ctr::new_from_slices(key, iv).map_err(err)?)
            }
            CipherAlgorithm::Aes128Cbc => CipherInner::Aes128CbcEnc(
                cbc::Encryptor::<Aes128>::new_from_slices(key, iv).map_err(err)?,
            ),
            CipherAlgorithm::TripleDesCtr => {
                CipherInner::TdesCtr(TdesCtr::new_from_slices(key, iv).map_err(err)?)
            }
            CipherAlgorithm::TripleDesCbc => CipherInner::TdesCbcEnc(
                cbc::Encryptor::<TdesEde3>::new_from_slices(key, iv).map_err(err)?,
            ),
            CipherAlgorithm::BlowfishCbc => CipherInner::BlowfishCbcEnc(
                cbc::Encryptor::<Blowfish>::new_from_slices(key, iv).map_err(err)?,
            ),
        };
        Ok(Self { algorithm, inner })
    }

    /// Creates a decrypting context.
    pub fn decryptor(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> SluiceResult<Self> {
        let err = |_| key_error(algorithm);
        let inner = match algorithm {
            CipherAlgorithm::Aes128Ctr => {
                CipherInner::Aes128Ctr(Aes128Ctr::new_from_slices(key, iv).map_err(err)?)
            }
            CipherAlgorithm::Aes128Cbc => CipherInner::Aes128CbcDec(
                cbc::Decryptor::<Aes128>::new_from_slices(key, iv).map_err(err)?,
            ),
            CipherAlgorithm::TripleDesCtr => {
                CipherInner::TdesCtr(TdesCtr::new_from_slices(key, iv).map_err(err)?)
            }
            CipherAlgorithm::TripleDesCbc => CipherInner::TdesCbcDec(
                cbc::Decryptor::<TdesEde3>::new_from_slices(key, iv).map_err(err)?,
            ),
            CipherAlgorithm::BlowfishCbc => CipherInner::BlowfishCbcDec(
                cbc::Decryptor::<Blowfish>::new_from_slices(key, iv).map_err(err)?,
            ),
        };
        Ok(Self { algorithm, inner })
    }

    /// Returns the algorithm of this context.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Returns the block size in bytes.
    pub fn block_size(&self) -> usize {
        self.algorithm.block_size()
    }

    /// Encrypts or decrypts `data` in place.
    ///
    /// `data` must be a whole number of blocks.
    pub fn apply(&mut self, data: &mut [u8]) -> SluiceResult<()> {
        let block = self.block_size();
        if data.len() % block != 0 {
            return Err(SluiceError::Crypto(format!(
                "Data length {} is not a multiple of block size {}",
                data.len(),
                block
            )));
        }

        match &mut self.inner {
            CipherInner::Aes128Ctr(c) => c.apply_keystream(data),
            CipherInner::TdesCtr(c) => c.apply_keystream(data),
            CipherInner::Aes128CbcEnc(c) => cbc_encrypt(c, data, block),
            CipherInner::TdesCbcEnc(c) => cbc_encrypt(c, data, block),
            CipherInner::BlowfishCbcEnc(c) => cbc_encrypt(c, data, block),
            CipherInner::Aes128CbcDec(c) => cbc_decrypt(c, data, block),
            CipherInner::TdesCbcDec(c) => cbc_decrypt(c, data, block),
            CipherInner::BlowfishCbcDec(c) => cbc_decrypt(c, data, block),
        }
        Ok(())
    }
}

fn cbc_encrypt<C: BlockEncryptMut>(cipher: &mut C, data: &mut [u8], block: usize) {
    for chunk in data.chunks_exact_mut(block) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

fn cbc_decrypt<C: BlockDecryptMut>(cipher: &mut C, data: &mut [u8], block: usize) {
    for chunk in data.chunks_exact_mut(block) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }
}

/// MAC algorithm for SSH packet integrity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-MD5 (16-byte tag)
    HmacMd5,
    /// HMAC-SHA1 (20-byte tag)
    HmacSha1,
    /// HMAC-SHA2-256 (32-byte tag)
    HmacSha256,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacMd5 => "hmac-md5",
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
        }
    }

    /// Returns the key size in bytes, equal to the digest size.
    pub fn key_size(&self) -> usize {
        self.tag_size()
    }

    /// Returns the MAC output size in bytes.
    pub fn tag_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacMd5 => 16,
            MacAlgorithm::HmacSha1 => 20,
            MacAlgorithm::HmacSha256 => 32,
        }
    }

    /// Parses MAC algorithm from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-md5" => Some(MacAlgorithm::HmacMd5),
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            _ => None,
        }
    }
}

#[derive(Clone)]
enum MacInner {
    Md5(Hmac<Md5>),
    Sha1(Hmac<Sha1>),
    Sha256(Hmac<Sha256>),
}

/// MAC key for one direction.
///
/// The tag covers `uint32 sequence_number || unencrypted packet`.
pub struct MacKey {
    algorithm: MacAlgorithm,
    inner: MacInner,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm.name())
            .field("key", &"<redacted>")
            .finish()
    }
}

fn keyed_tag<M: Mac + Clone>(keyed: &M, sequence: u32, packet: &[u8]) -> Vec<u8> {
    let mut mac = keyed.clone();
    mac.update(&sequence.to_be_bytes());
    mac.update(packet);
    mac.finalize().into_bytes().to_vec()
}

impl MacKey {
    /// Creates a MAC key; the key must be exactly the algorithm's key size.
    pub fn new(algorithm: MacAlgorithm, key: &[u8]) -> SluiceResult<Self> {
        if key.len() != algorithm.key_size() {
            return Err(SluiceError::Crypto(format!(
                "Invalid {} key length: expected {}, got {}",
                algorithm.name(),
                algorithm.key_size(),
                key.len()
            )));
        }
        let err = |_| SluiceError::Crypto(format!("Invalid {} key", algorithm.name()));
        let inner = match algorithm {
            MacAlgorithm::HmacMd5 => {
                MacInner::Md5(<Hmac<Md5> as Mac>::new_from_slice(key).map_err(err)?)
            }
            MacAlgorithm::HmacSha1 => {
                MacInner::Sha1(<Hmac<Sha1> as Mac>::new_from_slice(key).map_err(err)?)
            }
            MacAlgorithm::HmacSha256 => {
                MacInner::Sha256(<Hmac<Sha256> as Mac>::new_from_slice(key).map_err(err)?)
            }
        };
        Ok(Self { algorithm, inner })
    }

    /// Returns the algorithm of this key.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// Returns the tag size in bytes.
    pub fn tag_size(&self) -> usize {
        self.algorithm.tag_size()
    }

    /// Computes the tag for a packet with the given sequence number.
    pub fn compute(&self, sequence: u32, packet: &[u8]) -> Vec<u8> {
        match &self.inner {
            MacInner::Md5(m) => keyed_tag(m, sequence, packet),
            MacInner::Sha1(m) => keyed_tag(m, sequence, packet),
            MacInner::Sha256(m) => keyed_tag(m, sequence, packet),
        }
    }

    /// Verifies a tag in constant time.
    pub fn verify(&self, sequence: u32, packet: &[u8], tag: &[u8]) -> SluiceResult<()> {
        let expected = self.compute(sequence, packet);
        if expected.len() == tag.len() && bool::from(expected.ct_eq(tag)) {
            Ok(())
        } else {
            Err(SluiceError::Integrity(format!(
                "MAC verification failed for packet {}",
                sequence
            )))
        }
    }
}

/// Direction of traffic, which selects the key derivation letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server: IV 'A', encryption 'C', integrity 'E'
    ClientToServer,
    /// Server to client: IV 'B', encryption 'D', integrity 'F'
    ServerToClient,
}

impl Direction {
    fn letters(&self) -> (u8, u8, u8) {
        match self {
            Direction::ClientToServer => (b'A', b'C', b'E'),
            Direction::ServerToClient => (b'B', b'D', b'F'),
        }
    }
}

/// Derived key material for one direction (RFC 4253 Section 7.2).
pub struct DirectionKeys {
    /// Negotiated cipher
    pub cipher: CipherAlgorithm,
    /// Negotiated MAC
    pub mac: MacAlgorithm,
    /// Initial IV
    pub iv: Vec<u8>,
    /// Encryption key
    pub encryption_key: Vec<u8>,
    /// Integrity key
    pub integrity_key: Vec<u8>,
}

impl DirectionKeys {
    /// Derives IV, encryption and integrity keys for `direction` using SHA-1.
    pub fn derive(
        shared_secret: &[u8],
        exchange_hash: &[u8],
        session_id: &[u8],
        direction: Direction,
        cipher: CipherAlgorithm,
        mac: MacAlgorithm,
    ) -> Self {
        let (iv_letter, key_letter, mac_letter) = direction.letters();
        let derive = |letter: u8, len: usize| {
            derive_key::<Sha1>(shared_secret, exchange_hash, session_id, letter, len)
        };
        Self {
            cipher,
            mac,
            iv: derive(iv_letter, cipher.block_size()),
            encryption_key: derive(key_letter, cipher.key_size()),
            integrity_key: derive(mac_letter, mac.key_size()),
        }
    }
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("cipher", &self.cipher.name())
            .field("mac", &self.mac.name())
            .finish_non_exhaustive()
    }
}

impl Drop for DirectionKeys {
    fn drop(&mut self) {
        self.iv.zeroize();
        self.encryption_key.zeroize();
        self.integrity_key.zeroize();
    }
}
