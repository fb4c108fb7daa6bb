//! Client keys for public key authentication (RFC 4252 Section 7).
//!
//! Key material is supplied by the caller; loading keys from files or agents
//! happens outside this crate. A [`KeyProvider`] exposes the public key blob
//! and produces signature blobs over authentication data.
//!
//! # Supported Key Types
//!
//! - `ssh-rsa` - RSASSA-PKCS1-v1_5 with SHA-1, from raw components
//! - `ssh-ed25519` - Ed25519, from a 32-byte seed
//!
//! # Example
//!
//! ```rust
//! use sluice_proto::ssh::privatekey::{Ed25519KeyPair, KeyProvider};
//!
//! let key = Ed25519KeyPair::from_seed([7u8; 32]);
//! assert_eq!(key.algorithm(), "ssh-ed25519");
//! let signature = key.sign(b"data").unwrap();
//! assert_eq!(signature.len(), 4 + 11 + 4 + 64);
//! ```

use crate::ssh::wire::Writer;
use ed25519_dalek::{Signer, SigningKey};
use num_bigint::BigUint;
use sha1::{Digest, Sha1};
use sluice_platform::{SluiceError, SluiceResult};
use zeroize::Zeroizing;

/// DER `DigestInfo` prefix for SHA-1 (RFC 8017 Section 9.2).
const SHA1_DIGEST_INFO: &[u8] = &[
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x0e, 0x03, 0x02, 0x1a, 0x05, 0x00, 0x04, 0x14,
];

/// Source of a client identity for public key authentication.
pub trait KeyProvider: Send + Sync {
    /// Public key algorithm name, e.g. `ssh-rsa`.
    fn algorithm(&self) -> &str;

    /// Public key blob in SSH wire format.
    fn public_key_blob(&self) -> Vec<u8>;

    /// Signs `data` and returns the signature blob
    /// (`string algorithm, string signature`).
    fn sign(&self, data: &[u8]) -> SluiceResult<Vec<u8>>;
}

fn signature_blob(algorithm: &str, signature: &[u8]) -> Vec<u8> {
    let mut w = Writer::new();
    w.put_string(algorithm.as_bytes()).put_string(signature);
    w.finish()
}

/// RSA key pair built from its raw components.
///
/// Signing is a plain modular exponentiation without blinding.
pub struct RsaKeyPair {
    n: Vec<u8>,
    e: Vec<u8>,
    d: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("bits", &BigUint::from_bytes_be(&self.n).bits())
            .field("d", &"<redacted>")
            .finish()
    }
}

impl RsaKeyPair {
    /// Creates a key pair from modulus, public exponent and private exponent,
    /// all unsigned big-endian.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Config`] if the modulus is smaller than 1024 bits
    /// or an exponent is zero or not below the modulus.
    pub fn from_components(n: &[u8], e: &[u8], d: &[u8]) -> SluiceResult<Self> {
        let modulus = BigUint::from_bytes_be(n);
        if modulus.bits() < 1024 {
            return Err(SluiceError::Config(format!(
                "RSA modulus too small: {} bits",
                modulus.bits()
            )));
        }
        for (name, value) in [("public", e), ("private", d)] {
            let exponent = BigUint::from_bytes_be(value);
            if exponent == BigUint::from(0u32) || exponent >= modulus {
                return Err(SluiceError::Config(format!(
                    "RSA {} exponent out of range",
                    name
                )));
            }
        }

        Ok(Self {
            n: modulus.to_bytes_be(),
            e: BigUint::from_bytes_be(e).to_bytes_be(),
            d: Zeroizing::new(d.to_vec()),
        })
    }

    /// Modulus length in bytes.
    fn modulus_len(&self) -> usize {
        self.n.len()
    }

    /// Raw PKCS#1 v1.5 SHA-1 signature, as long as the modulus.
    pub fn sign_raw(&self, data: &[u8]) -> SluiceResult<Vec<u8>> {
        let k = self.modulus_len();
        let digest = Sha1::digest(data);
        let t_len = SHA1_DIGEST_INFO.len() + digest.len();
        if k < t_len + 11 {
            return Err(SluiceError::Crypto(
                "RSA modulus too short for SHA-1 signature".to_string(),
            ));
        }

        // EM = 0x00 || 0x01 || PS (0xff) || 0x00 || DigestInfo || H
        let mut em = Zeroizing::new(Vec::with_capacity(k));
        em.extend_from_slice(&[0x00, 0x01]);
        em.resize(k - t_len - 1, 0xff);
        em.push(0x00);
        em.extend_from_slice(SHA1_DIGEST_INFO);
        em.extend_from_slice(&digest);

        let n = BigUint::from_bytes_be(&self.n);
        let d = BigUint::from_bytes_be(&self.d);
        let s = BigUint::from_bytes_be(&em).modpow(&d, &n).to_bytes_be();

        let mut signature = vec![0u8; k - s.len()];
        signature.extend_from_slice(&s);
        Ok(signature)
    }
}

impl KeyProvider for RsaKeyPair {
    fn algorithm(&self) -> &str {
        "ssh-rsa"
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_string(b"ssh-rsa").put_mpint(&self.e).put_mpint(&self.n);
        w.finish()
    }

    fn sign(&self, data: &[u8]) -> SluiceResult<Vec<u8>> {
        Ok(signature_blob("ssh-rsa", &self.sign_raw(data)?))
    }
}

/// Ed25519 key pair.
pub struct Ed25519KeyPair {
    signing_key: SigningKey,
}

impl std::fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519KeyPair")
            .field("public_key", &hex::encode(self.signing_key.verifying_key().to_bytes()))
            .finish()
    }
}

impl Ed25519KeyPair {
    /// Creates a key pair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let seed = Zeroizing::new(seed);
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Returns the 32-byte public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }
}

impl KeyProvider for Ed25519KeyPair {
    fn algorithm(&self) -> &str {
        "ssh-ed25519"
    }

    fn public_key_blob(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_string(b"ssh-ed25519").put_string(&self.public_key());
        w.finish()
    }

    fn sign(&self, data: &[u8]) -> SluiceResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);
        Ok(signature_blob("ssh-ed25519", &signature.to_bytes()))
    }
}
