//! Diffie-Hellman key exchange (RFC 4253 Section 8, RFC 4419).
//!
//! This module implements:
//! - diffie-hellman-group1-sha1 (Oakley group 2, 1024-bit)
//! - diffie-hellman-group14-sha1 (2048-bit MODP group)
//! - diffie-hellman-group-exchange-sha1 (server-chosen group)
//! - the exchange hash H and the key derivation built on it
//!
//! # Security
//!
//! - Peer public values are range checked (1 < f < p - 1)
//! - Server-chosen groups are checked against the requested size bounds
//! - Private exponents are zeroized on drop
//!
//! # Example
//!
//! ```rust
//! use sluice_proto::ssh::kex_dh::DhExchange;
//!
//! let client = DhExchange::group14();
//! let server = DhExchange::group14();
//! let k1 = client.compute_shared_secret(&server.public_key()).unwrap();
//! let k2 = server.compute_shared_secret(&client.public_key()).unwrap();
//! assert_eq!(k1, k2);
//! ```

use crate::ssh::wire::{encode_mpint, Writer};
use num_bigint::{BigUint, RandBigInt};
use sha1::Sha1;
use sha2::Digest;
use sluice_platform::{SluiceError, SluiceResult};
use zeroize::Zeroize;

/// Fixed MODP groups (RFC 2409 Section 6.2, RFC 3526 Section 3).
mod groups {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    fn parse(hex_digits: &str) -> BigUint {
        BigUint::from_bytes_be(
            &hex::decode(hex_digits.replace([' ', '\n'], "")).expect("Invalid hex"),
        )
    }

    /// Oakley group 2 prime (1024-bit)
    pub static GROUP1_P: Lazy<BigUint> = Lazy::new(|| {
        parse(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
             FFFFFFFFFFFFFFFF",
        )
    });

    /// RFC 3526 group 14 prime (2048-bit)
    pub static GROUP14_P: Lazy<BigUint> = Lazy::new(|| {
        parse(
            "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
             C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
             83655D23DCA3AD961C62F356208552BB9ED529077096966D\
             670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
             E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
             DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
             15728E5A8AACAA68FFFFFFFFFFFFFFFF",
        )
    });

    /// Generator shared by both fixed groups
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Key exchange method names in default preference order.
pub const SUPPORTED_KEX: &[&str] = &[
    "diffie-hellman-group-exchange-sha1",
    "diffie-hellman-group14-sha1",
    "diffie-hellman-group1-sha1",
];

/// Negotiated key exchange method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexMethod {
    /// diffie-hellman-group-exchange-sha1 (RFC 4419)
    GroupExchangeSha1,
    /// diffie-hellman-group14-sha1 (RFC 4253)
    Group14Sha1,
    /// diffie-hellman-group1-sha1 (RFC 4253)
    Group1Sha1,
}

impl KexMethod {
    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            KexMethod::GroupExchangeSha1 => "diffie-hellman-group-exchange-sha1",
            KexMethod::Group14Sha1 => "diffie-hellman-group14-sha1",
            KexMethod::Group1Sha1 => "diffie-hellman-group1-sha1",
        }
    }

    /// Parses a method name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "diffie-hellman-group-exchange-sha1" => Some(KexMethod::GroupExchangeSha1),
            "diffie-hellman-group14-sha1" => Some(KexMethod::Group14Sha1),
            "diffie-hellman-group1-sha1" => Some(KexMethod::Group1Sha1),
            _ => None,
        }
    }

    /// Returns true if the server chooses the group.
    pub fn is_group_exchange(&self) -> bool {
        matches!(self, KexMethod::GroupExchangeSha1)
    }

    /// Returns the DH state for a fixed-group method, `None` for group exchange.
    pub fn fixed_group(&self) -> Option<DhExchange> {
        match self {
            KexMethod::GroupExchangeSha1 => None,
            KexMethod::Group14Sha1 => Some(DhExchange::group14()),
            KexMethod::Group1Sha1 => Some(DhExchange::group1()),
        }
    }
}

/// Group size bounds sent in SSH_MSG_KEX_DH_GEX_REQUEST, in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupExchangeBounds {
    /// Smallest acceptable modulus
    pub min: u32,
    /// Preferred modulus
    pub preferred: u32,
    /// Largest acceptable modulus
    pub max: u32,
}

impl Default for GroupExchangeBounds {
    fn default() -> Self {
        Self {
            min: 1024,
            preferred: 2048,
            max: 8192,
        }
    }
}

/// Ephemeral Diffie-Hellman state over a MODP group.
pub struct DhExchange {
    p: BigUint,
    g: BigUint,
    /// Private exponent x, big-endian
    private_key: Vec<u8>,
    /// Public value e = g^x mod p
    public_key: BigUint,
}

impl std::fmt::Debug for DhExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhExchange")
            .field("bits", &self.p.bits())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl DhExchange {
    fn generate(p: BigUint, g: BigUint) -> Self {
        let mut rng = rand::thread_rng();

        // 1 < x < p - 1
        let p_minus_one = &p - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let public_key = g.modpow(&x, &p);

        Self {
            p,
            g,
            private_key: x.to_bytes_be(),
            public_key,
        }
    }

    /// Generates a key pair in the 1024-bit Oakley group 2.
    pub fn group1() -> Self {
        Self::generate(groups::GROUP1_P.clone(), groups::G.clone())
    }

    /// Generates a key pair in the 2048-bit group 14.
    pub fn group14() -> Self {
        Self::generate(groups::GROUP14_P.clone(), groups::G.clone())
    }

    /// Generates a key pair in a server-chosen group.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Crypto`] if the modulus is even, outside
    /// `bounds.min..=bounds.max` bits, or the generator is out of range.
    pub fn from_group(p: &[u8], g: &[u8], bounds: &GroupExchangeBounds) -> SluiceResult<Self> {
        let p = BigUint::from_bytes_be(p);
        let g = BigUint::from_bytes_be(g);

        let bits = p.bits();
        if bits < u64::from(bounds.min) || bits > u64::from(bounds.max) {
            return Err(SluiceError::Crypto(format!(
                "Group modulus of {} bits outside requested range {}..={}",
                bits, bounds.min, bounds.max
            )));
        }
        if !p.bit(0) {
            return Err(SluiceError::Crypto("Group modulus is even".to_string()));
        }
        let p_minus_one = &p - 1u32;
        if g <= BigUint::from(1u32) || g >= p_minus_one {
            return Err(SluiceError::Crypto(
                "Group generator out of range".to_string(),
            ));
        }

        Ok(Self::generate(p, g))
    }

    /// Returns the public value e as an unsigned big-endian magnitude.
    pub fn public_key(&self) -> Vec<u8> {
        self.public_key.to_bytes_be()
    }

    /// Returns the modulus p.
    pub fn prime(&self) -> Vec<u8> {
        self.p.to_bytes_be()
    }

    /// Returns the generator g.
    pub fn generator(&self) -> Vec<u8> {
        self.g.to_bytes_be()
    }

    /// Computes K = f^x mod p from the peer's public value.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Crypto`] unless 1 < f < p - 1.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> SluiceResult<Vec<u8>> {
        let f = BigUint::from_bytes_be(peer_public);
        let p_minus_one = &self.p - 1u32;
        if f <= BigUint::from(1u32) || f >= p_minus_one {
            return Err(SluiceError::Crypto(
                "Invalid peer public key: out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        Ok(f.modpow(&x, &self.p).to_bytes_be())
    }
}

impl Drop for DhExchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Group parameters that enter H when group exchange was used.
#[derive(Debug, Clone)]
pub struct GroupHashInput {
    /// Bounds sent in the request
    pub bounds: GroupExchangeBounds,
    /// Modulus p
    pub p: Vec<u8>,
    /// Generator g
    pub g: Vec<u8>,
}

/// Everything the exchange hash binds (RFC 4253 Section 8, RFC 4419 Section 3).
#[derive(Debug, Clone)]
pub struct ExchangeHashInput<'a> {
    /// V_C, without CR LF
    pub client_version: &'a str,
    /// V_S, without CR LF
    pub server_version: &'a str,
    /// I_C, the client's full KEXINIT payload
    pub client_kexinit: &'a [u8],
    /// I_S, the server's full KEXINIT payload
    pub server_kexinit: &'a [u8],
    /// K_S, the host key blob
    pub host_key: &'a [u8],
    /// Group exchange parameters, if negotiated
    pub group: Option<&'a GroupHashInput>,
    /// e
    pub client_public: &'a [u8],
    /// f
    pub server_public: &'a [u8],
    /// K
    pub shared_secret: &'a [u8],
}

impl ExchangeHashInput<'_> {
    /// Serializes the hash input in protocol order.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_string(self.client_version.as_bytes())
            .put_string(self.server_version.as_bytes())
            .put_string(self.client_kexinit)
            .put_string(self.server_kexinit)
            .put_string(self.host_key);
        if let Some(group) = self.group {
            w.put_u32(group.bounds.min)
                .put_u32(group.bounds.preferred)
                .put_u32(group.bounds.max)
                .put_mpint(&group.p)
                .put_mpint(&group.g);
        }
        w.put_mpint(self.client_public)
            .put_mpint(self.server_public)
            .put_mpint(self.shared_secret);
        w.finish()
    }

    /// Computes H with SHA-1, the hash of every supported method.
    pub fn compute(&self) -> Vec<u8> {
        Sha1::digest(self.encode()).to_vec()
    }
}

/// Derives key material (RFC 4253 Section 7.2).
///
/// ```text
/// K1 = HASH(K || H || key_type || session_id)
/// Kn = HASH(K || H || K1 || ... || Kn-1)
/// key = K1 || K2 || ...   truncated to key_length
/// ```
///
/// `shared_secret` is the unsigned magnitude of K; it is mpint-encoded here.
///
/// # Example
///
/// ```rust
/// use sha1::Sha1;
/// use sluice_proto::ssh::kex_dh::derive_key;
///
/// let key = derive_key::<Sha1>(&[0x42; 128], &[1; 20], &[2; 20], b'C', 24);
/// assert_eq!(key.len(), 24);
/// ```
pub fn derive_key<D: Digest>(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Vec<u8> {
    let k_mpint = encode_mpint(shared_secret);

    let mut hasher = D::new();
    hasher.update(&k_mpint);
    hasher.update(exchange_hash);
    hasher.update([key_type]);
    hasher.update(session_id);
    let mut key = hasher.finalize().to_vec();

    while key.len() < key_length {
        let mut hasher = D::new();
        hasher.update(&k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&key);
        let block = hasher.finalize();
        key.extend_from_slice(&block);
    }

    key.truncate(key_length);
    key
}
