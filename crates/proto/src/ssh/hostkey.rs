//! Server host keys (RFC 4253 Section 6.6).
//!
//! The server proves possession of its host key by signing the exchange hash.
//! This module parses the host key blob from KEXDH_REPLY, verifies that
//! signature, and hands the key to a [`HostKeyVerifier`] for the trust decision.
//!
//! # Supported Algorithms
//!
//! - `ssh-rsa` - RSASSA-PKCS1-v1_5 with SHA-1 (`ring`)
//! - `ssh-dss` - DSA with SHA-1 (`dsa`)
//!
//! # Blob Formats
//!
//! ```text
//! ssh-rsa:  string "ssh-rsa", mpint e, mpint n
//! ssh-dss:  string "ssh-dss", mpint p, mpint q, mpint g, mpint y
//! ```
//!
//! DSS signatures travel as 40 raw bytes `r || s` and are re-encoded as DER
//! `SEQUENCE { INTEGER r, INTEGER s }` before verification.

use crate::ssh::wire::Reader;
use base64::Engine;
use dsa::signature::hazmat::PrehashVerifier;
use ring::signature::{RsaPublicKeyComponents, RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sluice_platform::{SluiceError, SluiceResult};
use std::fmt;

/// Host key algorithm names in default preference order.
pub const SUPPORTED_HOST_KEYS: &[&str] = &["ssh-rsa", "ssh-dss"];

/// Length of a raw DSS signature (`r || s`, 20 bytes each).
pub const DSS_SIGNATURE_LEN: usize = 40;

/// Host key algorithm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-rsa
    SshRsa,
    /// ssh-dss
    SshDss,
}

impl HostKeyAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshRsa => "ssh-rsa",
            HostKeyAlgorithm::SshDss => "ssh-dss",
        }
    }

    /// Parses an algorithm name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-rsa" => Some(HostKeyAlgorithm::SshRsa),
            "ssh-dss" => Some(HostKeyAlgorithm::SshDss),
            _ => None,
        }
    }
}

impl fmt::Display for HostKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, PartialEq, Eq)]
enum PublicParams {
    Rsa { e: Vec<u8>, n: Vec<u8> },
    Dss { p: Vec<u8>, q: Vec<u8>, g: Vec<u8>, y: Vec<u8> },
}

/// A server host key parsed from its wire blob.
#[derive(Clone, PartialEq, Eq)]
pub struct HostKey {
    blob: Vec<u8>,
    params: PublicParams,
}

impl fmt::Debug for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKey")
            .field("algorithm", &self.algorithm().name())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl HostKey {
    /// Parses a host key blob.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::HostKey`] for unknown algorithms and
    /// [`SluiceError::Protocol`] for truncated blobs.
    pub fn parse(blob: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(blob);
        let name = r.read_utf8()?;
        let params = match HostKeyAlgorithm::from_name(&name) {
            Some(HostKeyAlgorithm::SshRsa) => {
                let e = r.read_mpint()?.to_vec();
                let n = r.read_mpint()?.to_vec();
                PublicParams::Rsa { e, n }
            }
            Some(HostKeyAlgorithm::SshDss) => {
                let p = r.read_mpint()?.to_vec();
                let q = r.read_mpint()?.to_vec();
                let g = r.read_mpint()?.to_vec();
                let y = r.read_mpint()?.to_vec();
                PublicParams::Dss { p, q, g, y }
            }
            None => {
                return Err(SluiceError::HostKey(format!(
                    "Unsupported host key algorithm: {}",
                    name
                )))
            }
        };

        Ok(Self {
            blob: blob.to_vec(),
            params,
        })
    }

    /// Returns the algorithm named in the blob.
    pub fn algorithm(&self) -> HostKeyAlgorithm {
        match self.params {
            PublicParams::Rsa { .. } => HostKeyAlgorithm::SshRsa,
            PublicParams::Dss { .. } => HostKeyAlgorithm::SshDss,
        }
    }

    /// Returns the blob as received.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// OpenSSH style fingerprint: `SHA256:` followed by unpadded base64.
    pub fn fingerprint(&self) -> String {
        fingerprint_sha256(&self.blob)
    }

    /// Verifies a signature field from KEXDH_REPLY over `data`.
    ///
    /// `signature` is normally `string algorithm, string signature`. A field
    /// whose first three bytes are not all zero cannot start with a length
    /// prefix and is taken as a bare signature.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::HostKey`] if the signature algorithm does not
    /// match the key or the signature does not verify.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> SluiceResult<()> {
        let raw = extract_signature(self.algorithm(), signature)?;
        let verified = match &self.params {
            PublicParams::Rsa { e, n } => verify_rsa(e, n, data, raw),
            PublicParams::Dss { p, q, g, y } => verify_dss(p, q, g, y, data, raw)?,
        };

        if verified {
            Ok(())
        } else {
            Err(SluiceError::HostKey(format!(
                "{} signature verification failed",
                self.algorithm()
            )))
        }
    }
}

fn extract_signature(algorithm: HostKeyAlgorithm, field: &[u8]) -> SluiceResult<&[u8]> {
    if field.len() >= 3 && field[..3] != [0, 0, 0] {
        return Ok(field);
    }

    let mut r = Reader::new(field);
    let name = r.read_utf8()?;
    if name != algorithm.name() {
        return Err(SluiceError::HostKey(format!(
            "Signature algorithm '{}' does not match host key '{}'",
            name, algorithm
        )));
    }
    r.read_string()
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn verify_rsa(e: &[u8], n: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let n = strip_leading_zeros(n);
    let signature = strip_leading_zeros(signature);
    if signature.len() > n.len() {
        return false;
    }

    // ring expects the signature to be exactly as long as the modulus
    let mut padded = vec![0u8; n.len() - signature.len()];
    padded.extend_from_slice(signature);

    let key = RsaPublicKeyComponents { n, e };
    key.verify(&RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY, data, &padded)
        .is_ok()
}

fn verify_dss(
    p: &[u8],
    q: &[u8],
    g: &[u8],
    y: &[u8],
    data: &[u8],
    signature: &[u8],
) -> SluiceResult<bool> {
    let components = dsa::Components::from_components(
        dsa::BigUint::from_bytes_be(p),
        dsa::BigUint::from_bytes_be(q),
        dsa::BigUint::from_bytes_be(g),
    )
    .map_err(|_| SluiceError::HostKey("Invalid DSA domain parameters".to_string()))?;
    let key = dsa::VerifyingKey::from_components(components, dsa::BigUint::from_bytes_be(y))
        .map_err(|_| SluiceError::HostKey("Invalid DSA public key".to_string()))?;

    let der = dss_signature_to_der(signature)?;
    let signature = match dsa::Signature::try_from(der.as_slice()) {
        Ok(signature) => signature,
        Err(_) => return Ok(false),
    };

    let digest = Sha1::digest(data);
    Ok(key.verify_prehash(&digest, &signature).is_ok())
}

/// Re-encodes a raw 40-byte DSS signature as DER `SEQUENCE { INTEGER r, INTEGER s }`.
///
/// # Errors
///
/// Returns [`SluiceError::HostKey`] if the input is not 40 bytes long.
///
/// # Example
///
/// ```rust
/// use sluice_proto::ssh::hostkey::dss_signature_to_der;
///
/// let mut raw = [0u8; 40];
/// raw[19] = 1;
/// raw[20] = 0x80;
/// let der = dss_signature_to_der(&raw).unwrap();
/// assert_eq!(der[..5], [0x30, 0x1a, 0x02, 0x01, 0x01]);
/// assert_eq!(der[5..8], [0x02, 0x15, 0x00]);
/// ```
pub fn dss_signature_to_der(raw: &[u8]) -> SluiceResult<Vec<u8>> {
    if raw.len() != DSS_SIGNATURE_LEN {
        return Err(SluiceError::HostKey(format!(
            "DSS signature must be {} bytes, got {}",
            DSS_SIGNATURE_LEN,
            raw.len()
        )));
    }

    let (r, s) = raw.split_at(DSS_SIGNATURE_LEN / 2);
    let mut body = der_integer(r);
    body.extend(der_integer(s));

    let mut der = vec![0x30, body.len() as u8];
    der.extend(body);
    Ok(der)
}

fn der_integer(magnitude: &[u8]) -> Vec<u8> {
    let mut value = strip_leading_zeros(magnitude).to_vec();
    if value.is_empty() || value[0] & 0x80 != 0 {
        value.insert(0, 0);
    }
    let mut out = vec![0x02, value.len() as u8];
    out.extend(value);
    out
}

/// SHA-256 fingerprint of a key blob in OpenSSH notation.
pub fn fingerprint_sha256(blob: &[u8]) -> String {
    let digest = Sha256::digest(blob);
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    )
}

/// Trust decision for a host key whose signature already verified.
pub trait HostKeyVerifier: Send + Sync {
    /// Returns `Ok(())` to accept the key.
    fn verify(&self, host_key: &HostKey) -> SluiceResult<()>;
}

/// Accepts every host key. Suitable only where the network path is trusted.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAnyHostKey;

impl HostKeyVerifier for AcceptAnyHostKey {
    fn verify(&self, host_key: &HostKey) -> SluiceResult<()> {
        tracing::debug!(fingerprint = %host_key.fingerprint(), "Accepting host key without pinning");
        Ok(())
    }
}

/// Accepts only keys whose `SHA256:` fingerprint is in a fixed set.
#[derive(Debug, Clone, Default)]
pub struct FingerprintVerifier {
    fingerprints: Vec<String>,
}

impl FingerprintVerifier {
    /// Creates a verifier pinned to the given fingerprints.
    pub fn new<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fingerprints: fingerprints.into_iter().map(Into::into).collect(),
        }
    }
}

impl HostKeyVerifier for FingerprintVerifier {
    fn verify(&self, host_key: &HostKey) -> SluiceResult<()> {
        let fingerprint = host_key.fingerprint();
        if self.fingerprints.iter().any(|f| *f == fingerprint) {
            Ok(())
        } else {
            Err(SluiceError::HostKey(format!(
                "Host key {} {} is not trusted",
                host_key.algorithm(),
                fingerprint
            )))
        }
    }
}
