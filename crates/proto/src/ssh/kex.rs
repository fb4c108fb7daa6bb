//! Algorithm negotiation (RFC 4253 Section 7.1).
//!
//! This module implements:
//! - SSH_MSG_KEXINIT encoding and decoding
//! - SSH_MSG_NEWKEYS
//! - per-slot negotiation (first client preference the server also lists)
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Each of the name-list slots is negotiated
//! 3. Diffie-Hellman exchange ([`kex_dh`](crate::ssh::kex_dh))
//! 4. Both sides send SSH_MSG_NEWKEYS
//! 5. Both directions switch to the derived keys
//!
//! # Example
//!
//! ```rust
//! use sluice_proto::ssh::config::AlgorithmPreferences;
//! use sluice_proto::ssh::kex::{negotiate, KexInit};
//!
//! let client = KexInit::from_preferences(&AlgorithmPreferences::default());
//! let server = KexInit::from_preferences(&AlgorithmPreferences::default());
//! let negotiated = negotiate(&client, &server).unwrap();
//! assert_eq!(negotiated.kex.name(), "diffie-hellman-group-exchange-sha1");
//! ```

use crate::ssh::compression::CompressionAlgorithm;
use crate::ssh::config::AlgorithmPreferences;
use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::hostkey::HostKeyAlgorithm;
use crate::ssh::kex_dh::KexMethod;
use crate::ssh::message::MessageType;
use crate::ssh::wire::{Reader, Writer};
use rand::RngCore;
use sluice_platform::{SluiceError, SluiceResult};

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    pub cookie: [u8; 16],
    /// Key exchange algorithms
    pub kex_algorithms: Vec<String>,
    /// Server host key algorithms
    pub server_host_key_algorithms: Vec<String>,
    /// Encryption algorithms client to server
    pub encryption_client_to_server: Vec<String>,
    /// Encryption algorithms server to client
    pub encryption_server_to_client: Vec<String>,
    /// MAC algorithms client to server
    pub mac_client_to_server: Vec<String>,
    /// MAC algorithms server to client
    pub mac_server_to_client: Vec<String>,
    /// Compression algorithms client to server
    pub compression_client_to_server: Vec<String>,
    /// Compression algorithms server to client
    pub compression_server_to_client: Vec<String>,
    /// Languages client to server (usually empty)
    pub languages_client_to_server: Vec<String>,
    /// Languages server to client (usually empty)
    pub languages_server_to_client: Vec<String>,
    /// A guessed key exchange packet follows
    pub first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a proposal with a fresh random cookie.
    ///
    /// The same cipher, MAC and compression lists are offered for both
    /// directions; language lists are empty.
    pub fn from_preferences(prefs: &AlgorithmPreferences) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: prefs.kex.clone(),
            server_host_key_algorithms: prefs.host_key.clone(),
            encryption_client_to_server: prefs.ciphers.clone(),
            encryption_server_to_client: prefs.ciphers.clone(),
            mac_client_to_server: prefs.macs.clone(),
            mac_server_to_client: prefs.macs.clone(),
            compression_client_to_server: prefs.compression.clone(),
            compression_server_to_client: prefs.compression.clone(),
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// Serializes the message payload.
    ///
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie
    /// name-list    x 10
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::KexInit as u8);
        w.put_raw(&self.cookie)
            .put_name_list(&self.kex_algorithms)
            .put_name_list(&self.server_host_key_algorithms)
            .put_name_list(&self.encryption_client_to_server)
            .put_name_list(&self.encryption_server_to_client)
            .put_name_list(&self.mac_client_to_server)
            .put_name_list(&self.mac_server_to_client)
            .put_name_list(&self.compression_client_to_server)
            .put_name_list(&self.compression_server_to_client)
            .put_name_list(&self.languages_client_to_server)
            .put_name_list(&self.languages_server_to_client)
            .put_bool(self.first_kex_packet_follows)
            .put_u32(0);
        w.finish()
    }

    /// Parses a KEXINIT payload.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Protocol`] if the message code is wrong or any
    /// field is truncated.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(data);
        let code = r.read_u8()?;
        if code != MessageType::KexInit as u8 {
            return Err(SluiceError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                code
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(r.read_raw(16)?);

        let kex_algorithms = r.read_name_list()?;
        let server_host_key_algorithms = r.read_name_list()?;
        let encryption_client_to_server = r.read_name_list()?;
        let encryption_server_to_client = r.read_name_list()?;
        let mac_client_to_server = r.read_name_list()?;
        let mac_server_to_client = r.read_name_list()?;
        let compression_client_to_server = r.read_name_list()?;
        let compression_server_to_client = r.read_name_list()?;
        let languages_client_to_server = r.read_name_list()?;
        let languages_server_to_client = r.read_name_list()?;
        let first_kex_packet_follows = r.read_bool()?;
        let _reserved = r.read_u32()?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_client_to_server,
            encryption_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
            compression_client_to_server,
            compression_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// The packet sequence numbers are not reset when the new keys take effect.
///
/// ```rust
/// use sluice_proto::ssh::kex::NewKeys;
///
/// assert_eq!(NewKeys.to_bytes(), vec![21]);
/// assert!(NewKeys::from_bytes(&[21]).is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NewKeys;

impl NewKeys {
    /// Serializes the message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses a NEWKEYS payload.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        match data.first() {
            Some(&code) if code == MessageType::NewKeys as u8 => Ok(Self),
            Some(&code) => Err(SluiceError::Protocol(format!(
                "Invalid message type: expected 21 (SSH_MSG_NEWKEYS), got {}",
                code
            ))),
            None => Err(SluiceError::Protocol("NEWKEYS message is empty".to_string())),
        }
    }
}

/// Picks the first client preference that also appears in the server list.
///
/// # Errors
///
/// Returns [`SluiceError::Negotiation`] naming `slot` if the lists share no name.
///
/// # Example
///
/// ```rust
/// use sluice_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["x".to_string(), "y".to_string(), "z".to_string()];
/// let server = vec!["z".to_string(), "y".to_string()];
/// assert_eq!(negotiate_algorithm("cipher", &client, &server).unwrap(), "y");
/// ```
pub fn negotiate_algorithm(
    slot: &'static str,
    client_list: &[String],
    server_list: &[String],
) -> SluiceResult<String> {
    client_list
        .iter()
        .find(|name| server_list.contains(name))
        .cloned()
        .ok_or_else(|| SluiceError::Negotiation {
            slot,
            client: client_list.to_vec(),
            server: server_list.to_vec(),
        })
}

/// Language slots do not fail the handshake; no overlap means no language.
fn negotiate_language(client_list: &[String], server_list: &[String]) -> Option<String> {
    client_list
        .iter()
        .find(|name| server_list.contains(name))
        .cloned()
}

fn resolve<T>(
    slot: &'static str,
    name: String,
    parse: impl Fn(&str) -> Option<T>,
) -> SluiceResult<T> {
    parse(&name).ok_or_else(|| {
        SluiceError::Config(format!("Negotiated {} '{}' is not implemented", slot, name))
    })
}

/// Outcome of negotiating every KEXINIT slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Key exchange method
    pub kex: KexMethod,
    /// Host key algorithm
    pub host_key: HostKeyAlgorithm,
    /// Cipher client to server
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher server to client
    pub cipher_server_to_client: CipherAlgorithm,
    /// MAC client to server
    pub mac_client_to_server: MacAlgorithm,
    /// MAC server to client
    pub mac_server_to_client: MacAlgorithm,
    /// Compression client to server
    pub compression_client_to_server: CompressionAlgorithm,
    /// Compression server to client
    pub compression_server_to_client: CompressionAlgorithm,
    /// Language client to server
    pub language_client_to_server: Option<String>,
    /// Language server to client
    pub language_server_to_client: Option<String>,
    /// The server sent a guessed kex packet that does not match the outcome
    /// and must be discarded (RFC 4253 Section 7)
    pub discard_guessed_packet: bool,
}

/// Negotiates all slots between the client and server proposals.
pub fn negotiate(client: &KexInit, server: &KexInit) -> SluiceResult<Negotiated> {
    let kex_name = negotiate_algorithm("kex", &client.kex_algorithms, &server.kex_algorithms)?;
    let host_key_name = negotiate_algorithm(
        "host key",
        &client.server_host_key_algorithms,
        &server.server_host_key_algorithms,
    )?;

    let guess_correct = server.kex_algorithms.first() == Some(&kex_name)
        && server.server_host_key_algorithms.first() == Some(&host_key_name);

    let negotiated = Negotiated {
        kex: resolve("kex", kex_name, KexMethod::from_name)?,
        host_key: resolve("host key", host_key_name, HostKeyAlgorithm::from_name)?,
        cipher_client_to_server: resolve(
            "cipher",
            negotiate_algorithm(
                "cipher client to server",
                &client.encryption_client_to_server,
                &server.encryption_client_to_server,
            )?,
            CipherAlgorithm::from_name,
        )?,
        cipher_server_to_client: resolve(
            "cipher",
            negotiate_algorithm(
                "cipher server to client",
                &client.encryption_server_to_client,
                &server.encryption_server_to_client,
            )?,
            CipherAlgorithm::from_name,
        )?,
        mac_client_to_server: resolve(
            "mac",
            negotiate_algorithm(
                "mac client to server",
                &client.mac_client_to_server,
                &server.mac_client_to_server,
            )?,
            MacAlgorithm::from_name,
        )?,
        mac_server_to_client: resolve(
            "mac",
            negotiate_algorithm(
                "mac server to client",
                &client.mac_server_to_client,
                &server.mac_server_to_client,
            )?,
            MacAlgorithm::from_name,
        )?,
        compression_client_to_server: resolve(
            "compression",
            negotiate_algorithm(
                "compression client to server",
                &client.compression_client_to_server,
                &server.compression_client_to_server,
            )?,
            CompressionAlgorithm::from_name,
        )?,
        compression_server_to_client: resolve(
            "compression",
            negotiate_algorithm(
                "compression server to client",
                &client.compression_server_to_client,
                &server.compression_server_to_client,
            )?,
            CompressionAlgorithm::from_name,
        )?,
        language_client_to_server: negotiate_language(
            &client.languages_client_to_server,
            &server.languages_client_to_server,
        ),
        language_server_to_client: negotiate_language(
            &client.languages_server_to_client,
            &server.languages_server_to_client,
        ),
        discard_guessed_packet: server.first_kex_packet_follows && !guess_correct,
    };

    Ok(negotiated)
}
