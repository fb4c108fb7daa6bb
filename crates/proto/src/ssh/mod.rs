//! SSH-2 client implementation.
//!
//! # Architecture
//!
//! The client is layered, leaves first:
//!
//! 1. **Wire encoding** ([`wire`], [`message`]) - RFC 4251 Section 5 data types
//! 2. **Header exchange** ([`version`]) - identification lines
//! 3. **Packet framing** ([`packet`]) - RFC 4253 Section 6
//! 4. **Cipher/MAC** ([`crypto`], [`transport`]) - per-direction sealing and opening
//! 5. **Compression** ([`compression`]) - `zlib@openssh.com`
//! 6. **Pipeline** ([`pipeline`]) - the stages above composed per direction
//! 7. **Key exchange** ([`kex`], [`kex_dh`], [`hostkey`]) - RFC 4253 Section 7-8, RFC 4419
//! 8. **Authentication** ([`auth`], [`privatekey`]) - RFC 4252
//! 9. **Connection** ([`connection`], [`channel`]) - RFC 4254, one session channel
//! 10. **State machine** ([`handshake`], [`engine`]) - sans-IO orchestration
//! 11. **Adapter** ([`client`], [`config`]) - tokio driver and caller-facing handle
//!
//! # Security Considerations
//!
//! - **Input Validation**: packet lengths are bounded and every field is length checked
//! - **Fail Closed**: MAC mismatches and decode errors always tear the connection down
//! - **Memory Safety**: secrets are zeroized on drop using [`zeroize`]
//! - **No Unsafe Code**: pure Rust implementation without `unsafe`
//!
//! # Example
//!
//! ```rust
//! use sluice_proto::ssh::Packet;
//!
//! // Create a packet
//! let packet = Packet::new(b"SSH-MSG-KEXINIT payload".to_vec());
//!
//! // Serialize to wire format
//! let bytes = packet.to_bytes();
//!
//! // Parse from wire format
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"SSH-MSG-KEXINIT payload");
//! ```

pub mod auth;
pub mod channel;
pub mod client;
pub mod compression;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod engine;
pub mod handshake;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod packet;
pub mod pipeline;
pub mod privatekey;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use auth::{AuthMethod, AuthRequest, Credential};
pub use channel::{ChannelData, ChannelState, SessionChannel};
pub use client::{event_channel, EventForwarder, SessionHandle, SessionHandler, SshClient};
pub use config::{AlgorithmPreferences, ClientConfig, ConnectOptions, GroupExchangeBounds};
pub use connection::PtyRequest;
pub use crypto::{CipherAlgorithm, DirectionKeys, MacAlgorithm, MacKey};
pub use engine::{Engine, Event};
pub use handshake::{Action, AuthStage, Handshake, HandshakeState};
pub use hostkey::{AcceptAnyHostKey, FingerprintVerifier, HostKey, HostKeyAlgorithm, HostKeyVerifier};
pub use kex::{negotiate_algorithm, KexInit, Negotiated, NewKeys};
pub use kex_dh::{derive_key, DhExchange, KexMethod};
pub use message::MessageType;
pub use packet::Packet;
pub use pipeline::{Inbound, Outbound};
pub use privatekey::{Ed25519KeyPair, KeyProvider, RsaKeyPair};
pub use transport::{PacketOpener, PacketSealer};
pub use version::Version;
