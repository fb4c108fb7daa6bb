//! Client-side SSH-2 transport, authentication and session channel.
//!
//! This crate turns a raw byte stream into one encrypted, integrity-protected,
//! optionally compressed session channel:
//!
//! - **Transport** - version exchange, binary packet framing, Diffie-Hellman
//!   key exchange, host key verification and per-direction cipher/MAC state
//! - **Authentication** - password and public key authentication
//! - **Session** - a single `shell` or `exec` channel
//!
//! The core is sans-IO ([`ssh::engine::Engine`]); [`ssh::client`] drives it
//! over tokio.
//!
//! # Features
//!
//! - `ssh` (default) - SSH client support
//!
//! # Example
//!
//! ```rust
//! use sluice_proto::ssh::Packet;
//!
//! // Create and serialize an SSH packet
//! let packet = Packet::new(b"SSH message payload".to_vec());
//! let wire_format = packet.to_bytes();
//!
//! // Parse from wire format
//! let parsed = Packet::from_bytes(&wire_format).unwrap();
//! assert_eq!(parsed.payload(), b"SSH message payload");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 4419](https://datatracker.ietf.org/doc/html/rfc4419) - Diffie-Hellman Group Exchange

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
