//! Error types for Sluice

use std::fmt;

/// Broad class of a failure, used by callers to react without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// The byte-stream transport failed (refused, reset, closed early).
    Transport,
    /// The peer sent something that could not be decoded or arrived out of order.
    Decode,
    /// Algorithm negotiation, host signature or packet integrity failed.
    Crypto,
    /// The server rejected every usable credential.
    Auth,
    /// A local condition: bad configuration or an already closed connection.
    Local,
}

/// Unified error type for all Sluice operations
#[derive(Debug)]
pub enum SluiceError {
    /// I/O error from the underlying transport
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed, unknown or out-of-order message)
    Protocol(String),

    /// No common algorithm for a proposal slot
    Negotiation {
        /// Proposal slot, e.g. "encryption client to server"
        slot: &'static str,
        /// Client preference list
        client: Vec<String>,
        /// Server offer list
        server: Vec<String>,
    },

    /// Host key signature did not verify, or the host key was rejected
    HostKey(String),

    /// Packet MAC mismatch
    Integrity(String),

    /// Other cryptographic failure (invalid DH value, key setup)
    Crypto(String),

    /// Authentication rejected
    Auth(String),

    /// Peer sent SSH_MSG_DISCONNECT
    Disconnected {
        /// Disconnect reason code
        code: u32,
        /// Human readable description from the peer
        description: String,
    },

    /// The connection is already closed
    Closed,
}

impl SluiceError {
    /// Returns the failure class of this error.
    ///
    /// # Example
    ///
    /// ```
    /// use sluice_platform::{FailureCategory, SluiceError};
    ///
    /// let err = SluiceError::Integrity("bad tag".to_string());
    /// assert_eq!(err.category(), FailureCategory::Crypto);
    /// ```
    pub fn category(&self) -> FailureCategory {
        match self {
            SluiceError::Io(_) | SluiceError::Disconnected { .. } => FailureCategory::Transport,
            SluiceError::Protocol(_) => FailureCategory::Decode,
            SluiceError::Negotiation { .. }
            | SluiceError::HostKey(_)
            | SluiceError::Integrity(_)
            | SluiceError::Crypto(_) => FailureCategory::Crypto,
            SluiceError::Auth(_) => FailureCategory::Auth,
            SluiceError::Config(_) | SluiceError::Closed => FailureCategory::Local,
        }
    }
}

impl fmt::Display for SluiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SluiceError::Io(e) => write!(f, "IO error: {}", e),
            SluiceError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SluiceError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SluiceError::Negotiation {
                slot,
                client,
                server,
            } => write!(
                f,
                "No common algorithm for {}: client={:?}, server={:?}",
                slot, client, server
            ),
            SluiceError::HostKey(msg) => write!(f, "Host key error: {}", msg),
            SluiceError::Integrity(msg) => write!(f, "Integrity error: {}", msg),
            SluiceError::Crypto(msg) => write!(f, "Crypto error: {}", msg),
            SluiceError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            SluiceError::Disconnected { code, description } => {
                write!(f, "Disconnected ({}): {}", code, description)
            }
            SluiceError::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for SluiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SluiceError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SluiceError {
    fn from(err: std::io::Error) -> Self {
        SluiceError::Io(err)
    }
}

/// Result type for Sluice operations
pub type SluiceResult<T> = Result<T, SluiceError>;
