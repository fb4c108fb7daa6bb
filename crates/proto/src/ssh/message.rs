//! SSH message codes (RFC 4250 Section 4.1).
//!
//! # Message Ranges
//!
//! - **Transport generic** (1-19): disconnect, ignore, debug, service request
//! - **Algorithm negotiation** (20-29): KEXINIT, NEWKEYS
//! - **Key exchange method** (30-49): codes reused by each kex method
//! - **User authentication** (50-79)
//! - **Connection protocol** (80-127)
//!
//! Codes 30 and 31 are method specific: with fixed-group Diffie-Hellman they are
//! KEXDH_INIT and KEXDH_REPLY, with group exchange 31 carries the server's group.
//!
//! # Example
//!
//! ```rust
//! use sluice_proto::ssh::message::MessageType;
//!
//! assert_eq!(MessageType::KexInit as u8, 20);
//! assert_eq!(MessageType::from_u8(94), Some(MessageType::ChannelData));
//! ```

/// SSH message codes understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Connection termination.
    Disconnect = 1,
    /// Ignored data.
    Ignore = 2,
    /// Reply to an unsupported message.
    Unimplemented = 3,
    /// Debug text.
    Debug = 4,
    /// Service request ("ssh-userauth").
    ServiceRequest = 5,
    /// Service accepted.
    ServiceAccept = 6,

    /// Algorithm proposal.
    KexInit = 20,
    /// Switch to the freshly derived keys.
    NewKeys = 21,

    /// Fixed-group DH client public value.
    KexdhInit = 30,
    /// Fixed-group DH server reply, or the group exchange group message.
    KexdhReply = 31,
    /// Group exchange client public value.
    KexDhGexInit = 32,
    /// Group exchange server reply.
    KexDhGexReply = 33,
    /// Group exchange size request.
    KexDhGexRequest = 34,

    /// Authentication request.
    UserauthRequest = 50,
    /// Authentication failure with the methods that can continue.
    UserauthFailure = 51,
    /// Authentication success.
    UserauthSuccess = 52,
    /// Banner text shown before authentication.
    UserauthBanner = 53,
    /// Public key is acceptable for authentication.
    UserauthPkOk = 60,

    /// Connection level request.
    GlobalRequest = 80,
    /// Global request succeeded.
    RequestSuccess = 81,
    /// Global request failed.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmed.
    ChannelOpenConfirmation = 91,
    /// Channel open refused.
    ChannelOpenFailure = 92,
    /// Window space granted.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Typed channel data (stderr).
    ChannelExtendedData = 95,
    /// No more data in this direction.
    ChannelEof = 96,
    /// Channel closed.
    ChannelClose = 97,
    /// Channel specific request.
    ChannelRequest = 98,
    /// Channel request succeeded.
    ChannelSuccess = 99,
    /// Channel request failed.
    ChannelFailure = 100,
}

/// Group exchange group message `(p, g)`, shares code 31 with KEXDH_REPLY.
pub const KEX_DH_GEX_GROUP: u8 = 31;

/// Disconnect reason: by application (RFC 4250 Section 4.2.2).
pub const DISCONNECT_BY_APPLICATION: u32 = 11;

/// Disconnect reason: protocol error.
pub const DISCONNECT_PROTOCOL_ERROR: u32 = 2;

/// Disconnect reason: MAC error.
pub const DISCONNECT_MAC_ERROR: u32 = 5;

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sluice_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(34), Some(MessageType::KexDhGexRequest));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            32 => Some(MessageType::KexDhGexInit),
            33 => Some(MessageType::KexDhGexReply),
            34 => Some(MessageType::KexDhGexRequest),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthPkOk),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the RFC name of this message.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::KexDhGexInit => "SSH_MSG_KEX_DH_GEX_INIT",
            MessageType::KexDhGexReply => "SSH_MSG_KEX_DH_GEX_REPLY",
            MessageType::KexDhGexRequest => "SSH_MSG_KEX_DH_GEX_REQUEST",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthPkOk => "SSH_MSG_USERAUTH_PK_OK",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Describes a raw message code for log and error messages.
pub fn describe(code: u8) -> String {
    match MessageType::from_u8(code) {
        Some(t) => t.to_string(),
        None => format!("unknown({})", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(33), Some(MessageType::KexDhGexReply));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_group_exchange_codes() {
        assert_eq!(MessageType::KexDhGexInit as u8, 32);
        assert_eq!(MessageType::KexDhGexRequest as u8, 34);
        assert_eq!(KEX_DH_GEX_GROUP, MessageType::KexdhReply as u8);
    }

    #[test]
    fn test_every_code_round_trips() {
        for code in 0..=u8::MAX {
            if let Some(t) = MessageType::from_u8(code) {
                assert_eq!(t as u8, code);
            }
        }
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(94), "SSH_MSG_CHANNEL_DATA(94)");
        assert_eq!(describe(200), "unknown(200)");
    }
}
