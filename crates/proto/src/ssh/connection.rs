//! SSH connection protocol messages (RFC 4254) and transport-generic
//! messages carried alongside them (RFC 4253 Section 11).
//!
//! Only what a single session channel needs is modelled:
//! - channel open / confirmation / failure
//! - channel data and extended data
//! - channel requests: `pty-req`, `shell`, `exec`
//! - EOF, close, success/failure replies
//! - global requests (answered with failure)
//! - DISCONNECT, IGNORE, DEBUG
//!
//! # Example
//!
//! ```rust
//! use sluice_proto::ssh::connection::ChannelOpen;
//!
//! let open = ChannelOpen::session(0, u32::MAX - 1, 65536);
//! let bytes = open.to_bytes();
//! assert_eq!(bytes[0], 90);
//! assert_eq!(ChannelOpen::from_bytes(&bytes).unwrap(), open);
//! ```

use crate::ssh::message::{describe, MessageType};
use crate::ssh::wire::{Reader, Writer};
use sluice_platform::{SluiceError, SluiceResult};

/// Extended data type code for stderr (RFC 4254 Section 5.2).
pub const EXTENDED_DATA_STDERR: u32 = 1;

fn expect_code(r: &mut Reader<'_>, expected: MessageType) -> SluiceResult<()> {
    let code = r.read_u8()?;
    if code != expected as u8 {
        return Err(SluiceError::Protocol(format!(
            "Expected {}, got {}",
            expected,
            describe(code)
        )));
    }
    Ok(())
}

/// SSH_MSG_CHANNEL_OPEN for a "session" channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type name
    pub channel_type: String,
    /// Our channel number
    pub sender_channel: u32,
    /// Initial window we grant the peer
    pub initial_window_size: u32,
    /// Largest data packet we accept
    pub maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a session channel open request.
    pub fn session(sender_channel: u32, initial_window_size: u32, maximum_packet_size: u32) -> Self {
        Self {
            channel_type: "session".to_string(),
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::ChannelOpen as u8);
        w.put_string(self.channel_type.as_bytes())
            .put_u32(self.sender_channel)
            .put_u32(self.initial_window_size)
            .put_u32(self.maximum_packet_size);
        w.finish()
    }

    /// Parses the message; type specific trailing data is ignored.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(data);
        expect_code(&mut r, MessageType::ChannelOpen)?;
        Ok(Self {
            channel_type: r.read_utf8()?,
            sender_channel: r.read_u32()?,
            initial_window_size: r.read_u32()?,
            maximum_packet_size: r.read_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Our channel number
    pub recipient_channel: u32,
    /// Peer's channel number
    pub sender_channel: u32,
    /// Window the peer grants us
    pub initial_window_size: u32,
    /// Largest data packet the peer accepts
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::ChannelOpenConfirmation as u8);
        w.put_u32(self.recipient_channel)
            .put_u32(self.sender_channel)
            .put_u32(self.initial_window_size)
            .put_u32(self.maximum_packet_size);
        w.finish()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(data);
        expect_code(&mut r, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            sender_channel: r.read_u32()?,
            initial_window_size: r.read_u32()?,
            maximum_packet_size: r.read_u32()?,
        })
    }
}

/// Channel open failure reason (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited,
    /// SSH_OPEN_CONNECT_FAILED
    ConnectFailed,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE
    UnknownChannelType,
    /// SSH_OPEN_RESOURCE_SHORTAGE
    ResourceShortage,
    /// Any other code
    Other(u32),
}

impl ChannelOpenFailureReason {
    /// Maps a wire code.
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => ChannelOpenFailureReason::AdministrativelyProhibited,
            2 => ChannelOpenFailureReason::ConnectFailed,
            3 => ChannelOpenFailureReason::UnknownChannelType,
            4 => ChannelOpenFailureReason::ResourceShortage,
            other => ChannelOpenFailureReason::Other(other),
        }
    }

    /// Returns the wire code.
    pub fn code(&self) -> u32 {
        match self {
            ChannelOpenFailureReason::AdministrativelyProhibited => 1,
            ChannelOpenFailureReason::ConnectFailed => 2,
            ChannelOpenFailureReason::UnknownChannelType => 3,
            ChannelOpenFailureReason::ResourceShortage => 4,
            ChannelOpenFailureReason::Other(code) => *code,
        }
    }

    /// Returns a human readable description.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelOpenFailureReason::AdministrativelyProhibited => "administratively prohibited",
            ChannelOpenFailureReason::ConnectFailed => "connect failed",
            ChannelOpenFailureReason::UnknownChannelType => "unknown channel type",
            ChannelOpenFailureReason::ResourceShortage => "resource shortage",
            ChannelOpenFailureReason::Other(_) => "unknown reason",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Our channel number
    pub recipient_channel: u32,
    /// Reason code
    pub reason: ChannelOpenFailureReason,
    /// Description from the server
    pub description: String,
}

impl ChannelOpenFailure {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::ChannelOpenFailure as u8);
        w.put_u32(self.recipient_channel)
            .put_u32(self.reason.code())
            .put_string(self.description.as_bytes())
            .put_string(b"");
        w.finish()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(data);
        expect_code(&mut r, MessageType::ChannelOpenFailure)?;
        let recipient_channel = r.read_u32()?;
        let reason = ChannelOpenFailureReason::from_u32(r.read_u32()?);
        let description = r.read_utf8()?;
        Ok(Self {
            recipient_channel,
            reason,
            description,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Data
    pub data: Vec<u8>,
}

impl DataMessage {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_data(self.recipient_channel, &self.data)
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(data);
        expect_code(&mut r, MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data: r.read_string()?.to_vec(),
        })
    }
}

/// Encodes SSH_MSG_CHANNEL_DATA without an intermediate struct.
pub fn encode_data(recipient_channel: u32, data: &[u8]) -> Vec<u8> {
    let mut w = Writer::message(MessageType::ChannelData as u8);
    w.put_u32(recipient_channel).put_string(data);
    w.finish()
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedDataMessage {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Data type code (1 = stderr)
    pub data_type_code: u32,
    /// Data
    pub data: Vec<u8>,
}

impl ExtendedDataMessage {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::ChannelExtendedData as u8);
        w.put_u32(self.recipient_channel)
            .put_u32(self.data_type_code)
            .put_string(&self.data);
        w.finish()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(data);
        expect_code(&mut r, MessageType::ChannelExtendedData)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data_type_code: r.read_u32()?,
            data: r.read_string()?.to_vec(),
        })
    }
}

/// Messages that carry only a recipient channel: EOF, CLOSE, SUCCESS, FAILURE.
pub fn encode_channel_only(code: MessageType, recipient_channel: u32) -> Vec<u8> {
    let mut w = Writer::message(code as u8);
    w.put_u32(recipient_channel);
    w.finish()
}

/// Parses a recipient-only channel message of type `code`.
pub fn parse_channel_only(data: &[u8], code: MessageType) -> SluiceResult<u32> {
    let mut r = Reader::new(data);
    expect_code(&mut r, code)?;
    r.read_u32()
}

/// Pseudo-terminal parameters for `pty-req` (RFC 4254 Section 6.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// TERM environment value
    pub term: String,
    /// Width in characters
    pub columns: u32,
    /// Height in rows
    pub rows: u32,
    /// Width in pixels
    pub width_px: u32,
    /// Height in pixels
    pub height_px: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "vt100".to_string(),
            columns: 80,
            rows: 24,
            width_px: 0,
            height_px: 0,
        }
    }
}

/// Channel request kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// `pty-req`
    PtyReq(PtyRequest),
    /// `shell`
    Shell,
    /// `exec` with a command
    Exec(String),
    /// Any other request; its type specific data is kept unparsed
    Other {
        /// Request name
        name: String,
        /// Remaining bytes
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::PtyReq(_) => "pty-req",
            ChannelRequestType::Shell => "shell",
            ChannelRequestType::Exec(_) => "exec",
            ChannelRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Whether a reply is requested
    pub want_reply: bool,
    /// Request
    pub request: ChannelRequestType,
}

impl ChannelRequest {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::ChannelRequest as u8);
        w.put_u32(self.recipient_channel)
            .put_string(self.request.name().as_bytes())
            .put_bool(self.want_reply);

        match &self.request {
            ChannelRequestType::PtyReq(pty) => {
                w.put_string(pty.term.as_bytes())
                    .put_u32(pty.columns)
                    .put_u32(pty.rows)
                    .put_u32(pty.width_px)
                    .put_u32(pty.height_px)
                    // encoded terminal modes: TTY_OP_END only
                    .put_string(&[0]);
            }
            ChannelRequestType::Shell => {}
            ChannelRequestType::Exec(command) => {
                w.put_string(command.as_bytes());
            }
            ChannelRequestType::Other { data, .. } => {
                w.put_raw(data);
            }
        }

        w.finish()
    }

    /// Parses the message.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(data);
        expect_code(&mut r, MessageType::ChannelRequest)?;
        let recipient_channel = r.read_u32()?;
        let name = r.read_utf8()?;
        let want_reply = r.read_bool()?;

        let request = match name.as_str() {
            "pty-req" => {
                let pty = PtyRequest {
                    term: r.read_utf8()?,
                    columns: r.read_u32()?,
                    rows: r.read_u32()?,
                    width_px: r.read_u32()?,
                    height_px: r.read_u32()?,
                };
                let _modes = r.read_string()?;
                ChannelRequestType::PtyReq(pty)
            }
            "shell" => ChannelRequestType::Shell,
            "exec" => ChannelRequestType::Exec(r.read_utf8()?),
            _ => ChannelRequestType::Other {
                name,
                data: r.read_rest().to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            want_reply,
            request,
        })
    }
}

/// SSH_MSG_GLOBAL_REQUEST header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name
    pub name: String,
    /// Whether a reply is requested
    pub want_reply: bool,
}

impl GlobalRequest {
    /// Serializes the header (no request specific data).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::GlobalRequest as u8);
        w.put_string(self.name.as_bytes()).put_bool(self.want_reply);
        w.finish()
    }

    /// Parses the header; request specific data is ignored.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(data);
        expect_code(&mut r, MessageType::GlobalRequest)?;
        Ok(Self {
            name: r.read_utf8()?,
            want_reply: r.read_bool()?,
        })
    }
}

/// SSH_MSG_REQUEST_FAILURE.
pub fn request_failure() -> Vec<u8> {
    vec![MessageType::RequestFailure as u8]
}

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code
    pub reason_code: u32,
    /// Description
    pub description: String,
}

impl Disconnect {
    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::message(MessageType::Disconnect as u8);
        w.put_u32(self.reason_code)
            .put_string(self.description.as_bytes())
            .put_string(b"");
        w.finish()
    }

    /// Parses the message; the language tag is optional.
    pub fn from_bytes(data: &[u8]) -> SluiceResult<Self> {
        let mut r = Reader::new(data);
        expect_code(&mut r, MessageType::Disconnect)?;
        Ok(Self {
            reason_code: r.read_u32()?,
            description: r.read_utf8()?,
        })
    }
}

/// SSH_MSG_DEBUG message text, if well formed.
pub fn parse_debug(data: &[u8]) -> SluiceResult<String> {
    let mut r = Reader::new(data);
    expect_code(&mut r, MessageType::Debug)?;
    let _always_display = r.read_bool()?;
    r.read_utf8()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_layout() {
        let bytes = ChannelOpen::session(0, 0xffff_fffe, 65536).to_bytes();
        assert_eq!(
            bytes,
            [
                &[90, 0, 0, 0, 7][..],
                b"session",
                &[0, 0, 0, 0],
                &[0xff, 0xff, 0xff, 0xfe],
                &[0, 1, 0, 0],
            ]
            .concat()
        );
    }

    #[test]
    fn test_confirmation_round_trip() {
        let confirmation = ChannelOpenConfirmation {
            recipient_channel: 0,
            sender_channel: 42,
            initial_window_size: 2 * 1024 * 1024,
            maximum_packet_size: 32768,
        };
        assert_eq!(
            ChannelOpenConfirmation::from_bytes(&confirmation.to_bytes()).unwrap(),
            confirmation
        );
    }

    #[test]
    fn test_open_failure_parse() {
        let failure = ChannelOpenFailure {
            recipient_channel: 0,
            reason: ChannelOpenFailureReason::AdministrativelyProhibited,
            description: "no sessions".into(),
        };
        let parsed = ChannelOpenFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.reason.code(), 1);
        assert_eq!(parsed.description, "no sessions");
        assert_eq!(ChannelOpenFailureReason::from_u32(77).as_str(), "unknown reason");
    }

    #[test]
    fn test_data_encoding() {
        let bytes = encode_data(7, b"ls\n");
        assert_eq!(bytes, vec![94, 0, 0, 0, 7, 0, 0, 0, 3, b'l', b's', b'\n']);
        let parsed = DataMessage::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.data, b"ls\n");
    }

    #[test]
    fn test_extended_data_round_trip() {
        let ext = ExtendedDataMessage {
            recipient_channel: 0,
            data_type_code: EXTENDED_DATA_STDERR,
            data: b"error: nope".to_vec(),
        };
        assert_eq!(ExtendedDataMessage::from_bytes(&ext.to_bytes()).unwrap(), ext);
    }

    #[test]
    fn test_exec_request() {
        let request = ChannelRequest {
            recipient_channel: 3,
            want_reply: false,
            request: ChannelRequestType::Exec("uname -a".into()),
        };
        let bytes = request.to_bytes();
        assert_eq!(&bytes[5..13], &[0, 0, 0, 4, b'e', b'x', b'e', b'c']);
        assert_eq!(bytes[13], 0);
        assert_eq!(ChannelRequest::from_bytes(&bytes).unwrap(), request);
    }

    #[test]
    fn test_pty_request_round_trip() {
        let request = ChannelRequest {
            recipient_channel: 0,
            want_reply: false,
            request: ChannelRequestType::PtyReq(PtyRequest::default()),
        };
        assert_eq!(ChannelRequest::from_bytes(&request.to_bytes()).unwrap(), request);
    }

    #[test]
    fn test_unknown_channel_request_kept() {
        let mut w = Writer::message(98);
        w.put_u32(0)
            .put_string(b"exit-status")
            .put_bool(false)
            .put_u32(0);
        let parsed = ChannelRequest::from_bytes(&w.finish()).unwrap();
        assert_eq!(parsed.request.name(), "exit-status");
        assert!(!parsed.want_reply);
    }

    #[test]
    fn test_global_request_ignores_payload() {
        let mut w = Writer::message(80);
        w.put_string(b"keepalive@openssh.com")
            .put_bool(true)
            .put_u32(99);
        let parsed = GlobalRequest::from_bytes(&w.finish()).unwrap();
        assert_eq!(parsed.name, "keepalive@openssh.com");
        assert!(parsed.want_reply);
        assert_eq!(request_failure(), vec![82]);
    }

    #[test]
    fn test_disconnect_round_trip() {
        let d = Disconnect {
            reason_code: 11,
            description: "bye".into(),
        };
        assert_eq!(Disconnect::from_bytes(&d.to_bytes()).unwrap(), d);
    }

    #[test]
    fn test_channel_only_messages() {
        let close = encode_channel_only(MessageType::ChannelClose, 5);
        assert_eq!(close, vec![97, 0, 0, 0, 5]);
        assert_eq!(parse_channel_only(&close, MessageType::ChannelClose).unwrap(), 5);
        assert!(parse_channel_only(&close, MessageType::ChannelEof).is_err());
    }
}
