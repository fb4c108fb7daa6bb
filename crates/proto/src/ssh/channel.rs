//! The single session channel.
//!
//! [`SessionChannel`] tracks the state of channel 0 and produces the
//! connection protocol messages for it. It performs no I/O.

use crate::ssh::connection::{
    encode_channel_only, encode_data, ChannelOpen, ChannelOpenConfirmation, ChannelRequest,
    ChannelRequestType, PtyRequest,
};
use crate::ssh::message::MessageType;
use sluice_platform::{SluiceError, SluiceResult};
use tracing::warn;

/// Local channel number; only one channel is ever opened.
pub const SESSION_CHANNEL_ID: u32 = 0;

/// Per-message overhead of SSH_MSG_CHANNEL_DATA (code, channel, length).
const DATA_HEADER_LEN: u32 = 9;

/// SSH Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Open request sent, waiting for confirmation
    Opening,
    /// Channel is open and ready
    Open,
    /// Our close was sent
    Closing,
    /// Channel is closed
    Closed,
}

/// Data delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelData {
    /// Regular channel data
    Stdout(Vec<u8>),
    /// Extended data with its data type code (1 = stderr)
    Extended(u32, Vec<u8>),
}

impl ChannelData {
    /// Returns the data bytes.
    pub fn bytes(&self) -> &[u8] {
        match self {
            ChannelData::Stdout(data) | ChannelData::Extended(_, data) => data,
        }
    }
}

/// Client side of the session channel.
#[derive(Debug)]
pub struct SessionChannel {
    state: ChannelState,
    local_window: u32,
    local_max_packet: u32,
    remote_id: u32,
    remote_window: u32,
    remote_max_packet: u32,
    close_sent: bool,
}

impl SessionChannel {
    /// Creates a channel that will advertise `window_size` and `max_packet_size`.
    pub fn new(window_size: u32, max_packet_size: u32) -> Self {
        Self {
            state: ChannelState::Opening,
            local_window: window_size,
            local_max_packet: max_packet_size,
            remote_id: 0,
            remote_window: 0,
            remote_max_packet: 0,
            close_sent: false,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Returns the peer's channel number.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Returns the peer's maximum packet size.
    pub fn remote_max_packet(&self) -> u32 {
        self.remote_max_packet
    }

    /// Returns the window the peer granted us at open time.
    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    /// Returns the window we still grant the peer.
    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    /// SSH_MSG_CHANNEL_OPEN for this channel.
    pub fn open_message(&self) -> Vec<u8> {
        ChannelOpen::session(SESSION_CHANNEL_ID, self.local_window, self.local_max_packet)
            .to_bytes()
    }

    /// Applies the peer's open confirmation.
    pub fn on_confirmation(&mut self, confirmation: &ChannelOpenConfirmation) -> SluiceResult<()> {
        if self.state != ChannelState::Opening {
            return Err(SluiceError::Protocol(
                "Unexpected channel open confirmation".to_string(),
            ));
        }
        if confirmation.recipient_channel != SESSION_CHANNEL_ID {
            return Err(SluiceError::Protocol(format!(
                "Confirmation for unknown channel {}",
                confirmation.recipient_channel
            )));
        }
        if confirmation.maximum_packet_size == 0 {
            return Err(SluiceError::Protocol(
                "Peer advertised zero maximum packet size".to_string(),
            ));
        }

        self.remote_id = confirmation.sender_channel;
        self.remote_window = confirmation.initial_window_size;
        self.remote_max_packet = confirmation.maximum_packet_size;
        self.state = ChannelState::Open;
        Ok(())
    }

    /// Requests sent right after the channel opens: an optional `pty-req`,
    /// then `exec` when a command is given, else `shell`. No replies requested.
    pub fn start_requests(&self, pty: Option<&PtyRequest>, command: Option<&str>) -> Vec<Vec<u8>> {
        let mut requests = Vec::with_capacity(2);
        if let Some(pty) = pty {
            requests.push(self.request(ChannelRequestType::PtyReq(pty.clone())));
        }
        let start = match command {
            Some(command) => ChannelRequestType::Exec(command.to_string()),
            None => ChannelRequestType::Shell,
        };
        requests.push(self.request(start));
        requests
    }

    fn request(&self, request: ChannelRequestType) -> Vec<u8> {
        ChannelRequest {
            recipient_channel: self.remote_id,
            want_reply: false,
            request,
        }
        .to_bytes()
    }

    /// Wraps `data` into CHANNEL_DATA messages no larger than the peer's
    /// maximum packet size.
    pub fn data_messages(&self, data: &[u8]) -> SluiceResult<Vec<Vec<u8>>> {
        if self.state != ChannelState::Open {
            return Err(SluiceError::Closed);
        }
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let chunk = self
            .remote_max_packet
            .saturating_sub(DATA_HEADER_LEN)
            .max(1) as usize;
        Ok(data
            .chunks(chunk)
            .map(|part| encode_data(self.remote_id, part))
            .collect())
    }

    /// Accounts inbound data against the advertised window.
    ///
    /// The window is never replenished; data past it is still accepted.
    pub fn on_data(&mut self, len: usize) {
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        if len > self.local_window {
            warn!(
                "Peer exceeded channel window ({} > {})",
                len,
                self.local_window
            );
        }
        self.local_window = self.local_window.saturating_sub(len);
    }

    /// Checks that an inbound channel message targets this channel.
    pub fn check_recipient(&self, recipient: u32) -> SluiceResult<()> {
        if recipient != SESSION_CHANNEL_ID {
            return Err(SluiceError::Protocol(format!(
                "Message for unknown channel {}",
                recipient
            )));
        }
        Ok(())
    }

    /// SSH_MSG_CHANNEL_CLOSE, or `None` if our close was already sent.
    pub fn close_message(&mut self) -> Option<Vec<u8>> {
        if self.close_sent || self.state == ChannelState::Opening {
            return None;
        }
        self.close_sent = true;
        self.state = match self.state {
            ChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Closing,
        };
        Some(encode_channel_only(MessageType::ChannelClose, self.remote_id))
    }

    /// Applies the peer's close; returns our own close if still owed.
    pub fn on_close(&mut self) -> Option<Vec<u8>> {
        let reply = self.close_message();
        self.state = ChannelState::Closed;
        reply
    }
}
