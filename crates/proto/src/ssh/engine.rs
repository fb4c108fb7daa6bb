//! Sans-IO client engine.
//!
//! [`Engine`] glues the header reader, the inbound and outbound pipelines and
//! the [`Handshake`] together. Bytes from the transport go in through
//! [`Engine::receive`]; bytes for the transport come out of
//! [`Engine::take_outbound`]. The engine never blocks and owns no socket, so
//! a caller drives it from any event loop, one call at a time.
//!
//! # Example
//!
//! ```rust
//! use sluice_proto::ssh::auth::Credential;
//! use sluice_proto::ssh::config::ClientConfig;
//! use sluice_proto::ssh::engine::Engine;
//!
//! let mut engine = Engine::new(ClientConfig::new("alice", Credential::password("pw"))).unwrap();
//! engine.start();
//! assert!(engine.take_outbound().starts_with(b"SSH-2.0-sluice_"));
//!
//! let events = engine.receive(b"SSH-2.0-OpenSSH_9.6\r\n");
//! assert!(events.is_empty());
//! assert_eq!(engine.state_name(), "KexInit");
//! ```

use crate::ssh::channel::ChannelData;
use crate::ssh::config::ClientConfig;
use crate::ssh::connection::Disconnect;
use crate::ssh::handshake::{Action, Handshake, HandshakeState};
use crate::ssh::kex::Negotiated;
use crate::ssh::message::{DISCONNECT_MAC_ERROR, DISCONNECT_PROTOCOL_ERROR};
use crate::ssh::pipeline::{Inbound, Outbound};
use crate::ssh::version::{HeaderReader, Version};
use sluice_platform::{SluiceError, SluiceResult};
use tracing::{debug, info, trace, warn};

/// Something the caller must know about.
#[derive(Debug)]
pub enum Event {
    /// The session channel is usable
    Established,
    /// Data arrived on the session channel
    Data(ChannelData),
    /// The connection ended normally
    Closed,
    /// The connection failed; reported once, nothing follows
    Failed(SluiceError),
}

/// Client connection engine.
#[derive(Debug)]
pub struct Engine {
    handshake: Handshake,
    header: Option<HeaderReader>,
    outbound: Outbound,
    inbound: Inbound,
    pending: Vec<u8>,
    max_packet_length: usize,
    inflate_buffer_size: usize,
    started: bool,
    finished: bool,
}

impl Engine {
    /// Creates an engine for one connection attempt.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Config`] if the configuration is invalid.
    pub fn new(config: ClientConfig) -> SluiceResult<Self> {
        config.validate()?;
        let max_packet_length = config.max_packet_length;
        let inflate_buffer_size = config.inflate_buffer_size;
        Ok(Self {
            handshake: Handshake::new(config),
            header: Some(HeaderReader::new()),
            outbound: Outbound::new(),
            inbound: Inbound::new(max_packet_length, inflate_buffer_size),
            pending: Vec::new(),
            max_packet_length,
            inflate_buffer_size,
            started: false,
            finished: false,
        })
    }

    /// Queues our identification line. Calling it again has no effect.
    pub fn start(&mut self) {
        if self.started || self.finished {
            return;
        }
        self.started = true;
        let line = self.handshake.version_line();
        trace!(len = line.len(), "Queueing version line");
        self.pending.extend_from_slice(&line);
    }

    /// Feeds bytes received from the transport.
    ///
    /// Returns the events they produced, in order. After a
    /// [`Event::Failed`] or [`Event::Closed`] further input is ignored.
    pub fn receive(&mut self, data: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.start();

        if let Err(err) = self.process(data, &mut events) {
            self.fail(err, &mut events);
        }
        events
    }

    /// Reports that the transport is gone.
    ///
    /// Produces a [`Event::Failed`] unless the connection already ended.
    pub fn transport_closed(&mut self, cause: Option<std::io::Error>) -> Vec<Event> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        let cause = cause.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("Connection closed in state {}", self.handshake.state()),
            )
        });
        self.teardown();
        events.push(Event::Failed(SluiceError::Io(cause)));
        events
    }

    fn process(&mut self, data: &[u8], events: &mut Vec<Event>) -> SluiceResult<()> {
        if let Some(header) = self.header.as_mut() {
            let (version, rest): (Version, Vec<u8>) = match header.feed(data)? {
                Some(done) => done,
                None => return Ok(()),
            };
            self.header = None;
            let actions = self.handshake.on_version(version)?;
            self.apply(actions, events)?;
            self.inbound.feed(&rest);
        } else {
            self.inbound.feed(data);
        }

        while !self.finished {
            let sequence = self.inbound.sequence();
            let payload = match self.inbound.next_payload()? {
                Some(payload) => payload,
                None => break,
            };
            trace!(sequence, len = payload.len(), "Inbound payload");
            let actions = self.handshake.on_packet(&payload)?;
            self.apply(actions, events)?;
        }
        Ok(())
    }

    fn apply(&mut self, actions: Vec<Action>, events: &mut Vec<Event>) -> SluiceResult<()> {
        for action in actions {
            match action {
                Action::Send(payload) => self.send_payload(payload)?,
                Action::ArmOutbound(keys) => {
                    self.outbound.arm(&keys)?;
                    debug!(cipher = keys.cipher.name(), mac = keys.mac.name(), "Outbound keys armed");
                }
                Action::ArmInbound(keys) => {
                    self.inbound.arm(&keys)?;
                    debug!(cipher = keys.cipher.name(), mac = keys.mac.name(), "Inbound keys armed");
                }
                Action::ActivateCompression { outbound, inbound } => {
                    if outbound {
                        self.outbound.activate_compression();
                    }
                    if inbound {
                        self.inbound.activate_compression();
                    }
                    debug!(outbound, inbound, "Compression activated");
                }
                Action::Established => {
                    info!("Session established");
                    events.push(Event::Established);
                }
                Action::Deliver(data) => events.push(Event::Data(data)),
                Action::Closed => {
                    info!("Connection closed by server");
                    self.teardown();
                    events.push(Event::Closed);
                }
            }
        }
        Ok(())
    }

    fn send_payload(&mut self, payload: Vec<u8>) -> SluiceResult<()> {
        let sequence = self.outbound.sequence();
        let code = payload.first().copied().unwrap_or_default();
        let wire = self.outbound.send(payload)?;
        trace!(sequence, code, len = wire.len(), "Outbound packet");
        self.pending.extend_from_slice(&wire);
        Ok(())
    }

    fn fail(&mut self, err: SluiceError, events: &mut Vec<Event>) {
        warn!(
            state = %self.handshake.state(),
            category = ?err.category(),
            "Connection failed: {}",
            err
        );

        // Tell the peer why unless it hung up on us or never saw a packet
        let binary = self.header.is_none();
        let peer_gone = matches!(err, SluiceError::Disconnected { .. } | SluiceError::Io(_));
        if binary && !peer_gone {
            let reason_code = match err {
                SluiceError::Integrity(_) => DISCONNECT_MAC_ERROR,
                _ => DISCONNECT_PROTOCOL_ERROR,
            };
            let disconnect = Disconnect {
                reason_code,
                description: err.to_string(),
            };
            if self.send_payload(disconnect.to_bytes()).is_err() {
                debug!("Could not queue DISCONNECT");
            }
        }

        self.teardown();
        events.push(Event::Failed(err));
    }

    /// Drops handshake, key and compression state.
    fn teardown(&mut self) {
        self.handshake.abort();
        self.header = None;
        self.outbound = Outbound::new();
        self.inbound = Inbound::new(self.max_packet_length, self.inflate_buffer_size);
        self.finished = true;
    }

    /// Sends data on the session channel.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Closed`] once the connection ended and
    /// [`SluiceError::Protocol`] before it is established.
    pub fn write(&mut self, data: &[u8]) -> SluiceResult<()> {
        if self.finished {
            return Err(SluiceError::Closed);
        }
        for message in self.handshake.write(data)? {
            if let Err(err) = self.send_payload(message) {
                self.teardown();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Closes the session and queues CHANNEL_CLOSE and DISCONNECT.
    ///
    /// # Errors
    ///
    /// Returns [`SluiceError::Closed`] if the connection already ended.
    pub fn close(&mut self) -> SluiceResult<()> {
        if self.finished {
            return Err(SluiceError::Closed);
        }
        info!("Closing connection");
        let mut result = Ok(());
        for message in self.handshake.close() {
            if let Err(err) = self.send_payload(message) {
                result = Err(err);
                break;
            }
        }
        self.teardown();
        result
    }

    /// Takes the bytes waiting to be written to the transport.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Returns true if bytes are waiting for the transport.
    pub fn has_outbound(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Returns true once the session channel is usable.
    pub fn is_established(&self) -> bool {
        self.handshake.state() == HandshakeState::Established
    }

    /// Returns true once the connection ended, normally or not.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns the handshake state name.
    pub fn state_name(&self) -> &'static str {
        self.handshake.state().name()
    }

    /// Returns the negotiated algorithms.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.handshake.negotiated()
    }

    /// Returns the session id.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.handshake.session_id()
    }

    /// Returns the server's identification.
    pub fn server_version(&self) -> Option<&Version> {
        self.handshake.server_version()
    }

    /// Sequence numbers of the next outbound and inbound packets.
    pub fn sequence_numbers(&self) -> (u32, u32) {
        (self.outbound.sequence(), self.inbound.sequence())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::Credential;
    use crate::ssh::packet::Packet;

    fn engine() -> Engine {
        Engine::new(ClientConfig::new("alice", Credential::password("pw"))).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig::new("", Credential::password("pw"));
        assert!(matches!(Engine::new(config), Err(SluiceError::Config(_))));
    }

    #[test]
    fn test_start_is_idempotent() {
        let mut engine = engine();
        engine.start();
        engine.start();
        let out = engine.take_outbound();
        assert_eq!(out.iter().filter(|&&b| b == b'\n').count(), 1);
        assert!(!engine.has_outbound());
    }

    #[test]
    fn test_version_then_kexinit() {
        let mut engine = engine();
        engine.start();
        engine.take_outbound();

        // Split inside the line
        assert!(engine.receive(b"SSH-2.0-Op").is_empty());
        assert!(engine.receive(b"enSSH_9.6\r\n").is_empty());
        assert_eq!(engine.server_version().unwrap().software(), "OpenSSH_9.6");

        let out = engine.take_outbound();
        let packet = Packet::from_bytes(&out).unwrap();
        assert_eq!(packet.payload()[0], 20);
        assert_eq!(engine.sequence_numbers(), (1, 0));
    }

    #[test]
    fn test_bad_version_fails_once() {
        let mut engine = engine();
        let events = engine.receive(b"SSH-1.5-ancient\r\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Failed(SluiceError::Protocol(_))));
        assert!(engine.is_finished());
        assert!(engine.receive(b"more").is_empty());
        assert!(matches!(engine.write(b"x"), Err(SluiceError::Closed)));
        assert!(matches!(engine.close(), Err(SluiceError::Closed)));
    }

    #[test]
    fn test_malformed_packet_sends_disconnect() {
        let mut engine = engine();
        engine.receive(b"SSH-2.0-srv\r\n");
        engine.take_outbound();

        // A USERAUTH_SUCCESS during key exchange is out of order
        let bogus = Packet::new(vec![52]).to_bytes();
        let events = engine.receive(&bogus);
        assert!(matches!(events[0], Event::Failed(SluiceError::Protocol(_))));

        let out = engine.take_outbound();
        let packet = Packet::from_bytes(&out).unwrap();
        let disconnect = Disconnect::from_bytes(packet.payload()).unwrap();
        assert_eq!(disconnect.reason_code, DISCONNECT_PROTOCOL_ERROR);
    }

    #[test]
    fn test_transport_closed_reports_io() {
        let mut engine = engine();
        engine.receive(b"SSH-2.0-srv\r\n");
        let events = engine.transport_closed(None);
        assert!(matches!(events[0], Event::Failed(SluiceError::Io(_))));
        assert!(engine.transport_closed(None).is_empty());
    }

    #[test]
    fn test_close_before_binary_sends_nothing() {
        let mut engine = engine();
        engine.start();
        engine.take_outbound();
        engine.close().unwrap();
        assert!(!engine.has_outbound());
        assert!(engine.is_finished());
    }

    #[test]
    fn test_write_before_established() {
        let mut engine = engine();
        assert!(matches!(engine.write(b"ls\n"), Err(SluiceError::Protocol(_))));
    }
}
