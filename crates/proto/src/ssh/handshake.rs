//! Client handshake state machine.
//!
//! [`Handshake`] is an explicit enumerated state plus a transition function:
//! every inbound payload goes through [`Handshake::on_packet`], which returns
//! the [`Action`]s the caller must carry out in order. It performs no I/O and
//! owns no cipher state, so every transition can be tested without a network.
//!
//! ```text
//! HeaderExchange -> KexInit -> [GroupNegotiation] -> KexReply -> NewKeys
//!     -> ServiceAccept -> Auth -> ChannelOpen -> Established -> Closed
//! ```

use crate::ssh::auth::{
    parse_service, service_request, signature_data, AuthBanner, AuthFailure, AuthMethod,
    AuthPkOk, AuthRequest, Credential, USERAUTH_SERVICE,
};
use crate::ssh::channel::{ChannelData, SessionChannel};
use crate::ssh::compression::CompressionAlgorithm;
use crate::ssh::config::ClientConfig;
use crate::ssh::connection::{
    encode_channel_only, parse_channel_only, parse_debug, request_failure, ChannelOpenConfirmation,
    ChannelOpenFailure, ChannelRequest, DataMessage, Disconnect, ExtendedDataMessage,
    GlobalRequest,
};
use crate::ssh::crypto::{Direction, DirectionKeys};
use crate::ssh::hostkey::HostKey;
use crate::ssh::kex::{negotiate, KexInit, Negotiated, NewKeys};
use crate::ssh::kex_dh::{DhExchange, ExchangeHashInput, GroupHashInput};
use crate::ssh::message::{
    describe, MessageType, DISCONNECT_BY_APPLICATION, KEX_DH_GEX_GROUP,
};
use crate::ssh::version::Version;
use crate::ssh::wire::{Reader, Writer};
use sluice_platform::{SluiceError, SluiceResult};
use tracing::{debug, info, trace, warn};
use zeroize::Zeroizing;

/// Progress through user authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStage {
    /// "none" request sent to learn the accepted methods
    MethodsQuery,
    /// Password request sent
    Password,
    /// Public key query sent, waiting for PK_OK
    PublicKeyQuery,
    /// Signed public key request sent
    PublicKeySigned,
}

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the server's identification line
    HeaderExchange,
    /// KEXINIT sent, waiting for the server's
    KexInit,
    /// Group exchange request sent, waiting for (p, g)
    GroupNegotiation,
    /// DH public value sent, waiting for the server's reply
    KexReply,
    /// NEWKEYS sent, waiting for the server's
    NewKeys,
    /// Service request sent
    ServiceAccept,
    /// Authenticating
    Auth(AuthStage),
    /// Channel open sent
    ChannelOpen,
    /// Session channel usable
    Established,
    /// Torn down
    Closed,
}

impl HandshakeState {
    /// Returns a short name for logs and introspection.
    pub fn name(&self) -> &'static str {
        match self {
            HandshakeState::HeaderExchange => "HeaderExchange",
            HandshakeState::KexInit => "KexInit",
            HandshakeState::GroupNegotiation => "GroupNegotiation",
            HandshakeState::KexReply => "KexReply",
            HandshakeState::NewKeys => "NewKeys",
            HandshakeState::ServiceAccept => "ServiceAccept",
            HandshakeState::Auth(_) => "Auth",
            HandshakeState::ChannelOpen => "ChannelOpen",
            HandshakeState::Established => "Established",
            HandshakeState::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Side effect requested by a transition; carry out in order.
#[derive(Debug)]
pub enum Action {
    /// Send a payload through the outbound pipeline
    Send(Vec<u8>),
    /// Arm the outbound cipher/MAC context
    ArmOutbound(DirectionKeys),
    /// Arm the inbound cipher/MAC context before the next packet is read
    ArmInbound(DirectionKeys),
    /// Start compressing the flagged directions
    ActivateCompression {
        /// Client to server
        outbound: bool,
        /// Server to client
        inbound: bool,
    },
    /// The session channel is usable
    Established,
    /// Data for the caller
    Deliver(ChannelData),
    /// The connection ended normally
    Closed,
}

/// Key exchange output kept between the server's reply and its NEWKEYS.
struct PendingKeys {
    shared_secret: Zeroizing<Vec<u8>>,
    exchange_hash: Vec<u8>,
}

/// Client handshake and session state.
pub struct Handshake {
    config: ClientConfig,
    state: HandshakeState,
    client_version: Version,
    server_version: Option<Version>,
    client_kexinit: Vec<u8>,
    server_kexinit: Vec<u8>,
    negotiated: Option<Negotiated>,
    dh: Option<DhExchange>,
    group: Option<GroupHashInput>,
    pending: Option<PendingKeys>,
    session_id: Option<Vec<u8>>,
    discard_guess: bool,
    channel: SessionChannel,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .field("server_version", &self.server_version)
            .field("negotiated", &self.negotiated)
            .field("session_id", &self.session_id.as_ref().map(hex::encode))
            .finish()
    }
}

impl Handshake {
    /// Creates the state machine; the configuration is not validated here.
    pub fn new(config: ClientConfig) -> Self {
        let client_version = Version::new(&config.client_software, None);
        let client_kexinit = KexInit::from_preferences(&config.algorithms).to_bytes();
        let channel = SessionChannel::new(config.window_size, config.max_packet_size);
        Self {
            config,
            state: HandshakeState::HeaderExchange,
            client_version,
            server_version: None,
            client_kexinit,
            server_kexinit: Vec::new(),
            negotiated: None,
            dh: None,
            group: None,
            pending: None,
            session_id: None,
            discard_guess: false,
            channel,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Returns the negotiated algorithms once KEXINIT was exchanged.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Returns the session id once the first key exchange finished.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Returns the server's identification.
    pub fn server_version(&self) -> Option<&Version> {
        self.server_version.as_ref()
    }

    /// Returns our identification.
    pub fn client_version(&self) -> &Version {
        &self.client_version
    }

    /// Returns the session channel.
    pub fn channel(&self) -> &SessionChannel {
        &self.channel
    }

    /// Our identification line, CR LF terminated.
    pub fn version_line(&self) -> Vec<u8> {
        self.client_version.to_wire_format()
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!("Handshake {} -> {}", self.state, next);
        self.state = next;
    }

    /// Handles the server's identification line. Sends our KEXINIT.
    pub fn on_version(&mut self, version: Version) -> SluiceResult<Vec<Action>> {
        if self.state != HandshakeState::HeaderExchange {
            return Err(SluiceError::Protocol(
                "Unexpected identification line".to_string(),
            ));
        }
        debug!("Server version: {}", version);
        self.server_version = Some(version);
        self.transition(HandshakeState::KexInit);
        Ok(vec![Action::Send(self.client_kexinit.clone())])
    }

    /// Handles one decoded inbound payload.
    pub fn on_packet(&mut self, payload: &[u8]) -> SluiceResult<Vec<Action>> {
        let code = *payload
            .first()
            .ok_or_else(|| SluiceError::Protocol("Empty packet payload".to_string()))?;
        trace!(state = %self.state, code = %describe(code), len = payload.len(), "Inbound message");

        match MessageType::from_u8(code) {
            Some(MessageType::Ignore) => return Ok(Vec::new()),
            Some(MessageType::Debug) => {
                if let Ok(message) = parse_debug(payload) {
                    debug!("Peer debug message: {}", message);
                }
                return Ok(Vec::new());
            }
            Some(MessageType::Disconnect) => {
                let disconnect = Disconnect::from_bytes(payload)?;
                self.state = HandshakeState::Closed;
                return Err(SluiceError::Disconnected {
                    code: disconnect.reason_code,
                    description: disconnect.description,
                });
            }
            Some(MessageType::Unimplemented) => {
                let mut r = Reader::new(&payload[1..]);
                let sequence = r.read_u32()?;
                return Err(SluiceError::Protocol(format!(
                    "Peer could not handle packet {}",
                    sequence
                )));
            }
            _ => {}
        }

        match self.state {
            HandshakeState::HeaderExchange => Err(self.unexpected(code)),
            HandshakeState::KexInit => self.on_kexinit(payload),
            HandshakeState::GroupNegotiation => {
                if self.take_guess() {
                    return Ok(Vec::new());
                }
                self.on_group(payload)
            }
            HandshakeState::KexReply => {
                if self.take_guess() {
                    return Ok(Vec::new());
                }
                self.on_kex_reply(payload)
            }
            HandshakeState::NewKeys => self.on_newkeys(payload),
            HandshakeState::ServiceAccept => self.on_service_accept(payload),
            HandshakeState::Auth(stage) => self.on_auth(stage, payload),
            HandshakeState::ChannelOpen => self.on_channel_open(payload),
            HandshakeState::Established => self.on_established(payload),
            HandshakeState::Closed => Err(SluiceError::Closed),
        }
    }

    fn unexpected(&self, code: u8) -> SluiceError {
        SluiceError::Protocol(format!(
            "Unexpected {} in state {}",
            describe(code),
            self.state
        ))
    }

    fn take_guess(&mut self) -> bool {
        if self.discard_guess {
            debug!("Discarding wrongly guessed key exchange packet");
            self.discard_guess = false;
            return true;
        }
        false
    }

    fn negotiated_ref(&self) -> SluiceResult<&Negotiated> {
        self.negotiated
            .as_ref()
            .ok_or_else(|| SluiceError::Protocol("Algorithms not negotiated".to_string()))
    }

    fn on_kexinit(&mut self, payload: &[u8]) -> SluiceResult<Vec<Action>> {
        if payload[0] != MessageType::KexInit as u8 {
            return Err(self.unexpected(payload[0]));
        }
        let client = KexInit::from_bytes(&self.client_kexinit)?;
        let server = KexInit::from_bytes(payload)?;
        let negotiated = negotiate(&client, &server)?;
        debug!(
            kex = negotiated.kex.name(),
            host_key = negotiated.host_key.name(),
            cipher_c2s = negotiated.cipher_client_to_server.name(),
            cipher_s2c = negotiated.cipher_server_to_client.name(),
            mac_c2s = negotiated.mac_client_to_server.name(),
            mac_s2c = negotiated.mac_server_to_client.name(),
            compression_c2s = negotiated.compression_client_to_server.name(),
            compression_s2c = negotiated.compression_server_to_client.name(),
            "Negotiated algorithms"
        );

        self.server_kexinit = payload.to_vec();
        self.discard_guess = negotiated.discard_guessed_packet;
        let kex = negotiated.kex;
        self.negotiated = Some(negotiated);

        match kex.fixed_group() {
            Some(dh) => {
                let mut w = Writer::message(MessageType::KexdhInit as u8);
                w.put_mpint(&dh.public_key());
                self.dh = Some(dh);
                self.transition(HandshakeState::KexReply);
                Ok(vec![Action::Send(w.finish())])
            }
            None => {
                let bounds = self.config.group_exchange;
                let mut w = Writer::message(MessageType::KexDhGexRequest as u8);
                w.put_u32(bounds.min)
                    .put_u32(bounds.preferred)
                    .put_u32(bounds.max);
                self.transition(HandshakeState::GroupNegotiation);
                Ok(vec![Action::Send(w.finish())])
            }
        }
    }

    fn on_group(&mut self, payload: &[u8]) -> SluiceResult<Vec<Action>> {
        if payload[0] != KEX_DH_GEX_GROUP {
            return Err(self.unexpected(payload[0]));
        }
        let mut r = Reader::new(&payload[1..]);
        let p = r.read_mpint()?;
        let g = r.read_mpint()?;

        let dh = DhExchange::from_group(p, g, &self.config.group_exchange)?;
        debug!("Server group: {} bits", p.len() * 8);

        let mut w = Writer::message(MessageType::KexDhGexInit as u8);
        w.put_mpint(&dh.public_key());

        self.group = Some(GroupHashInput {
            bounds: self.config.group_exchange,
            p: p.to_vec(),
            g: g.to_vec(),
        });
        self.dh = Some(dh);
        self.transition(HandshakeState::KexReply);
        Ok(vec![Action::Send(w.finish())])
    }

    fn on_kex_reply(&mut self, payload: &[u8]) -> SluiceResult<Vec<Action>> {
        let expected = if self.group.is_some() {
            MessageType::KexDhGexReply
        } else {
            MessageType::KexdhReply
        };
        if payload[0] != expected as u8 {
            return Err(self.unexpected(payload[0]));
        }

        let mut r = Reader::new(&payload[1..]);
        let host_key_blob = r.read_string()?;
        let server_public = r.read_mpint()?;
        let signature = r.read_string()?;

        let negotiated_host_key = self.negotiated_ref()?.host_key;
        let host_key = HostKey::parse(host_key_blob)?;
        if host_key.algorithm() != negotiated_host_key {
            return Err(SluiceError::HostKey(format!(
                "Server sent {} key, negotiated {}",
                host_key.algorithm(),
                negotiated_host_key
            )));
        }

        let dh = self
            .dh
            .take()
            .ok_or_else(|| SluiceError::Protocol("No key exchange in progress".to_string()))?;
        let shared_secret = Zeroizing::new(dh.compute_shared_secret(server_public)?);
        let client_public = dh.public_key();
        drop(dh);

        let server_version = self
            .server_version
            .as_ref()
            .ok_or_else(|| SluiceError::Protocol("Server version unknown".to_string()))?;
        let exchange_hash = ExchangeHashInput {
            client_version: self.client_version.as_str(),
            server_version: server_version.as_str(),
            client_kexinit: &self.client_kexinit,
            server_kexinit: &self.server_kexinit,
            host_key: host_key_blob,
            group: self.group.as_ref(),
            client_public: &client_public,
            server_public,
            shared_secret: &shared_secret,
        }
        .compute();

        host_key.verify(&exchange_hash, signature)?;
        self.config.host_key_verifier.verify(&host_key)?;
        debug!(
            algorithm = %host_key.algorithm(),
            fingerprint = %host_key.fingerprint(),
            "Host key verified"
        );

        if self.session_id.is_none() {
            self.session_id = Some(exchange_hash.clone());
        }
        self.pending = Some(PendingKeys {
            shared_secret,
            exchange_hash,
        });

        self.transition(HandshakeState::NewKeys);
        Ok(vec![Action::Send(NewKeys.to_bytes())])
    }

    fn on_newkeys(&mut self, payload: &[u8]) -> SluiceResult<Vec<Action>> {
        if payload[0] != MessageType::NewKeys as u8 {
            return Err(self.unexpected(payload[0]));
        }
        NewKeys::from_bytes(payload)?;

        let pending = self
            .pending
            .take()
            .ok_or_else(|| SluiceError::Protocol("NEWKEYS before key exchange".to_string()))?;
        let session_id = self
            .session_id
            .clone()
            .ok_or_else(|| SluiceError::Protocol("Session id not set".to_string()))?;
        let negotiated = self.negotiated_ref()?;

        let outbound = DirectionKeys::derive(
            &pending.shared_secret,
            &pending.exchange_hash,
            &session_id,
            Direction::ClientToServer,
            negotiated.cipher_client_to_server,
            negotiated.mac_client_to_server,
        );
        let inbound = DirectionKeys::derive(
            &pending.shared_secret,
            &pending.exchange_hash,
            &session_id,
            Direction::ServerToClient,
            negotiated.cipher_server_to_client,
            negotiated.mac_server_to_client,
        );

        self.transition(HandshakeState::ServiceAccept);
        Ok(vec![
            Action::ArmInbound(inbound),
            Action::ArmOutbound(outbound),
            Action::Send(service_request(USERAUTH_SERVICE)),
        ])
    }

    fn on_service_accept(&mut self, payload: &[u8]) -> SluiceResult<Vec<Action>> {
        if payload[0] != MessageType::ServiceAccept as u8 {
            return Err(self.unexpected(payload[0]));
        }
        let service = parse_service(payload, MessageType::ServiceAccept)?;
        if service != USERAUTH_SERVICE {
            return Err(SluiceError::Protocol(format!(
                "Server accepted unexpected service {}",
                service
            )));
        }

        let request = AuthRequest::new(&self.config.username, AuthMethod::None);
        self.transition(HandshakeState::Auth(AuthStage::MethodsQuery));
        Ok(vec![Action::Send(request.to_bytes())])
    }

    fn on_auth(&mut self, stage: AuthStage, payload: &[u8]) -> SluiceResult<Vec<Action>> {
        match MessageType::from_u8(payload[0]) {
            Some(MessageType::UserauthBanner) => {
                let banner = AuthBanner::from_bytes(payload)?;
                info!("Server banner: {}", banner.message.trim_end());
                Ok(Vec::new())
            }
            Some(MessageType::UserauthSuccess) => self.on_auth_success(),
            Some(MessageType::UserauthFailure) => {
                let failure = AuthFailure::from_bytes(payload)?;
                self.on_auth_failure(stage, failure)
            }
            Some(MessageType::UserauthPkOk) if stage == AuthStage::PublicKeyQuery => {
                let pk_ok = AuthPkOk::from_bytes(payload)?;
                self.on_pk_ok(pk_ok)
            }
            Some(MessageType::UserauthPkOk) if stage == AuthStage::Password => Err(
                SluiceError::Auth("Server requested a password change".to_string()),
            ),
            _ => Err(self.unexpected(payload[0])),
        }
    }

    fn on_auth_failure(
        &mut self,
        stage: AuthStage,
        failure: AuthFailure,
    ) -> SluiceResult<Vec<Action>> {
        let offered = failure.methods.join(",");
        if stage != AuthStage::MethodsQuery {
            return Err(SluiceError::Auth(format!(
                "{} authentication rejected (server accepts: {})",
                self.config.credential.method_name(),
                offered
            )));
        }

        let method = self.config.credential.method_name();
        if !failure.allows(method) {
            return Err(SluiceError::Auth(format!(
                "Server does not accept {} authentication (server accepts: {})",
                method, offered
            )));
        }
        debug!("Server accepts: {}", offered);

        let (method, stage) = match &self.config.credential {
            Credential::Password(password) => {
                (AuthMethod::Password(password.clone()), AuthStage::Password)
            }
            Credential::PublicKey(key) => (
                AuthMethod::PublicKeyQuery {
                    algorithm: key.algorithm().to_string(),
                    public_key: key.public_key_blob(),
                },
                AuthStage::PublicKeyQuery,
            ),
        };

        let request = AuthRequest::new(&self.config.username, method);
        self.transition(HandshakeState::Auth(stage));
        Ok(vec![Action::Send(request.to_bytes())])
    }

    fn on_pk_ok(&mut self, pk_ok: AuthPkOk) -> SluiceResult<Vec<Action>> {
        let key = match &self.config.credential {
            Credential::PublicKey(key) => key.clone(),
            Credential::Password(_) => {
                return Err(SluiceError::Protocol(
                    "PK_OK without a public key query".to_string(),
                ))
            }
        };
        let algorithm = key.algorithm().to_string();
        let public_key = key.public_key_blob();
        if pk_ok.algorithm != algorithm || pk_ok.public_key != public_key {
            return Err(SluiceError::Auth(
                "PK_OK does not match the offered key".to_string(),
            ));
        }

        let session_id = self
            .session_id
            .as_deref()
            .ok_or_else(|| SluiceError::Protocol("Session id not set".to_string()))?;
        let data = signature_data(session_id, &self.config.username, &algorithm, &public_key);
        let signature = key.sign(&data)?;

        let request = AuthRequest::new(
            &self.config.username,
            AuthMethod::PublicKeySigned {
                algorithm,
                public_key,
                signature,
            },
        );
        self.transition(HandshakeState::Auth(AuthStage::PublicKeySigned));
        Ok(vec![Action::Send(request.to_bytes())])
    }

    fn on_auth_success(&mut self) -> SluiceResult<Vec<Action>> {
        info!("Authenticated as {}", self.config.username);
        let negotiated = self.negotiated_ref()?;
        let outbound = negotiated.compression_client_to_server != CompressionAlgorithm::None;
        let inbound = negotiated.compression_server_to_client != CompressionAlgorithm::None;

        let mut actions = Vec::with_capacity(2);
        if outbound || inbound {
            actions.push(Action::ActivateCompression { outbound, inbound });
        }
        actions.push(Action::Send(self.channel.open_message()));
        self.transition(HandshakeState::ChannelOpen);
        Ok(actions)
    }

    fn on_channel_open(&mut self, payload: &[u8]) -> SluiceResult<Vec<Action>> {
        match MessageType::from_u8(payload[0]) {
            Some(MessageType::ChannelOpenConfirmation) => {
                let confirmation = ChannelOpenConfirmation::from_bytes(payload)?;
                self.channel.on_confirmation(&confirmation)?;
                debug!(
                    remote_id = confirmation.sender_channel,
                    window = confirmation.initial_window_size,
                    max_packet = confirmation.maximum_packet_size,
                    "Session channel open"
                );

                let mut actions: Vec<Action> = self
                    .channel
                    .start_requests(self.config.pty.as_ref(), self.config.command.as_deref())
                    .into_iter()
                    .map(Action::Send)
                    .collect();
                actions.push(Action::Established);
                self.transition(HandshakeState::Established);
                Ok(actions)
            }
            Some(MessageType::ChannelOpenFailure) => {
                let failure = ChannelOpenFailure::from_bytes(payload)?;
                Err(SluiceError::Protocol(format!(
                    "Channel open failed: {} ({})",
                    failure.reason.as_str(),
                    failure.description
                )))
            }
            Some(MessageType::GlobalRequest) => self.on_global_request(payload),
            _ => Err(self.unexpected(payload[0])),
        }
    }

    fn on_global_request(&mut self, payload: &[u8]) -> SluiceResult<Vec<Action>> {
        let request = GlobalRequest::from_bytes(payload)?;
        debug!("Refusing global request {}", request.name);
        if request.want_reply {
            Ok(vec![Action::Send(request_failure())])
        } else {
            Ok(Vec::new())
        }
    }

    fn on_established(&mut self, payload: &[u8]) -> SluiceResult<Vec<Action>> {
        match MessageType::from_u8(payload[0]) {
            Some(MessageType::ChannelData) => {
                let message = DataMessage::from_bytes(payload)?;
                self.channel.check_recipient(message.recipient_channel)?;
                self.channel.on_data(message.data.len());
                Ok(vec![Action::Deliver(ChannelData::Stdout(message.data))])
            }
            Some(MessageType::ChannelExtendedData) => {
                let message = ExtendedDataMessage::from_bytes(payload)?;
                self.channel.check_recipient(message.recipient_channel)?;
                self.channel.on_data(message.data.len());
                Ok(vec![Action::Deliver(ChannelData::Extended(
                    message.data_type_code,
                    message.data,
                ))])
            }
            Some(
                code @ (MessageType::ChannelWindowAdjust
                | MessageType::ChannelEof
                | MessageType::ChannelSuccess),
            ) => {
                let recipient = parse_channel_only(payload, code)?;
                self.channel.check_recipient(recipient)?;
                trace!("Ignoring {}", code);
                Ok(Vec::new())
            }
            Some(MessageType::ChannelRequest) => {
                let request = ChannelRequest::from_bytes(payload)?;
                self.channel.check_recipient(request.recipient_channel)?;
                debug!("Channel request {}", request.request.name());
                if request.want_reply {
                    Ok(vec![Action::Send(encode_channel_only(
                        MessageType::ChannelFailure,
                        self.channel.remote_id(),
                    ))])
                } else {
                    Ok(Vec::new())
                }
            }
            Some(MessageType::GlobalRequest) => self.on_global_request(payload),
            Some(MessageType::ChannelClose) => {
                let recipient = parse_channel_only(payload, MessageType::ChannelClose)?;
                self.channel.check_recipient(recipient)?;
                info!("Server closed the session channel");

                let mut actions = Vec::with_capacity(2);
                if let Some(close) = self.channel.on_close() {
                    actions.push(Action::Send(close));
                }
                actions.push(Action::Closed);
                self.transition(HandshakeState::Closed);
                Ok(actions)
            }
            _ => Err(self.unexpected(payload[0])),
        }
    }

    /// Wraps caller data into channel data messages.
    pub fn write(&self, data: &[u8]) -> SluiceResult<Vec<Vec<u8>>> {
        match self.state {
            HandshakeState::Established => self.channel.data_messages(data),
            HandshakeState::Closed => Err(SluiceError::Closed),
            state => Err(SluiceError::Protocol(format!(
                "Cannot write in state {}",
                state
            ))),
        }
    }

    /// Closes the session: CHANNEL_CLOSE (if the channel is open) then DISCONNECT.
    pub fn close(&mut self) -> Vec<Vec<u8>> {
        if self.state == HandshakeState::Closed {
            return Vec::new();
        }
        let mut messages = Vec::with_capacity(2);
        if let Some(close) = self.channel.close_message() {
            messages.push(close);
        }
        // DISCONNECT is only meaningful once the binary protocol started
        if self.state != HandshakeState::HeaderExchange {
            messages.push(
                Disconnect {
                    reason_code: DISCONNECT_BY_APPLICATION,
                    description: "disconnected by application".to_string(),
                }
                .to_bytes(),
            );
        }
        self.transition(HandshakeState::Closed);
        messages
    }

    /// Marks the handshake dead after a fatal error and drops key material.
    pub fn abort(&mut self) {
        if self.state != HandshakeState::Closed {
            warn!("Aborting handshake in state {}", self.state);
        }
        self.pending = None;
        self.dh = None;
        self.state = HandshakeState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::service_accept;
    use crate::ssh::config::AlgorithmPreferences;
    use crate::ssh::privatekey::{Ed25519KeyPair, KeyProvider};

    fn config() -> ClientConfig {
        ClientConfig::new("alice", Credential::password("hunter2"))
    }

    fn sends(actions: &[Action]) -> Vec<&[u8]> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(p) => Some(p.as_slice()),
                _ => None,
            })
            .collect()
    }

    fn server_kexinit(kex: &str) -> Vec<u8> {
        let prefs = AlgorithmPreferences {
            kex: vec![kex.to_string()],
            host_key: vec!["ssh-rsa".into()],
            ciphers: vec!["aes128-ctr".into()],
            macs: vec!["hmac-sha1".into()],
            compression: vec!["none".into()],
        };
        KexInit::from_preferences(&prefs).to_bytes()
    }

    fn at_kexinit(config: ClientConfig) -> Handshake {
        let mut hs = Handshake::new(config);
        hs.on_version(Version::parse("SSH-2.0-TestServer").unwrap())
            .unwrap();
        hs
    }

    // Jumps to the authentication phase with a fake session id.
    fn at_service_accept(config: ClientConfig) -> Handshake {
        let mut hs = at_kexinit(config);
        hs.on_packet(&server_kexinit("diffie-hellman-group14-sha1"))
            .unwrap();
        hs.session_id = Some(vec![0x5a; 20]);
        hs.state = HandshakeState::ServiceAccept;
        hs
    }

    #[test]
    fn test_version_sends_kexinit() {
        let mut hs = Handshake::new(config());
        assert!(hs.version_line().starts_with(b"SSH-2.0-sluice_"));
        assert!(hs.version_line().ends_with(b"\r\n"));

        let actions = hs
            .on_version(Version::parse("SSH-2.0-OpenSSH_9.6").unwrap())
            .unwrap();
        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], MessageType::KexInit as u8);
        assert_eq!(hs.state(), HandshakeState::KexInit);
    }

    #[test]
    fn test_packet_before_version_rejected() {
        let mut hs = Handshake::new(config());
        assert!(hs.on_packet(&[MessageType::KexInit as u8]).is_err());
    }

    #[test]
    fn test_fixed_group_sends_kexdh_init() {
        let mut hs = at_kexinit(config());
        let actions = hs
            .on_packet(&server_kexinit("diffie-hellman-group14-sha1"))
            .unwrap();
        let sent = sends(&actions);
        assert_eq!(sent[0][0], MessageType::KexdhInit as u8);
        assert_eq!(hs.state(), HandshakeState::KexReply);
        assert_eq!(hs.negotiated().unwrap().kex.name(), "diffie-hellman-group14-sha1");
    }

    #[test]
    fn test_group_exchange_sends_request() {
        let mut hs = at_kexinit(config());
        let actions = hs
            .on_packet(&server_kexinit("diffie-hellman-group-exchange-sha1"))
            .unwrap();
        let sent = sends(&actions);
        assert_eq!(
            sent[0],
            &[34, 0, 0, 4, 0, 0, 0, 8, 0, 0, 0, 32, 0][..]
        );
        assert_eq!(hs.state(), HandshakeState::GroupNegotiation);
    }

    #[test]
    fn test_group_too_small_rejected() {
        let mut hs = at_kexinit(config());
        hs.on_packet(&server_kexinit("diffie-hellman-group-exchange-sha1"))
            .unwrap();
        let mut w = Writer::message(KEX_DH_GEX_GROUP);
        w.put_mpint(&[0xfb; 64]).put_mpint(&[2]);
        assert!(matches!(
            hs.on_packet(&w.finish()),
            Err(SluiceError::Crypto(_))
        ));
    }

    #[test]
    fn test_no_common_cipher_fails() {
        let mut hs = at_kexinit(config());
        let mut server = KexInit::from_bytes(&server_kexinit("diffie-hellman-group14-sha1")).unwrap();
        server.encryption_server_to_client = vec!["chacha20-poly1305@openssh.com".into()];
        let err = hs.on_packet(&server.to_bytes()).unwrap_err();
        assert!(matches!(
            err,
            SluiceError::Negotiation { slot: "cipher server to client", .. }
        ));
    }

    #[test]
    fn test_wrong_guess_discarded() {
        let mut hs = at_kexinit(config());
        let mut server = KexInit::from_bytes(&server_kexinit("diffie-hellman-group14-sha1")).unwrap();
        server.kex_algorithms = vec![
            "diffie-hellman-group1-sha1".into(),
            "diffie-hellman-group-exchange-sha1".into(),
        ];
        server.first_kex_packet_follows = true;
        hs.on_packet(&server.to_bytes()).unwrap();
        assert_eq!(hs.state(), HandshakeState::GroupNegotiation);

        // The guessed packet is dropped without a state change
        assert!(hs.on_packet(&[30, 0, 0, 0, 1, 5]).unwrap().is_empty());
        assert_eq!(hs.state(), HandshakeState::GroupNegotiation);
        assert!(hs.on_packet(&[30, 0, 0, 0, 1, 5]).is_err());
    }

    #[test]
    fn test_ignore_and_debug_in_any_state() {
        let mut hs = at_kexinit(config());
        assert!(hs.on_packet(&[2, 0, 0, 0, 0]).unwrap().is_empty());
        let mut w = Writer::message(MessageType::Debug as u8);
        w.put_bool(false).put_string(b"hello").put_string(b"");
        assert!(hs.on_packet(&w.finish()).unwrap().is_empty());
        assert_eq!(hs.state(), HandshakeState::KexInit);
    }

    #[test]
    fn test_disconnect_reported() {
        let mut hs = at_kexinit(config());
        let disconnect = Disconnect {
            reason_code: 3,
            description: "no thanks".into(),
        };
        let err = hs.on_packet(&disconnect.to_bytes()).unwrap_err();
        assert!(matches!(err, SluiceError::Disconnected { code: 3, .. }));
        assert_eq!(hs.state(), HandshakeState::Closed);
    }

    #[test]
    fn test_out_of_order_message_fatal() {
        let mut hs = at_kexinit(config());
        let err = hs.on_packet(&[MessageType::UserauthSuccess as u8]).unwrap_err();
        assert!(err.to_string().contains("KexInit"));
    }

    #[test]
    fn test_password_flow() {
        let mut hs = at_service_accept(config());
        let actions = hs.on_packet(&service_accept(USERAUTH_SERVICE)).unwrap();
        let none = AuthRequest::from_bytes(sends(&actions)[0]).unwrap();
        assert_eq!(none.method().name(), "none");
        assert_eq!(hs.state(), HandshakeState::Auth(AuthStage::MethodsQuery));

        let failure = AuthFailure {
            methods: vec!["publickey".into(), "password".into()],
            partial_success: false,
        };
        let actions = hs.on_packet(&failure.to_bytes()).unwrap();
        let request = AuthRequest::from_bytes(sends(&actions)[0]).unwrap();
        assert_eq!(request.method().name(), "password");
        assert_eq!(request.user_name(), "alice");

        let actions = hs.on_packet(&[MessageType::UserauthSuccess as u8]).unwrap();
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::ActivateCompression { .. })));
        assert_eq!(sends(&actions)[0][0], MessageType::ChannelOpen as u8);
        assert_eq!(hs.state(), HandshakeState::ChannelOpen);
    }

    #[test]
    fn test_method_not_offered_fails() {
        let mut hs = at_service_accept(config());
        hs.on_packet(&service_accept(USERAUTH_SERVICE)).unwrap();
        let failure = AuthFailure {
            methods: vec!["publickey".into()],
            partial_success: false,
        };
        let err = hs.on_packet(&failure.to_bytes()).unwrap_err();
        assert!(matches!(err, SluiceError::Auth(_)));
        assert!(err.to_string().contains("publickey"));
    }

    #[test]
    fn test_password_rejected_fails() {
        let mut hs = at_service_accept(config());
        hs.on_packet(&service_accept(USERAUTH_SERVICE)).unwrap();
        let failure = AuthFailure {
            methods: vec!["password".into()],
            partial_success: false,
        };
        hs.on_packet(&failure.to_bytes()).unwrap();
        assert!(matches!(
            hs.on_packet(&failure.to_bytes()),
            Err(SluiceError::Auth(_))
        ));
    }

    #[test]
    fn test_banner_accepted_during_auth() {
        let mut hs = at_service_accept(config());
        hs.on_packet(&service_accept(USERAUTH_SERVICE)).unwrap();
        let banner = AuthBanner {
            message: "Authorised users only\n".into(),
            language: String::new(),
        };
        assert!(hs.on_packet(&banner.to_bytes()).unwrap().is_empty());
        assert_eq!(hs.state(), HandshakeState::Auth(AuthStage::MethodsQuery));
    }

    #[test]
    fn test_publickey_flow_signs_session_id() {
        let key = Ed25519KeyPair::from_seed([3u8; 32]);
        let blob = key.public_key_blob();
        let mut hs = at_service_accept(ClientConfig::new("bob", Credential::public_key(key)));
        hs.on_packet(&service_accept(USERAUTH_SERVICE)).unwrap();

        let failure = AuthFailure {
            methods: vec!["publickey".into()],
            partial_success: false,
        };
        let actions = hs.on_packet(&failure.to_bytes()).unwrap();
        let query = AuthRequest::from_bytes(sends(&actions)[0]).unwrap();
        assert!(matches!(query.method(), AuthMethod::PublicKeyQuery { .. }));
        assert_eq!(hs.state(), HandshakeState::Auth(AuthStage::PublicKeyQuery));

        let pk_ok = AuthPkOk {
            algorithm: "ssh-ed25519".into(),
            public_key: blob.clone(),
        };
        let actions = hs.on_packet(&pk_ok.to_bytes()).unwrap();
        let signed = AuthRequest::from_bytes(sends(&actions)[0]).unwrap();
        match signed.method() {
            AuthMethod::PublicKeySigned { signature, .. } => {
                let mut r = Reader::new(signature);
                assert_eq!(r.read_string().unwrap(), b"ssh-ed25519");
                let raw = r.read_string().unwrap();
                let data = signature_data(&[0x5a; 20], "bob", "ssh-ed25519", &blob);
                let vk = ed25519_dalek::VerifyingKey::from_bytes(
                    blob[blob.len() - 32..].try_into().unwrap(),
                )
                .unwrap();
                let sig = ed25519_dalek::Signature::from_slice(raw).unwrap();
                assert!(vk.verify_strict(&data, &sig).is_ok());
            }
            other => panic!("unexpected method {:?}", other),
        }
        assert_eq!(hs.state(), HandshakeState::Auth(AuthStage::PublicKeySigned));
    }

    #[test]
    fn test_compression_activated_after_auth() {
        let mut hs = at_kexinit(config());
        let mut server = KexInit::from_bytes(&server_kexinit("diffie-hellman-group14-sha1")).unwrap();
        server.compression_server_to_client = vec!["zlib@openssh.com".into()];
        hs.on_packet(&server.to_bytes()).unwrap();
        hs.session_id = Some(vec![1; 20]);
        hs.state = HandshakeState::Auth(AuthStage::Password);

        let actions = hs.on_packet(&[MessageType::UserauthSuccess as u8]).unwrap();
        assert!(matches!(
            actions[0],
            Action::ActivateCompression {
                outbound: false,
                inbound: true
            }
        ));
    }

    fn established(config: ClientConfig) -> (Handshake, Vec<Action>) {
        let mut hs = at_service_accept(config);
        hs.state = HandshakeState::ChannelOpen;
        let confirmation = ChannelOpenConfirmation {
            recipient_channel: 0,
            sender_channel: 9,
            initial_window_size: 1 << 20,
            maximum_packet_size: 32768,
        };
        let actions = hs.on_packet(&confirmation.to_bytes()).unwrap();
        (hs, actions)
    }

    #[test]
    fn test_channel_confirmation_starts_exec() {
        let (hs, actions) = established(config().with_command("uname -a"));
        let sent = sends(&actions);
        assert_eq!(sent.len(), 1);
        let request = ChannelRequest::from_bytes(sent[0]).unwrap();
        assert_eq!(request.request.name(), "exec");
        assert!(matches!(actions.last(), Some(Action::Established)));
        assert_eq!(hs.state(), HandshakeState::Established);
    }

    #[test]
    fn test_channel_open_failure_fatal() {
        let mut hs = at_service_accept(config());
        hs.state = HandshakeState::ChannelOpen;
        let failure = ChannelOpenFailure {
            recipient_channel: 0,
            reason: crate::ssh::connection::ChannelOpenFailureReason::ResourceShortage,
            description: "too many sessions".into(),
        };
        let err = hs.on_packet(&failure.to_bytes()).unwrap_err();
        assert!(err.to_string().contains("resource shortage"));
    }

    #[test]
    fn test_established_delivers_data() {
        let (mut hs, _) = established(config());
        let actions = hs
            .on_packet(&crate::ssh::connection::encode_data(0, b"hello"))
            .unwrap();
        assert!(matches!(
            &actions[0],
            Action::Deliver(ChannelData::Stdout(data)) if data == b"hello"
        ));

        let ext = ExtendedDataMessage {
            recipient_channel: 0,
            data_type_code: 1,
            data: b"oops".to_vec(),
        };
        let actions = hs.on_packet(&ext.to_bytes()).unwrap();
        assert!(matches!(
            &actions[0],
            Action::Deliver(ChannelData::Extended(1, data)) if data == b"oops"
        ));
    }

    #[test]
    fn test_established_refuses_requests() {
        let (mut hs, _) = established(config());

        let global = GlobalRequest {
            name: "hostkeys-00@openssh.com".into(),
            want_reply: true,
        };
        let actions = hs.on_packet(&global.to_bytes()).unwrap();
        assert_eq!(sends(&actions), vec![&[82u8][..]]);

        let mut w = Writer::message(MessageType::ChannelRequest as u8);
        w.put_u32(0).put_string(b"keepalive@openssh.com").put_bool(true);
        let actions = hs.on_packet(&w.finish()).unwrap();
        assert_eq!(sends(&actions), vec![&[100u8, 0, 0, 0, 9][..]]);

        let mut w = Writer::message(MessageType::ChannelRequest as u8);
        w.put_u32(0).put_string(b"exit-status").put_bool(false).put_u32(0);
        assert!(hs.on_packet(&w.finish()).unwrap().is_empty());
    }

    #[test]
    fn test_established_ignores_window_and_eof() {
        let (mut hs, _) = established(config());
        let mut w = Writer::message(MessageType::ChannelWindowAdjust as u8);
        w.put_u32(0).put_u32(4096);
        assert!(hs.on_packet(&w.finish()).unwrap().is_empty());
        assert!(hs
            .on_packet(&encode_channel_only(MessageType::ChannelEof, 0))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unexpected_channel_failure_fatal() {
        let (mut hs, _) = established(config());
        assert!(hs
            .on_packet(&encode_channel_only(MessageType::ChannelFailure, 0))
            .is_err());
    }

    #[test]
    fn test_peer_close_is_normal() {
        let (mut hs, _) = established(config());
        let actions = hs
            .on_packet(&encode_channel_only(MessageType::ChannelClose, 0))
            .unwrap();
        assert_eq!(sends(&actions), vec![&[97u8, 0, 0, 0, 9][..]]);
        assert!(matches!(actions.last(), Some(Action::Closed)));
        assert_eq!(hs.state(), HandshakeState::Closed);
        assert!(matches!(hs.write(b"x"), Err(SluiceError::Closed)));
    }

    #[test]
    fn test_close_sends_channel_close_then_disconnect() {
        let (mut hs, _) = established(config());
        let messages = hs.close();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], vec![97, 0, 0, 0, 9]);
        let disconnect = Disconnect::from_bytes(&messages[1]).unwrap();
        assert_eq!(disconnect.reason_code, DISCONNECT_BY_APPLICATION);
        assert!(hs.close().is_empty());
    }

    #[test]
    fn test_write_before_established_rejected() {
        let hs = at_kexinit(config());
        assert!(matches!(hs.write(b"ls\n"), Err(SluiceError::Protocol(_))));
    }
}
