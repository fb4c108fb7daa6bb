//! Sans-IO SSH server fixture built from the crate's public building blocks.
//!
//! It speaks just enough of the server side to drive the client through a
//! full handshake: group exchange or fixed-group DH, an ssh-rsa host key,
//! password and public key authentication and one session channel.

#![allow(dead_code)]

use sluice_platform::SluiceResult;
use sluice_proto::ssh::auth::{
    parse_service, service_accept, signature_data, AuthFailure, AuthMethod, AuthPkOk,
    AuthRequest,
};
use sluice_proto::ssh::config::AlgorithmPreferences;
use sluice_proto::ssh::connection::{
    encode_channel_only, encode_data, ChannelOpen, ChannelOpenConfirmation, ChannelRequest,
    DataMessage, ExtendedDataMessage, GlobalRequest,
};
use sluice_proto::ssh::crypto::{CipherAlgorithm, Direction, DirectionKeys, MacAlgorithm};
use sluice_proto::ssh::engine::{Engine, Event};
use sluice_proto::ssh::hostkey::HostKey;
use sluice_proto::ssh::kex::KexInit;
use sluice_proto::ssh::kex_dh::{DhExchange, ExchangeHashInput, GroupExchangeBounds, GroupHashInput};
use sluice_proto::ssh::message::{MessageType, KEX_DH_GEX_GROUP};
use sluice_proto::ssh::pipeline::{Inbound, Outbound};
use sluice_proto::ssh::privatekey::{KeyProvider, RsaKeyPair};
use sluice_proto::ssh::version::{HeaderReader, Version};
use sluice_proto::ssh::wire::{Reader, Writer};

pub const RSA_N: &str = "b4ac4b5dd198fdb2c08fae727e068a50a8335c9b2d72791a7e8695661ee819d2\
    15e70ccd8d3d075121d37ef7f3db84c1b42032724d6bfe95f8cf5d980c4cb89c\
    8619d34e1c419a5a2c12e0a5a5eef5fc0a5c98a2e9372f68ca73614becfe67c5\
    acb5540d278473a09af765ef0812ce25f5ab7b67a1262dbb8c3717c39e4c695b";
pub const RSA_D: &str = "76e05aa27b536fb1da936f53b3ea37bdc43e2f33871ea7e22fd7fb9afac0faa4\
    497701ec897edb3e9dc41be9a7910b73ac41f70f5033bb8a0ff0d9033f2c87d6\
    918f6bed48809881230c2ecebe0008d1b09d3f8079455f0126eca36e72750a58\
    ba430802d61cbb456f6ca0983f89113c82d3878cb8a78662ef388c06496b81a9";

pub const USERNAME: &str = "tester";
pub const PASSWORD: &str = "correct horse";
pub const SERVER_CHANNEL_ID: u32 = 5;
pub const SERVER_MAX_PACKET: u32 = 32768;

/// The 1024-bit RSA fixture key, used as host key and as client key.
pub fn rsa_key() -> RsaKeyPair {
    RsaKeyPair::from_components(
        &hex::decode(RSA_N).unwrap(),
        &[0x01, 0x00, 0x01],
        &hex::decode(RSA_D).unwrap(),
    )
    .unwrap()
}

/// Algorithms the fixture offers.
pub fn fixture_algorithms(kex: &str, compression: &str) -> AlgorithmPreferences {
    AlgorithmPreferences {
        kex: vec![kex.to_string()],
        host_key: vec!["ssh-rsa".into()],
        ciphers: vec!["aes128-ctr".into()],
        macs: vec!["hmac-sha1".into()],
        compression: vec![compression.to_string()],
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct KexState {
    group: Option<GroupHashInput>,
    dh: Option<DhExchange>,
}

pub struct FixtureServer {
    version: Version,
    header: Option<HeaderReader>,
    client_version: Option<Version>,
    kexinit: Vec<u8>,
    client_kexinit: Vec<u8>,
    compression: bool,
    kex: KexState,
    host_key: RsaKeyPair,
    inbound_keys: Option<DirectionKeys>,
    outbound: Outbound,
    inbound: Inbound,
    out: Vec<u8>,
    pub session_id: Option<Vec<u8>>,
    pub accepted_methods: Vec<String>,
    pub authenticated: bool,
    pub auth_methods_seen: Vec<String>,
    pub client_window: u32,
    pub channel_requests: Vec<String>,
    pub received: Vec<u8>,
    pub data_packets: usize,
    pub channel_closed: bool,
    pub disconnect_code: Option<u32>,
}

impl FixtureServer {
    pub fn new(algorithms: AlgorithmPreferences) -> Self {
        let compression = algorithms.compression.iter().any(|c| c != "none");
        Self {
            version: Version::new("FixtureSSH_1.0", None),
            header: Some(HeaderReader::new()),
            client_version: None,
            kexinit: KexInit::from_preferences(&algorithms).to_bytes(),
            client_kexinit: Vec::new(),
            compression,
            kex: KexState {
                group: None,
                dh: None,
            },
            host_key: rsa_key(),
            inbound_keys: None,
            outbound: Outbound::new(),
            inbound: Inbound::new(256 * 1024, 10 * 1024),
            out: Vec::new(),
            session_id: None,
            accepted_methods: vec!["publickey".into(), "password".into()],
            authenticated: false,
            auth_methods_seen: Vec::new(),
            client_window: 0,
            channel_requests: Vec::new(),
            received: Vec::new(),
            data_packets: 0,
            channel_closed: false,
            disconnect_code: None,
        }
    }

    /// The standard fixture: group14-sha1, ssh-rsa, aes128-ctr, hmac-sha1, none.
    pub fn standard() -> Self {
        Self::new(fixture_algorithms("diffie-hellman-group14-sha1", "none"))
    }

    pub fn host_key_fingerprint(&self) -> String {
        HostKey::parse(&self.host_key.public_key_blob())
            .unwrap()
            .fingerprint()
    }

    /// Queues the version line and KEXINIT.
    pub fn start(&mut self) {
        self.out.extend_from_slice(&self.version.to_wire_format());
        let kexinit = self.kexinit.clone();
        self.send(kexinit);
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    pub fn send(&mut self, payload: Vec<u8>) {
        let wire = self.outbound.send(payload).unwrap();
        self.out.extend_from_slice(&wire);
    }

    pub fn send_data(&mut self, data: &[u8]) {
        self.send(encode_data(0, data));
    }

    pub fn send_stderr(&mut self, data: &[u8]) {
        let message = ExtendedDataMessage {
            recipient_channel: 0,
            data_type_code: 1,
            data: data.to_vec(),
        };
        self.send(message.to_bytes());
    }

    pub fn send_close(&mut self) {
        self.send(encode_channel_only(MessageType::ChannelClose, 0));
    }

    pub fn send_global_request(&mut self, name: &str) {
        let request = GlobalRequest {
            name: name.to_string(),
            want_reply: true,
        };
        self.send(request.to_bytes());
    }

    /// Sequence number of the next packet the server will read.
    pub fn inbound_sequence(&self) -> u32 {
        self.inbound.sequence()
    }

    pub fn feed(&mut self, data: &[u8]) -> SluiceResult<()> {
        let data = match self.header.as_mut() {
            Some(header) => match header.feed(data)? {
                Some((version, rest)) => {
                    self.client_version = Some(version);
                    self.header = None;
                    rest
                }
                None => return Ok(()),
            },
            None => data.to_vec(),
        };
        self.inbound.feed(&data);

        while let Some(payload) = self.inbound.next_payload()? {
            self.on_packet(&payload)?;
        }
        Ok(())
    }

    fn on_packet(&mut self, payload: &[u8]) -> SluiceResult<()> {
        match MessageType::from_u8(payload[0]) {
            Some(MessageType::KexInit) => self.client_kexinit = payload.to_vec(),
            Some(MessageType::KexDhGexRequest) => {
                let mut r = Reader::new(&payload[1..]);
                let bounds = GroupExchangeBounds {
                    min: r.read_u32()?,
                    preferred: r.read_u32()?,
                    max: r.read_u32()?,
                };
                let template = DhExchange::group14();
                let (p, g) = (template.prime(), template.generator());
                let dh = DhExchange::from_group(&p, &g, &bounds)?;
                let mut w = Writer::message(KEX_DH_GEX_GROUP);
                w.put_mpint(&p).put_mpint(&g);
                self.kex.group = Some(GroupHashInput { bounds, p, g });
                self.kex.dh = Some(dh);
                self.send(w.finish());
            }
            Some(MessageType::KexdhInit) => {
                self.kex.dh = Some(DhExchange::group14());
                self.on_kex_init(payload, MessageType::KexdhReply)?;
            }
            Some(MessageType::KexDhGexInit) => {
                self.on_kex_init(payload, MessageType::KexDhGexReply)?;
            }
            Some(MessageType::NewKeys) => {
                let keys = self.inbound_keys.take().expect("NEWKEYS before kex");
                self.inbound.arm(&keys)?;
            }
            Some(MessageType::ServiceRequest) => {
                let service = parse_service(payload, MessageType::ServiceRequest)?;
                self.send(service_accept(&service));
            }
            Some(MessageType::UserauthRequest) => self.on_auth(payload)?,
            Some(MessageType::ChannelOpen) => {
                let open = ChannelOpen::from_bytes(payload)?;
                self.client_window = open.initial_window_size;
                let confirmation = ChannelOpenConfirmation {
                    recipient_channel: open.sender_channel,
                    sender_channel: SERVER_CHANNEL_ID,
                    initial_window_size: 1 << 21,
                    maximum_packet_size: SERVER_MAX_PACKET,
                };
                self.send(confirmation.to_bytes());
            }
            Some(MessageType::ChannelRequest) => {
                let request = ChannelRequest::from_bytes(payload)?;
                self.channel_requests.push(request.request.name().to_string());
            }
            Some(MessageType::ChannelData) => {
                let message = DataMessage::from_bytes(payload)?;
                assert_eq!(message.recipient_channel, SERVER_CHANNEL_ID);
                self.data_packets += 1;
                self.received.extend_from_slice(&message.data);
            }
            Some(MessageType::ChannelClose) => self.channel_closed = true,
            Some(MessageType::Disconnect) => {
                let mut r = Reader::new(&payload[1..]);
                self.disconnect_code = Some(r.read_u32()?);
            }
            _ => {}
        }
        Ok(())
    }

    fn on_kex_init(&mut self, payload: &[u8], reply: MessageType) -> SluiceResult<()> {
        let mut r = Reader::new(&payload[1..]);
        let client_public = r.read_mpint()?.to_vec();
        let dh = self.kex.dh.take().expect("no DH state");
        let server_public = dh.public_key();
        let shared_secret = dh.compute_shared_secret(&client_public)?;
        let host_key_blob = self.host_key.public_key_blob();

        let client_version = self.client_version.as_ref().expect("client version");
        let exchange_hash = ExchangeHashInput {
            client_version: client_version.as_str(),
            server_version: self.version.as_str(),
            client_kexinit: &self.client_kexinit,
            server_kexinit: &self.kexinit,
            host_key: &host_key_blob,
            group: self.kex.group.as_ref(),
            client_public: &client_public,
            server_public: &server_public,
            shared_secret: &shared_secret,
        }
        .compute();
        let signature = self.host_key.sign(&exchange_hash)?;

        let mut w = Writer::message(reply as u8);
        w.put_string(&host_key_blob)
            .put_mpint(&server_public)
            .put_string(&signature);
        self.send(w.finish());
        self.send(vec![MessageType::NewKeys as u8]);

        let session_id = self
            .session_id
            .get_or_insert_with(|| exchange_hash.clone())
            .clone();
        let derive = |direction| {
            DirectionKeys::derive(
                &shared_secret,
                &exchange_hash,
                &session_id,
                direction,
                CipherAlgorithm::Aes128Ctr,
                MacAlgorithm::HmacSha1,
            )
        };
        self.outbound.arm(&derive(Direction::ServerToClient))?;
        self.inbound_keys = Some(derive(Direction::ClientToServer));
        Ok(())
    }

    fn on_auth(&mut self, payload: &[u8]) -> SluiceResult<()> {
        let request = AuthRequest::from_bytes(payload)?;
        self.auth_methods_seen.push(request.method().name().to_string());
        let session_id = self.session_id.clone().expect("session id");

        let accepted = match request.method() {
            AuthMethod::None => false,
            AuthMethod::Password(password) => {
                request.user_name() == USERNAME && password.as_str() == PASSWORD
            }
            AuthMethod::PublicKeyQuery {
                algorithm,
                public_key,
            } => {
                let pk_ok = AuthPkOk {
                    algorithm: algorithm.clone(),
                    public_key: public_key.clone(),
                };
                self.send(pk_ok.to_bytes());
                return Ok(());
            }
            AuthMethod::PublicKeySigned {
                algorithm,
                public_key,
                signature,
            } => {
                let data = signature_data(&session_id, request.user_name(), algorithm, public_key);
                HostKey::parse(public_key)?.verify(&data, signature).is_ok()
            }
        };

        if accepted {
            self.authenticated = true;
            self.send(vec![MessageType::UserauthSuccess as u8]);
            if self.compression {
                self.outbound.activate_compression();
                self.inbound.activate_compression();
            }
        } else {
            let failure = AuthFailure {
                methods: self.accepted_methods.clone(),
                partial_success: false,
            };
            self.send(failure.to_bytes());
        }
        Ok(())
    }
}

/// Shuttles bytes between client and server until both are quiet.
pub fn pump(engine: &mut Engine, server: &mut FixtureServer) -> Vec<Event> {
    let mut events = Vec::new();
    for _ in 0..64 {
        let to_server = engine.take_outbound();
        let to_client = server.take_output();
        if to_server.is_empty() && to_client.is_empty() {
            break;
        }
        if !to_server.is_empty() {
            server.feed(&to_server).unwrap();
        }
        if !to_client.is_empty() {
            events.extend(engine.receive(&to_client));
        }
    }
    events
}
