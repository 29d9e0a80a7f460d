//! Test doubles for driving the peer end to end
//!
//! `MockEngine` speaks a toy record protocol instead of TLS: every record
//! is `[kind][len u16][payload]`. Like rustls it queues the client flight
//! while reading the server hello, before trust is decided.
//! `Authenticator` plays the EAP server, fragmenting its own messages and
//! reassembling the peer's.

#![allow(dead_code)]

use eap_peer::{
    ClientIdentity, HandshakeStatus, MethodRegistry, PeerConfig, Step, TlsEngine, TlsEngineError,
    TrustEvaluator, TrustOutcome, TrustPolicy, TtlsStateMachine,
};
use eap_proto::diameter::{self, AvpCode};
use eap_proto::{
    EapCode, EapPacket, EapTlsPacket, EapType, FeedResult, FragmentAssembler, FragmentWriter,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::VecDeque;

pub const CLIENT_HELLO: u8 = 1;
pub const SERVER_HELLO: u8 = 2;
pub const CLIENT_KEY_EXCHANGE: u8 = 3;
pub const CLIENT_FINISHED: u8 = 4;
pub const SERVER_FINISHED: u8 = 5;
pub const ALERT: u8 = 21;
pub const APPLICATION_DATA: u8 = 23;

const MASTER_SECRET: &[u8] = b"mock master secret";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn record(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![kind];
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn parse_records(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut records = Vec::new();
    while !bytes.is_empty() {
        let len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
        records.push((bytes[0], bytes[3..3 + len].to_vec()));
        bytes = &bytes[3 + len..];
    }
    records
}

/// Keying material both ends derive for a label
pub fn export(label: &str, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter = 0u8;
    while out.len() < len {
        let mut mac = Hmac::<Sha256>::new_from_slice(MASTER_SECRET).unwrap();
        mac.update(label.as_bytes());
        mac.update(&[counter]);
        out.extend_from_slice(&mac.finalize().into_bytes());
        counter += 1;
    }
    out.truncate(len);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum MockState {
    #[default]
    Closed,
    Initial,
    AwaitServerHello,
    AwaitServerFinished,
    Established,
    Failed,
}

#[derive(Debug, Default)]
pub struct MockEngine {
    state: MockState,
    records: VecDeque<(u8, Vec<u8>)>,
    outgoing: Vec<u8>,
    pub peer_id: Option<Vec<u8>>,
    certificates: Vec<Vec<u8>>,
    resumed: bool,
    key_exchange_len: usize,
    /// Tunnel writes so far
    pub writes: usize,
}

impl MockEngine {
    /// `key_exchange_len` sizes the client flight so it can be fragmented
    pub fn new(key_exchange_len: usize) -> Self {
        MockEngine {
            key_exchange_len,
            ..Default::default()
        }
    }
}

impl TlsEngine for MockEngine {
    fn create(&mut self) -> Result<(), TlsEngineError> {
        *self = MockEngine {
            state: MockState::Initial,
            peer_id: self.peer_id.take(),
            key_exchange_len: self.key_exchange_len,
            ..Default::default()
        };
        Ok(())
    }

    fn set_peer_id(&mut self, peer_id: &[u8]) {
        self.peer_id = Some(peer_id.to_vec());
    }

    fn set_certificate(&mut self, _identity: &ClientIdentity) -> Result<(), TlsEngineError> {
        Ok(())
    }

    fn push_incoming(&mut self, bytes: &[u8]) -> Result<(), TlsEngineError> {
        if self.state == MockState::Closed {
            return Err(TlsEngineError::NotCreated);
        }
        self.records.extend(parse_records(bytes));
        Ok(())
    }

    fn take_outgoing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outgoing)
    }

    fn handshake_step(&mut self) -> HandshakeStatus {
        match self.state {
            MockState::Closed => HandshakeStatus::Error(TlsEngineError::NotCreated),
            MockState::Initial => {
                let id = self.peer_id.clone().unwrap_or_default();
                self.outgoing.extend(record(CLIENT_HELLO, &id));
                self.state = MockState::AwaitServerHello;
                HandshakeStatus::WouldBlock
            }
            MockState::AwaitServerHello => match self.records.pop_front() {
                None => HandshakeStatus::WouldBlock,
                Some((SERVER_HELLO, payload)) => {
                    if payload[0] == 1 && self.peer_id.is_some() {
                        self.resumed = true;
                        self.outgoing.extend(record(CLIENT_FINISHED, b"resumed"));
                        self.state = MockState::Established;
                        HandshakeStatus::Complete
                    } else {
                        self.certificates = vec![payload[1..].to_vec()];
                        self.outgoing
                            .extend(record(CLIENT_KEY_EXCHANGE, &vec![0xAB; self.key_exchange_len]));
                        self.outgoing.extend(record(CLIENT_FINISHED, b"full"));
                        self.state = MockState::AwaitServerFinished;
                        HandshakeStatus::ServerAuthCompleted
                    }
                }
                Some((ALERT, payload)) => {
                    self.state = MockState::Failed;
                    HandshakeStatus::Error(TlsEngineError::PeerAlert(payload[0]))
                }
                Some(_) => HandshakeStatus::Error(TlsEngineError::Protocol("unexpected record".into())),
            },
            MockState::AwaitServerFinished => match self.records.pop_front() {
                None => HandshakeStatus::WouldBlock,
                Some((SERVER_FINISHED, _)) => {
                    self.state = MockState::Established;
                    HandshakeStatus::Complete
                }
                Some((ALERT, payload)) => {
                    self.state = MockState::Failed;
                    HandshakeStatus::Error(TlsEngineError::PeerAlert(payload[0]))
                }
                Some(_) => HandshakeStatus::Error(TlsEngineError::Protocol("unexpected record".into())),
            },
            MockState::Established => HandshakeStatus::Complete,
            MockState::Failed => HandshakeStatus::Error(TlsEngineError::Closed),
        }
    }

    fn read(&mut self) -> Result<Vec<u8>, TlsEngineError> {
        let mut plaintext = Vec::new();
        while let Some((kind, payload)) = self.records.pop_front() {
            match kind {
                APPLICATION_DATA => plaintext.extend(payload),
                ALERT => return Err(TlsEngineError::PeerAlert(payload[0])),
                _ => return Err(TlsEngineError::Protocol("handshake record in tunnel".into())),
            }
        }
        Ok(plaintext)
    }

    fn write(&mut self, plaintext: &[u8]) -> Result<(), TlsEngineError> {
        if self.state != MockState::Established {
            return Err(TlsEngineError::Closed);
        }
        self.outgoing.extend(record(APPLICATION_DATA, plaintext));
        self.writes += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.outgoing.extend(record(ALERT, &[0]));
        self.state = MockState::Failed;
    }

    fn abort(&mut self, alert: u8) {
        self.records.clear();
        self.outgoing = record(ALERT, &[alert]);
        self.state = MockState::Failed;
    }

    fn export_key_material(&self, label: &str, len: usize) -> Result<Vec<u8>, TlsEngineError> {
        if self.state != MockState::Established {
            return Err(TlsEngineError::KeyExport("handshake not complete".into()));
        }
        Ok(export(label, len))
    }

    fn negotiated_cipher(&self) -> Option<u16> {
        (self.state == MockState::Established).then_some(0xC02F)
    }

    fn peer_certificates(&self) -> Vec<Vec<u8>> {
        self.certificates.clone()
    }

    fn session_was_resumed(&self) -> bool {
        self.resumed
    }
}

pub struct FixedTrust(pub TrustOutcome);

impl TrustEvaluator for FixedTrust {
    fn evaluate(&self, _chain: &[Vec<u8>], _policy: &TrustPolicy) -> TrustOutcome {
        self.0
    }
}

pub type Peer = TtlsStateMachine<MockEngine>;

pub fn peer(config: &PeerConfig, trust: TrustOutcome) -> Peer {
    TtlsStateMachine::new(config, MockEngine::new(300), Box::new(FixedTrust(trust))).unwrap()
}

pub fn peer_with_registry(
    config: &PeerConfig,
    credentials: eap_peer::Credentials,
    registry: MethodRegistry,
) -> Peer {
    TtlsStateMachine::with_parts(
        config,
        credentials,
        MockEngine::new(300),
        Box::new(FixedTrust(TrustOutcome::Ok)),
        registry,
    )
}

/// The EAP server side of a conversation
pub struct Authenticator {
    eap_type: EapType,
    mtu: usize,
    identifier: u8,
    assembler: FragmentAssembler,
    writer: FragmentWriter,
    last_request: Option<EapPacket>,
}

impl Authenticator {
    pub fn new(eap_type: EapType, mtu: usize) -> Self {
        Authenticator {
            eap_type,
            mtu,
            identifier: 0,
            assembler: FragmentAssembler::new(),
            writer: FragmentWriter::new(),
            last_request: None,
        }
    }

    fn next_identifier(&mut self) -> u8 {
        self.identifier = self.identifier.wrapping_add(1);
        self.identifier
    }

    fn request(&mut self, packet: EapPacket) -> EapPacket {
        self.last_request = Some(packet.clone());
        packet
    }

    pub fn start(&mut self) -> EapPacket {
        let id = self.next_identifier();
        self.request(EapTlsPacket::start().to_eap_request(id, self.eap_type))
    }

    pub fn ack(&mut self) -> EapPacket {
        let id = self.next_identifier();
        self.request(EapTlsPacket::ack().to_eap_request(id, self.eap_type))
    }

    pub fn success(&mut self) -> EapPacket {
        let id = self.next_identifier();
        EapPacket::success(id)
    }

    pub fn failure(&mut self) -> EapPacket {
        let id = self.next_identifier();
        EapPacket::failure(id)
    }

    /// A raw request with the next identifier
    pub fn raw(&mut self, tls: EapTlsPacket) -> EapPacket {
        let id = self.next_identifier();
        self.request(tls.to_eap_request(id, self.eap_type))
    }

    pub fn last_request(&self) -> EapPacket {
        self.last_request.clone().unwrap()
    }

    /// Start the conversation and return the peer's first flight
    pub fn begin(&mut self, peer: &mut Peer) -> (Vec<u8>, Step) {
        let start = self.start();
        let step = peer.process(&start);
        self.collect(peer, step)
    }

    /// Send a whole message, fragment by fragment, and collect the reply
    ///
    /// An empty message is sent as an Ack.
    pub fn exchange(&mut self, peer: &mut Peer, message: Vec<u8>) -> (Vec<u8>, Step) {
        if message.is_empty() {
            let ack = self.ack();
            let step = peer.process(&ack);
            return self.collect(peer, step);
        }

        self.writer.set_message(message);
        let step = loop {
            let id = self.next_identifier();
            let (mut packet, more) = self.writer.next_fragment(id, self.mtu, self.eap_type).unwrap();
            packet.code = EapCode::Request;
            let packet = self.request(packet);
            let step = peer.process(&packet);
            if !more {
                break step;
            }
            let response = step.response.expect("peer acknowledges each fragment");
            assert!(EapTlsPacket::from_eap_packet(&response).unwrap().is_ack());
        };
        self.collect(peer, step)
    }

    /// Re-deliver the last request, e.g. after supplying user input
    pub fn repeat(&mut self, peer: &mut Peer) -> (Vec<u8>, Step) {
        let request = self.last_request();
        let step = peer.process(&request);
        self.collect(peer, step)
    }

    /// Reassemble the peer's reply, acknowledging its fragments
    pub fn collect(&mut self, peer: &mut Peer, mut step: Step) -> (Vec<u8>, Step) {
        loop {
            let Some(response) = step.response.clone() else {
                return (Vec::new(), step);
            };
            assert_eq!(response.code, EapCode::Response);
            assert_eq!(response.eap_type, Some(self.eap_type));
            let tls = EapTlsPacket::from_eap_packet(&response).unwrap();
            match self.assembler.feed(response.identifier, &tls).unwrap() {
                FeedResult::Complete(bytes) => return (bytes, step),
                FeedResult::Ack => return (Vec::new(), step),
                FeedResult::Incomplete => {
                    let ack = self.ack();
                    step = peer.process(&ack);
                }
                other => panic!("unexpected peer output {:?}", other),
            }
        }
    }
}

/// Server hello for a full handshake carrying a fake certificate
pub fn server_hello(certificate_len: usize) -> Vec<u8> {
    let mut payload = vec![0];
    payload.extend(std::iter::repeat_n(0x30, certificate_len));
    record(SERVER_HELLO, &payload)
}

pub fn resumed_server_hello() -> Vec<u8> {
    record(SERVER_HELLO, &[1])
}

pub fn server_finished() -> Vec<u8> {
    record(SERVER_FINISHED, b"server")
}

/// Plaintext the peer wrote into the tunnel
pub fn tunnel_plaintext(flight: &[u8]) -> Vec<u8> {
    parse_records(flight)
        .into_iter()
        .filter(|(kind, _)| *kind == APPLICATION_DATA)
        .flat_map(|(_, payload)| payload)
        .collect()
}

/// Nested EAP packet wrapped for the tunnel
pub fn tunnel_eap(packet: &EapPacket) -> Vec<u8> {
    record(
        APPLICATION_DATA,
        &diameter::encode(AvpCode::EAP_MESSAGE, &packet.to_bytes()).unwrap(),
    )
}

/// Nested EAP packet the peer sent through the tunnel
pub fn nested_reply(flight: &[u8]) -> EapPacket {
    let plaintext = tunnel_plaintext(flight);
    let avps = diameter::decode_all(&plaintext).unwrap();
    assert_eq!(avps.len(), 1, "one EAP-Message per packet");
    assert_eq!(avps[0].key(), AvpCode::EAP_MESSAGE);
    EapPacket::from_bytes(&avps[0].payload).unwrap()
}

/// Drive a fresh peer through a full handshake, returning the first tunnel flight
pub fn establish(server: &mut Authenticator, peer: &mut Peer) -> (Vec<u8>, Step) {
    let (hello, _) = server.begin(peer);
    assert_eq!(parse_records(&hello)[0].0, CLIENT_HELLO);
    let (flight, _) = server.exchange(peer, server_hello(600));
    let kinds: Vec<u8> = parse_records(&flight).iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds, vec![CLIENT_KEY_EXCHANGE, CLIENT_FINISHED]);
    server.exchange(peer, server_finished())
}
