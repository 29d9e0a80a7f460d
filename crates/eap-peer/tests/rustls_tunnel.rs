//! The shipped rustls stack against a rustls server
//!
//! These tests verify:
//! - A full EAP-TTLS/PAP session and its keys
//! - Resumption of a second session through a shared cache
//! - A refused server chain answered with a lone alert

use eap_peer::{
    ClientIdentity, ClientState, ClientStatus, EapMethod, InnerAuthType, PeerConfig,
    SessionCache, TtlsPhase, TtlsStateMachine, trust::fingerprint,
};
use eap_proto::diameter::{AvpCode, decode_all};
use eap_proto::{EapCode, EapPacket, EapTlsPacket, EapType, TlsFlags};
use pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data")
        .join(name)
}

fn server_identity() -> ClientIdentity {
    ClientIdentity::from_pem_files(fixture("server.pem"), fixture("server.key")).unwrap()
}

fn server_config() -> Arc<ServerConfig> {
    let identity = server_identity();
    let certs = identity
        .cert_chain
        .into_iter()
        .map(CertificateDer::from)
        .collect();
    let key = PrivateKeyDer::try_from(identity.private_key).unwrap();
    let config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_protocol_versions(&[&rustls::version::TLS12])
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap();
    Arc::new(config)
}

fn pinned_config() -> PeerConfig {
    let mut config = PeerConfig::new("alice");
    config.password = Some("secret".to_string());
    config.inner_authentication = InnerAuthType::Pap;
    config.trust.trusted_certificates = vec![fingerprint(&server_identity().cert_chain[0])];
    config
}

/// One EAP-TTLS conversation: the peer and a rustls server
struct Session {
    peer: TtlsStateMachine<eap_peer::RustlsEngine>,
    server: ServerConnection,
    identifier: u8,
}

impl Session {
    fn new(config: &PeerConfig, cache: Arc<SessionCache>, server: Arc<ServerConfig>) -> Self {
        Session {
            peer: TtlsStateMachine::from_config_with_cache(config, cache).unwrap(),
            server: ServerConnection::new(server).unwrap(),
            identifier: 0,
        }
    }

    fn next_identifier(&mut self) -> u8 {
        self.identifier += 1;
        self.identifier
    }

    /// TLS bytes carried by the peer's response, empty for an Ack
    fn peer_bytes(response: Option<EapPacket>) -> Vec<u8> {
        let response = response.expect("peer responds");
        assert_eq!(response.code, EapCode::Response);
        EapTlsPacket::from_eap_packet(&response).unwrap().tls_data
    }

    fn start(&mut self) -> Vec<u8> {
        let id = self.next_identifier();
        let step = self
            .peer
            .process(&EapTlsPacket::start().to_eap_request(id, EapType::Ttls));
        Self::peer_bytes(step.response)
    }

    /// Feed the peer's TLS bytes to the server and send its reply back
    fn round(&mut self, client_bytes: &[u8]) -> Vec<u8> {
        let mut input = client_bytes;
        while !input.is_empty() {
            self.server.read_tls(&mut input).unwrap();
            self.server.process_new_packets().unwrap();
        }
        let mut reply = Vec::new();
        while self.server.wants_write() {
            self.server.write_tls(&mut reply).unwrap();
        }

        let id = self.next_identifier();
        let request = EapTlsPacket::new(TlsFlags::new(false, false, false), None, reply)
            .to_eap_request(id, EapType::Ttls);
        Self::peer_bytes(self.peer.process(&request).response)
    }

    fn success(&mut self) -> ClientState {
        let id = self.next_identifier();
        self.peer.process(&EapPacket::success(id)).state
    }

    fn server_keys(&self) -> Vec<u8> {
        self.server
            .export_keying_material(vec![0u8; 128], b"ttls keying material", None)
            .unwrap()
    }
}

#[test]
fn test_full_session_then_resumed_session() {
    let cache = Arc::new(SessionCache::default());
    let server_config = server_config();
    let config = pinned_config();

    let mut session = Session::new(&config, cache.clone(), server_config.clone());
    let hello = session.start();
    let client_flight = session.round(&hello);
    let tunnel = session.round(&client_flight);
    assert_eq!(session.peer.phase(), TtlsPhase::TunnelEstablished);

    // The first inner step travels with the end of the handshake
    let mut input = &tunnel[..];
    session.server.read_tls(&mut input).unwrap();
    session.server.process_new_packets().unwrap();
    let mut plaintext = [0u8; 256];
    let n = session.server.reader().read(&mut plaintext).unwrap();
    let avps = decode_all(&plaintext[..n]).unwrap();
    assert!(
        avps.iter()
            .any(|avp| avp.key() == AvpCode::USER_NAME && avp.payload == b"alice")
    );

    assert_eq!(session.success(), ClientState::Success);
    let keys = session.peer.session_keys().unwrap();
    let expected = session.server_keys();
    assert_eq!(keys.msk, expected[..64]);
    assert_eq!(keys.emsk, expected[64..]);
    assert!(!session.peer.publish_properties().session_resumed);

    let mut resumed = Session::new(&config, cache, server_config);
    let hello = resumed.start();
    let final_flight = resumed.round(&hello);
    assert_eq!(resumed.peer.phase(), TtlsPhase::TunnelEstablished);
    assert!(resumed.peer.publish_properties().session_resumed);

    let mut input = &final_flight[..];
    resumed.server.read_tls(&mut input).unwrap();
    resumed.server.process_new_packets().unwrap();
    assert!(!resumed.server.is_handshaking());

    assert_eq!(resumed.success(), ClientState::Success);
    let expected = resumed.server_keys();
    assert_eq!(resumed.peer.session_keys().unwrap().msk, expected[..64]);
}

#[test]
fn test_refused_server_gets_only_an_alert() {
    let mut config = pinned_config();
    config.trust.trusted_certificates.clear();

    let mut session = Session::new(&config, Arc::new(SessionCache::default()), server_config());
    let hello = session.start();
    let id = session.next_identifier();

    let mut input = &hello[..];
    while !input.is_empty() {
        session.server.read_tls(&mut input).unwrap();
        session.server.process_new_packets().unwrap();
    }
    let mut flight = Vec::new();
    while session.server.wants_write() {
        session.server.write_tls(&mut flight).unwrap();
    }
    let request = EapTlsPacket::new(TlsFlags::new(false, false, false), None, flight)
        .to_eap_request(id, EapType::Ttls);
    let step = session.peer.process(&request);

    assert_eq!(step.state, ClientState::Failure);
    assert_eq!(step.status, ClientStatus::SecurityError);
    let alert = Session::peer_bytes(step.response);
    // One record: fatal unknown_ca
    assert_eq!(alert, vec![21, 3, 3, 0, 2, 2, 48]);
    assert_eq!(session.peer.phase(), TtlsPhase::Failure);
}
