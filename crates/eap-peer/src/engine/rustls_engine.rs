//! [`TlsEngine`] over a rustls `ClientConnection`
//!
//! Server certificate trust is not decided here. The verifier accepts any
//! chain and still checks handshake signatures against the leaf key. rustls
//! queues the client's second flight in the same call that processes the
//! server certificate, so the handshake driver evaluates trust before taking
//! that flight and calls [`TlsEngine::abort`] to drop it when the chain is
//! refused. Only a fatal alert is then sent.
//!
//! Only TLS 1.2 is offered. The EAP-TLS and EAP-TTLS key labels used by
//! the state machine are the RFC 5216/5281 ones, which TLS 1.3 replaces.

use super::{HandshakeStatus, TlsEngine, TlsEngineError};
use crate::credentials::ClientIdentity;
use pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ClientSessionMemoryCache, ClientSessionStore, Resumption};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, HandshakeKind, SignatureScheme};
use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, trace, warn};

const DEFAULT_CACHE_SIZE: usize = 32;

/// Name used when no peer id was set
const ANONYMOUS_SERVER_NAME: &str = "anonymous.eap-peer.invalid";

const ALERT_CONTENT_TYPE: u8 = 21;
const ALERT_LEVEL_FATAL: u8 = 2;

/// Leaves the trust decision to the caller
#[derive(Debug)]
struct DeferredTrustVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for DeferredTrustVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        trace!(certificates = 1 + intermediates.len(), "server chain received");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client configurations and resumable sessions shared between engines
///
/// rustls resumes a session only under the same verifier and client
/// certificate resolver it was established with, so configurations are
/// built once per client identity and handed out again.
pub struct SessionCache {
    provider: Arc<CryptoProvider>,
    store: Arc<ClientSessionMemoryCache>,
    verifier: Arc<DeferredTrustVerifier>,
    configs: Mutex<Vec<ConfigEntry>>,
}

struct ConfigEntry {
    identity: Option<ClientIdentity>,
    resumption: bool,
    config: Arc<ClientConfig>,
}

impl SessionCache {
    /// Cache holding up to `size` sessions
    pub fn new(size: usize) -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(DeferredTrustVerifier {
            algorithms: provider.signature_verification_algorithms,
        });
        SessionCache {
            provider,
            store: Arc::new(ClientSessionMemoryCache::new(size)),
            verifier,
            configs: Mutex::new(Vec::new()),
        }
    }

    /// The process-wide cache used by [`RustlsEngine::new`]
    pub fn shared() -> Arc<SessionCache> {
        static SHARED: OnceLock<Arc<SessionCache>> = OnceLock::new();
        SHARED
            .get_or_init(|| Arc::new(SessionCache::new(DEFAULT_CACHE_SIZE)))
            .clone()
    }

    fn config(
        &self,
        identity: Option<&ClientIdentity>,
        resumption: bool,
    ) -> Result<Arc<ClientConfig>, TlsEngineError> {
        let mut configs = self
            .configs
            .lock()
            .map_err(|_| TlsEngineError::Configuration("session cache lock poisoned".to_string()))?;

        if let Some(entry) = configs
            .iter()
            .find(|entry| entry.identity.as_ref() == identity && entry.resumption == resumption)
        {
            return Ok(entry.config.clone());
        }

        let config = Arc::new(self.build_config(identity, resumption)?);
        debug!(
            client_certificate = identity.is_some(),
            resumption, "TLS client configuration built"
        );
        configs.push(ConfigEntry {
            identity: identity.cloned(),
            resumption,
            config: config.clone(),
        });
        Ok(config)
    }

    fn build_config(
        &self,
        identity: Option<&ClientIdentity>,
        resumption: bool,
    ) -> Result<ClientConfig, TlsEngineError> {
        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS12])
            .map_err(|e| TlsEngineError::Configuration(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(self.verifier.clone());

        let mut config = match identity {
            Some(identity) => {
                let chain = identity
                    .cert_chain
                    .iter()
                    .map(|der| CertificateDer::from(der.clone()))
                    .collect();
                let key = PrivateKeyDer::try_from(identity.private_key.clone())
                    .map_err(|e| TlsEngineError::Configuration(e.to_string()))?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| TlsEngineError::Configuration(e.to_string()))?
            }
            None => builder.with_no_client_auth(),
        };

        config.enable_sni = false;
        config.resumption = if resumption {
            Resumption::store(self.store.clone())
        } else {
            Resumption::disabled()
        };
        Ok(config)
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

/// rustls-backed engine
pub struct RustlsEngine {
    cache: Arc<SessionCache>,
    created: bool,
    peer_id: Option<Vec<u8>>,
    identity: Option<ClientIdentity>,
    conn: Option<ClientConnection>,
    server_auth_reported: bool,
    pending_error: Option<TlsEngineError>,
    /// Alert record queued by [`TlsEngine::abort`]
    aborted: Vec<u8>,
}

impl RustlsEngine {
    /// Engine on the process-wide session cache
    pub fn new() -> Self {
        Self::with_session_cache(SessionCache::shared())
    }

    /// Engine on its own cache; resumption only works across engines that
    /// share one
    pub fn with_session_cache(cache: Arc<SessionCache>) -> Self {
        RustlsEngine {
            cache,
            created: false,
            peer_id: None,
            identity: None,
            conn: None,
            server_auth_reported: false,
            pending_error: None,
            aborted: Vec::new(),
        }
    }

    fn server_name(&self) -> Result<ServerName<'static>, TlsEngineError> {
        let name = match &self.peer_id {
            Some(id) => format!("{:x}.eap-peer.invalid", md5::compute(id)),
            None => ANONYMOUS_SERVER_NAME.to_string(),
        };
        ServerName::try_from(name).map_err(|e| TlsEngineError::Configuration(e.to_string()))
    }

    fn build_connection(&mut self) -> Result<(), TlsEngineError> {
        let resumption = self.peer_id.is_some();
        let config = self.cache.config(self.identity.as_ref(), resumption)?;
        let conn = ClientConnection::new(config, self.server_name()?)
            .map_err(|e| TlsEngineError::Configuration(e.to_string()))?;

        debug!(resumption, "TLS connection created");
        self.conn = Some(conn);
        Ok(())
    }

    fn connection(&mut self) -> Result<&mut ClientConnection, TlsEngineError> {
        if !self.created {
            return Err(TlsEngineError::NotCreated);
        }
        if self.conn.is_none() {
            self.build_connection()?;
        }
        self.conn.as_mut().ok_or(TlsEngineError::NotCreated)
    }
}

impl Default for RustlsEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn map_rustls_error(error: rustls::Error) -> TlsEngineError {
    match error {
        rustls::Error::AlertReceived(alert) => TlsEngineError::PeerAlert(u8::from(alert)),
        rustls::Error::InvalidCertificate(reason) => {
            TlsEngineError::Certificate(format!("{:?}", reason))
        }
        other => TlsEngineError::Protocol(other.to_string()),
    }
}

impl TlsEngine for RustlsEngine {
    fn create(&mut self) -> Result<(), TlsEngineError> {
        self.created = true;
        self.conn = None;
        self.server_auth_reported = false;
        self.pending_error = None;
        self.aborted.clear();
        Ok(())
    }

    fn set_peer_id(&mut self, peer_id: &[u8]) {
        self.peer_id = Some(peer_id.to_vec());
    }

    fn set_certificate(&mut self, identity: &ClientIdentity) -> Result<(), TlsEngineError> {
        if identity.cert_chain.is_empty() {
            return Err(TlsEngineError::Configuration(
                "client identity has no certificates".to_string(),
            ));
        }
        self.identity = Some(identity.clone());
        Ok(())
    }

    fn push_incoming(&mut self, bytes: &[u8]) -> Result<(), TlsEngineError> {
        let conn = self.connection()?;
        let mut cursor = Cursor::new(bytes);

        while (cursor.position() as usize) < bytes.len() {
            let read = conn
                .read_tls(&mut cursor)
                .map_err(|e| TlsEngineError::Protocol(e.to_string()))?;
            if read == 0 {
                break;
            }
            if let Err(e) = conn.process_new_packets() {
                let error = map_rustls_error(e);
                warn!(error = %error, "TLS processing failed");
                self.pending_error = Some(error.clone());
                return Err(error);
            }
        }
        Ok(())
    }

    fn take_outgoing(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.aborted);
        if let Some(conn) = self.conn.as_mut() {
            while conn.wants_write() {
                match conn.write_tls(&mut out) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        }
        out
    }

    fn handshake_step(&mut self) -> HandshakeStatus {
        if let Some(error) = self.pending_error.take() {
            return HandshakeStatus::Error(error);
        }
        let (handshaking, chain_presented) = match self.connection() {
            // A resumed session carries the chain of the session it resumes
            Ok(conn) => (
                conn.is_handshaking(),
                conn.peer_certificates().is_some()
                    && conn.handshake_kind() != Some(HandshakeKind::Resumed),
            ),
            Err(e) => return HandshakeStatus::Error(e),
        };

        if chain_presented && !self.server_auth_reported {
            self.server_auth_reported = true;
            return HandshakeStatus::ServerAuthCompleted;
        }

        if handshaking {
            HandshakeStatus::WouldBlock
        } else {
            HandshakeStatus::Complete
        }
    }

    fn read(&mut self) -> Result<Vec<u8>, TlsEngineError> {
        let conn = self.connection()?;
        let mut plaintext = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match conn.reader().read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => plaintext.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TlsEngineError::Protocol(e.to_string())),
            }
        }
        Ok(plaintext)
    }

    fn write(&mut self, plaintext: &[u8]) -> Result<(), TlsEngineError> {
        let conn = self.connection()?;
        conn.writer()
            .write_all(plaintext)
            .map_err(|e| TlsEngineError::Protocol(e.to_string()))
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.send_close_notify();
        }
    }

    fn abort(&mut self, alert: u8) {
        if let Some(conn) = self.conn.take() {
            debug!(
                discarded = conn.wants_write(),
                alert, "TLS connection aborted"
            );
        }
        // A refused server must not be resumed later
        if let Ok(name) = self.server_name() {
            self.cache.store.remove_tls12_session(&name);
        }
        self.created = false;
        self.pending_error = None;
        // The server never saw our ChangeCipherSpec, so the alert goes in clear
        self.aborted = vec![
            ALERT_CONTENT_TYPE,
            0x03,
            0x03,
            0x00,
            0x02,
            ALERT_LEVEL_FATAL,
            alert,
        ];
    }

    fn export_key_material(&self, label: &str, len: usize) -> Result<Vec<u8>, TlsEngineError> {
        let conn = self.conn.as_ref().ok_or(TlsEngineError::NotCreated)?;
        conn.export_keying_material(vec![0u8; len], label.as_bytes(), None)
            .map_err(|e| TlsEngineError::KeyExport(e.to_string()))
    }

    fn negotiated_cipher(&self) -> Option<u16> {
        self.conn
            .as_ref()
            .and_then(|conn| conn.negotiated_cipher_suite())
            .map(|suite| u16::from(suite.suite()))
    }

    fn peer_certificates(&self) -> Vec<Vec<u8>> {
        self.conn
            .as_ref()
            .and_then(|conn| conn.peer_certificates())
            .map(|certs| certs.iter().map(|cert| cert.to_vec()).collect())
            .unwrap_or_default()
    }

    fn session_was_resumed(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|conn| conn.handshake_kind() == Some(HandshakeKind::Resumed))
    }
}
