//! The TLS engine seam
//!
//! The state machine never touches TLS records itself. It pushes received
//! bytes into an engine, asks it to make progress and ships whatever the
//! engine wants to send. [`RustlsEngine`] is the shipped implementation.

use crate::credentials::ClientIdentity;
use thiserror::Error;

mod rustls_engine;

pub use rustls_engine::{RustlsEngine, SessionCache};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TlsEngineError {
    #[error("TLS engine used before create()")]
    NotCreated,
    #[error("TLS configuration error: {0}")]
    Configuration(String),
    #[error("TLS protocol error: {0}")]
    Protocol(String),
    #[error("Server certificate rejected: {0}")]
    Certificate(String),
    #[error("Peer sent alert {0}")]
    PeerAlert(u8),
    #[error("Key export failed: {0}")]
    KeyExport(String),
    #[error("TLS connection closed")]
    Closed,
}

impl TlsEngineError {
    /// Numeric code reported as the session's last error
    ///
    /// Alerts received from the server keep their TLS alert number in the
    /// low byte.
    pub fn code(&self) -> u32 {
        match self {
            TlsEngineError::NotCreated => 1,
            TlsEngineError::Configuration(_) => 2,
            TlsEngineError::Protocol(_) => 3,
            TlsEngineError::Certificate(_) => 4,
            TlsEngineError::KeyExport(_) => 5,
            TlsEngineError::Closed => 6,
            TlsEngineError::PeerAlert(alert) => 0x100 | *alert as u32,
        }
    }
}

/// Result of one [`TlsEngine::handshake_step`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Handshake finished; application data may flow
    Complete,
    /// Waiting for more bytes from the server
    WouldBlock,
    /// The server presented its certificate chain; evaluate trust and step again
    ServerAuthCompleted,
    Error(TlsEngineError),
}

/// A client-side TLS engine driven over in-memory buffers
pub trait TlsEngine {
    /// Start a fresh connection, discarding any previous one
    fn create(&mut self) -> Result<(), TlsEngineError>;

    /// Key under which sessions are cached for resumption
    fn set_peer_id(&mut self, peer_id: &[u8]);

    fn set_certificate(&mut self, identity: &ClientIdentity) -> Result<(), TlsEngineError>;

    /// Hand received TLS bytes to the engine
    fn push_incoming(&mut self, bytes: &[u8]) -> Result<(), TlsEngineError>;

    /// Drain TLS bytes the engine wants to send
    fn take_outgoing(&mut self) -> Vec<u8>;

    fn handshake_step(&mut self) -> HandshakeStatus;

    /// Drain decrypted application data
    fn read(&mut self) -> Result<Vec<u8>, TlsEngineError>;

    /// Encrypt application data; the records appear in [`Self::take_outgoing`]
    fn write(&mut self, plaintext: &[u8]) -> Result<(), TlsEngineError>;

    /// Queue a close alert
    fn close(&mut self);

    /// Drop every queued record and the connection, and queue only the
    /// fatal `alert`; used when the server chain is refused
    fn abort(&mut self, alert: u8);

    /// RFC 5705 exporter with an empty context
    fn export_key_material(&self, label: &str, len: usize) -> Result<Vec<u8>, TlsEngineError>;

    /// IANA value of the negotiated cipher suite
    fn negotiated_cipher(&self) -> Option<u16>;

    /// Server chain as DER, leaf first
    fn peer_certificates(&self) -> Vec<Vec<u8>>;

    fn session_was_resumed(&self) -> bool;
}
