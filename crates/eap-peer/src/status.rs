//! Results returned to the host for every processed packet

use eap_proto::{EapPacket, EapType};

/// Coarse outcome of the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    Running,
    Success,
    Failure,
}

/// Why the last step ended the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientStatus {
    #[default]
    Ok,
    /// A password or trust decision is needed before continuing
    UserInputRequired,
    Failed,
    /// The server certificate was rejected
    SecurityError,
    /// No mutually acceptable nested EAP method
    ProtocolNotSupported,
    /// The server failed to prove knowledge of the password
    InnerAuthVerificationFailed,
    PasswordExpired,
}

/// User input a method may ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    UserName,
    UserPassword,
    /// Accept or reject an untrusted server certificate chain
    TrustDecision,
}

/// Facts a method publishes about the session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishedProperties {
    /// IANA TLS cipher suite value
    pub negotiated_cipher: Option<u16>,
    pub session_resumed: bool,
    /// DER certificates, leaf first
    pub server_certificates: Vec<Vec<u8>>,
    pub inner_eap_type: Option<EapType>,
    pub trust_pending: bool,
}

/// Result of processing one inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub response: Option<EapPacket>,
    pub status: ClientStatus,
    pub state: ClientState,
}

impl Step {
    pub fn running(response: Option<EapPacket>) -> Self {
        Step {
            response,
            status: ClientStatus::Ok,
            state: ClientState::Running,
        }
    }

    pub fn input_required(response: Option<EapPacket>) -> Self {
        Step {
            response,
            status: ClientStatus::UserInputRequired,
            state: ClientState::Running,
        }
    }

    pub fn success(response: Option<EapPacket>) -> Self {
        Step {
            response,
            status: ClientStatus::Ok,
            state: ClientState::Success,
        }
    }

    pub fn failure(response: Option<EapPacket>, status: ClientStatus) -> Self {
        Step {
            response,
            status,
            state: ClientState::Failure,
        }
    }
}

/// Result of one inner exchange inside the tunnel
///
/// `write` holds plaintext AVPs to send through the tunnel. `None` with a
/// running state means the outer layer only acknowledges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStep {
    pub write: Option<Vec<u8>>,
    pub status: ClientStatus,
    pub state: ClientState,
}

impl TunnelStep {
    pub fn write(bytes: Vec<u8>) -> Self {
        TunnelStep {
            write: Some(bytes),
            status: ClientStatus::Ok,
            state: ClientState::Running,
        }
    }

    pub fn ack() -> Self {
        TunnelStep {
            write: None,
            status: ClientStatus::Ok,
            state: ClientState::Running,
        }
    }

    pub fn input_required() -> Self {
        TunnelStep {
            write: None,
            status: ClientStatus::UserInputRequired,
            state: ClientState::Running,
        }
    }

    pub fn failure(write: Option<Vec<u8>>, status: ClientStatus) -> Self {
        TunnelStep {
            write,
            status,
            state: ClientState::Failure,
        }
    }
}
