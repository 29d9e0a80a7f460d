//! EAP (Extensible Authentication Protocol) Support
//!
//! This module implements the EAP packet structures defined in RFC 3748
//! together with the peer-side helpers needed by tunneled methods:
//! Identity, Notification and Nak responses, and the EAP-MD5 Challenge
//! computation.
//!
//! # EAP Packet Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Code      |  Identifier   |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |  Type-Data ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use thiserror::Error;

pub mod eap_mschapv2;
pub mod eap_tls;

/// Size of the Code, Identifier and Length fields
pub const EAP_HEADER_LEN: usize = 4;

/// Size of the header of a Request/Response packet (header + Type)
pub const EAP_TYPED_HEADER_LEN: usize = 5;

/// EAP packet code (first byte of EAP packet)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EapCode {
    /// Request packet (Code 1)
    Request = 1,
    /// Response packet (Code 2)
    Response = 2,
    /// Success packet (Code 3)
    Success = 3,
    /// Failure packet (Code 4)
    Failure = 4,
}

impl EapCode {
    /// Convert from u8 to EapCode
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(EapCode::Request),
            2 => Some(EapCode::Response),
            3 => Some(EapCode::Success),
            4 => Some(EapCode::Failure),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// EAP method types (RFC 3748 and IANA registry)
///
/// Types this crate does not know about are preserved as `Unknown` so that
/// a peer can still name them in logs and answer them with a Nak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EapType {
    /// Identity (Type 1) - RFC 3748
    Identity,
    /// Notification (Type 2) - RFC 3748
    Notification,
    /// Nak (Type 3) - RFC 3748, Response only
    Nak,
    /// MD5-Challenge (Type 4) - RFC 3748
    Md5Challenge,
    /// One-Time Password (Type 5) - RFC 3748
    OneTimePassword,
    /// Generic Token Card (Type 6) - RFC 3748
    GenericTokenCard,
    /// EAP-TLS (Type 13) - RFC 5216
    Tls,
    /// EAP-TTLS (Type 21) - RFC 5281
    Ttls,
    /// PEAP (Type 25)
    Peap,
    /// EAP-MSCHAPv2 (Type 26) - draft-kamath-pppext-eap-mschapv2
    MsChapV2,
    /// Any other type value
    Unknown(u8),
}

impl EapType {
    /// Convert from u8 to EapType
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => EapType::Identity,
            2 => EapType::Notification,
            3 => EapType::Nak,
            4 => EapType::Md5Challenge,
            5 => EapType::OneTimePassword,
            6 => EapType::GenericTokenCard,
            13 => EapType::Tls,
            21 => EapType::Ttls,
            25 => EapType::Peap,
            26 => EapType::MsChapV2,
            other => EapType::Unknown(other),
        }
    }

    /// Convert to u8
    pub fn as_u8(self) -> u8 {
        match self {
            EapType::Identity => 1,
            EapType::Notification => 2,
            EapType::Nak => 3,
            EapType::Md5Challenge => 4,
            EapType::OneTimePassword => 5,
            EapType::GenericTokenCard => 6,
            EapType::Tls => 13,
            EapType::Ttls => 21,
            EapType::Peap => 25,
            EapType::MsChapV2 => 26,
            EapType::Unknown(value) => value,
        }
    }

    /// Identity, Notification and Nak carry no authentication method
    pub fn is_method(self) -> bool {
        !matches!(self, EapType::Identity | EapType::Notification | EapType::Nak)
    }
}

impl std::fmt::Display for EapType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EapType::Identity => write!(f, "Identity"),
            EapType::Notification => write!(f, "Notification"),
            EapType::Nak => write!(f, "Nak"),
            EapType::Md5Challenge => write!(f, "MD5-Challenge"),
            EapType::OneTimePassword => write!(f, "OTP"),
            EapType::GenericTokenCard => write!(f, "GTC"),
            EapType::Tls => write!(f, "EAP-TLS"),
            EapType::Ttls => write!(f, "EAP-TTLS"),
            EapType::Peap => write!(f, "PEAP"),
            EapType::MsChapV2 => write!(f, "EAP-MSCHAPv2"),
            EapType::Unknown(value) => write!(f, "type {}", value),
        }
    }
}

/// EAP packet structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapPacket {
    /// EAP code (Request, Response, Success, Failure)
    pub code: EapCode,
    /// Identifier for matching requests and responses (0-255)
    pub identifier: u8,
    /// EAP type (only present for Request/Response)
    pub eap_type: Option<EapType>,
    /// Type-specific data
    pub data: Vec<u8>,
}

impl EapPacket {
    /// Create a new EAP packet
    pub fn new(code: EapCode, identifier: u8, eap_type: Option<EapType>, data: Vec<u8>) -> Self {
        EapPacket {
            code,
            identifier,
            eap_type,
            data,
        }
    }

    /// Create a Response of the given type
    pub fn response(identifier: u8, eap_type: EapType, data: Vec<u8>) -> Self {
        Self::new(EapCode::Response, identifier, Some(eap_type), data)
    }

    /// Create a Request of the given type
    pub fn request(identifier: u8, eap_type: EapType, data: Vec<u8>) -> Self {
        Self::new(EapCode::Request, identifier, Some(eap_type), data)
    }

    /// Create an EAP Identity Response
    pub fn identity_response(identifier: u8, identity: &[u8]) -> Self {
        Self::response(identifier, EapType::Identity, identity.to_vec())
    }

    /// Create an (empty) EAP Notification Response
    ///
    /// RFC 3748 Section 5.2: the Type-Data of a Notification Response
    /// is always empty.
    pub fn notification_response(identifier: u8) -> Self {
        Self::response(identifier, EapType::Notification, Vec::new())
    }

    /// Create an EAP Nak (legacy Nak, RFC 3748 Section 5.3.1)
    ///
    /// `desired` lists the authentication types the peer is willing to use,
    /// in order of preference. An empty list is encoded as a single zero
    /// octet, meaning "no alternative".
    pub fn nak(identifier: u8, desired: &[EapType]) -> Self {
        let data = if desired.is_empty() {
            vec![0]
        } else {
            desired.iter().map(|t| t.as_u8()).collect()
        };
        Self::response(identifier, EapType::Nak, data)
    }

    /// Create an EAP Success packet
    pub fn success(identifier: u8) -> Self {
        Self::new(EapCode::Success, identifier, None, Vec::new())
    }

    /// Create an EAP Failure packet
    pub fn failure(identifier: u8) -> Self {
        Self::new(EapCode::Failure, identifier, None, Vec::new())
    }

    /// Parse EAP packet from bytes
    ///
    /// # Packet Format
    /// - Code (1 byte)
    /// - Identifier (1 byte)
    /// - Length (2 bytes, network byte order)
    /// - Type (1 byte, only for Request/Response)
    /// - Type-Data (variable length)
    ///
    /// Bytes beyond the Length field are ignored (RFC 3748 Section 4.1).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EapError> {
        if bytes.len() < EAP_HEADER_LEN {
            return Err(EapError::PacketTooShort {
                expected: EAP_HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let code = EapCode::from_u8(bytes[0]).ok_or(EapError::InvalidCode(bytes[0]))?;
        let identifier = bytes[1];
        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;

        if length < EAP_HEADER_LEN {
            return Err(EapError::InvalidLength(length));
        }
        if bytes.len() < length {
            return Err(EapError::PacketTooShort {
                expected: length,
                actual: bytes.len(),
            });
        }

        let (eap_type, data) = match code {
            EapCode::Request | EapCode::Response => {
                if length < EAP_TYPED_HEADER_LEN {
                    return Err(EapError::InvalidLength(length));
                }
                let eap_type = EapType::from_u8(bytes[4]);
                (Some(eap_type), bytes[EAP_TYPED_HEADER_LEN..length].to_vec())
            }
            // Success and Failure packets have no Type field
            EapCode::Success | EapCode::Failure => (None, Vec::new()),
        };

        Ok(EapPacket {
            code,
            identifier,
            eap_type,
            data,
        })
    }

    /// Encode EAP packet to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let length = self.length();
        let mut bytes = Vec::with_capacity(length);

        bytes.push(self.code.as_u8());
        bytes.push(self.identifier);
        bytes.extend_from_slice(&(length as u16).to_be_bytes());

        if let (EapCode::Request | EapCode::Response, Some(eap_type)) = (self.code, self.eap_type)
        {
            bytes.push(eap_type.as_u8());
            bytes.extend_from_slice(&self.data);
        }

        bytes
    }

    /// Get the total length of the packet
    pub fn length(&self) -> usize {
        match (self.code, self.eap_type) {
            (EapCode::Request | EapCode::Response, Some(_)) => {
                EAP_TYPED_HEADER_LEN + self.data.len()
            }
            _ => EAP_HEADER_LEN,
        }
    }

    /// True for a Request carrying the given type
    pub fn is_request_of(&self, eap_type: EapType) -> bool {
        self.code == EapCode::Request && self.eap_type == Some(eap_type)
    }
}

/// EAP-related errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EapError {
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid EAP code: {0}")]
    InvalidCode(u8),

    #[error("Invalid packet length: {0}")]
    InvalidLength(usize),

    #[error("Unexpected EAP type: {0}")]
    UnexpectedType(EapType),

    #[error("Invalid challenge length: {0}")]
    InvalidChallengeLength(usize),

    #[error("Invalid response format")]
    InvalidResponseFormat,
}

/// EAP-MD5 Challenge implementation (RFC 3748 Section 5.4)
///
/// Security Note: EAP-MD5 provides neither mutual authentication nor key
/// derivation. Inside an EAP-TTLS tunnel it is protected by TLS, which is
/// the only setting where a peer should offer it.
pub mod eap_md5 {
    use super::*;

    /// EAP-MD5 Response value size (16 bytes MD5 hash)
    pub const MD5_RESPONSE_SIZE: usize = 16;

    /// Parse an EAP-MD5 Challenge from packet data
    ///
    /// ```text
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// | Value-Size    | Value (Challenge) ...
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// | Name (optional) ...
    /// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    /// ```
    ///
    /// Returns (challenge_bytes, name)
    pub fn parse_challenge(packet: &EapPacket) -> Result<(Vec<u8>, Vec<u8>), EapError> {
        if packet.eap_type != Some(EapType::Md5Challenge) {
            return Err(EapError::InvalidResponseFormat);
        }

        let Some(&value_size) = packet.data.first() else {
            return Err(EapError::InvalidChallengeLength(0));
        };
        let value_size = value_size as usize;
        if value_size == 0 || packet.data.len() < 1 + value_size {
            return Err(EapError::InvalidChallengeLength(packet.data.len()));
        }

        let challenge = packet.data[1..1 + value_size].to_vec();
        let name = packet.data[1 + value_size..].to_vec();

        Ok((challenge, name))
    }

    /// Create an EAP-MD5 Response
    ///
    /// # Arguments
    /// * `identifier` - EAP packet identifier (must match challenge)
    /// * `response_hash` - MD5 hash of (identifier + password + challenge)
    /// * `name` - Peer identity
    pub fn create_response(identifier: u8, response_hash: &[u8; 16], name: &[u8]) -> EapPacket {
        let mut data = Vec::with_capacity(1 + MD5_RESPONSE_SIZE + name.len());
        data.push(MD5_RESPONSE_SIZE as u8);
        data.extend_from_slice(response_hash);
        data.extend_from_slice(name);

        EapPacket::response(identifier, EapType::Md5Challenge, data)
    }

    /// Compute MD5 hash for EAP-MD5 response
    ///
    /// Hash = MD5(Identifier + Password + Challenge)
    pub fn compute_response_hash(identifier: u8, password: &[u8], challenge: &[u8]) -> [u8; 16] {
        let mut data = Vec::with_capacity(1 + password.len() + challenge.len());
        data.push(identifier);
        data.extend_from_slice(password);
        data.extend_from_slice(challenge);

        md5::compute(&data).0
    }
}
