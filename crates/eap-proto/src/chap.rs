//! CHAP (Challenge-Handshake Authentication Protocol) Support
//!
//! EAP-TTLS CHAP (RFC 5281 Section 11.2.2) reuses the RADIUS CHAP-Password
//! layout from RFC 2865 Section 5.3; the challenge and identifier are not
//! sent by the server but exported from the TLS session by both sides.

/// Length of an encoded CHAP-Password value
pub const CHAP_PASSWORD_LEN: usize = 17;

/// CHAP response structure
///
/// A CHAP response consists of:
/// - CHAP Identifier (1 byte)
/// - CHAP Response (16 bytes MD5 hash)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapResponse {
    /// CHAP identifier (must match the challenge)
    pub ident: u8,
    /// MD5 hash of (ident + password + challenge)
    pub response: [u8; 16],
}

impl ChapResponse {
    /// Compute the response for a challenge
    pub fn compute(ident: u8, password: &[u8], challenge: &[u8]) -> Self {
        ChapResponse {
            ident,
            response: compute_chap_response(ident, password, challenge),
        }
    }

    /// Parse a CHAP-Password value (exactly 17 bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChapError> {
        if bytes.len() != CHAP_PASSWORD_LEN {
            return Err(ChapError::InvalidLength(bytes.len()));
        }

        let ident = bytes[0];
        let mut response = [0u8; 16];
        response.copy_from_slice(&bytes[1..CHAP_PASSWORD_LEN]);

        Ok(ChapResponse { ident, response })
    }

    /// Convert CHAP response to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(CHAP_PASSWORD_LEN);
        bytes.push(self.ident);
        bytes.extend_from_slice(&self.response);
        bytes
    }
}

/// Compute the CHAP response
///
/// MD5(CHAP_Identifier + Password + Challenge)
pub fn compute_chap_response(ident: u8, password: &[u8], challenge: &[u8]) -> [u8; 16] {
    let mut data = Vec::with_capacity(1 + password.len() + challenge.len());
    data.push(ident);
    data.extend_from_slice(password);
    data.extend_from_slice(challenge);

    md5::compute(&data).0
}

/// Verify a CHAP response against a known password
pub fn verify_chap_response(chap_response: &ChapResponse, password: &[u8], challenge: &[u8]) -> bool {
    let expected = compute_chap_response(chap_response.ident, password, challenge);
    chap_response.response == expected
}

/// CHAP-specific errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChapError {
    #[error("Invalid CHAP-Password length: expected 17 bytes, got {0}")]
    InvalidLength(usize),
}
