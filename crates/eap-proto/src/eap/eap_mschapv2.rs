//! EAP-MSCHAPv2 packet layout (draft-kamath-pppext-eap-mschapv2)
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    OpCode     |  MS-CHAPv2-ID |           MS-Length           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Value-Size   |  Value ...  Name ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Success and Failure requests carry a text message instead of a value;
//! the matching responses are a single OpCode octet.

use super::{EapError, EapPacket, EapType};

pub const CHALLENGE_LEN: usize = 16;
pub const NT_RESPONSE_LEN: usize = 24;

/// Value-Size of a Response: peer challenge + reserved + NT response + flags
pub const RESPONSE_VALUE_LEN: u8 = 49;

const MS_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Challenge = 1,
    Response = 2,
    Success = 3,
    Failure = 4,
    ChangePassword = 7,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(OpCode::Challenge),
            2 => Some(OpCode::Response),
            3 => Some(OpCode::Success),
            4 => Some(OpCode::Failure),
            7 => Some(OpCode::ChangePassword),
            _ => None,
        }
    }
}

/// A parsed server request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsChapV2Request {
    Challenge {
        ms_id: u8,
        challenge: [u8; CHALLENGE_LEN],
        name: Vec<u8>,
    },
    /// Message text, e.g. `S=<40 hex> M=Welcome`
    Success { ms_id: u8, message: String },
    /// Message text, e.g. `E=691 R=0 C=<32 hex> V=3 M=...`
    Failure { ms_id: u8, message: String },
}

/// Parse the Type-Data of an EAP-MSCHAPv2 Request
pub fn parse_request(packet: &EapPacket) -> Result<MsChapV2Request, EapError> {
    if packet.eap_type != Some(EapType::MsChapV2) {
        return Err(EapError::InvalidResponseFormat);
    }
    let data = &packet.data;
    if data.len() < MS_HEADER_LEN {
        return Err(EapError::PacketTooShort {
            expected: MS_HEADER_LEN,
            actual: data.len(),
        });
    }

    let ms_id = data[1];
    let ms_length = u16::from_be_bytes([data[2], data[3]]) as usize;
    // Some servers send a stale MS-Length; trust the EAP length instead
    let body_end = if (MS_HEADER_LEN..=data.len()).contains(&ms_length) {
        ms_length
    } else {
        data.len()
    };

    match OpCode::from_u8(data[0]) {
        Some(OpCode::Challenge) => {
            let value_size = *data.get(4).ok_or(EapError::InvalidChallengeLength(0))? as usize;
            if value_size != CHALLENGE_LEN || body_end < 5 + CHALLENGE_LEN {
                return Err(EapError::InvalidChallengeLength(value_size));
            }
            let mut challenge = [0u8; CHALLENGE_LEN];
            challenge.copy_from_slice(&data[5..5 + CHALLENGE_LEN]);
            Ok(MsChapV2Request::Challenge {
                ms_id,
                challenge,
                name: data[5 + CHALLENGE_LEN..body_end].to_vec(),
            })
        }
        Some(OpCode::Success) => Ok(MsChapV2Request::Success {
            ms_id,
            message: String::from_utf8_lossy(&data[MS_HEADER_LEN..body_end]).into_owned(),
        }),
        Some(OpCode::Failure) => Ok(MsChapV2Request::Failure {
            ms_id,
            message: String::from_utf8_lossy(&data[MS_HEADER_LEN..body_end]).into_owned(),
        }),
        _ => Err(EapError::InvalidResponseFormat),
    }
}

/// Build the Response to a Challenge
pub fn create_response(
    identifier: u8,
    ms_id: u8,
    peer_challenge: &[u8; CHALLENGE_LEN],
    nt_response: &[u8; NT_RESPONSE_LEN],
    name: &[u8],
) -> EapPacket {
    let ms_length = (MS_HEADER_LEN + 1 + RESPONSE_VALUE_LEN as usize + name.len()) as u16;

    let mut data = Vec::with_capacity(ms_length as usize);
    data.push(OpCode::Response as u8);
    data.push(ms_id);
    data.extend_from_slice(&ms_length.to_be_bytes());
    data.push(RESPONSE_VALUE_LEN);
    data.extend_from_slice(peer_challenge);
    data.extend_from_slice(&[0u8; 8]); // Reserved
    data.extend_from_slice(nt_response);
    data.push(0); // Flags
    data.extend_from_slice(name);

    EapPacket::response(identifier, EapType::MsChapV2, data)
}

/// Acknowledge a Success request
pub fn create_success_response(identifier: u8) -> EapPacket {
    EapPacket::response(identifier, EapType::MsChapV2, vec![OpCode::Success as u8])
}

/// Acknowledge a Failure request
pub fn create_failure_response(identifier: u8) -> EapPacket {
    EapPacket::response(identifier, EapType::MsChapV2, vec![OpCode::Failure as u8])
}

/// Build a Challenge request; used by test servers
pub fn create_challenge(
    identifier: u8,
    ms_id: u8,
    challenge: &[u8; CHALLENGE_LEN],
    name: &[u8],
) -> EapPacket {
    let ms_length = (MS_HEADER_LEN + 1 + CHALLENGE_LEN + name.len()) as u16;
    let mut data = Vec::with_capacity(ms_length as usize);
    data.push(OpCode::Challenge as u8);
    data.push(ms_id);
    data.extend_from_slice(&ms_length.to_be_bytes());
    data.push(CHALLENGE_LEN as u8);
    data.extend_from_slice(challenge);
    data.extend_from_slice(name);
    EapPacket::request(identifier, EapType::MsChapV2, data)
}

/// Build a Success or Failure request carrying a message; used by test servers
pub fn create_message_request(identifier: u8, op: OpCode, ms_id: u8, message: &str) -> EapPacket {
    let ms_length = (MS_HEADER_LEN + message.len()) as u16;
    let mut data = Vec::with_capacity(ms_length as usize);
    data.push(op as u8);
    data.push(ms_id);
    data.extend_from_slice(&ms_length.to_be_bytes());
    data.extend_from_slice(message.as_bytes());
    EapPacket::request(identifier, EapType::MsChapV2, data)
}

/// Split a parsed Response back into (ms_id, peer challenge, NT response, name)
pub fn parse_response(
    packet: &EapPacket,
) -> Result<(u8, [u8; CHALLENGE_LEN], [u8; NT_RESPONSE_LEN], Vec<u8>), EapError> {
    let data = &packet.data;
    let value_end = MS_HEADER_LEN + 1 + RESPONSE_VALUE_LEN as usize;
    if data.len() < value_end || data[0] != OpCode::Response as u8 {
        return Err(EapError::InvalidResponseFormat);
    }
    let mut peer_challenge = [0u8; CHALLENGE_LEN];
    peer_challenge.copy_from_slice(&data[5..21]);
    let mut nt_response = [0u8; NT_RESPONSE_LEN];
    nt_response.copy_from_slice(&data[29..53]);
    Ok((data[1], peer_challenge, nt_response, data[value_end..].to_vec()))
}
