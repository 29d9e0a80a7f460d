//! MS-CHAP (RFC 2433) and MS-CHAPv2 (RFC 2759) algorithms
//!
//! Only the peer side computations are needed by a supplicant: the NT
//! response, the expected authenticator response used to verify the
//! server, and the RFC 3079 master key.

use des::Des;
use des::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use md4::Md4;
use sha1::{Digest, Sha1};
use thiserror::Error;

pub const CHALLENGE_LEN: usize = 16;
pub const MSCHAP_CHALLENGE_LEN: usize = 8;
pub const NT_RESPONSE_LEN: usize = 24;

/// "S=" followed by 40 hex digits
pub const AUTHENTICATOR_RESPONSE_LEN: usize = 42;

const MAGIC1: &[u8; 39] = b"Magic server to client signing constant";
const MAGIC2: &[u8; 41] = b"Pad to make it do more than one iteration";
const MASTER_KEY_MAGIC: &[u8; 27] = b"This is the MPPE Master Key";

/// Error codes carried in `E=` of a failure message (RFC 2759 Section 6)
pub const ERROR_RESTRICTED_LOGON_HOURS: u32 = 646;
pub const ERROR_ACCT_DISABLED: u32 = 647;
pub const ERROR_PASSWD_EXPIRED: u32 = 648;
pub const ERROR_NO_DIALIN_PERMISSION: u32 = 649;
pub const ERROR_AUTHENTICATION_FAILURE: u32 = 691;
pub const ERROR_CHANGING_PASSWORD: u32 = 709;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MsChapError {
    #[error("Malformed failure message: {0}")]
    MalformedFailure(String),
}

/// MD4 over the UTF-16LE encoding of the password
pub fn nt_password_hash(password: &str) -> [u8; 16] {
    let unicode: Vec<u8> = password
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    Md4::digest(&unicode).into()
}

pub fn hash_nt_password_hash(password_hash: &[u8; 16]) -> [u8; 16] {
    Md4::digest(password_hash).into()
}

/// Drop a leading `DOMAIN\` from a user name
pub fn strip_domain(username: &[u8]) -> &[u8] {
    match username.iter().rposition(|&b| b == b'\\') {
        Some(pos) => &username[pos + 1..],
        None => username,
    }
}

/// First 8 octets of SHA1(PeerChallenge + AuthenticatorChallenge + UserName)
pub fn challenge_hash(
    peer_challenge: &[u8; CHALLENGE_LEN],
    auth_challenge: &[u8; CHALLENGE_LEN],
    username: &[u8],
) -> [u8; MSCHAP_CHALLENGE_LEN] {
    let mut sha = Sha1::new();
    sha.update(peer_challenge);
    sha.update(auth_challenge);
    sha.update(strip_domain(username));
    let digest = sha.finalize();

    let mut out = [0u8; MSCHAP_CHALLENGE_LEN];
    out.copy_from_slice(&digest[..MSCHAP_CHALLENGE_LEN]);
    out
}

/// DES-encrypt one block with a 56-bit key
///
/// The key is spread over eight octets with odd parity in the low bit.
pub fn des_encrypt(key: &[u8; 7], block: &[u8; 8]) -> [u8; 8] {
    let mut expanded = [
        key[0],
        (key[0] << 7) | (key[1] >> 1),
        (key[1] << 6) | (key[2] >> 2),
        (key[2] << 5) | (key[3] >> 3),
        (key[3] << 4) | (key[4] >> 4),
        (key[4] << 3) | (key[5] >> 5),
        (key[5] << 2) | (key[6] >> 6),
        key[6] << 1,
    ];
    for byte in expanded.iter_mut() {
        *byte &= 0xFE;
        if byte.count_ones() % 2 == 0 {
            *byte |= 1;
        }
    }

    let cipher = Des::new(GenericArray::from_slice(&expanded));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

/// Three DES encryptions of the challenge keyed by the zero-padded hash
pub fn challenge_response(
    challenge: &[u8; MSCHAP_CHALLENGE_LEN],
    password_hash: &[u8; 16],
) -> [u8; NT_RESPONSE_LEN] {
    let mut padded = [0u8; 21];
    padded[..16].copy_from_slice(password_hash);

    let mut response = [0u8; NT_RESPONSE_LEN];
    for (i, chunk) in padded.chunks_exact(7).enumerate() {
        let mut key = [0u8; 7];
        key.copy_from_slice(chunk);
        response[i * 8..(i + 1) * 8].copy_from_slice(&des_encrypt(&key, challenge));
    }
    response
}

/// MS-CHAP (v1) NT response
pub fn mschap_nt_response(
    challenge: &[u8; MSCHAP_CHALLENGE_LEN],
    password: &str,
) -> [u8; NT_RESPONSE_LEN] {
    challenge_response(challenge, &nt_password_hash(password))
}

/// MS-CHAPv2 GenerateNTResponse
pub fn generate_nt_response(
    auth_challenge: &[u8; CHALLENGE_LEN],
    peer_challenge: &[u8; CHALLENGE_LEN],
    username: &[u8],
    password: &str,
) -> [u8; NT_RESPONSE_LEN] {
    let challenge = challenge_hash(peer_challenge, auth_challenge, username);
    challenge_response(&challenge, &nt_password_hash(password))
}

/// MS-CHAPv2 GenerateAuthenticatorResponse, formatted as `S=` + 40 upper-case hex digits
pub fn generate_authenticator_response(
    password: &str,
    nt_response: &[u8; NT_RESPONSE_LEN],
    peer_challenge: &[u8; CHALLENGE_LEN],
    auth_challenge: &[u8; CHALLENGE_LEN],
    username: &[u8],
) -> String {
    let password_hash_hash = hash_nt_password_hash(&nt_password_hash(password));

    let mut sha = Sha1::new();
    sha.update(password_hash_hash);
    sha.update(nt_response);
    sha.update(MAGIC1);
    let digest = sha.finalize();

    let challenge = challenge_hash(peer_challenge, auth_challenge, username);
    let mut sha = Sha1::new();
    sha.update(digest);
    sha.update(challenge);
    sha.update(MAGIC2);

    format!("S={}", hex::encode_upper(sha.finalize()))
}

/// Compare a received authenticator response with the expected one
///
/// Only the first 42 characters are compared; servers append ` M=...`.
/// Hex digits are compared case-insensitively.
pub fn check_authenticator_response(expected: &str, received: &[u8]) -> bool {
    received.len() >= AUTHENTICATOR_RESPONSE_LEN
        && expected.len() == AUTHENTICATOR_RESPONSE_LEN
        && received[..AUTHENTICATOR_RESPONSE_LEN].eq_ignore_ascii_case(expected.as_bytes())
}

/// RFC 3079 GetMasterKey
pub fn get_master_key(
    password_hash_hash: &[u8; 16],
    nt_response: &[u8; NT_RESPONSE_LEN],
) -> [u8; 16] {
    let mut sha = Sha1::new();
    sha.update(password_hash_hash);
    sha.update(nt_response);
    sha.update(MASTER_KEY_MAGIC);
    let digest = sha.finalize();

    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// Random 16-octet peer challenge
pub fn generate_peer_challenge() -> [u8; CHALLENGE_LEN] {
    rand::random()
}

/// Parsed `E=eeeeeeeeee R=r C=cccc V=vvvv M=<msg>` failure text
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MsChapFailure {
    pub error_code: u32,
    pub retry: bool,
    pub challenge: Option<[u8; CHALLENGE_LEN]>,
    pub version: Option<u32>,
    pub message: Option<String>,
}

impl MsChapFailure {
    pub fn is_password_expired(&self) -> bool {
        self.error_code == ERROR_PASSWD_EXPIRED
    }
}

/// Parse a failure message
///
/// `M=` always comes last and may contain spaces. Unknown fields are
/// ignored; a missing or non-numeric `E=` is an error.
pub fn parse_failure_message(text: &[u8]) -> Result<MsChapFailure, MsChapError> {
    let text = String::from_utf8_lossy(text);
    let text = text.trim_end_matches('\0');

    let (fields, message) = match text.find("M=") {
        Some(pos) => (&text[..pos], Some(text[pos + 2..].to_string())),
        None => (text, None),
    };

    let mut failure = MsChapFailure {
        message,
        ..Default::default()
    };
    let mut saw_error = false;

    for field in fields.split_whitespace() {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key {
            "E" => {
                failure.error_code = value
                    .parse()
                    .map_err(|_| MsChapError::MalformedFailure(text.to_string()))?;
                saw_error = true;
            }
            "R" => failure.retry = value == "1",
            "C" => {
                let mut challenge = [0u8; CHALLENGE_LEN];
                if hex::decode_to_slice(value, &mut challenge).is_ok() {
                    failure.challenge = Some(challenge);
                }
            }
            "V" => failure.version = value.parse().ok(),
            _ => {}
        }
    }

    if !saw_error {
        return Err(MsChapError::MalformedFailure(text.to_string()));
    }
    Ok(failure)
}
