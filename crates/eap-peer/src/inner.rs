//! Authentication inside the EAP-TTLS tunnel (RFC 5281 Section 11)
//!
//! PAP, CHAP, MS-CHAP and MS-CHAPv2 are single AVP exchanges built here.
//! CHAP-style challenges are not sent by the server; both sides export
//! them from the TLS session with the `ttls challenge` label. Nested EAP
//! is handed to the [`NestedEapMultiplexer`].

use crate::config::InnerAuthType;
use crate::credentials::Credentials;
use crate::engine::{TlsEngine, TlsEngineError};
use crate::method::MethodRegistry;
use crate::nested::{NestedEapError, NestedEapMultiplexer};
use crate::status::{ClientStatus, PropertyKey, TunnelStep};
use eap_proto::chap::ChapResponse;
use eap_proto::diameter::{self, Avp, AvpCode, AvpError};
use eap_proto::mschap::{self, CHALLENGE_LEN, MSCHAP_CHALLENGE_LEN, NT_RESPONSE_LEN};
use eap_proto::EapType;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Label for exporting CHAP-style challenges from the tunnel
pub const CHALLENGE_LABEL: &str = "ttls challenge";

/// MS-CHAP-Response flag: use the NT response
const MSCHAP_USE_NT: u8 = 1;

const PAP_BLOCK_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum InnerAuthError {
    #[error("AVP error: {0}")]
    Avp(#[from] AvpError),
    #[error("Challenge export failed: {0}")]
    KeyExport(#[from] TlsEngineError),
    #[error("Nested EAP error: {0}")]
    Nested(#[from] NestedEapError),
    #[error("Exported {actual} challenge bytes, expected {expected}")]
    ShortChallenge { expected: usize, actual: usize },
    #[error("MS-CHAP2-Success ident {received} does not match {expected}")]
    IdentMismatch { expected: u8, received: u8 },
}

impl InnerAuthError {
    /// Numeric code reported as the session's last error
    pub fn code(&self) -> u32 {
        match self {
            InnerAuthError::Avp(_) => 0x301,
            InnerAuthError::KeyExport(e) => e.code(),
            InnerAuthError::Nested(_) => 0x302,
            InnerAuthError::ShortChallenge { .. } => 0x303,
            InnerAuthError::IdentMismatch { .. } => 0x304,
        }
    }
}

struct MsChapV2Context {
    auth_challenge: [u8; CHALLENGE_LEN],
    ident: u8,
    peer_challenge: [u8; CHALLENGE_LEN],
    nt_response: [u8; NT_RESPONSE_LEN],
}

pub struct InnerAuthEngine {
    auth_type: InnerAuthType,
    credentials: Credentials,
    started: bool,
    verified: bool,
    mschapv2: Option<MsChapV2Context>,
    nested: Option<NestedEapMultiplexer>,
}

impl InnerAuthEngine {
    pub fn new(
        auth_type: InnerAuthType,
        credentials: Credentials,
        registry: MethodRegistry,
        candidates: Vec<EapType>,
    ) -> Self {
        let nested = (auth_type == InnerAuthType::Eap)
            .then(|| NestedEapMultiplexer::new(registry, credentials.clone(), candidates));
        InnerAuthEngine {
            auth_type,
            credentials,
            started: false,
            verified: false,
            mschapv2: None,
            nested,
        }
    }

    pub fn auth_type(&self) -> InnerAuthType {
        self.auth_type
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// First tunnel write after the handshake
    pub fn start<E: TlsEngine>(&mut self, engine: &E) -> Result<TunnelStep, InnerAuthError> {
        if self.auth_type.requires_password() && self.credentials.password.is_none() {
            return Ok(TunnelStep::input_required());
        }

        let username = self.credentials.username.as_bytes();
        let password = self.credentials.password.as_deref().unwrap_or_default();

        let step = match self.auth_type {
            InnerAuthType::None => TunnelStep::ack(),
            InnerAuthType::Pap => TunnelStep::write(diameter::encode_all(&[
                Avp::new(AvpCode::USER_NAME, username.to_vec()),
                Avp::new(AvpCode::USER_PASSWORD, pad_password(password.as_bytes())),
            ])?),
            InnerAuthType::Chap => {
                let exported = export_challenge(engine, CHALLENGE_LEN + 1)?;
                let (challenge, ident) = exported.split_at(CHALLENGE_LEN);
                let response = ChapResponse::compute(ident[0], password.as_bytes(), challenge);
                TunnelStep::write(diameter::encode_all(&[
                    Avp::new(AvpCode::USER_NAME, username.to_vec()),
                    Avp::new(AvpCode::CHAP_CHALLENGE, challenge.to_vec()),
                    Avp::new(AvpCode::CHAP_PASSWORD, response.to_bytes()),
                ])?)
            }
            InnerAuthType::MsChap => {
                let exported = export_challenge(engine, MSCHAP_CHALLENGE_LEN + 1)?;
                let mut challenge = [0u8; MSCHAP_CHALLENGE_LEN];
                challenge.copy_from_slice(&exported[..MSCHAP_CHALLENGE_LEN]);
                let ident = exported[MSCHAP_CHALLENGE_LEN];

                let mut response = Vec::with_capacity(2 + 2 * NT_RESPONSE_LEN);
                response.push(ident);
                response.push(MSCHAP_USE_NT);
                response.extend_from_slice(&[0u8; NT_RESPONSE_LEN]);
                response.extend_from_slice(&mschap::mschap_nt_response(&challenge, password));

                TunnelStep::write(diameter::encode_all(&[
                    Avp::new(AvpCode::USER_NAME, username.to_vec()),
                    Avp::new(AvpCode::MS_CHAP_CHALLENGE, challenge.to_vec()),
                    Avp::new(AvpCode::MS_CHAP_RESPONSE, response),
                ])?)
            }
            InnerAuthType::MsChapV2 => {
                let exported = export_challenge(engine, CHALLENGE_LEN + 1)?;
                let mut auth_challenge = [0u8; CHALLENGE_LEN];
                auth_challenge.copy_from_slice(&exported[..CHALLENGE_LEN]);
                let ident = exported[CHALLENGE_LEN];
                let peer_challenge = mschap::generate_peer_challenge();
                let nt_response = mschap::generate_nt_response(
                    &auth_challenge,
                    &peer_challenge,
                    username,
                    password,
                );

                let mut response = Vec::with_capacity(2 + CHALLENGE_LEN + 8 + NT_RESPONSE_LEN);
                response.push(ident);
                response.push(0);
                response.extend_from_slice(&peer_challenge);
                response.extend_from_slice(&[0u8; 8]);
                response.extend_from_slice(&nt_response);

                let bytes = diameter::encode_all(&[
                    Avp::new(AvpCode::USER_NAME, username.to_vec()),
                    Avp::new(AvpCode::MS_CHAP_CHALLENGE, auth_challenge.to_vec()),
                    Avp::new(AvpCode::MS_CHAP2_RESPONSE, response),
                ])?;
                self.mschapv2 = Some(MsChapV2Context {
                    auth_challenge,
                    ident,
                    peer_challenge,
                    nt_response,
                });
                TunnelStep::write(bytes)
            }
            InnerAuthType::Eap => match self.nested.as_mut() {
                Some(nested) => nested.start()?,
                None => TunnelStep::failure(None, ClientStatus::Failed),
            },
        };

        if step.status != ClientStatus::UserInputRequired {
            self.started = true;
            debug!(auth_type = ?self.auth_type, "inner authentication started");
        }
        Ok(step)
    }

    /// Handle decrypted tunnel data from the server
    ///
    /// On a resumed session the inner exchange was skipped; it starts here
    /// once the server sends something through the tunnel.
    pub fn process<E: TlsEngine>(
        &mut self,
        engine: &E,
        data: &[u8],
    ) -> Result<TunnelStep, InnerAuthError> {
        if !self.started {
            if self.auth_type == InnerAuthType::Eap {
                // The server opens nested EAP itself; answer its request
                self.started = true;
            } else {
                info!("inner authentication run on demand");
                return self.start(engine);
            }
        }

        match self.auth_type {
            InnerAuthType::Eap => match self.nested.as_mut() {
                Some(nested) => Ok(nested.process(data)?),
                None => Ok(TunnelStep::failure(None, ClientStatus::Failed)),
            },
            InnerAuthType::MsChapV2 => self.on_mschapv2_result(data),
            _ => {
                let avps = diameter::decode_all(data)?;
                if let Some(error) = avps.iter().find(|a| a.key() == AvpCode::MS_CHAP_ERROR) {
                    return Ok(ms_chap_error(&error.payload));
                }
                log_reply_messages(&avps);
                Ok(TunnelStep::ack())
            }
        }
    }

    fn on_mschapv2_result(&mut self, data: &[u8]) -> Result<TunnelStep, InnerAuthError> {
        let avps = diameter::decode_all(data)?;
        log_reply_messages(&avps);

        if let Some(error) = avps.iter().find(|a| a.key() == AvpCode::MS_CHAP_ERROR) {
            return Ok(ms_chap_error(&error.payload));
        }

        let success = avps
            .iter()
            .find(|a| a.key() == AvpCode::MS_CHAP2_SUCCESS)
            .ok_or(AvpError::Missing(AvpCode::MS_CHAP2_SUCCESS))?;
        let (Some(context), Some(password)) = (&self.mschapv2, &self.credentials.password) else {
            return Ok(TunnelStep::failure(None, ClientStatus::Failed));
        };

        let Some((&received, authenticator)) = success.payload.split_first() else {
            return Err(AvpError::Truncated {
                needed: 1,
                available: 0,
            }
            .into());
        };
        if received != context.ident {
            return Err(InnerAuthError::IdentMismatch {
                expected: context.ident,
                received,
            });
        }

        let expected = mschap::generate_authenticator_response(
            password,
            &context.nt_response,
            &context.peer_challenge,
            &context.auth_challenge,
            self.credentials.username.as_bytes(),
        );
        if !mschap::check_authenticator_response(&expected, authenticator) {
            warn!("MS-CHAP2-Success authenticator response mismatch");
            return Ok(TunnelStep::failure(
                None,
                ClientStatus::InnerAuthVerificationFailed,
            ));
        }

        info!("MS-CHAPv2 server verified");
        self.verified = true;
        Ok(TunnelStep::ack())
    }

    /// Decide whether an outer EAP Success may be accepted
    pub fn accept_success(&mut self, identifier: u8, resumed: bool) -> Result<(), ClientStatus> {
        if !self.started {
            return if resumed || self.auth_type == InnerAuthType::None {
                Ok(())
            } else {
                Err(ClientStatus::Failed)
            };
        }
        match self.auth_type {
            InnerAuthType::MsChapV2 if !self.verified => {
                Err(ClientStatus::InnerAuthVerificationFailed)
            }
            InnerAuthType::Eap => match self.nested.as_mut() {
                Some(nested) => nested.accept_success(identifier),
                None => Err(ClientStatus::Failed),
            },
            _ => Ok(()),
        }
    }

    pub fn update_credentials(&mut self, credentials: &Credentials) {
        if credentials.password.is_some() {
            self.credentials.password = credentials.password.clone();
        }
        if let Some(nested) = self.nested.as_mut() {
            nested.update_credentials(&self.credentials);
        }
    }

    pub fn require_properties(&self) -> Vec<PropertyKey> {
        if self.auth_type.requires_password() && self.credentials.password.is_none() {
            return vec![PropertyKey::UserPassword];
        }
        self.nested
            .as_ref()
            .map(NestedEapMultiplexer::require_properties)
            .unwrap_or_default()
    }

    /// Type of the nested EAP method in use, if any
    pub fn nested_type(&self) -> Option<EapType> {
        self.nested.as_ref().and_then(NestedEapMultiplexer::active_type)
    }

    /// Key produced by the nested method, e.g. the MS-CHAPv2 master key
    pub fn nested_session_key(&self) -> Option<Vec<u8>> {
        self.nested.as_ref().and_then(NestedEapMultiplexer::session_key)
    }
}

fn export_challenge<E: TlsEngine>(engine: &E, len: usize) -> Result<Vec<u8>, InnerAuthError> {
    let exported = engine.export_key_material(CHALLENGE_LABEL, len)?;
    if exported.len() != len {
        return Err(InnerAuthError::ShortChallenge {
            expected: len,
            actual: exported.len(),
        });
    }
    Ok(exported)
}

/// Zero pad to a multiple of 16 octets, at least 16
fn pad_password(password: &[u8]) -> Vec<u8> {
    let blocks = password.len().div_ceil(PAP_BLOCK_LEN).max(1);
    let mut padded = password.to_vec();
    padded.resize(blocks * PAP_BLOCK_LEN, 0);
    padded
}

fn ms_chap_error(payload: &[u8]) -> TunnelStep {
    // First octet is the ident
    let text = payload.get(1..).unwrap_or_default();
    let status = match mschap::parse_failure_message(text) {
        Ok(failure) if failure.is_password_expired() => ClientStatus::PasswordExpired,
        Ok(failure) => {
            info!(code = failure.error_code, retry = failure.retry, "MS-CHAP error");
            ClientStatus::Failed
        }
        Err(e) => {
            warn!(error = %e, "unparseable MS-CHAP-Error");
            ClientStatus::Failed
        }
    };
    TunnelStep::failure(None, status)
}

fn log_reply_messages(avps: &[Avp]) {
    for avp in avps.iter().filter(|a| a.key() == AvpCode::REPLY_MESSAGE) {
        info!(message = %String::from_utf8_lossy(&avp.payload), "Reply-Message");
    }
}
