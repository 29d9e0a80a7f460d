//! EAP-MSCHAPv2 with server authenticator verification

use crate::credentials::Credentials;
use crate::method::EapMethod;
use crate::status::{ClientStatus, PropertyKey, Step};
use eap_proto::eap::eap_mschapv2::{self, MsChapV2Request};
use eap_proto::mschap;
use eap_proto::{EapCode, EapPacket, EapType};
use tracing::{debug, info, warn};

struct Exchange {
    auth_challenge: [u8; mschap::CHALLENGE_LEN],
    peer_challenge: [u8; mschap::CHALLENGE_LEN],
    nt_response: [u8; mschap::NT_RESPONSE_LEN],
}

pub struct MsChapV2Method {
    username: String,
    password: Option<String>,
    exchange: Option<Exchange>,
    verified: bool,
}

impl MsChapV2Method {
    pub fn new(credentials: &Credentials) -> Self {
        MsChapV2Method {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            exchange: None,
            verified: false,
        }
    }

    fn on_challenge(
        &mut self,
        identifier: u8,
        ms_id: u8,
        auth_challenge: [u8; mschap::CHALLENGE_LEN],
    ) -> Step {
        let Some(password) = &self.password else {
            return Step::input_required(None);
        };

        let peer_challenge = mschap::generate_peer_challenge();
        let nt_response = mschap::generate_nt_response(
            &auth_challenge,
            &peer_challenge,
            self.username.as_bytes(),
            password,
        );
        self.exchange = Some(Exchange {
            auth_challenge,
            peer_challenge,
            nt_response,
        });
        self.verified = false;

        debug!(ms_id, "EAP-MSCHAPv2 challenge answered");
        Step::running(Some(eap_mschapv2::create_response(
            identifier,
            ms_id,
            &peer_challenge,
            &nt_response,
            self.username.as_bytes(),
        )))
    }

    fn on_success(&mut self, identifier: u8, message: &str) -> Step {
        let (Some(exchange), Some(password)) = (&self.exchange, &self.password) else {
            return Step::failure(None, ClientStatus::Failed);
        };

        let expected = mschap::generate_authenticator_response(
            password,
            &exchange.nt_response,
            &exchange.peer_challenge,
            &exchange.auth_challenge,
            self.username.as_bytes(),
        );
        if !mschap::check_authenticator_response(&expected, message.as_bytes()) {
            warn!("EAP-MSCHAPv2 authenticator response mismatch");
            return Step::failure(None, ClientStatus::InnerAuthVerificationFailed);
        }

        info!("EAP-MSCHAPv2 server verified");
        self.verified = true;
        Step::running(Some(eap_mschapv2::create_success_response(identifier)))
    }

    fn on_failure(&mut self, identifier: u8, message: &str) -> Step {
        let status = match mschap::parse_failure_message(message.as_bytes()) {
            Ok(failure) if failure.is_password_expired() => ClientStatus::PasswordExpired,
            Ok(failure) => {
                info!(code = failure.error_code, "EAP-MSCHAPv2 failure");
                ClientStatus::Failed
            }
            Err(_) => ClientStatus::Failed,
        };
        Step::failure(
            Some(eap_mschapv2::create_failure_response(identifier)),
            status,
        )
    }
}

impl EapMethod for MsChapV2Method {
    fn eap_type(&self) -> EapType {
        EapType::MsChapV2
    }

    fn process(&mut self, packet: &EapPacket) -> Step {
        match packet.code {
            EapCode::Success if self.verified => return Step::success(None),
            EapCode::Success => {
                return Step::failure(None, ClientStatus::InnerAuthVerificationFailed);
            }
            EapCode::Failure => return Step::failure(None, ClientStatus::Failed),
            _ => {}
        }

        match eap_mschapv2::parse_request(packet) {
            Ok(MsChapV2Request::Challenge {
                ms_id, challenge, ..
            }) => self.on_challenge(packet.identifier, ms_id, challenge),
            Ok(MsChapV2Request::Success { message, .. }) => {
                self.on_success(packet.identifier, &message)
            }
            Ok(MsChapV2Request::Failure { message, .. }) => {
                self.on_failure(packet.identifier, &message)
            }
            Err(e) => {
                warn!(error = %e, "malformed EAP-MSCHAPv2 request");
                Step::failure(None, ClientStatus::Failed)
            }
        }
    }

    fn require_properties(&self) -> Vec<PropertyKey> {
        if self.password.is_none() {
            vec![PropertyKey::UserPassword]
        } else {
            Vec::new()
        }
    }

    /// RFC 3079 master key once the server has been verified
    fn session_key(&self) -> Option<Vec<u8>> {
        if !self.verified {
            return None;
        }
        let exchange = self.exchange.as_ref()?;
        let password = self.password.as_deref()?;
        let hash_hash = mschap::hash_nt_password_hash(&mschap::nt_password_hash(password));
        Some(mschap::get_master_key(&hash_hash, &exchange.nt_response).to_vec())
    }

    fn update_credentials(&mut self, credentials: &Credentials) {
        if credentials.password.is_some() {
            self.password = credentials.password.clone();
        }
    }
}
