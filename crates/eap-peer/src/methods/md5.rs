use crate::credentials::Credentials;
use crate::method::EapMethod;
use crate::status::{ClientStatus, PropertyKey, Step};
use eap_proto::eap::eap_md5;
use eap_proto::{EapPacket, EapType};
use tracing::warn;

/// EAP-MD5-Challenge (RFC 3748 Section 5.4)
pub struct Md5Method {
    username: String,
    password: Option<String>,
    answered: bool,
}

impl Md5Method {
    pub fn new(credentials: &Credentials) -> Self {
        Md5Method {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            answered: false,
        }
    }
}

impl EapMethod for Md5Method {
    fn eap_type(&self) -> EapType {
        EapType::Md5Challenge
    }

    fn process(&mut self, packet: &EapPacket) -> Step {
        if let Some(step) = super::finish(packet, self.answered) {
            return step;
        }

        let challenge = match eap_md5::parse_challenge(packet) {
            Ok((challenge, _name)) => challenge,
            Err(e) => {
                warn!(error = %e, "malformed MD5 challenge");
                return Step::failure(None, ClientStatus::Failed);
            }
        };

        let Some(password) = &self.password else {
            return Step::input_required(None);
        };

        let hash =
            eap_md5::compute_response_hash(packet.identifier, password.as_bytes(), &challenge);
        self.answered = true;
        Step::running(Some(eap_md5::create_response(
            packet.identifier,
            &hash,
            self.username.as_bytes(),
        )))
    }

    fn require_properties(&self) -> Vec<PropertyKey> {
        if self.password.is_none() {
            vec![PropertyKey::UserPassword]
        } else {
            Vec::new()
        }
    }

    fn update_credentials(&mut self, credentials: &Credentials) {
        if credentials.password.is_some() {
            self.password = credentials.password.clone();
        }
    }
}
