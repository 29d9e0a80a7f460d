//! EAP-GTC (RFC 3748 Section 5.6)
//!
//! The request text is a prompt; the response carries the password.

use crate::credentials::Credentials;
use crate::method::EapMethod;
use crate::status::{ClientStatus, PropertyKey, Step};
use eap_proto::{EapPacket, EapType};
use tracing::debug;

pub struct GtcMethod {
    password: Option<String>,
    answered: bool,
}

impl GtcMethod {
    pub fn new(credentials: &Credentials) -> Self {
        GtcMethod {
            password: credentials.password.clone(),
            answered: false,
        }
    }
}

impl EapMethod for GtcMethod {
    fn eap_type(&self) -> EapType {
        EapType::GenericTokenCard
    }

    fn process(&mut self, packet: &EapPacket) -> Step {
        if let Some(step) = super::finish(packet, self.answered) {
            return step;
        }
        if !packet.is_request_of(EapType::GenericTokenCard) {
            return Step::failure(None, ClientStatus::Failed);
        }

        let Some(password) = &self.password else {
            return Step::input_required(None);
        };

        debug!(prompt = %String::from_utf8_lossy(&packet.data), "GTC prompt answered");
        self.answered = true;
        Step::running(Some(EapPacket::response(
            packet.identifier,
            EapType::GenericTokenCard,
            password.as_bytes().to_vec(),
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
