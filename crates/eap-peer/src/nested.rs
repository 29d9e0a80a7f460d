//! Secondary EAP conversation carried in EAP-Message AVPs
//!
//! The multiplexer answers Identity and Notification itself, negotiates a
//! method from an ordered candidate list with NAKs and forwards everything
//! else to the active method.

use crate::credentials::Credentials;
use crate::method::{EapMethod, MethodRegistry};
use crate::status::{ClientState, ClientStatus, Step, TunnelStep};
use eap_proto::diameter::{self, AvpCode, AvpError, AvpReader};
use eap_proto::{EapCode, EapError, EapPacket, EapType};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NestedEapError {
    #[error("AVP error: {0}")]
    Avp(#[from] AvpError),
    #[error("Invalid nested EAP packet: {0}")]
    Packet(#[from] EapError),
    #[error("Unexpected nested EAP {0:?} from server")]
    UnexpectedCode(EapCode),
}

pub struct NestedEapMultiplexer {
    registry: MethodRegistry,
    credentials: Credentials,
    candidates: Vec<EapType>,
    index: usize,
    last_offered: Option<EapType>,
    active: Option<Box<dyn EapMethod + Send>>,
    last_identifier: Option<u8>,
    last_response: Option<Vec<u8>>,
}

impl NestedEapMultiplexer {
    pub fn new(registry: MethodRegistry, credentials: Credentials, candidates: Vec<EapType>) -> Self {
        NestedEapMultiplexer {
            registry,
            credentials,
            candidates,
            index: 0,
            last_offered: None,
            active: None,
            last_identifier: None,
            last_response: None,
        }
    }

    /// First tunnel write: Response/Identity with identifier 0
    pub fn start(&mut self) -> Result<TunnelStep, NestedEapError> {
        let identity = EapPacket::identity_response(0, self.credentials.username.as_bytes());
        Ok(TunnelStep::write(wrap(&identity)?))
    }

    /// Handle the AVPs of one tunnel frame
    pub fn process(&mut self, data: &[u8]) -> Result<TunnelStep, NestedEapError> {
        let avp = AvpReader::new(data).decode_for_code(AvpCode::EAP_MESSAGE)?;
        let packet = EapPacket::from_bytes(&avp.payload)?;

        if let (Some(last), Some(response)) = (self.last_identifier, &self.last_response) {
            if last == packet.identifier && packet.code == EapCode::Request {
                debug!(identifier = last, "nested EAP request repeated, resending");
                return Ok(TunnelStep::write(response.clone()));
            }
        }

        let step = match packet.code {
            EapCode::Request => self.on_request(&packet),
            EapCode::Success | EapCode::Failure => self.on_result(&packet),
            EapCode::Response => return Err(NestedEapError::UnexpectedCode(packet.code)),
        };
        self.record(packet.identifier, step)
    }

    fn on_request(&mut self, packet: &EapPacket) -> Step {
        match packet.eap_type {
            Some(EapType::Identity) => Step::running(Some(EapPacket::identity_response(
                packet.identifier,
                self.credentials.username.as_bytes(),
            ))),
            Some(EapType::Notification) => {
                info!(
                    text = %String::from_utf8_lossy(&packet.data),
                    "nested EAP notification"
                );
                Step::running(Some(EapPacket::notification_response(packet.identifier)))
            }
            Some(requested) => match self.active.as_mut() {
                Some(method) if method.eap_type() == requested => method.process(packet),
                Some(method) => {
                    // The selected method stays for the rest of the session
                    let active = method.eap_type();
                    debug!(
                        requested = %requested,
                        active = %active,
                        "method already selected, sending nested EAP NAK"
                    );
                    Step::running(Some(EapPacket::nak(packet.identifier, &[active])))
                }
                None => self.negotiate(packet, requested),
            },
            None => Step::failure(None, ClientStatus::Failed),
        }
    }

    fn negotiate(&mut self, packet: &EapPacket, requested: EapType) -> Step {
        let acceptable = self.candidates.get(self.index) == Some(&requested)
            || self.last_offered == Some(requested);
        if acceptable {
            if let Some(mut method) = self.registry.create(requested, &self.credentials) {
                info!(eap_type = %requested, "nested EAP method selected");
                let step = method.process(packet);
                self.active = Some(method);
                return step;
            }
        }

        let Some(&offer) = self.candidates.get(self.index) else {
            warn!(eap_type = %requested, "nested EAP candidates exhausted");
            return Step::failure(None, ClientStatus::ProtocolNotSupported);
        };
        debug!(requested = %requested, offer = %offer, "sending nested EAP NAK");
        self.index += 1;
        self.last_offered = Some(offer);
        Step::running(Some(EapPacket::nak(packet.identifier, &[offer])))
    }

    fn on_result(&mut self, packet: &EapPacket) -> Step {
        match self.active.as_mut() {
            Some(method) => method.process(packet),
            None => {
                warn!(code = ?packet.code, "nested EAP result without an active method");
                Step::failure(None, ClientStatus::Failed)
            }
        }
    }

    fn record(&mut self, identifier: u8, step: Step) -> Result<TunnelStep, NestedEapError> {
        let write = match &step.response {
            Some(response) => {
                let bytes = wrap(response)?;
                self.last_identifier = Some(identifier);
                self.last_response = Some(bytes.clone());
                Some(bytes)
            }
            None => None,
        };

        Ok(match (step.state, step.status) {
            (ClientState::Failure, status) => TunnelStep::failure(write, status),
            (_, ClientStatus::UserInputRequired) => TunnelStep::input_required(),
            (_, _) => TunnelStep {
                write,
                status: ClientStatus::Ok,
                state: step.state,
            },
        })
    }

    /// Deliver an outer Success to the active method
    ///
    /// Fails when no method ran or the method has not finished its exchange.
    pub fn accept_success(&mut self, identifier: u8) -> Result<(), ClientStatus> {
        let Some(method) = self.active.as_mut() else {
            return Err(ClientStatus::Failed);
        };
        let step = method.process(&EapPacket::success(identifier));
        match (step.state, step.status) {
            (ClientState::Success, _) => Ok(()),
            (_, ClientStatus::Ok) => Err(ClientStatus::Failed),
            (_, status) => Err(status),
        }
    }

    pub fn update_credentials(&mut self, credentials: &Credentials) {
        self.credentials = credentials.clone();
        if let Some(method) = self.active.as_mut() {
            method.update_credentials(credentials);
        }
    }

    pub fn active_type(&self) -> Option<EapType> {
        self.active.as_ref().map(|m| m.eap_type())
    }

    pub fn session_key(&self) -> Option<Vec<u8>> {
        self.active.as_ref().and_then(|m| m.session_key())
    }

    pub fn require_properties(&self) -> Vec<crate::status::PropertyKey> {
        self.active
            .as_ref()
            .map(|m| m.require_properties())
            .unwrap_or_default()
    }
}

fn wrap(packet: &EapPacket) -> Result<Vec<u8>, AvpError> {
    diameter::encode(AvpCode::EAP_MESSAGE, &packet.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use eap_proto::diameter::decode_all;

    fn multiplexer(candidates: Vec<EapType>) -> NestedEapMultiplexer {
        NestedEapMultiplexer::new(
            MethodRegistry::with_defaults(),
            Credentials::new("alice").with_password("secret"),
            candidates,
        )
    }

    fn frame(packet: &EapPacket) -> Vec<u8> {
        wrap(packet).unwrap()
    }

    fn unwrap_response(step: &TunnelStep) -> EapPacket {
        let avps = decode_all(step.write.as_ref().unwrap()).unwrap();
        assert_eq!(avps.len(), 1);
        assert_eq!(avps[0].key(), AvpCode::EAP_MESSAGE);
        EapPacket::from_bytes(&avps[0].payload).unwrap()
    }

    #[test]
    fn test_start_sends_identity() {
        let mut mux = multiplexer(vec![EapType::GenericTokenCard]);
        let response = unwrap_response(&mux.start().unwrap());
        assert_eq!(response.identifier, 0);
        assert_eq!(response.eap_type, Some(EapType::Identity));
        assert_eq!(response.data, b"alice");
    }

    #[test]
    fn test_identity_and_notification() {
        let mut mux = multiplexer(vec![EapType::GenericTokenCard]);
        let step = mux
            .process(&frame(&EapPacket::request(4, EapType::Identity, Vec::new())))
            .unwrap();
        assert_eq!(unwrap_response(&step).identifier, 4);

        let step = mux
            .process(&frame(&EapPacket::request(5, EapType::Notification, b"hi".to_vec())))
            .unwrap();
        let response = unwrap_response(&step);
        assert_eq!(response.eap_type, Some(EapType::Notification));
        assert!(response.data.is_empty());
    }

    #[test]
    fn test_nak_negotiation_order() {
        let mut mux = multiplexer(vec![
            EapType::MsChapV2,
            EapType::GenericTokenCard,
            EapType::Md5Challenge,
        ]);

        let step = mux
            .process(&frame(&EapPacket::request(1, EapType::Tls, vec![0x20])))
            .unwrap();
        let nak = unwrap_response(&step);
        assert_eq!(nak.eap_type, Some(EapType::Nak));
        assert_eq!(nak.data, vec![EapType::MsChapV2.as_u8()]);

        let step = mux
            .process(&frame(&EapPacket::request(2, EapType::Peap, vec![0x20])))
            .unwrap();
        assert_eq!(unwrap_response(&step).data, vec![EapType::GenericTokenCard.as_u8()]);

        // The type offered last is accepted
        let step = mux
            .process(&frame(&EapPacket::request(
                3,
                EapType::GenericTokenCard,
                b"Password:".to_vec(),
            )))
            .unwrap();
        let response = unwrap_response(&step);
        assert_eq!(response.eap_type, Some(EapType::GenericTokenCard));
        assert_eq!(response.data, b"secret");
        assert_eq!(mux.active_type(), Some(EapType::GenericTokenCard));
        assert_eq!(mux.accept_success(4), Ok(()));
    }

    #[test]
    fn test_active_method_is_never_replaced() {
        let mut mux = multiplexer(vec![EapType::GenericTokenCard, EapType::MsChapV2]);
        mux.process(&frame(&EapPacket::request(1, EapType::GenericTokenCard, Vec::new())))
            .unwrap();
        assert_eq!(mux.active_type(), Some(EapType::GenericTokenCard));

        for identifier in [2, 3] {
            let step = mux
                .process(&frame(&EapPacket::request(identifier, EapType::MsChapV2, vec![1; 20])))
                .unwrap();
            let nak = unwrap_response(&step);
            assert_eq!(nak.identifier, identifier);
            assert_eq!(nak.eap_type, Some(EapType::Nak));
            assert_eq!(nak.data, vec![EapType::GenericTokenCard.as_u8()]);
            assert_eq!(mux.active_type(), Some(EapType::GenericTokenCard));
        }
    }

    #[test]
    fn test_negotiation_exhausted() {
        let mut mux = multiplexer(vec![EapType::Md5Challenge]);
        mux.process(&frame(&EapPacket::request(1, EapType::Tls, vec![0x20])))
            .unwrap();
        let step = mux
            .process(&frame(&EapPacket::request(2, EapType::Tls, vec![0x20])))
            .unwrap();
        assert_eq!(step.state, ClientState::Failure);
        assert_eq!(step.status, ClientStatus::ProtocolNotSupported);
    }

    #[test]
    fn test_repeated_identifier_resends() {
        let mut mux = multiplexer(vec![EapType::GenericTokenCard]);
        let request = frame(&EapPacket::request(7, EapType::GenericTokenCard, Vec::new()));
        let first = mux.process(&request).unwrap();
        let second = mux.process(&request).unwrap();
        assert_eq!(first.write, second.write);
    }

    #[test]
    fn test_missing_eap_message() {
        let mut mux = multiplexer(vec![EapType::GenericTokenCard]);
        let data = diameter::encode(AvpCode::REPLY_MESSAGE, b"hello").unwrap();
        assert!(matches!(
            mux.process(&data),
            Err(NestedEapError::Avp(AvpError::Missing(_)))
        ));
    }

    #[test]
    fn test_failure_without_method() {
        let mut mux = multiplexer(vec![EapType::GenericTokenCard]);
        let step = mux.process(&frame(&EapPacket::failure(9))).unwrap();
        assert_eq!(step.state, ClientState::Failure);
        assert_eq!(mux.accept_success(10), Err(ClientStatus::Failed));
    }
}
