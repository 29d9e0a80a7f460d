//! The EAP method seam and a registry of method constructors

use crate::credentials::Credentials;
use crate::status::{PropertyKey, PublishedProperties, Step};
use eap_proto::{EapPacket, EapType};
use std::collections::BTreeMap;

/// One EAP authentication method on the peer side
///
/// `process` receives Requests of the method's type as well as the
/// Success and Failure packets that end the conversation.
pub trait EapMethod {
    fn eap_type(&self) -> EapType;

    fn process(&mut self, packet: &EapPacket) -> Step;

    /// Input the method still needs before it can answer
    fn require_properties(&self) -> Vec<PropertyKey> {
        Vec::new()
    }

    fn publish_properties(&self) -> PublishedProperties {
        PublishedProperties::default()
    }

    /// Key material produced by the method, if any
    fn session_key(&self) -> Option<Vec<u8>> {
        None
    }

    /// Pick up input supplied after the method was created
    fn update_credentials(&mut self, _credentials: &Credentials) {}
}

pub type MethodFactory = Box<dyn Fn(&Credentials) -> Box<dyn EapMethod + Send> + Send + Sync>;

/// Method constructors keyed by numeric EAP type
#[derive(Default)]
pub struct MethodRegistry {
    factories: BTreeMap<u8, MethodFactory>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding EAP-MSCHAPv2, EAP-GTC and EAP-MD5
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(EapType::MsChapV2, |creds| {
            Box::new(crate::methods::MsChapV2Method::new(creds))
        });
        registry.register(EapType::GenericTokenCard, |creds| {
            Box::new(crate::methods::GtcMethod::new(creds))
        });
        registry.register(EapType::Md5Challenge, |creds| {
            Box::new(crate::methods::Md5Method::new(creds))
        });
        registry
    }

    /// Register a constructor, replacing any previous one for the type
    pub fn register<F>(&mut self, eap_type: EapType, factory: F)
    where
        F: Fn(&Credentials) -> Box<dyn EapMethod + Send> + Send + Sync + 'static,
    {
        self.factories.insert(eap_type.as_u8(), Box::new(factory));
    }

    pub fn supports(&self, eap_type: EapType) -> bool {
        self.factories.contains_key(&eap_type.as_u8())
    }

    pub fn create(
        &self,
        eap_type: EapType,
        credentials: &Credentials,
    ) -> Option<Box<dyn EapMethod + Send>> {
        self.factories
            .get(&eap_type.as_u8())
            .map(|factory| factory(credentials))
    }

    /// Registered types in numeric order
    pub fn types(&self) -> Vec<EapType> {
        self.factories.keys().map(|&t| EapType::from_u8(t)).collect()
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("types", &self.types())
            .finish()
    }
}
