use crate::credentials::{ClientIdentity, CredentialError, Credentials};
use eap_proto::EapType;
use eap_proto::eap::eap_tls::{DEFAULT_MAX_MESSAGE_SIZE, MIN_MTU};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Outer EAP method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMethod {
    /// EAP-TTLS (type 21) with inner authentication
    #[default]
    Ttls,
    /// EAP-TLS (type 13), certificate only
    Tls,
}

impl TunnelMethod {
    pub fn eap_type(self) -> EapType {
        match self {
            TunnelMethod::Ttls => EapType::Ttls,
            TunnelMethod::Tls => EapType::Tls,
        }
    }

    /// Label for the 128 byte MSK/EMSK export
    pub fn key_label(self) -> &'static str {
        match self {
            TunnelMethod::Ttls => "ttls keying material",
            TunnelMethod::Tls => "client EAP encryption",
        }
    }
}

/// Authentication carried inside the EAP-TTLS tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InnerAuthType {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "PAP")]
    Pap,
    #[serde(rename = "CHAP")]
    Chap,
    #[serde(rename = "MSCHAP")]
    MsChap,
    #[serde(rename = "MSCHAPv2")]
    MsChapV2,
    #[default]
    #[serde(rename = "EAP")]
    Eap,
}

impl InnerAuthType {
    /// Whether the type cannot run without a password
    pub fn requires_password(self) -> bool {
        !matches!(self, InnerAuthType::None | InnerAuthType::Eap)
    }
}

/// Secondary EAP methods that can be offered inside the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NestedEapType {
    #[serde(rename = "MSCHAPv2")]
    MsChapV2,
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "MD5")]
    Md5,
}

impl NestedEapType {
    pub fn eap_type(self) -> EapType {
        match self {
            NestedEapType::MsChapV2 => EapType::MsChapV2,
            NestedEapType::Gtc => EapType::GenericTokenCard,
            NestedEapType::Md5 => EapType::Md5Challenge,
        }
    }
}

/// PEM files for EAP-TLS client authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCertificate {
    pub cert_path: String,
    pub key_path: String,
}

/// How the server certificate chain is judged
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrustPolicy {
    /// Names the leaf must carry (CN or DNS SAN); `*.example.com` matches one label
    #[serde(default)]
    pub trusted_server_names: Vec<String>,

    /// SHA-256 fingerprints (hex) of acceptable certificates anywhere in the chain
    #[serde(default)]
    pub trusted_certificates: Vec<String>,

    /// Ask the user when nothing above matches
    #[serde(default)]
    pub allow_user_trust: bool,
}

/// Peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    #[serde(default)]
    pub method: TunnelMethod,

    /// Identity sent in the tunnel and in EAP Identity responses
    pub username: String,

    /// Omit to be prompted
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub inner_authentication: InnerAuthType,

    #[serde(default = "default_enable_session_resumption")]
    pub enable_session_resumption: bool,

    /// Maximum size of an emitted EAP packet, header included
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Ceiling on a reassembled TLS message
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default)]
    pub client_certificate: Option<ClientCertificate>,

    #[serde(default)]
    pub trust: TrustPolicy,

    /// Nested EAP methods in order of preference
    #[serde(default = "default_nested_eap_types")]
    pub nested_eap_types: Vec<NestedEapType>,

    /// Key for the TLS session cache; defaults to the username
    #[serde(default)]
    pub resumption_id: Option<String>,
}

fn default_enable_session_resumption() -> bool {
    true
}

fn default_mtu() -> usize {
    1400
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_nested_eap_types() -> Vec<NestedEapType> {
    vec![NestedEapType::MsChapV2, NestedEapType::Gtc, NestedEapType::Md5]
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            method: TunnelMethod::default(),
            username: String::new(),
            password: None,
            inner_authentication: InnerAuthType::default(),
            enable_session_resumption: default_enable_session_resumption(),
            mtu: default_mtu(),
            max_message_size: default_max_message_size(),
            client_certificate: None,
            trust: TrustPolicy::default(),
            nested_eap_types: default_nested_eap_types(),
            resumption_id: None,
        }
    }
}

impl PeerConfig {
    pub fn new(username: impl Into<String>) -> Self {
        PeerConfig {
            username: username.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: PeerConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.is_empty() {
            return Err(ConfigError::Invalid("Username cannot be empty".to_string()));
        }

        if self.mtu < MIN_MTU {
            return Err(ConfigError::Invalid(format!(
                "MTU {} is below the minimum of {}",
                self.mtu, MIN_MTU
            )));
        }

        if self.mtu > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "MTU {} exceeds the EAP length limit of {}",
                self.mtu,
                u16::MAX
            )));
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "Maximum message size cannot be 0".to_string(),
            ));
        }

        if self.nested_eap_types.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one nested EAP type is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for eap_type in &self.nested_eap_types {
            if !seen.insert(eap_type) {
                return Err(ConfigError::Invalid(format!(
                    "Nested EAP type {:?} listed twice",
                    eap_type
                )));
            }
        }

        if self.method == TunnelMethod::Tls && self.client_certificate.is_none() {
            return Err(ConfigError::Invalid(
                "EAP-TLS requires a client certificate".to_string(),
            ));
        }

        for fingerprint in &self.trust.trusted_certificates {
            let mut digest = [0u8; 32];
            if hex::decode_to_slice(fingerprint.replace(':', ""), &mut digest).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "Invalid SHA-256 fingerprint: {}",
                    fingerprint
                )));
            }
        }

        Ok(())
    }

    /// Build credentials, loading the client certificate if configured
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let mut credentials = Credentials::new(self.username.clone());
        credentials.password = self.password.clone();

        if let Some(cert) = &self.client_certificate {
            credentials.identity = Some(ClientIdentity::from_pem_files(
                &cert.cert_path,
                &cert.key_path,
            )?);
        }

        if self.enable_session_resumption {
            credentials.resumption_id = Some(
                self.resumption_id
                    .clone()
                    .unwrap_or_else(|| self.username.clone()),
            );
        }

        Ok(credentials)
    }

    /// Nested EAP candidates as EAP types
    pub fn nested_candidates(&self) -> Vec<EapType> {
        self.nested_eap_types.iter().map(|t| t.eap_type()).collect()
    }

    /// Create an example configuration
    pub fn example() -> Self {
        PeerConfig {
            method: TunnelMethod::Ttls,
            username: "alice@example.com".to_string(),
            password: None,
            inner_authentication: InnerAuthType::MsChapV2,
            enable_session_resumption: true,
            mtu: 1400,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            client_certificate: None,
            trust: TrustPolicy {
                trusted_server_names: vec!["radius.example.com".to_string()],
                trusted_certificates: vec![],
                allow_user_trust: true,
            },
            nested_eap_types: default_nested_eap_types(),
            resumption_id: None,
        }
    }
}
