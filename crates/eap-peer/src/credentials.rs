//! User credentials and the optional client certificate identity

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Failed to open '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Certificate error: {0}")]
    Certificate(String),
}

/// Client certificate chain and private key, DER encoded
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Leaf first
    pub cert_chain: Vec<Vec<u8>>,
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("certificates", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

impl ClientIdentity {
    pub fn new(cert_chain: Vec<Vec<u8>>, private_key: Vec<u8>) -> Self {
        ClientIdentity {
            cert_chain,
            private_key,
        }
    }

    /// Load a PEM certificate chain and a PEM private key
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, CredentialError> {
        Ok(ClientIdentity {
            cert_chain: load_certificates_from_pem(cert_path.as_ref())?,
            private_key: load_private_key_from_pem(key_path.as_ref())?,
        })
    }
}

fn open(path: &Path) -> Result<BufReader<File>, CredentialError> {
    let file = File::open(path).map_err(|source| CredentialError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(BufReader::new(file))
}

/// Load every certificate in a PEM file
pub fn load_certificates_from_pem(path: &Path) -> Result<Vec<Vec<u8>>, CredentialError> {
    let mut reader = open(path)?;

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CredentialError::Certificate(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(CredentialError::Certificate(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }

    Ok(certs.into_iter().map(|cert| cert.to_vec()).collect())
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file
pub fn load_private_key_from_pem(path: &Path) -> Result<Vec<u8>, CredentialError> {
    let mut reader = open(path)?;

    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| CredentialError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| {
            CredentialError::Certificate(format!("No private key found in '{}'", path.display()))
        })?;

    Ok(key.secret_der().to_vec())
}

/// What the peer knows about its user
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    pub identity: Option<ClientIdentity>,
    /// Stable key for TLS session resumption; `None` disables resumption
    pub resumption_id: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity", &self.identity)
            .field("resumption_id", &self.resumption_id)
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_resumption_id(mut self, id: impl Into<String>) -> Self {
        self.resumption_id = Some(id.into());
        self
    }

    pub fn password_bytes(&self) -> Option<&[u8]> {
        self.password.as_deref().map(str::as_bytes)
    }
}
