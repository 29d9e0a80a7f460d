//! Server certificate trust evaluation
//!
//! The TLS engine hands over the chain the server presented and the
//! evaluator decides. [`PolicyTrustEvaluator`] applies a [`TrustPolicy`]:
//!
//! 1. the leaf must be inside its validity period;
//! 2. if server names are configured, the leaf must carry one of them;
//! 3. a certificate is trusted when its SHA-256 fingerprint is pinned and
//!    every certificate below it in the chain is signed by its successor;
//! 4. otherwise the user is asked, if the policy allows it.

use crate::config::TrustPolicy;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use x509_parser::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustFailure {
    NoCertificates,
    InvalidCertificate,
    Expired,
    NameMismatch,
    UserRejected,
    Untrusted,
}

impl TrustFailure {
    /// Numeric code reported as the session's last error
    pub fn code(self) -> u32 {
        match self {
            TrustFailure::NoCertificates => 0x201,
            TrustFailure::InvalidCertificate => 0x202,
            TrustFailure::Expired => 0x203,
            TrustFailure::NameMismatch => 0x204,
            TrustFailure::UserRejected => 0x205,
            TrustFailure::Untrusted => 0x206,
        }
    }

    /// TLS alert sent to the server when its chain is refused
    pub fn alert(self) -> u8 {
        match self {
            TrustFailure::NoCertificates
            | TrustFailure::InvalidCertificate
            | TrustFailure::NameMismatch => 42,
            TrustFailure::Expired => 45,
            TrustFailure::UserRejected | TrustFailure::Untrusted => 48,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustOutcome {
    Ok,
    /// Ask the user; the session waits until a decision is supplied
    UserInputRequired,
    Failed(TrustFailure),
}

pub trait TrustEvaluator {
    /// `chain` is DER, leaf first
    fn evaluate(&self, chain: &[Vec<u8>], policy: &TrustPolicy) -> TrustOutcome;
}

/// Fingerprint, name and validity checks driven by a [`TrustPolicy`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyTrustEvaluator;

impl PolicyTrustEvaluator {
    pub fn new() -> Self {
        PolicyTrustEvaluator
    }
}

/// Lower-case hex SHA-256 of a DER certificate
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint.replace(':', "").to_ascii_lowercase()
}

/// Match a certificate name against a configured name
///
/// Either side may be a `*.` wildcard covering exactly one label.
pub fn name_matches(configured: &str, presented: &str) -> bool {
    let configured = configured.trim_end_matches('.').to_ascii_lowercase();
    let presented = presented.trim_end_matches('.').to_ascii_lowercase();

    if configured == presented {
        return true;
    }

    let wildcard = |pattern: &str, name: &str| match pattern.strip_prefix("*.") {
        Some(suffix) => name
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && !label.contains('*') && rest == suffix),
        None => false,
    };

    wildcard(configured.as_str(), presented.as_str())
        || wildcard(presented.as_str(), configured.as_str())
}

fn certificate_names(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut names: Vec<String> = cert
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .map(str::to_string)
        .collect();

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for general_name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = general_name {
                names.push(dns.to_string());
            }
        }
    }
    names
}

/// Every certificate in `chain[..=index]` below `index` is signed by the next one
fn links_verified(chain: &[X509Certificate<'_>], index: usize) -> bool {
    (0..index).all(|i| {
        chain[i]
            .verify_signature(Some(chain[i + 1].public_key()))
            .is_ok()
    })
}

impl TrustEvaluator for PolicyTrustEvaluator {
    fn evaluate(&self, chain: &[Vec<u8>], policy: &TrustPolicy) -> TrustOutcome {
        if chain.is_empty() {
            warn!("server presented no certificates");
            return TrustOutcome::Failed(TrustFailure::NoCertificates);
        }

        let mut parsed = Vec::with_capacity(chain.len());
        for der in chain {
            match X509Certificate::from_der(der) {
                Ok((_, cert)) => parsed.push(cert),
                Err(e) => {
                    warn!(error = %e, "unparseable server certificate");
                    return TrustOutcome::Failed(TrustFailure::InvalidCertificate);
                }
            }
        }

        let leaf = &parsed[0];
        if !leaf.validity().is_valid() {
            warn!(
                not_before = %leaf.validity().not_before,
                not_after = %leaf.validity().not_after,
                "server certificate outside validity period"
            );
            return TrustOutcome::Failed(TrustFailure::Expired);
        }

        if !policy.trusted_server_names.is_empty() {
            let names = certificate_names(leaf);
            let matched = policy
                .trusted_server_names
                .iter()
                .any(|configured| names.iter().any(|name| name_matches(configured, name)));
            if !matched {
                warn!(presented = ?names, "server name not trusted");
                return TrustOutcome::Failed(TrustFailure::NameMismatch);
            }
        }

        let pins: Vec<String> = policy
            .trusted_certificates
            .iter()
            .map(|pin| normalize_fingerprint(pin))
            .collect();
        for (index, der) in chain.iter().enumerate() {
            if pins.contains(&fingerprint(der)) && links_verified(&parsed, index) {
                debug!(depth = index, "server chain anchored at pinned certificate");
                return TrustOutcome::Ok;
            }
        }

        if policy.allow_user_trust {
            debug!("server chain needs user confirmation");
            TrustOutcome::UserInputRequired
        } else {
            TrustOutcome::Failed(TrustFailure::Untrusted)
        }
    }
}
