//! EAP-TTLS / EAP-TLS Peer
//!
//! This crate provides the peer (supplicant) side of EAP-TTLS and EAP-TLS
//! built on top of the `eap-proto` wire formats.
//!
//! # Features
//!
//! - Synchronous, one-packet-at-a-time state machine
//! - TLS handshake over a pluggable engine; rustls ships as the default
//! - Server trust from pinned fingerprints, server names or a user prompt
//! - PAP, CHAP, MS-CHAP, MS-CHAPv2 and nested EAP inside the tunnel
//! - Fragmentation, reassembly and identifier-based retransmission
//! - JSON configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use eap_peer::{PeerConfig, TtlsStateMachine};
//! use eap_proto::EapPacket;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PeerConfig::from_file("peer.json")?;
//!     let mut machine = TtlsStateMachine::from_config(&config)?;
//!
//!     // Each request from the authenticator yields at most one response
//!     let request = EapPacket::from_bytes(&[1, 1, 0, 6, 21, 0x20])?;
//!     let step = machine.process(&request);
//!     if let Some(response) = step.response {
//!         let _bytes = response.to_bytes();
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod credentials;
pub mod engine;
pub mod handshake;
pub mod inner;
pub mod method;
pub mod methods;
pub mod nested;
pub mod status;
pub mod trust;
pub mod ttls;

pub use config::{ConfigError, InnerAuthType, NestedEapType, PeerConfig, TrustPolicy, TunnelMethod};
pub use credentials::{ClientIdentity, CredentialError, Credentials};
pub use engine::{HandshakeStatus, RustlsEngine, SessionCache, TlsEngine, TlsEngineError};
pub use handshake::{HandshakePhase, HandshakeProgress, SessionKeys, TlsHandshakeDriver};
pub use inner::{InnerAuthEngine, InnerAuthError};
pub use method::{EapMethod, MethodRegistry};
pub use nested::{NestedEapError, NestedEapMultiplexer};
pub use status::{ClientState, ClientStatus, PropertyKey, PublishedProperties, Step, TunnelStep};
pub use trust::{PolicyTrustEvaluator, TrustEvaluator, TrustFailure, TrustOutcome};
pub use ttls::{TtlsPhase, TtlsStateMachine};
