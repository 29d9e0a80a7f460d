//! EAP Protocol Building Blocks
//!
//! This crate provides the wire formats and pure cryptography used by an
//! EAP-TTLS / EAP-TLS peer. It holds no session state and performs no I/O.
//!
//! # Features
//!
//! - EAP packet encoding and decoding (RFC 3748)
//! - EAP-TLS / EAP-TTLS framing with fragment reassembly and fragmentation
//!   (RFC 5216, RFC 5281)
//! - Diameter AVP codec for the EAP-TTLS inner tunnel
//! - CHAP, MS-CHAP and MS-CHAPv2 response computation (RFC 1994, 2433, 2759)
//!
//! # Example
//!
//! ```rust
//! use eap_proto::diameter::{AvpCode, AvpReader, encode};
//!
//! let bytes = encode(AvpCode::USER_NAME, b"alice").unwrap();
//! let avp = AvpReader::new(&bytes).decode_for_code(AvpCode::USER_NAME).unwrap();
//! assert_eq!(avp.payload, b"alice");
//! ```

pub mod chap;
pub mod diameter;
pub mod eap;
pub mod mschap;

pub use chap::{ChapError, ChapResponse, compute_chap_response, verify_chap_response};
pub use diameter::{Avp, AvpCode, AvpError, AvpReader};
pub use eap::eap_tls::{
    EapTlsPacket, FeedResult, FragmentAssembler, FragmentError, FragmentWriter, TlsFlags,
};
pub use eap::{EapCode, EapError, EapPacket, EapType};
pub use mschap::{MsChapError, MsChapFailure};
