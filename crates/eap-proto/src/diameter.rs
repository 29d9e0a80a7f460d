//! Diameter AVP encoding (RFC 6733 Section 4.1) as used inside EAP-TTLS
//!
//! EAP-TTLS carries its inner authentication as a stream of Diameter AVPs
//! (RFC 5281 Section 10).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           AVP Code                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V M r r r r r r|                  AVP Length                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Vendor-ID (opt)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Data ...
//! +-+-+-+-+-+-+-+-+
//! ```
//!
//! AVP Length covers header and data but not the zero padding that
//! aligns the next AVP to four octets.

use thiserror::Error;
use tracing::trace;

/// Header size without Vendor-ID
pub const AVP_HEADER_LEN: usize = 8;

/// Header size with Vendor-ID
pub const AVP_VENDOR_HEADER_LEN: usize = 12;

/// Largest data length accepted by the decoder (128 KiB)
pub const DEFAULT_MAX_AVP_LENGTH: usize = 128 * 1024;

/// Largest value of the 24-bit length field
const MAX_WIRE_LENGTH: usize = 0x00FF_FFFF;

/// Microsoft vendor id (RFC 2548)
pub const VENDOR_MICROSOFT: u32 = 311;

/// AVP flags
pub mod flags {
    /// Vendor-ID present
    pub const VENDOR: u8 = 0x80;
    /// Mandatory
    pub const MANDATORY: u8 = 0x40;
}

/// AVP code qualified by its vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AvpCode {
    pub code: u32,
    pub vendor: Option<u32>,
}

impl AvpCode {
    pub const fn ietf(code: u32) -> Self {
        AvpCode { code, vendor: None }
    }

    pub const fn microsoft(code: u32) -> Self {
        AvpCode {
            code,
            vendor: Some(VENDOR_MICROSOFT),
        }
    }

    pub const USER_NAME: AvpCode = AvpCode::ietf(1);
    pub const USER_PASSWORD: AvpCode = AvpCode::ietf(2);
    pub const CHAP_PASSWORD: AvpCode = AvpCode::ietf(3);
    pub const REPLY_MESSAGE: AvpCode = AvpCode::ietf(18);
    pub const CHAP_CHALLENGE: AvpCode = AvpCode::ietf(60);
    pub const EAP_MESSAGE: AvpCode = AvpCode::ietf(79);

    pub const MS_CHAP_RESPONSE: AvpCode = AvpCode::microsoft(1);
    pub const MS_CHAP_ERROR: AvpCode = AvpCode::microsoft(2);
    pub const MS_CHAP_CHALLENGE: AvpCode = AvpCode::microsoft(11);
    pub const MS_CHAP2_RESPONSE: AvpCode = AvpCode::microsoft(25);
    pub const MS_CHAP2_SUCCESS: AvpCode = AvpCode::microsoft(26);
}

impl std::fmt::Display for AvpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.vendor {
            Some(vendor) => write!(f, "{}:{}", vendor, self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

/// A single Diameter AVP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avp {
    pub code: u32,
    pub flags: u8,
    pub vendor_id: Option<u32>,
    pub payload: Vec<u8>,
}

impl Avp {
    /// Create a mandatory AVP; the V bit follows the vendor
    pub fn new(code: AvpCode, payload: Vec<u8>) -> Self {
        let mut avp_flags = flags::MANDATORY;
        if code.vendor.is_some() {
            avp_flags |= flags::VENDOR;
        }
        Avp {
            code: code.code,
            flags: avp_flags,
            vendor_id: code.vendor,
            payload,
        }
    }

    pub fn key(&self) -> AvpCode {
        AvpCode {
            code: self.code,
            vendor: self.vendor_id,
        }
    }

    pub fn is_mandatory(&self) -> bool {
        self.flags & flags::MANDATORY != 0
    }

    fn header_len(&self) -> usize {
        if self.vendor_id.is_some() {
            AVP_VENDOR_HEADER_LEN
        } else {
            AVP_HEADER_LEN
        }
    }

    /// Value of the AVP Length field
    pub fn length(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    /// Length on the wire including padding
    pub fn padded_length(&self) -> usize {
        padded(self.length())
    }

    /// Append the encoded AVP to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), AvpError> {
        let length = self.length();
        if length > MAX_WIRE_LENGTH {
            return Err(AvpError::LengthOverflow(length));
        }

        out.reserve(padded(length));
        out.extend_from_slice(&self.code.to_be_bytes());
        let length_field = (length as u32).to_be_bytes();
        out.push(self.flags);
        out.extend_from_slice(&length_field[1..]);
        if let Some(vendor) = self.vendor_id {
            out.extend_from_slice(&vendor.to_be_bytes());
        }
        out.extend_from_slice(&self.payload);
        out.resize(out.len() + padded(length) - length, 0);
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, AvpError> {
        let mut out = Vec::with_capacity(self.padded_length());
        self.encode_into(&mut out)?;
        Ok(out)
    }
}

fn padded(length: usize) -> usize {
    (length + 3) & !3
}

/// Encode one AVP
pub fn encode(code: AvpCode, payload: &[u8]) -> Result<Vec<u8>, AvpError> {
    Avp::new(code, payload.to_vec()).encode()
}

/// Encode a sequence of AVPs back to back
pub fn encode_all(avps: &[Avp]) -> Result<Vec<u8>, AvpError> {
    let mut out = Vec::with_capacity(avps.iter().map(Avp::padded_length).sum());
    for avp in avps {
        avp.encode_into(&mut out)?;
    }
    Ok(out)
}

/// AVP codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AvpError {
    #[error("AVP truncated: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("AVP length {0} is smaller than its header")]
    InvalidLength(usize),

    #[error("AVP data length {length} exceeds limit {limit}")]
    TooLarge { length: usize, limit: usize },

    #[error("AVP {0} not found")]
    Missing(AvpCode),

    #[error("AVP length {0} does not fit in 24 bits")]
    LengthOverflow(usize),
}

/// Bounds-checked cursor over a sequence of encoded AVPs
#[derive(Debug, Clone)]
pub struct AvpReader<'a> {
    data: &'a [u8],
    offset: usize,
    max_length: usize,
}

impl<'a> AvpReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_max_length(data, DEFAULT_MAX_AVP_LENGTH)
    }

    pub fn with_max_length(data: &'a [u8], max_length: usize) -> Self {
        AvpReader {
            data,
            offset: 0,
            max_length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], AvpError> {
        if len > self.remaining() {
            return Err(AvpError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn take_u32(&mut self) -> Result<u32, AvpError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Decode the next AVP
    pub fn decode_one(&mut self) -> Result<Avp, AvpError> {
        let code = self.take_u32()?;
        let flags_and_length = self.take_u32()?;
        let avp_flags = (flags_and_length >> 24) as u8;
        let length = (flags_and_length & 0x00FF_FFFF) as usize;

        let (vendor_id, header_len) = if avp_flags & flags::VENDOR != 0 {
            (Some(self.take_u32()?), AVP_VENDOR_HEADER_LEN)
        } else {
            (None, AVP_HEADER_LEN)
        };

        if length < header_len {
            return Err(AvpError::InvalidLength(length));
        }
        let data_len = length - header_len;
        if data_len > self.max_length {
            return Err(AvpError::TooLarge {
                length: data_len,
                limit: self.max_length,
            });
        }

        let payload = self.take(data_len)?.to_vec();

        // The final AVP of a stream may omit its padding
        let padding = padded(length) - length;
        self.offset += padding.min(self.remaining());

        trace!(code, vendor = ?vendor_id, length = data_len, "AVP decoded");

        Ok(Avp {
            code,
            flags: avp_flags,
            vendor_id,
            payload,
        })
    }

    /// Skip AVPs until one with the given code and vendor is found
    pub fn decode_for_code(&mut self, code: AvpCode) -> Result<Avp, AvpError> {
        while !self.is_empty() {
            let avp = self.decode_one()?;
            if avp.key() == code {
                return Ok(avp);
            }
            trace!(found = %avp.key(), wanted = %code, "skipping AVP");
        }
        Err(AvpError::Missing(code))
    }
}

impl Iterator for AvpReader<'_> {
    type Item = Result<Avp, AvpError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_empty() {
            return None;
        }
        let item = self.decode_one();
        if item.is_err() {
            // Stop after the first malformed AVP
            self.offset = self.data.len();
        }
        Some(item)
    }
}

/// Decode every AVP in `data`
pub fn decode_all(data: &[u8]) -> Result<Vec<Avp>, AvpError> {
    AvpReader::new(data).collect()
}
