//! EAP-TLS / EAP-TTLS framing and fragmentation (RFC 5216 Section 3, RFC 5281 Section 9.2)
//!
//! Both methods carry TLS records in the same envelope: one flags octet,
//! an optional four octet total length and a slice of the TLS byte stream.
//! EAP-TTLS reuses the low three bits of the flags octet as a version
//! number; this crate only speaks version 0 so those bits are masked off.
//!
//! [`FragmentAssembler`] reassembles inbound messages and
//! [`FragmentWriter`] splits outbound messages into MTU-sized packets.

use super::{EAP_TYPED_HEADER_LEN, EapPacket, EapType};
use thiserror::Error;
use tracing::{debug, trace};

/// Default ceiling on a reassembled message (128 KiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 128 * 1024;

/// Smallest MTU a writer accepts
pub const MIN_MTU: usize = 64;

/// Size of the flags octet
const FLAGS_LEN: usize = 1;

/// Size of the TLS Message Length field
const LENGTH_FIELD_LEN: usize = 4;

/// EAP-TLS flags (first byte of Type-Data)
///
/// ```text
///  0 1 2 3 4 5 6 7
/// +-+-+-+-+-+-+-+-+
/// |L M S R R V V V|
/// +-+-+-+-+-+-+-+-+
/// ```
///
/// - L (Length included) = 0x80
/// - M (More fragments) = 0x40
/// - S (Start) = 0x20
/// - R (Reserved) and V (TTLS version) = zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlsFlags(u8);

impl TlsFlags {
    /// Length included flag (L bit)
    pub const LENGTH_INCLUDED: u8 = 0x80;
    /// More fragments flag (M bit)
    pub const MORE_FRAGMENTS: u8 = 0x40;
    /// Start flag (S bit)
    pub const START: u8 = 0x20;

    /// Create new TLS flags
    pub fn new(length_included: bool, more_fragments: bool, start: bool) -> Self {
        let mut flags = 0u8;
        if length_included {
            flags |= Self::LENGTH_INCLUDED;
        }
        if more_fragments {
            flags |= Self::MORE_FRAGMENTS;
        }
        if start {
            flags |= Self::START;
        }
        TlsFlags(flags)
    }

    /// Create from raw byte
    pub fn from_u8(value: u8) -> Self {
        TlsFlags(value & 0xE0) // Mask reserved and version bits
    }

    /// Get raw byte value
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Check if Length included flag is set
    pub fn length_included(self) -> bool {
        (self.0 & Self::LENGTH_INCLUDED) != 0
    }

    /// Check if More fragments flag is set
    pub fn more_fragments(self) -> bool {
        (self.0 & Self::MORE_FRAGMENTS) != 0
    }

    /// Check if Start flag is set
    pub fn start(self) -> bool {
        (self.0 & Self::START) != 0
    }
}

/// EAP-TLS packet structure
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Flags     |               TLS Message Length              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     TLS Message Length        |       TLS Data...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapTlsPacket {
    /// TLS flags
    pub flags: TlsFlags,
    /// Total TLS message length (present if L flag is set)
    pub tls_message_length: Option<u32>,
    /// TLS record data
    pub tls_data: Vec<u8>,
}

impl EapTlsPacket {
    /// Create a new EAP-TLS packet
    pub fn new(flags: TlsFlags, tls_message_length: Option<u32>, tls_data: Vec<u8>) -> Self {
        EapTlsPacket {
            flags,
            tls_message_length,
            tls_data,
        }
    }

    /// Create a Start packet
    pub fn start() -> Self {
        Self::new(TlsFlags::new(false, false, true), None, Vec::new())
    }

    /// Create an acknowledgement (no flags, no data)
    pub fn ack() -> Self {
        Self::new(TlsFlags::default(), None, Vec::new())
    }

    /// An Ack carries no data, no length and no Start bit
    ///
    /// A packet with only the M bit set is also treated as an Ack; some
    /// servers set it while they wait for the peer's next fragment.
    pub fn is_ack(&self) -> bool {
        !self.flags.start() && !self.flags.length_included() && self.tls_data.is_empty()
    }

    /// Parse EAP-TLS packet from EAP Type-Data
    pub fn from_eap_data(data: &[u8]) -> Result<Self, FragmentError> {
        let Some(&raw_flags) = data.first() else {
            return Err(FragmentError::Truncated {
                expected: FLAGS_LEN,
                actual: 0,
            });
        };

        let flags = TlsFlags::from_u8(raw_flags);
        let mut offset = FLAGS_LEN;

        let tls_message_length = if flags.length_included() {
            if data.len() < FLAGS_LEN + LENGTH_FIELD_LEN {
                return Err(FragmentError::Truncated {
                    expected: FLAGS_LEN + LENGTH_FIELD_LEN,
                    actual: data.len(),
                });
            }
            offset += LENGTH_FIELD_LEN;
            Some(u32::from_be_bytes([data[1], data[2], data[3], data[4]]))
        } else {
            None
        };

        Ok(EapTlsPacket {
            flags,
            tls_message_length,
            tls_data: data[offset..].to_vec(),
        })
    }

    /// Parse the Type-Data of an EAP packet
    pub fn from_eap_packet(packet: &EapPacket) -> Result<Self, FragmentError> {
        Self::from_eap_data(&packet.data)
    }

    /// Convert to EAP packet data
    pub fn to_eap_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(FLAGS_LEN + LENGTH_FIELD_LEN + self.tls_data.len());
        data.push(self.flags.as_u8());

        if let Some(length) = self.tls_message_length {
            data.extend_from_slice(&length.to_be_bytes());
        }

        data.extend_from_slice(&self.tls_data);
        data
    }

    /// Wrap this packet in an EAP Response of the given method type
    pub fn to_eap_response(&self, identifier: u8, eap_type: EapType) -> EapPacket {
        EapPacket::response(identifier, eap_type, self.to_eap_data())
    }

    /// Wrap this packet in an EAP Request of the given method type
    pub fn to_eap_request(&self, identifier: u8, eap_type: EapType) -> EapPacket {
        EapPacket::request(identifier, eap_type, self.to_eap_data())
    }
}

/// Errors raised while framing or reassembling TLS messages
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragmentError {
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Declared message length {declared} exceeds limit {limit}")]
    DeclaredLengthTooLarge { declared: usize, limit: usize },

    #[error("Fragment overflows declared message length {declared}")]
    Overflow { declared: usize },

    #[error("Message ended after {received} of {declared} bytes")]
    LengthMismatch { declared: usize, received: usize },

    #[error("Fragment announces more data but no message length")]
    MissingLength,

    #[error("Declared message length changed from {previous} to {declared}")]
    LengthChanged { previous: usize, declared: usize },

    #[error("MTU {0} is below the minimum of 64")]
    MtuTooSmall(usize),
}

/// Ordered bytes of one message with a declared total length
///
/// The write cursor is the length of `data`; it never passes `total`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentBuffer {
    data: Vec<u8>,
    total: usize,
}

impl FragmentBuffer {
    pub fn new(total: usize) -> Self {
        FragmentBuffer {
            data: Vec::with_capacity(total),
            total,
        }
    }

    /// Append bytes at the cursor
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), FragmentError> {
        if bytes.len() > self.remaining() {
            return Err(FragmentError::Overflow {
                declared: self.total,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn received(&self) -> usize {
        self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.total - self.data.len()
    }

    pub fn is_complete(&self) -> bool {
        self.data.len() == self.total
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Outcome of feeding one packet to a [`FragmentAssembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedResult {
    /// Start packet (S flag)
    Start,
    /// Empty packet acknowledging our previous fragment
    Ack,
    /// More fragments follow; the caller acknowledges this one
    Incomplete,
    /// Same identifier as the previous packet; nothing was buffered and the
    /// caller answers with its previous response
    Duplicate,
    /// A whole message
    Complete(Vec<u8>),
}

/// Inbound reassembly of fragmented TLS messages
#[derive(Debug, Clone)]
pub struct FragmentAssembler {
    max_message_size: usize,
    buffer: Option<FragmentBuffer>,
    last_identifier: Option<u8>,
}

impl FragmentAssembler {
    /// Create an assembler with the default 128 KiB ceiling
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        FragmentAssembler {
            max_message_size,
            buffer: None,
            last_identifier: None,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// True while a fragmented message is partially received
    pub fn in_progress(&self) -> bool {
        self.buffer.is_some()
    }

    /// Identifier of the last packet accepted
    pub fn last_identifier(&self) -> Option<u8> {
        self.last_identifier
    }

    /// Drop any partial message and forget the last identifier
    pub fn reset(&mut self) {
        self.buffer = None;
        self.last_identifier = None;
    }

    /// Feed one inbound packet
    ///
    /// Any error discards the partial message.
    pub fn feed(
        &mut self,
        identifier: u8,
        packet: &EapTlsPacket,
    ) -> Result<FeedResult, FragmentError> {
        if self.last_identifier == Some(identifier) {
            trace!(identifier, "duplicate fragment ignored");
            return Ok(FeedResult::Duplicate);
        }

        let result = self.feed_inner(packet);
        match &result {
            Ok(_) => self.last_identifier = Some(identifier),
            Err(e) => {
                debug!(identifier, error = %e, "fragment reassembly failed");
                self.buffer = None;
            }
        }
        result
    }

    fn feed_inner(&mut self, packet: &EapTlsPacket) -> Result<FeedResult, FragmentError> {
        if packet.flags.start() {
            self.buffer = None;
            return Ok(FeedResult::Start);
        }

        if self.buffer.is_none() && packet.is_ack() {
            return Ok(FeedResult::Ack);
        }

        if let Some(declared) = packet.tls_message_length {
            let declared = declared as usize;
            if declared > self.max_message_size {
                return Err(FragmentError::DeclaredLengthTooLarge {
                    declared,
                    limit: self.max_message_size,
                });
            }
            match &self.buffer {
                Some(buffer) if buffer.total() != declared => {
                    return Err(FragmentError::LengthChanged {
                        previous: buffer.total(),
                        declared,
                    });
                }
                Some(_) => {}
                None => {
                    trace!(declared, "new fragmented message");
                    self.buffer = Some(FragmentBuffer::new(declared));
                }
            }
        }

        let Some(buffer) = self.buffer.as_mut() else {
            // Unfragmented message without a length field
            if packet.flags.more_fragments() {
                return Err(FragmentError::MissingLength);
            }
            if packet.tls_data.len() > self.max_message_size {
                return Err(FragmentError::DeclaredLengthTooLarge {
                    declared: packet.tls_data.len(),
                    limit: self.max_message_size,
                });
            }
            return Ok(FeedResult::Complete(packet.tls_data.clone()));
        };

        buffer.append(&packet.tls_data)?;

        if packet.flags.more_fragments() {
            trace!(
                received = buffer.received(),
                total = buffer.total(),
                "fragment buffered"
            );
            return Ok(FeedResult::Incomplete);
        }

        if !buffer.is_complete() {
            return Err(FragmentError::LengthMismatch {
                declared: buffer.total(),
                received: buffer.received(),
            });
        }

        match self.buffer.take() {
            Some(buffer) => {
                debug!(length = buffer.total(), "message reassembled");
                Ok(FeedResult::Complete(buffer.into_bytes()))
            }
            None => Ok(FeedResult::Complete(Vec::new())),
        }
    }
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound fragmentation of one TLS message
///
/// Every call to [`FragmentWriter::next_fragment`] with a new identifier
/// advances past the previously emitted fragment. Repeating an identifier
/// emits the same bytes again.
#[derive(Debug, Clone, Default)]
pub struct FragmentWriter {
    message: Vec<u8>,
    start: usize,
    end: usize,
    last_identifier: Option<u8>,
}

impl FragmentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending message
    pub fn set_message(&mut self, message: Vec<u8>) {
        self.message = message;
        self.start = 0;
        self.end = 0;
        self.last_identifier = None;
    }

    /// Forget the pending message
    pub fn clear(&mut self) {
        self.set_message(Vec::new());
    }

    /// True while fragments remain to be sent
    pub fn has_pending(&self) -> bool {
        self.end < self.message.len()
    }

    /// Total length of the pending message
    pub fn message_len(&self) -> usize {
        self.message.len()
    }

    /// Emit the next fragment as an EAP Response
    ///
    /// Returns the packet and whether more fragments follow.
    pub fn next_fragment(
        &mut self,
        identifier: u8,
        mtu: usize,
        eap_type: EapType,
    ) -> Result<(EapPacket, bool), FragmentError> {
        if mtu < MIN_MTU {
            return Err(FragmentError::MtuTooSmall(mtu));
        }

        if self.last_identifier != Some(identifier) {
            self.start = self.end;
            let capacity = self.capacity(mtu, self.start == 0 && self.needs_length(mtu));
            self.end = (self.start + capacity).min(self.message.len());
            self.last_identifier = Some(identifier);
        }

        let more = self.end < self.message.len();
        let with_length = self.start == 0 && self.needs_length(mtu);
        let packet = EapTlsPacket::new(
            TlsFlags::new(with_length, more, false),
            with_length.then_some(self.message.len() as u32),
            self.message[self.start..self.end].to_vec(),
        );

        trace!(
            identifier,
            offset = self.start,
            length = self.end - self.start,
            more,
            "fragment emitted"
        );

        Ok((packet.to_eap_response(identifier, eap_type), more))
    }

    fn needs_length(&self, mtu: usize) -> bool {
        self.message.len() > self.capacity(mtu, false)
    }

    fn capacity(&self, mtu: usize, with_length: bool) -> usize {
        let overhead = EAP_TYPED_HEADER_LEN
            + FLAGS_LEN
            + if with_length { LENGTH_FIELD_LEN } else { 0 };
        mtu - overhead
    }
}
