//! DoIP generic header codec
//!
//! Every DoIP frame, on TCP as well as on UDP, starts with the same 8 bytes
//! header: protocol version, its bitwise inverse, the payload type and the
//! payload length, all integers being big-endian.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// Length of the generic DoIP header.
pub const DOIP_HEADER_LENGTH: usize = 8;
/// Protocol version written in every emitted header (ISO 13400-2:2012).
pub const DOIP_PROTOCOL_VERSION: u8 = 0x02;
/// Inverse of [`DOIP_PROTOCOL_VERSION`].
pub const DOIP_INVERSE_PROTOCOL_VERSION: u8 = !DOIP_PROTOCOL_VERSION;

/// Generic NACK code: incorrect pattern format.
pub const NACK_INCORRECT_PATTERN_FORMAT: u8 = 0x00;
/// Generic NACK code: unknown payload type.
pub const NACK_UNKNOWN_PAYLOAD_TYPE: u8 = 0x01;
/// Generic NACK code: message too large.
pub const NACK_MESSAGE_TOO_LARGE: u8 = 0x02;
/// Generic NACK code: invalid payload length.
pub const NACK_INVALID_PAYLOAD_LENGTH: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// DoIP payload types handled by the tester engine.
///
/// Codes outside of this set decode to [`PayloadType::Unhandled`], the upper
/// layers deciding whether they matter.
pub enum PayloadType {
    /// Generic DoIP header negative acknowledge (0x0000).
    NegativeAck,
    /// Vehicle identification request (0x0001).
    VehicleIdentRequest,
    /// Vehicle identification response, aka. vehicle announcement (0x0004).
    VehicleIdentResponse,
    /// Routing activation request (0x0005).
    RoutingActivationRequest,
    /// Routing activation response (0x0006).
    RoutingActivationResponse,
    /// Alive check request (0x0007).
    AliveCheckRequest,
    /// Alive check response (0x0008).
    AliveCheckResponse,
    /// Diagnostic message (0x8001).
    DiagnosticMessage,
    /// Diagnostic message positive acknowledgement (0x8002).
    DiagnosticPositiveAck,
    /// Diagnostic message negative acknowledgement (0x8003).
    DiagnosticNegativeAck,
    /// Any other payload type code.
    Unhandled(u16),
}

impl PayloadType {
    /// Wire code of the payload type.
    pub fn code(self) -> u16 {
        use PayloadType::*;
        match self {
            NegativeAck => 0x0000,
            VehicleIdentRequest => 0x0001,
            VehicleIdentResponse => 0x0004,
            RoutingActivationRequest => 0x0005,
            RoutingActivationResponse => 0x0006,
            AliveCheckRequest => 0x0007,
            AliveCheckResponse => 0x0008,
            DiagnosticMessage => 0x8001,
            DiagnosticPositiveAck => 0x8002,
            DiagnosticNegativeAck => 0x8003,
            Unhandled(code) => code,
        }
    }

    /// Payload type of a wire code.
    pub fn from_code(code: u16) -> Self {
        use PayloadType::*;
        match code {
            0x0000 => NegativeAck,
            0x0001 => VehicleIdentRequest,
            0x0004 => VehicleIdentResponse,
            0x0005 => RoutingActivationRequest,
            0x0006 => RoutingActivationResponse,
            0x0007 => AliveCheckRequest,
            0x0008 => AliveCheckResponse,
            0x8001 => DiagnosticMessage,
            0x8002 => DiagnosticPositiveAck,
            0x8003 => DiagnosticNegativeAck,
            other => Unhandled(other),
        }
    }

    /// Offset in the payload of the byte reported as
    /// [`GenericHeaderAction::value`], if this payload type has one.
    fn value_offset(self) -> Option<usize> {
        match self {
            PayloadType::NegativeAck => Some(0),
            PayloadType::RoutingActivationResponse => Some(4),
            PayloadType::DiagnosticPositiveAck | PayloadType::DiagnosticNegativeAck => Some(4),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// A malformed generic header.
pub enum HeaderError {
    /// The inverse protocol version doesn't complement the protocol version.
    #[error("incorrect pattern format: version {version:#04x}, inverse {inverse:#04x}")]
    IncorrectPatternFormat {
        /// Received protocol version.
        version: u8,
        /// Received inverse protocol version.
        inverse: u8,
    },
    /// Strict decoding met a payload type code outside the supported set.
    #[error("unknown payload type {0:#06x}")]
    UnknownPayloadType(u16),
    /// The declared payload length exceeds the available bytes, or the
    /// payload is too short for its type.
    #[error("invalid payload length: declared {declared}, available {available}")]
    InvalidPayloadLength {
        /// Length declared by the header or required by the payload type.
        declared: u32,
        /// Bytes actually available.
        available: u32,
    },
    /// The declared payload length exceeds what the receiver accepts.
    #[error("message too large: declared {declared}, max {max}")]
    MessageTooLarge {
        /// Length declared by the header.
        declared: u32,
        /// Largest accepted payload.
        max: u32,
    },
}

impl HeaderError {
    /// Generic DoIP NACK code matching this error.
    pub fn nack_code(&self) -> u8 {
        match self {
            HeaderError::IncorrectPatternFormat { .. } => NACK_INCORRECT_PATTERN_FORMAT,
            HeaderError::UnknownPayloadType(_) => NACK_UNKNOWN_PAYLOAD_TYPE,
            HeaderError::InvalidPayloadLength { .. } => NACK_INVALID_PAYLOAD_LENGTH,
            HeaderError::MessageTooLarge { .. } => NACK_MESSAGE_TOO_LARGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of a generic header decode.
pub struct GenericHeaderAction {
    /// Decoded payload type.
    pub payload_type: PayloadType,
    /// Single relevant payload byte: NACK code, acknowledgement code or
    /// routing activation response code. Zero otherwise.
    pub value: u8,
    /// Payload length, verbatim from the header.
    pub payload_length: u32,
}

/// Encode a generic DoIP header.
pub fn encode_header(payload_type: PayloadType, payload_length: u32) -> [u8; DOIP_HEADER_LENGTH] {
    let mut header = [0u8; DOIP_HEADER_LENGTH];
    header[0] = DOIP_PROTOCOL_VERSION;
    header[1] = DOIP_INVERSE_PROTOCOL_VERSION;
    BigEndian::write_u16(&mut header[2..4], payload_type.code());
    BigEndian::write_u32(&mut header[4..8], payload_length);
    header
}

/// Start a frame: the header followed by room for `payload_length` bytes.
pub(crate) fn new_frame(payload_type: PayloadType, payload_length: usize) -> Vec<u8> {
    let mut frame = Vec::with_capacity(DOIP_HEADER_LENGTH + payload_length);
    frame.extend_from_slice(&encode_header(payload_type, payload_length as u32));
    frame
}

/// Check the header pattern and extract the payload type and length.
///
/// Only the first [`DOIP_HEADER_LENGTH`] bytes are looked at, the payload
/// bytes availability is not checked.
pub fn parse_header(bytes: &[u8], strict: bool) -> Result<(PayloadType, u32), HeaderError> {
    if bytes.len() < DOIP_HEADER_LENGTH {
        return Err(HeaderError::InvalidPayloadLength {
            declared: DOIP_HEADER_LENGTH as u32,
            available: bytes.len() as u32,
        });
    }
    let (version, inverse) = (bytes[0], bytes[1]);
    if version != !inverse {
        return Err(HeaderError::IncorrectPatternFormat { version, inverse });
    }
    let payload_type = PayloadType::from_code(BigEndian::read_u16(&bytes[2..4]));
    if let PayloadType::Unhandled(code) = payload_type {
        if strict {
            return Err(HeaderError::UnknownPayloadType(code));
        }
    }
    Ok((payload_type, BigEndian::read_u32(&bytes[4..8])))
}

/// Decode a whole DoIP frame header.
///
/// `bytes` is the header followed by all the payload bytes received so far.
/// When `strict` is set, unknown payload types are rejected instead of being
/// reported as [`PayloadType::Unhandled`].
pub fn decode_header(bytes: &[u8], strict: bool) -> Result<GenericHeaderAction, HeaderError> {
    let (payload_type, payload_length) = parse_header(bytes, strict)?;
    let payload = &bytes[DOIP_HEADER_LENGTH..];
    if payload_length as usize > payload.len() {
        return Err(HeaderError::InvalidPayloadLength {
            declared: payload_length,
            available: payload.len() as u32,
        });
    }
    let payload = &payload[..payload_length as usize];
    let value = payload_type
        .value_offset()
        .and_then(|offset| payload.get(offset).copied())
        .unwrap_or(0);
    Ok(GenericHeaderAction {
        payload_type,
        value,
        payload_length,
    })
}

/// Payload bytes of a frame whose header was successfully decoded.
pub(crate) fn payload_of<'a>(frame: &'a [u8], action: &GenericHeaderAction) -> &'a [u8] {
    &frame[DOIP_HEADER_LENGTH..DOIP_HEADER_LENGTH + action.payload_length as usize]
}

/// Build a generic DoIP header negative acknowledge frame.
pub fn build_generic_nack(code: u8) -> Vec<u8> {
    let mut frame = new_frame(PayloadType::NegativeAck, 1);
    frame.push(code);
    frame
}
