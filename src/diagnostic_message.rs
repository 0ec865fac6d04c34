//
// This module builds and reads the diagnostic message family of frames.

use byteorder::{BigEndian, ByteOrder};

use crate::header::{new_frame, HeaderError, PayloadType};

/// Positive acknowledgement code: routing confirmation.
pub const DIAGNOSTIC_ACK_CONFIRMATION: u8 = 0x00;

const ADDRESSES_LENGTH: usize = 4;

fn push_addrs(frame: &mut Vec<u8>, source_address: u16, target_address: u16) {
    let mut addrs = [0u8; ADDRESSES_LENGTH];
    BigEndian::write_u16(&mut addrs[0..2], source_address);
    BigEndian::write_u16(&mut addrs[2..4], target_address);
    frame.extend_from_slice(&addrs);
}

/// Build a diagnostic message frame carrying `user_data`.
pub fn build_diagnostic_message(source_address: u16, target_address: u16, user_data: &[u8]) -> Vec<u8> {
    let mut frame = new_frame(
        PayloadType::DiagnosticMessage,
        ADDRESSES_LENGTH + user_data.len(),
    );
    push_addrs(&mut frame, source_address, target_address);
    frame.extend_from_slice(user_data);
    frame
}

fn build_diagnostic_acknowledge(
    payload_type: PayloadType,
    source_address: u16,
    target_address: u16,
    code: u8,
) -> Vec<u8> {
    let mut frame = new_frame(payload_type, ADDRESSES_LENGTH + 1);
    push_addrs(&mut frame, source_address, target_address);
    frame.push(code);
    frame
}

/// Build a diagnostic message positive acknowledgement frame.
pub fn build_diagnostic_ack(source_address: u16, target_address: u16) -> Vec<u8> {
    build_diagnostic_acknowledge(
        PayloadType::DiagnosticPositiveAck,
        source_address,
        target_address,
        DIAGNOSTIC_ACK_CONFIRMATION,
    )
}

/// Build a diagnostic message negative acknowledgement frame.
pub fn build_diagnostic_nack(source_address: u16, target_address: u16, code: u8) -> Vec<u8> {
    build_diagnostic_acknowledge(
        PayloadType::DiagnosticNegativeAck,
        source_address,
        target_address,
        code,
    )
}

/// Build an alive check request frame (header only).
pub fn build_alive_check_request() -> Vec<u8> {
    new_frame(PayloadType::AliveCheckRequest, 0)
}

/// Build an alive check response frame carrying the tester address.
pub fn build_alive_check_response(source_address: u16) -> Vec<u8> {
    let mut frame = new_frame(PayloadType::AliveCheckResponse, 2);
    frame.extend_from_slice(&source_address.to_be_bytes());
    frame
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A received diagnostic message.
pub struct DiagnosticResponse {
    /// Logical address of the sender.
    pub source_address: u16,
    /// Logical address of the receiver.
    pub target_address: u16,
    /// Diagnostic (UDS) payload.
    pub user_data: Vec<u8>,
}

impl DiagnosticResponse {
    /// Parse the payload of a diagnostic message.
    pub fn parse(payload: &[u8]) -> Result<Self, HeaderError> {
        if payload.len() < ADDRESSES_LENGTH {
            return Err(HeaderError::InvalidPayloadLength {
                declared: ADDRESSES_LENGTH as u32,
                available: payload.len() as u32,
            });
        }
        Ok(Self {
            source_address: BigEndian::read_u16(&payload[0..2]),
            target_address: BigEndian::read_u16(&payload[2..4]),
            user_data: payload[ADDRESSES_LENGTH..].to_vec(),
        })
    }
}
