//! Routing activation frames and session state

use byteorder::{BigEndian, ByteOrder};

use crate::header::{new_frame, HeaderError, PayloadType};

/// Routing activation response code of a successful activation.
pub const ROUTING_SUCCESSFULLY_ACTIVATED: u8 = 0x10;
/// Default activation type.
pub const ACTIVATION_TYPE_DEFAULT: u8 = 0x00;

const ACTIVATION_REQUEST_LENGTH: usize = 7;
const ACTIVATION_RESPONSE_MIN_LENGTH: usize = 9;
const ACTIVATION_RESPONSE_OEM_LENGTH: usize = 13;

/// Build a routing activation request frame (15 bytes).
pub fn build_activation_request(source_address: u16, activation_type: u8) -> Vec<u8> {
    let mut frame = new_frame(PayloadType::RoutingActivationRequest, ACTIVATION_REQUEST_LENGTH);
    frame.extend_from_slice(&source_address.to_be_bytes());
    frame.push(activation_type);
    frame.extend_from_slice(&[0; 4]);
    frame
}

/// Build a routing activation response frame, with the OEM specific bytes.
///
/// Used by DoIP entities, and by tests standing for one.
pub fn build_activation_response(tester: u16, entity: u16, code: u8) -> Vec<u8> {
    let mut frame = new_frame(
        PayloadType::RoutingActivationResponse,
        ACTIVATION_RESPONSE_OEM_LENGTH,
    );
    frame.extend_from_slice(&tester.to_be_bytes());
    frame.extend_from_slice(&entity.to_be_bytes());
    frame.push(code);
    frame.extend_from_slice(&[0; 8]);
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Routing activation response payload.
pub struct RoutingActivationResponse {
    /// Logical address of the tester the response is for.
    pub logical_address_tester: u16,
    /// Logical address of the answering DoIP entity.
    pub logical_address_of_doip_entity: u16,
    /// Activation response code, see [`ROUTING_SUCCESSFULLY_ACTIVATED`].
    pub routing_activation_response_code: u8,
    /// Reserved by ISO 13400.
    pub reserved: [u8; 4],
    /// Optional OEM specific bytes.
    pub oem_specific: Option<[u8; 4]>,
}

impl RoutingActivationResponse {
    /// Parse the payload of a routing activation response.
    pub fn parse(payload: &[u8]) -> Result<Self, HeaderError> {
        if payload.len() < ACTIVATION_RESPONSE_MIN_LENGTH {
            return Err(HeaderError::InvalidPayloadLength {
                declared: ACTIVATION_RESPONSE_MIN_LENGTH as u32,
                available: payload.len() as u32,
            });
        }
        let mut reserved = [0u8; 4];
        reserved.copy_from_slice(&payload[5..9]);
        let oem_specific = payload
            .get(9..ACTIVATION_RESPONSE_OEM_LENGTH)
            .map(|oem| [oem[0], oem[1], oem[2], oem[3]]);
        Ok(Self {
            logical_address_tester: BigEndian::read_u16(&payload[0..2]),
            logical_address_of_doip_entity: BigEndian::read_u16(&payload[2..4]),
            routing_activation_response_code: payload[4],
            reserved,
            oem_specific,
        })
    }

    /// Whether routing is activated.
    pub fn is_success(&self) -> bool {
        self.routing_activation_response_code == ROUTING_SUCCESSFULLY_ACTIVATED
    }
}

#[derive(Debug, Clone, Default)]
/// Routing activation state of one TCP session.
///
/// The activation is bound to the connection it was obtained on: once the
/// link is reconnected, the session is no longer activated.
pub struct RoutingActivationSession {
    source_address: u16,
    activated: bool,
    link_generation: u64,
    last_response_code: Option<u8>,
}

impl RoutingActivationSession {
    /// A fresh, not activated session for `source_address`.
    pub fn new(source_address: u16) -> Self {
        Self {
            source_address,
            ..Default::default()
        }
    }

    /// Tester logical address.
    pub fn source_address(&self) -> u16 {
        self.source_address
    }

    /// Change the tester logical address. Drops any activation.
    pub fn set_source_address(&mut self, source_address: u16) {
        if source_address != self.source_address {
            self.reset();
        }
        self.source_address = source_address;
    }

    /// Whether the session is activated on link `generation`.
    pub fn is_activated(&self, generation: u64) -> bool {
        self.activated && self.link_generation == generation
    }

    /// Code of the last routing activation response received.
    pub fn last_response_code(&self) -> Option<u8> {
        self.last_response_code
    }

    /// Record a routing activation response received on link `generation`.
    pub fn record_response(&mut self, response: &RoutingActivationResponse, generation: u64) {
        self.last_response_code = Some(response.routing_activation_response_code);
        self.activated = response.is_success();
        self.link_generation = generation;
    }

    /// Drop the activation.
    pub fn reset(&mut self) {
        self.activated = false;
    }
}
