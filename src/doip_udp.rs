use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, trace, warn};
use tokio::net::UdpSocket;

use crate::header::{decode_header, new_frame, payload_of, HeaderError, PayloadType};
use crate::transport::DatagramTransport;
use crate::DoIpError;

/// Vehicle identification response payload length, without the optional
/// VIN/GID sync status.
pub const VEHICLE_IDENT_RESPONSE_LENGTH: usize = 32;

const RECEIVE_BUFFER_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Content of a vehicle identification response, aka. vehicle announcement.
pub struct VehicleIdentificationResult {
    /// Vehicle identification number.
    pub vin: [u8; 17],
    /// Logical address of the DoIP entity, network order.
    pub logical_address: [u8; 2],
    /// Entity identifier.
    pub eid: [u8; 6],
    /// Group identifier.
    pub gid: [u8; 6],
    /// Further action required flag.
    pub further_action_required: u8,
    /// VIN/GID synchronisation status, when sent.
    pub vin_gid_sync_status: Option<u8>,
}

impl VehicleIdentificationResult {
    /// Parse the payload of a vehicle identification response.
    pub fn parse(payload: &[u8]) -> Result<Self, HeaderError> {
        if payload.len() < VEHICLE_IDENT_RESPONSE_LENGTH {
            return Err(HeaderError::InvalidPayloadLength {
                declared: VEHICLE_IDENT_RESPONSE_LENGTH as u32,
                available: payload.len() as u32,
            });
        }
        let mut result = VehicleIdentificationResult {
            vin: [0; 17],
            logical_address: [0; 2],
            eid: [0; 6],
            gid: [0; 6],
            further_action_required: payload[31],
            vin_gid_sync_status: payload.get(VEHICLE_IDENT_RESPONSE_LENGTH).copied(),
        };
        result.vin.copy_from_slice(&payload[0..17]);
        result.logical_address.copy_from_slice(&payload[17..19]);
        result.eid.copy_from_slice(&payload[19..25]);
        result.gid.copy_from_slice(&payload[25..31]);
        Ok(result)
    }

    /// The VIN as text, padding removed.
    pub fn vin_string(&self) -> String {
        String::from_utf8_lossy(&self.vin)
            .trim_matches(char::from(0))
            .to_string()
    }

    /// The logical address of the DoIP entity.
    pub fn logical_address_u16(&self) -> u16 {
        BigEndian::read_u16(&self.logical_address)
    }
}

/// Build a vehicle identification request frame (header only).
pub fn build_identification_request() -> Vec<u8> {
    new_frame(PayloadType::VehicleIdentRequest, 0)
}

/// Build a vehicle identification response frame.
///
/// Used by DoIP entities, and by tests standing for one.
pub fn build_identification_response(result: &VehicleIdentificationResult) -> Vec<u8> {
    let length = VEHICLE_IDENT_RESPONSE_LENGTH + result.vin_gid_sync_status.map_or(0, |_| 1);
    let mut frame = new_frame(PayloadType::VehicleIdentResponse, length);
    frame.extend_from_slice(&result.vin);
    frame.extend_from_slice(&result.logical_address);
    frame.extend_from_slice(&result.eid);
    frame.extend_from_slice(&result.gid);
    frame.push(result.further_action_required);
    frame.extend(result.vin_gid_sync_status);
    frame
}

/// DoIpUdpConnection
///
/// The datagram DoIP endpoint of the tester, used to discover the DoIP
/// entities through vehicle identification requests.
pub struct DoIpUdpConnection<D: DatagramTransport = UdpSocket> {
    socket: D,
    port: u16,
    receive_buffer: Vec<u8>,
    result: Option<VehicleIdentificationResult>,
    last_sender: Option<SocketAddr>,
}

impl DoIpUdpConnection<UdpSocket> {
    /// Bind a tokio UDP socket on `local_addr` and create the endpoint.
    /// Requests are sent to `port`.
    pub async fn bind(local_addr: SocketAddr, port: u16) -> Result<Self, DoIpError> {
        let socket = UdpSocket::bind(local_addr).await.map_err(|e| {
            warn!(target: "doip_udp", "Unable to bind {}: {}", local_addr, e);
            DoIpError::SocketOption(e)
        })?;
        info!(target: "doip_udp", "DoIP UDP socket bound on {}", local_addr);
        Ok(Self::new(socket, port))
    }
}

impl<D: DatagramTransport> DoIpUdpConnection<D> {
    /// Create the endpoint over an already bound socket. Requests are sent to
    /// `port`.
    pub fn new(socket: D, port: u16) -> Self {
        Self {
            socket,
            port,
            receive_buffer: vec![0; RECEIVE_BUFFER_SIZE],
            result: None,
            last_sender: None,
        }
    }

    /// Send a vehicle identification request.
    ///
    /// The request goes to `target`, or to the limited broadcast address when
    /// `None`. Both failures below leave the endpoint usable, the request may
    /// be sent again.
    ///
    /// # Errors
    ///
    /// - [`DoIpError::SocketOption`] if broadcast cannot be enabled.
    /// - [`DoIpError::Send`] if the datagram cannot be sent.
    pub async fn broadcast_identification_request(
        &mut self,
        target: Option<IpAddr>,
    ) -> Result<(), DoIpError> {
        self.socket.set_broadcast(true).map_err(|e| {
            warn!(target: "doip_udp", "Unable to enable broadcast: {}", e);
            DoIpError::SocketOption(e)
        })?;
        let remote = SocketAddr::new(
            target.unwrap_or(IpAddr::V4(Ipv4Addr::BROADCAST)),
            self.port,
        );
        let request = build_identification_request();
        trace!(target: "doip_udp", "Writing out {:02x?}", request);
        self.socket
            .send_to(&request, remote)
            .await
            .map_err(|e| {
                warn!(target: "doip_udp", "Unable to send vehicle identification request: {}", e);
                DoIpError::Send(e)
            })?;
        info!(target: "doip_udp", "Sent vehicle identification request to {}", remote);
        Ok(())
    }

    /// Receive one datagram, expecting a vehicle identification response.
    ///
    /// Any other payload type is ignored and yields `Ok(None)`. A matching
    /// response replaces the previously stored result.
    pub async fn receive_identification_response(
        &mut self,
    ) -> Result<Option<VehicleIdentificationResult>, DoIpError> {
        let (len, sender) = self
            .socket
            .recv_from(&mut self.receive_buffer)
            .await
            .map_err(DoIpError::Receive)?;
        let datagram = &self.receive_buffer[..len];
        trace!(target: "doip_udp", "Reading in {:02x?} from {}", datagram, sender);
        let action = decode_header(datagram, false)?;
        if action.payload_type != PayloadType::VehicleIdentResponse {
            debug!(
                target: "doip_udp",
                "Ignoring {:?} from {}", action.payload_type, sender
            );
            return Ok(None);
        }
        let result = VehicleIdentificationResult::parse(payload_of(datagram, &action))?;
        info!(
            target: "doip_udp",
            "Vehicle {} at logical address {:#06x} answered from {}",
            result.vin_string(),
            result.logical_address_u16(),
            sender
        );
        self.result = Some(result.clone());
        self.last_sender = Some(sender);
        Ok(Some(result))
    }

    /// Last vehicle identification response received.
    pub fn last_result(&self) -> Option<&VehicleIdentificationResult> {
        self.result.as_ref()
    }

    /// Sender of the last vehicle identification response.
    pub fn last_sender(&self) -> Option<SocketAddr> {
        self.last_sender
    }
}
