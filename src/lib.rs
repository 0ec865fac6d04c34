#![warn(missing_docs)]
//! DoIP tokio tester engine
//!
//! This library implements the external tester side of Diagnostic over IP
//! (ISO 13400): vehicle discovery over UDP, then over TCP the routing
//! activation handshake and the diagnostic message exchange, each diagnostic
//! message being validated by its acknowledgement.
//!
//! It enables async operations thanks to tokio framework. The engine has no
//! background task: each call sends its request, waits for the answer and
//! returns, so one connection is driven by one task at a time.
//!
//! Sockets are reached through the traits of the [`transport`] module, which
//! have tokio implementations and may be replaced, for example by a scripted
//! transport in tests.
//!
//! The first usage of the API should always be either :
//! - [`connect_doip_tcp()`] for the TCP DoIP stream, activated and ready for
//!   diagnostic messages.
//! - [`create_doip_udp()`] for the UDP DoIP endpoint, used for discovery.

mod config;
mod connection;
mod diagnostic_message;
mod doip_tcp;
mod doip_udp;
pub mod header;
mod routing;
pub mod transport;

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

pub use crate::config::{ClientConfig, Timings, DOIP_PORT};
pub use crate::connection::{ConnectionManager, LinkState, EMPTY_READ_THRESHOLD};
pub use crate::diagnostic_message::{
    build_alive_check_request, build_alive_check_response, build_diagnostic_ack,
    build_diagnostic_message, build_diagnostic_nack, DiagnosticResponse,
    DIAGNOSTIC_ACK_CONFIRMATION,
};
pub use crate::doip_tcp::DoIpTcpConnection;
pub use crate::doip_udp::{
    build_identification_request, build_identification_response, DoIpUdpConnection,
    VehicleIdentificationResult, VEHICLE_IDENT_RESPONSE_LENGTH,
};
pub use crate::header::{GenericHeaderAction, HeaderError, PayloadType};
pub use crate::routing::{
    build_activation_request, build_activation_response, RoutingActivationResponse,
    RoutingActivationSession, ACTIVATION_TYPE_DEFAULT, ROUTING_SUCCESSFULLY_ACTIVATED,
};

#[derive(Debug, Error)]
/// A DoIP API error
pub enum DoIpError {
    /// The TCP connection couldn't be established within the retry budget.
    #[error("unable to connect to {addr} after {attempts} attempt(s)")]
    ConnectionFailed {
        /// DoIP entity address.
        addr: SocketAddr,
        /// Number of attempts made.
        attempts: u32,
    },
    /// The operation needs an established TCP connection.
    #[error("not connected")]
    NotConnected,
    /// A write on the transport failed.
    #[error("send error: {0}")]
    Send(#[source] io::Error),
    /// A read on the transport failed or returned nothing.
    #[error("receive error: {0}")]
    Receive(#[source] io::Error),
    /// A diagnostic message went out but wasn't positively acknowledged.
    #[error("diagnostic message not acknowledged (received {received:?}, code {code:#04x})")]
    NotAcknowledged {
        /// Payload type received instead of the positive acknowledgement,
        /// `None` if nothing valid was received.
        received: Option<PayloadType>,
        /// Negative acknowledgement or generic NACK code, if any.
        code: u8,
    },
    /// A diagnostic message was attempted without routing activation.
    #[error("routing not activated")]
    NotActivated,
    /// The DoIP entity denied the routing activation.
    #[error("routing activation denied with code {0:#04x}")]
    RoutingActivationDenied(u8),
    /// A received frame is malformed.
    #[error(transparent)]
    Header(#[from] HeaderError),
    /// A message of an unexpected payload type was received.
    #[error("unexpected payload type {0:?}")]
    UnexpectedPayload(PayloadType),
    /// A socket couldn't be bound or configured.
    #[error("socket option error: {0}")]
    SocketOption(#[source] io::Error),
    /// The configured DoIP entity address isn't an IP address.
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    /// An answer didn't come in time.
    #[error("timeout")]
    Timeout,
}

/// Create a tester DoIP over TCP connection, activated.
///
/// This is the main way to access the diagnostic over IP stream.
///
/// The call connects the TCP socket (retrying as configured), sends the
/// routing activation request for the configured source address and waits for
/// the answer. Upon a positive answer, a [`DoIpTcpConnection`] is returned.
///
/// # Errors
///
/// - [`DoIpError::RoutingActivationDenied`] if the routing activation is
///   answered negatively.
/// - [`DoIpError::ConnectionFailed`] if the TCP connection cannot be
///   established (think network error here).
/// - [`DoIpError::Timeout`] if the routing activation response doesn't come
///   in time.
pub async fn connect_doip_tcp(config: &ClientConfig) -> Result<DoIpTcpConnection, DoIpError> {
    let mut cnx = DoIpTcpConnection::new(config)?;
    if !cnx.request_activation(config.source_address).await? {
        let code = cnx.last_activation_code().unwrap_or_default();
        cnx.disconnect().await;
        return Err(DoIpError::RoutingActivationDenied(code));
    }
    Ok(cnx)
}

/// Create a tester DoIP over UDP endpoint.
///
/// This endpoint might be used to send both unicast and broadcast vehicle
/// identification requests, to the configured UDP port.
///
/// This function expects the caller to have created and bound the socket
/// beforehand. It doesn't do any IO.
pub fn create_doip_udp(local_socket: UdpSocket, config: &ClientConfig) -> DoIpUdpConnection {
    DoIpUdpConnection::new(local_socket, config.udp_port)
}
