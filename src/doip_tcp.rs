use std::io;
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::time;

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, LinkState};
use crate::diagnostic_message::{
    build_alive_check_response, build_diagnostic_message, DiagnosticResponse,
};
use crate::header::{decode_header, payload_of, PayloadType};
use crate::routing::{build_activation_request, RoutingActivationResponse, RoutingActivationSession};
use crate::transport::{StreamConnector, TcpConnector};
use crate::DoIpError;

/// DoIpTcpConnection
///
/// The tester side DoIP stream: routing activation, then diagnostic messages
/// through [`send_diagnostic()`](Self::send_diagnostic).
///
/// Every call sends at most one request and waits for its answer before
/// returning, so a single connection is driven by one task at a time.
pub struct DoIpTcpConnection<C: StreamConnector = TcpConnector> {
    link: ConnectionManager<C>,
    session: RoutingActivationSession,
    activation_type: u8,
    max_payload_size: u32,
    verbose: bool,
    activation_timeout: Duration,
    ack_timeout: Duration,
}

impl DoIpTcpConnection<TcpConnector> {
    /// Create a disconnected tester connection over tokio TCP.
    pub fn new(config: &ClientConfig) -> Result<Self, DoIpError> {
        let connector = TcpConnector::new(config.local_addr, config.timings.tcp_connect);
        Self::with_connector(connector, config)
    }
}

impl<C: StreamConnector> DoIpTcpConnection<C> {
    /// Create a disconnected tester connection over any transport.
    pub fn with_connector(connector: C, config: &ClientConfig) -> Result<Self, DoIpError> {
        let link = ConnectionManager::new(connector, config.remote_addr()?, config.retries)
            .with_retry_delay(config.timings.connect_retry_delay)
            .with_verbose(config.verbose);
        Ok(Self {
            link,
            session: RoutingActivationSession::new(config.source_address),
            activation_type: config.activation_type,
            max_payload_size: config.max_payload_size,
            verbose: config.verbose,
            activation_timeout: config.timings.routing_activation_rsp,
            ack_timeout: config.timings.diagnostic_ack,
        })
    }

    /// Connect the TCP stream, within the configured retry budget.
    pub async fn connect(&mut self) -> Result<(), DoIpError> {
        self.link.connect().await
    }

    /// Drop the stream and connect again. The routing activation is lost and
    /// has to be requested again.
    pub async fn reconnect(&mut self) -> Result<(), DoIpError> {
        self.session.reset();
        self.link.reconnect().await
    }

    /// Close the stream. Safe to call at any time.
    pub async fn disconnect(&mut self) {
        self.session.reset();
        self.link.disconnect().await
    }

    /// Whether the TCP stream is established.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// TCP link state.
    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    /// Whether routing is activated on the current stream.
    pub fn is_activated(&self) -> bool {
        self.link.is_connected() && self.session.is_activated(self.link.generation())
    }

    /// Empty reads in a row on the current stream.
    pub fn consecutive_empty_reads(&self) -> u32 {
        self.link.consecutive_empty_reads()
    }

    /// Tester logical address.
    pub fn source_address(&self) -> u16 {
        self.session.source_address()
    }

    /// Set the tester logical address used by the next routing activation.
    pub fn set_source_address(&mut self, source_address: u16) {
        self.session.set_source_address(source_address);
    }

    /// Same as [`set_source_address()`](Self::set_source_address), from the
    /// network order bytes.
    pub fn set_source_address_bytes(&mut self, source_address: [u8; 2]) {
        self.set_source_address(u16::from_be_bytes(source_address));
    }

    /// Code of the last routing activation response.
    pub fn last_activation_code(&self) -> Option<u8> {
        self.session.last_response_code()
    }

    /// Request routing activation for `source_address`.
    ///
    /// Connects first if needed. Returns `Ok(true)` when the entity answers
    /// with the successful activation code, `Ok(false)` for any other answer,
    /// in which case activation may be requested again.
    ///
    /// # Errors
    ///
    /// - [`DoIpError::ConnectionFailed`] if the stream cannot be established.
    /// - [`DoIpError::Send`] if the request cannot be written.
    /// - [`DoIpError::Receive`] if no response comes.
    /// - [`DoIpError::Timeout`] if the response doesn't come in time.
    pub async fn request_activation(&mut self, source_address: u16) -> Result<bool, DoIpError> {
        if !self.link.is_connected() {
            if let Err(e) = self.link.connect().await {
                warn!(
                    target: "doip_tcp",
                    "Unable to connect to the ECU at {}", self.link.remote_addr()
                );
                return Err(e);
            }
        }
        self.session.set_source_address(source_address);
        self.session.reset();
        let request = build_activation_request(source_address, self.activation_type);
        if let Err(e) = self.link.send(&request).await {
            warn!(target: "doip_tcp", "Unable to send routing activation request: {}", e);
            return Err(e);
        }

        let max_payload_size = self.max_payload_size;
        let frame = time::timeout(self.activation_timeout, self.link.receive_frame(max_payload_size))
            .await
            .map_err(|_| DoIpError::Timeout)??
            .ok_or_else(|| {
                warn!(target: "doip_tcp", "Error receiving routing activation response");
                DoIpError::Receive(io::ErrorKind::UnexpectedEof.into())
            })?;
        let action = decode_header(&frame, false)?;
        if action.payload_type != PayloadType::RoutingActivationResponse {
            warn!(
                target: "doip_tcp",
                "Expected routing activation response, got {:?}", action.payload_type
            );
            return Ok(false);
        }
        let response = RoutingActivationResponse::parse(payload_of(&frame, &action))?;
        self.session.record_response(&response, self.link.generation());
        if response.is_success() {
            info!(target: "doip_tcp", "DoIP routing activation succeeded");
        } else {
            info!(
                target: "doip_tcp",
                "DoIP routing activation denied with code {:#04x}",
                response.routing_activation_response_code
            );
        }
        Ok(response.is_success())
    }

    /// Send a diagnostic message and wait for its positive acknowledgement.
    ///
    /// Returns the number of bytes written. The message counts as sent only
    /// once acknowledged: a negative acknowledgement, another message, an
    /// empty read or no answer in time all fail with
    /// [`DoIpError::NotAcknowledged`], though the bytes did go out.
    ///
    /// Caller: only a DoIP external tester with routing activated.
    pub async fn send_diagnostic(
        &mut self,
        source_address: u16,
        target_address: u16,
        user_data: &[u8],
    ) -> Result<usize, DoIpError> {
        if !self.is_activated() {
            return Err(DoIpError::NotActivated);
        }
        let message = build_diagnostic_message(source_address, target_address, user_data);
        let sent = match self.link.send(&message).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(target: "doip_tcp", "Unable to send diagnostic message: {}", e);
                return Err(e);
            }
        };

        let max_payload_size = self.max_payload_size;
        let frame = match time::timeout(self.ack_timeout, self.link.receive_frame(max_payload_size)).await
        {
            Err(_) | Ok(Ok(None)) => {
                warn!(target: "doip_tcp", "Diagnostic ACK not received");
                return Err(DoIpError::NotAcknowledged {
                    received: None,
                    code: 0,
                });
            }
            Ok(Err(DoIpError::Header(e))) => {
                warn!(target: "doip_tcp", "Malformed diagnostic ACK: {}", e);
                return Err(DoIpError::NotAcknowledged {
                    received: None,
                    code: e.nack_code(),
                });
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(Some(frame))) => frame,
        };

        let action = match decode_header(&frame, false) {
            Ok(action) => action,
            Err(e) => {
                return Err(DoIpError::NotAcknowledged {
                    received: None,
                    code: e.nack_code(),
                })
            }
        };
        if action.payload_type == PayloadType::DiagnosticPositiveAck {
            if self.verbose {
                debug!(target: "doip_tcp", "Received +ve ACK to diagnostic message");
            }
            Ok(sent)
        } else {
            warn!(
                target: "doip_tcp",
                "Did not receive +ve ACK to diagnostic message: {:?} ({:#04x})",
                action.payload_type,
                action.value
            );
            Err(DoIpError::NotAcknowledged {
                received: Some(action.payload_type),
                code: action.value,
            })
        }
    }

    /// Answer an alive check request.
    ///
    /// No answer is expected. A write failure is reported but leaves the
    /// session as it is.
    pub async fn respond_to_alive_check(&mut self, source_address: u16) -> Result<(), DoIpError> {
        let response = build_alive_check_response(source_address);
        self.link.send(&response).await.map(|_| ()).map_err(|e| {
            warn!(target: "doip_tcp", "Unable to send alive check response: {}", e);
            e
        })
    }

    /// Receive the diagnostic message answering an acknowledged request.
    ///
    /// Alive check requests received in the meantime are answered and
    /// skipped. Each frame is waited for at most the diagnostic
    /// acknowledgement timing.
    pub async fn receive_diagnostic_response(&mut self) -> Result<DiagnosticResponse, DoIpError> {
        loop {
            let max_payload_size = self.max_payload_size;
            let frame = time::timeout(self.ack_timeout, self.link.receive_frame(max_payload_size))
                .await
                .map_err(|_| DoIpError::Timeout)??
                .ok_or_else(|| DoIpError::Receive(io::ErrorKind::UnexpectedEof.into()))?;
            let action = decode_header(&frame, false)?;
            match action.payload_type {
                PayloadType::AliveCheckRequest => {
                    let source_address = self.session.source_address();
                    if let Err(e) = self.respond_to_alive_check(source_address).await {
                        trace!(target: "doip_tcp", "Carrying on without alive check response: {}", e);
                    }
                }
                PayloadType::DiagnosticMessage => {
                    return Ok(DiagnosticResponse::parse(payload_of(&frame, &action))?)
                }
                other => return Err(DoIpError::UnexpectedPayload(other)),
            }
        }
    }

    /// Send a UDS request from the tester address to `target_address`, and
    /// receive the UDS answer.
    pub async fn send_uds(
        &mut self,
        target_address: u16,
        uds: &[u8],
    ) -> Result<DiagnosticResponse, DoIpError> {
        let source_address = self.session.source_address();
        self.send_diagnostic(source_address, target_address, uds)
            .await?;
        self.receive_diagnostic_response().await
    }

    /// Raw read on the stream, see [`ConnectionManager::receive()`].
    pub async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, DoIpError> {
        self.link.receive(buffer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic_message::{
        build_alive_check_request, build_diagnostic_ack, build_diagnostic_nack,
    };
    use crate::header::{build_generic_nack, NACK_INCORRECT_PATTERN_FORMAT, NACK_MESSAGE_TOO_LARGE};
    use crate::routing::{build_activation_response, ROUTING_SUCCESSFULLY_ACTIVATED};
    use crate::transport::mock::MockConnector;

    const TESTER: u16 = 0x0e80;
    const ECU: u16 = 0x1001;

    fn config() -> ClientConfig {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = ClientConfig::new("192.168.0.10");
        config.source_address = TESTER;
        config.timings.routing_activation_rsp = Duration::from_millis(20);
        config.timings.diagnostic_ack = Duration::from_millis(20);
        config
    }

    fn tester(connector: &MockConnector) -> DoIpTcpConnection<MockConnector> {
        DoIpTcpConnection::with_connector(connector.clone(), &config()).unwrap()
    }

    async fn activated(connector: &MockConnector) -> DoIpTcpConnection<MockConnector> {
        let mut cnx = tester(connector);
        connector.push_read(&build_activation_response(
            TESTER,
            ECU,
            ROUTING_SUCCESSFULLY_ACTIVATED,
        ));
        assert!(cnx.request_activation(TESTER).await.unwrap());
        cnx
    }

    #[tokio::test]
    async fn activation_success() {
        let connector = MockConnector::new();
        let cnx = activated(&connector).await;
        assert!(cnx.is_activated());
        assert_eq!(cnx.last_activation_code(), Some(0x10));
        let sent = connector.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 15);
        assert_eq!(&sent[0][8..10], &[0x0e, 0x80]);
    }

    #[tokio::test]
    async fn activation_denied() {
        let connector = MockConnector::new();
        let mut cnx = tester(&connector);
        connector.push_read(&build_activation_response(TESTER, ECU, 0x06));
        assert!(!cnx.request_activation(TESTER).await.unwrap());
        assert!(!cnx.is_activated());
        assert_eq!(cnx.last_activation_code(), Some(0x06));

        connector.push_read(&build_activation_response(
            TESTER,
            ECU,
            ROUTING_SUCCESSFULLY_ACTIVATED,
        ));
        assert!(cnx.request_activation(TESTER).await.unwrap());
    }

    #[tokio::test]
    async fn activation_answered_by_generic_nack() {
        let connector = MockConnector::new();
        let mut cnx = tester(&connector);
        connector.push_read(&build_generic_nack(NACK_INCORRECT_PATTERN_FORMAT));
        assert!(!cnx.request_activation(TESTER).await.unwrap());
    }

    #[tokio::test]
    async fn activation_without_connection() {
        let connector = MockConnector::new();
        connector.fail_connects(3);
        let mut cnx = tester(&connector);
        assert!(matches!(
            cnx.request_activation(TESTER).await,
            Err(DoIpError::ConnectionFailed { attempts: 3, .. })
        ));
        assert!(connector.sent().is_empty());
    }

    #[tokio::test]
    async fn activation_send_and_receive_errors() {
        let connector = MockConnector::new();
        let mut cnx = tester(&connector);
        connector.fail_next_send(io::ErrorKind::BrokenPipe);
        assert!(matches!(
            cnx.request_activation(TESTER).await,
            Err(DoIpError::Send(_))
        ));
        assert!(matches!(
            cnx.request_activation(TESTER).await,
            Err(DoIpError::Receive(_))
        ));
    }

    #[tokio::test]
    async fn diagnostic_requires_activation() {
        let connector = MockConnector::new();
        let mut cnx = tester(&connector);
        cnx.connect().await.unwrap();
        assert!(matches!(
            cnx.send_diagnostic(TESTER, ECU, &[0x3e, 0x00]).await,
            Err(DoIpError::NotActivated)
        ));
        assert!(connector.sent().is_empty());
    }

    #[tokio::test]
    async fn diagnostic_positive_ack() {
        let connector = MockConnector::new();
        let mut cnx = activated(&connector).await;
        connector.push_read(&build_diagnostic_ack(ECU, TESTER));
        let sent = cnx.send_diagnostic(TESTER, ECU, &[0x22, 0xf1, 0x90]).await.unwrap();
        assert_eq!(sent, 15);
        let frame = &connector.sent()[1];
        assert_eq!(&frame[8..12], &[0x0e, 0x80, 0x10, 0x01]);
        assert_eq!(&frame[12..], &[0x22, 0xf1, 0x90]);
    }

    #[tokio::test]
    async fn diagnostic_negative_ack() {
        let connector = MockConnector::new();
        let mut cnx = activated(&connector).await;
        connector.push_read(&build_diagnostic_nack(ECU, TESTER, 0x03));
        assert!(matches!(
            cnx.send_diagnostic(TESTER, ECU, &[0x10, 0x03]).await,
            Err(DoIpError::NotAcknowledged {
                received: Some(PayloadType::DiagnosticNegativeAck),
                code: 0x03
            })
        ));
        assert!(cnx.is_activated());
    }

    #[tokio::test]
    async fn diagnostic_empty_read_is_not_acknowledged() {
        let connector = MockConnector::new();
        let mut cnx = activated(&connector).await;
        assert!(matches!(
            cnx.send_diagnostic(TESTER, ECU, &[0x10, 0x03]).await,
            Err(DoIpError::NotAcknowledged { received: None, .. })
        ));
        assert_eq!(cnx.consecutive_empty_reads(), 1);
    }

    #[tokio::test]
    async fn diagnostic_malformed_ack() {
        let connector = MockConnector::new();
        let mut cnx = activated(&connector).await;
        connector.push_read(&[0x02, 0x02, 0x80, 0x02, 0, 0, 0, 0]);
        assert!(matches!(
            cnx.send_diagnostic(TESTER, ECU, &[0x10, 0x03]).await,
            Err(DoIpError::NotAcknowledged {
                received: None,
                code: NACK_INCORRECT_PATTERN_FORMAT
            })
        ));
    }

    #[tokio::test]
    async fn reconnection_drops_activation() {
        let connector = MockConnector::new();
        let mut cnx = activated(&connector).await;
        connector.push_empty_reads(5);
        let mut buffer = [0u8; 8];
        for _ in 0..5 {
            assert_eq!(cnx.receive(&mut buffer).await.unwrap(), 0);
        }
        assert!(cnx.is_connected());
        assert!(!cnx.is_activated());
        assert!(matches!(
            cnx.send_diagnostic(TESTER, ECU, &[0x3e, 0x00]).await,
            Err(DoIpError::NotActivated)
        ));

        let mut cnx = activated(&connector).await;
        cnx.reconnect().await.unwrap();
        assert!(!cnx.is_activated());
    }

    #[tokio::test]
    async fn alive_check_response() {
        let connector = MockConnector::new();
        let mut cnx = tester(&connector);
        cnx.connect().await.unwrap();
        cnx.respond_to_alive_check(TESTER).await.unwrap();
        assert_eq!(
            connector.sent()[0],
            vec![0x02, 0xfd, 0x00, 0x08, 0x00, 0x00, 0x00, 0x02, 0x0e, 0x80]
        );

        connector.fail_next_send(io::ErrorKind::BrokenPipe);
        assert!(cnx.respond_to_alive_check(TESTER).await.is_err());
        assert!(cnx.is_connected());
    }

    #[tokio::test]
    async fn uds_round_trip_with_alive_check() {
        let connector = MockConnector::new();
        let mut cnx = activated(&connector).await;
        connector.push_read(&build_diagnostic_ack(ECU, TESTER));
        connector.push_read(&build_alive_check_request());
        connector.push_read(&build_diagnostic_message(ECU, TESTER, &[0x50, 0x03]));
        let rsp = cnx.send_uds(ECU, &[0x10, 0x03]).await.unwrap();
        assert_eq!(rsp.source_address, ECU);
        assert_eq!(rsp.user_data, vec![0x50, 0x03]);
        let sent = connector.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2], build_alive_check_response(TESTER));
    }

    #[tokio::test]
    async fn activation_timeout() {
        let connector = MockConnector::new();
        let mut cnx = tester(&connector);
        connector.push_stalled_read();
        assert!(matches!(
            cnx.request_activation(TESTER).await,
            Err(DoIpError::Timeout)
        ));
        assert!(cnx.is_connected());
        assert!(!cnx.is_activated());
    }

    #[tokio::test]
    async fn diagnostic_ack_timeout() {
        let connector = MockConnector::new();
        let mut cnx = activated(&connector).await;
        connector.push_stalled_read();
        assert!(matches!(
            cnx.send_diagnostic(TESTER, ECU, &[0x10, 0x03]).await,
            Err(DoIpError::NotAcknowledged {
                received: None,
                code: 0
            })
        ));
        assert_eq!(connector.sent().len(), 2);
        assert!(cnx.is_activated());
    }

    #[tokio::test]
    async fn late_ack_keeps_stream_in_step() {
        let connector = MockConnector::new();
        let mut cnx = activated(&connector).await;
        let ack = build_diagnostic_ack(ECU, TESTER);
        connector.push_read(&ack[..8]);
        connector.push_stalled_read();
        connector.push_read(&ack[8..]);
        connector.push_read(&build_diagnostic_ack(ECU, TESTER));
        assert!(matches!(
            cnx.send_diagnostic(TESTER, ECU, &[0x10, 0x03]).await,
            Err(DoIpError::NotAcknowledged { received: None, .. })
        ));
        // the late ack completes, then the next one is read from its start
        assert_eq!(cnx.send_diagnostic(TESTER, ECU, &[0x3e, 0x00]).await.unwrap(), 14);
        assert_eq!(cnx.send_diagnostic(TESTER, ECU, &[0x3e, 0x00]).await.unwrap(), 14);
    }

    #[tokio::test]
    async fn oversized_answer_then_ack() {
        let connector = MockConnector::new();
        let mut cnx = activated(&connector).await;
        let oversized = build_diagnostic_message(ECU, TESTER, &[0x55; 4996]);
        assert_eq!(oversized.len(), 8 + 5000);
        connector.push_read(&oversized);
        connector.push_read(&build_diagnostic_ack(ECU, TESTER));
        assert!(matches!(
            cnx.send_diagnostic(TESTER, ECU, &[0x22, 0xf1, 0x90]).await,
            Err(DoIpError::NotAcknowledged {
                received: None,
                code: NACK_MESSAGE_TOO_LARGE
            })
        ));
        assert_eq!(cnx.send_diagnostic(TESTER, ECU, &[0x3e, 0x00]).await.unwrap(), 14);
        assert!(cnx.is_connected());
    }

    #[tokio::test]
    async fn diagnostic_response_timeout() {
        let connector = MockConnector::new();
        let mut cnx = activated(&connector).await;
        connector.push_stalled_read();
        assert!(matches!(
            cnx.receive_diagnostic_response().await,
            Err(DoIpError::Timeout)
        ));
    }

    #[tokio::test]
    async fn diagnostic_response_of_unexpected_type() {
        let connector = MockConnector::new();
        let mut cnx = activated(&connector).await;
        connector.push_read(&build_generic_nack(NACK_INCORRECT_PATTERN_FORMAT));
        assert!(matches!(
            cnx.receive_diagnostic_response().await,
            Err(DoIpError::UnexpectedPayload(PayloadType::NegativeAck))
        ));
    }

    #[tokio::test]
    async fn alive_check_answer_failure_is_skipped() {
        let connector = MockConnector::new();
        let mut cnx = activated(&connector).await;
        connector.push_read(&build_alive_check_request());
        connector.push_read(&build_diagnostic_message(ECU, TESTER, &[0x7e, 0x00]));
        connector.fail_next_send(io::ErrorKind::BrokenPipe);
        let rsp = cnx.receive_diagnostic_response().await.unwrap();
        assert_eq!(rsp.user_data, vec![0x7e, 0x00]);
    }

    #[tokio::test]
    async fn source_address_from_bytes() {
        let connector = MockConnector::new();
        let mut cnx = tester(&connector);
        cnx.set_source_address_bytes([0x0e, 0x01]);
        assert_eq!(cnx.source_address(), 0x0e01);
    }
}
