use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use doip_tester_tokio::header::{decode_header, DOIP_HEADER_LENGTH};
use doip_tester_tokio::{
    build_activation_response, build_diagnostic_ack, build_diagnostic_message,
    build_identification_response, connect_doip_tcp, ClientConfig, DoIpError, DoIpTcpConnection,
    DoIpUdpConnection, PayloadType, VehicleIdentificationResult, ROUTING_SUCCESSFULLY_ACTIVATED,
};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

const TESTER: u16 = 0x0e80;
const ECU: u16 = 0x1001;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config_for(addr: SocketAddr) -> ClientConfig {
    let mut config = ClientConfig::new(addr.ip().to_string());
    config.tcp_port = addr.port();
    config.source_address = TESTER;
    config.verbose = true;
    config
}

async fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut frame = vec![0u8; DOIP_HEADER_LENGTH];
    stream.read_exact(&mut frame).await?;
    let length = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
    frame.resize(DOIP_HEADER_LENGTH + length, 0);
    stream.read_exact(&mut frame[DOIP_HEADER_LENGTH..]).await?;
    Ok(frame)
}

/// A DoIP entity answering `sessions` connections in turn: routing activation
/// with `activation_code`, diagnostic messages with an ack and an echo of the
/// request with 0x40 added to the service identifier.
fn spawn_entity(listener: TcpListener, sessions: usize, activation_code: u8) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut diagnostics = 0;
        for session in 0..sessions {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut served = 0;
            while let Ok(frame) = read_frame(&mut stream).await {
                let action = decode_header(&frame, true).unwrap();
                let payload = &frame[DOIP_HEADER_LENGTH..];
                match action.payload_type {
                    PayloadType::RoutingActivationRequest => {
                        let tester = u16::from_be_bytes([payload[0], payload[1]]);
                        let rsp = build_activation_response(tester, ECU, activation_code);
                        stream.write_all(&rsp).await.unwrap();
                    }
                    PayloadType::DiagnosticMessage => {
                        diagnostics += 1;
                        served += 1;
                        let tester = u16::from_be_bytes([payload[0], payload[1]]);
                        let mut answer = payload[4..].to_vec();
                        answer[0] += 0x40;
                        stream
                            .write_all(&build_diagnostic_ack(ECU, tester))
                            .await
                            .unwrap();
                        stream
                            .write_all(&build_diagnostic_message(ECU, tester, &answer))
                            .await
                            .unwrap();
                    }
                    _ => break,
                }
                if served == 1 && session + 1 < sessions {
                    // drop all but the last session after one request
                    break;
                }
            }
        }
        diagnostics
    })
}

#[tokio::test]
async fn activate_and_exchange_uds() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = config_for(listener.local_addr().unwrap());
    let entity = spawn_entity(listener, 1, ROUTING_SUCCESSFULLY_ACTIVATED);

    let mut cnx = connect_doip_tcp(&config).await.unwrap();
    assert!(cnx.is_activated());
    let rsp = cnx.send_uds(ECU, &[0x22, 0xf1, 0x90]).await.unwrap();
    assert_eq!(rsp.source_address, ECU);
    assert_eq!(rsp.target_address, TESTER);
    assert_eq!(rsp.user_data, vec![0x62, 0xf1, 0x90]);

    let sent = cnx.send_diagnostic(TESTER, ECU, &[0x3e, 0x00]).await.unwrap();
    assert_eq!(sent, 14);
    assert_eq!(
        cnx.receive_diagnostic_response().await.unwrap().user_data,
        vec![0x7e, 0x00]
    );

    cnx.disconnect().await;
    assert_eq!(entity.await.unwrap(), 2);
}

#[tokio::test]
async fn denied_activation() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = config_for(listener.local_addr().unwrap());
    let _entity = spawn_entity(listener, 1, 0x06);

    assert!(matches!(
        connect_doip_tcp(&config).await,
        Err(DoIpError::RoutingActivationDenied(0x06))
    ));
}

#[tokio::test]
async fn unreachable_entity() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = config_for(listener.local_addr().unwrap());
    drop(listener);
    config.retries = 2;
    config.timings.connect_retry_delay = Duration::from_millis(10);

    let mut cnx = DoIpTcpConnection::new(&config).unwrap();
    let err = cnx.request_activation(TESTER).await.unwrap_err();
    let re = Regex::new(r"^unable to connect to 127\.0\.0\.1:\d+ after 2 attempt\(s\)$").unwrap();
    assert!(re.is_match(&err.to_string()), "{}", err);
    assert!(!cnx.is_connected());
}

#[tokio::test]
async fn dead_peer_is_reconnected() {
    init_logs();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = config_for(listener.local_addr().unwrap());
    let entity = spawn_entity(listener, 2, ROUTING_SUCCESSFULLY_ACTIVATED);

    let mut cnx = connect_doip_tcp(&config).await.unwrap();
    cnx.send_uds(ECU, &[0x10, 0x03]).await.unwrap();

    let mut buffer = [0u8; 64];
    for _ in 0..5 {
        assert_eq!(cnx.receive(&mut buffer).await.unwrap(), 0);
    }
    assert_eq!(cnx.consecutive_empty_reads(), 0);
    assert!(cnx.is_connected());
    assert!(!cnx.is_activated());
    assert!(matches!(
        cnx.send_diagnostic(TESTER, ECU, &[0x3e, 0x00]).await,
        Err(DoIpError::NotActivated)
    ));

    assert!(cnx.request_activation(TESTER).await.unwrap());
    let rsp = cnx.send_uds(ECU, &[0x3e, 0x00]).await.unwrap();
    assert_eq!(rsp.user_data, vec![0x7e, 0x00]);
    cnx.disconnect().await;
    assert_eq!(entity.await.unwrap(), 2);
}

#[tokio::test]
async fn discovery_over_loopback() {
    init_logs();
    let entity = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let entity_addr = entity.local_addr().unwrap();
    let identity = VehicleIdentificationResult {
        vin: *b"WVWZZZ3CZWE123456",
        logical_address: ECU.to_be_bytes(),
        eid: [0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e],
        gid: [0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5],
        further_action_required: 0x00,
        vin_gid_sync_status: Some(0x00),
    };
    let expected = identity.clone();
    let responder = tokio::spawn(async move {
        let mut buffer = [0u8; 64];
        let (len, tester) = entity.recv_from(&mut buffer).await.unwrap();
        let action = decode_header(&buffer[..len], true).unwrap();
        assert_eq!(action.payload_type, PayloadType::VehicleIdentRequest);
        assert_eq!(action.payload_length, 0);
        // an unrelated frame first, then the answer
        entity
            .send_to(&build_diagnostic_ack(ECU, TESTER), tester)
            .await
            .unwrap();
        entity
            .send_to(&build_identification_response(&identity), tester)
            .await
            .unwrap();
    });

    let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut udp = DoIpUdpConnection::bind(local, entity_addr.port())
        .await
        .unwrap();
    udp.broadcast_identification_request(Some(entity_addr.ip()))
        .await
        .unwrap();
    assert_eq!(udp.receive_identification_response().await.unwrap(), None);
    let vehicle = udp.receive_identification_response().await.unwrap().unwrap();
    assert_eq!(vehicle, expected);
    assert_eq!(vehicle.vin_string(), "WVWZZZ3CZWE123456");
    assert_eq!(udp.last_sender(), Some(entity_addr));
    responder.await.unwrap();
}
