use std::fmt::Write;
use std::{io, str::from_utf8};

extern crate doip_tester_tokio;

use doip_tester_tokio::header::{decode_header, HeaderError, DOIP_HEADER_LENGTH};
use doip_tester_tokio::{
    build_activation_response, build_diagnostic_ack, build_diagnostic_message,
    build_identification_response, PayloadType, VehicleIdentificationResult,
    ROUTING_SUCCESSFULLY_ACTIVATED,
};
use log::{error, info};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task;

const ENTITY_ADDRESS: u16 = 0x1001;

const UDS_ANSWERS: [(&str, &str); 4] = [
    (
        r"22f012",
        "62 f0 12 32 36 34 31 33 30 30 35 30 30 52 31", //"62140350001R"
    ),
    (
        r"22f190",
        "62 f1 90 56 46 31 58 52 32 31 30 46 53 54 47 42 45 4e 30 34", // VF1XR210FSTGBEN04
    ),
    (r"22.*", "7f2210"),
    (r"19 0a", "59 0a ff ea 19 88 00 fd 01 50"),
];

fn identity() -> VehicleIdentificationResult {
    VehicleIdentificationResult {
        vin: *b"VF1XR210FSTGBEN04",
        logical_address: ENTITY_ADDRESS.to_be_bytes(),
        eid: [0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e],
        gid: [0; 6],
        further_action_required: 0x00,
        vin_gid_sync_status: None,
    }
}

fn find_uds_answer(req: &[u8]) -> Option<Vec<u8>> {
    let req_nibbles = bin2nibbles(req);
    for (regex, answer) in UDS_ANSWERS.into_iter() {
        let regex = regex.replace(' ', "");
        let re = Regex::new(&regex).ok()?;
        if re.is_match(&req_nibbles) {
            return Some(nibbles2bin(answer));
        }
    }
    None
}

fn bin2nibbles(req: &[u8]) -> String {
    req.iter().fold(String::new(), |mut output, b| {
        let _ = write!(output, "{b:02x}");
        output
    })
}

fn nibbles2bin(req: &str) -> Vec<u8> {
    let req = req.replace(' ', "");
    req.as_bytes()
        .chunks(2)
        .filter_map(|c| u8::from_str_radix(from_utf8(c).ok()?, 16).ok())
        .collect::<Vec<u8>>()
}

async fn read_frame(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut frame = vec![0u8; DOIP_HEADER_LENGTH];
    stream.read_exact(&mut frame).await?;
    let length = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
    frame.resize(DOIP_HEADER_LENGTH + length, 0);
    stream.read_exact(&mut frame[DOIP_HEADER_LENGTH..]).await?;
    Ok(frame)
}

async fn handle_cnx(mut client: TcpStream) -> io::Result<()> {
    loop {
        let frame = read_frame(&mut client).await?;
        let action = match decode_header(&frame, true) {
            Ok(action) => action,
            Err(e @ HeaderError::UnknownPayloadType(_)) => {
                error!("Rejecting frame: {}", e);
                continue;
            }
            Err(e) => {
                error!("Closing on malformed frame: {}", e);
                return Ok(());
            }
        };
        let payload = &frame[DOIP_HEADER_LENGTH..];
        match action.payload_type {
            PayloadType::RoutingActivationRequest if payload.len() >= 2 => {
                let tester = u16::from_be_bytes([payload[0], payload[1]]);
                info!("Routing activation for tester {:#06x}", tester);
                let rsp =
                    build_activation_response(tester, ENTITY_ADDRESS, ROUTING_SUCCESSFULLY_ACTIVATED);
                client.write_all(&rsp).await?;
            }
            PayloadType::DiagnosticMessage if payload.len() >= 4 => {
                let tester = u16::from_be_bytes([payload[0], payload[1]]);
                let uds = &payload[4..];
                println!("UDS  input: {:02x?}", uds);
                client
                    .write_all(&build_diagnostic_ack(ENTITY_ADDRESS, tester))
                    .await?;
                let answer = match find_uds_answer(uds) {
                    None => vec![0x7f, uds.first().copied().unwrap_or_default(), 0x11],
                    Some(answer) => answer,
                };
                println!("UDS output: {:02x?}", answer);
                client
                    .write_all(&build_diagnostic_message(ENTITY_ADDRESS, tester, &answer))
                    .await?;
            }
            PayloadType::AliveCheckResponse => {}
            other => {
                error!("Unexpected {:?}, closing", other);
                return Ok(());
            }
        }
    }
}

async fn answer_discovery(socket: UdpSocket) -> io::Result<()> {
    let mut buffer = [0u8; 512];
    loop {
        let (len, tester) = socket.recv_from(&mut buffer).await?;
        if let Ok(action) = decode_header(&buffer[..len], false) {
            if action.payload_type == PayloadType::VehicleIdentRequest {
                let rsp = build_identification_response(&identity());
                socket.send_to(&rsp, tester).await?;
            }
        }
    }
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();
    let listener = TcpListener::bind("127.0.0.1:13400").await?;
    let udp = UdpSocket::bind("127.0.0.1:13400").await?;
    task::spawn(answer_discovery(udp));
    loop {
        let (client, addr) = listener.accept().await?;
        info!("Tester connected from {}", addr);
        task::spawn(async move {
            if let Err(e) = handle_cnx(client).await {
                info!("Tester {} gone: {}", addr, e);
            }
        });
    }
}
