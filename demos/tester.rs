use std::env;
use std::net::SocketAddr;
use std::time::Duration;

extern crate doip_tester_tokio;

use doip_tester_tokio::{connect_doip_tcp, ClientConfig, DoIpError, DoIpUdpConnection};
use log::{error, info};
use tokio::time;

const ECU_ADDRESS: u16 = 0x1001;

async fn discover(config: &ClientConfig) -> Result<(), DoIpError> {
    let local = SocketAddr::from(([0, 0, 0, 0], 0));
    let mut udp = DoIpUdpConnection::bind(local, config.udp_port).await?;
    let target = config.ecu_address.parse().ok();
    udp.broadcast_identification_request(target).await?;
    match time::timeout(Duration::from_secs(1), udp.receive_identification_response()).await {
        Ok(Ok(Some(vehicle))) => println!(
            "VIN: {} LogicalAddress: {:04X} EID: {:02X?} GID: {:02X?} FurtherActionRequest: {:02X}",
            vehicle.vin_string(),
            vehicle.logical_address_u16(),
            vehicle.eid,
            vehicle.gid,
            vehicle.further_action_required
        ),
        Ok(Ok(None)) => info!("No vehicle identification response"),
        Ok(Err(e)) => return Err(e),
        Err(_) => info!("No DoIP entity answered"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), DoIpError> {
    env_logger::init();
    let mut config = ClientConfig::new(env::args().nth(1).unwrap_or("127.0.0.1".to_string()));
    config.verbose = true;
    config.source_address = 0x0e80;

    if let Err(e) = discover(&config).await {
        error!("Discovery failed: {}", e);
    }

    let mut cnx = connect_doip_tcp(&config).await?;
    let rsp = cnx.send_uds(ECU_ADDRESS, &[0x22, 0xf1, 0x90]).await?;
    println!("UDS answer from {:#06x}: {:02x?}", rsp.source_address, rsp.user_data);
    cnx.disconnect().await;
    Ok(())
}
