use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::DoIpError;

/// Default DoIP server port, both for TCP and UDP.
pub const DOIP_PORT: u16 = 13400;

#[derive(Debug, Clone)]
/// Timings
///
/// Timings for connection establishement, and more specifically timeouts.
pub struct Timings {
    /// Maximum time for one TCP connection attempt to be established.
    pub tcp_connect: Duration,
    /// Maximum time to wait for the routing activation response.
    pub routing_activation_rsp: Duration,
    /// Maximum time to wait for a diagnostic message acknowledgement.
    pub diagnostic_ack: Duration,
    /// Pause between two failed connection attempts. Zero retries immediately.
    pub connect_retry_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            tcp_connect: Duration::from_secs(1),
            routing_activation_rsp: Duration::from_secs(1),
            diagnostic_ack: Duration::from_secs(2),
            connect_retry_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
/// Tester side configuration.
pub struct ClientConfig {
    /// IP address of the DoIP entity (ECU or gateway).
    pub ecu_address: String,
    /// DoIP entity TCP port.
    pub tcp_port: u16,
    /// DoIP UDP port, used for discovery.
    pub udp_port: u16,
    /// Local address the TCP socket is bound to, if any.
    pub local_addr: Option<SocketAddr>,
    /// Dump received frames and acknowledgement outcomes.
    pub verbose: bool,
    /// Number of TCP connection attempts before giving up.
    pub retries: u32,
    /// Tester logical address.
    pub source_address: u16,
    /// Routing activation type sent in the activation request.
    pub activation_type: u8,
    /// Largest inbound payload accepted on the TCP session.
    pub max_payload_size: u32,
    /// Timeouts.
    pub timings: Timings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ecu_address: "127.0.0.1".to_string(),
            tcp_port: DOIP_PORT,
            udp_port: DOIP_PORT,
            local_addr: None,
            verbose: false,
            retries: 3,
            source_address: 0x0e00,
            activation_type: 0x00,
            max_payload_size: 4096,
            timings: Timings::default(),
        }
    }
}

impl ClientConfig {
    /// Configuration for the entity at `ecu_address`, defaults elsewhere.
    pub fn new(ecu_address: impl Into<String>) -> Self {
        Self {
            ecu_address: ecu_address.into(),
            ..Default::default()
        }
    }

    /// Socket address of the DoIP entity TCP server.
    pub fn remote_addr(&self) -> Result<SocketAddr, DoIpError> {
        let ip: IpAddr = self
            .ecu_address
            .parse()
            .map_err(|_| DoIpError::InvalidAddress(self.ecu_address.clone()))?;
        Ok(SocketAddr::new(ip, self.tcp_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::new("10.0.0.2");
        assert_eq!(config.retries, 3);
        assert_eq!(config.tcp_port, 13400);
        assert_eq!(config.udp_port, 13400);
        assert!(!config.verbose);
        assert_eq!(config.timings.connect_retry_delay, Duration::ZERO);
        assert_eq!(
            config.remote_addr().unwrap(),
            "10.0.0.2:13400".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn bad_ecu_address() {
        let config = ClientConfig::new("ecu.local");
        assert!(matches!(
            config.remote_addr(),
            Err(DoIpError::InvalidAddress(addr)) if addr == "ecu.local"
        ));
    }
}
