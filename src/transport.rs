//! Transport contract consumed by the DoIP engine
//!
//! The engine never opens sockets by itself: it connects, sends and receives
//! through these traits. The tokio implementations below are the ones used
//! outside of tests.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::trace;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time;

#[allow(async_fn_in_trait)]
/// A connected byte stream, the TCP DoIP session.
pub trait DoIpStream {
    /// Write all of `bytes`, returning the number of bytes written.
    async fn send(&mut self, bytes: &[u8]) -> io::Result<usize>;
    /// Read at most `buffer.len()` bytes. `Ok(0)` is an empty read.
    async fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize>;
    /// Close the stream. Never fails, even on an already closed stream.
    async fn close(&mut self);
}

#[allow(async_fn_in_trait)]
/// Opens [`DoIpStream`]s towards a DoIP entity.
pub trait StreamConnector {
    /// The connected stream type.
    type Stream: DoIpStream;
    /// Make one connection attempt to `remote`.
    async fn connect(&mut self, remote: SocketAddr) -> io::Result<Self::Stream>;
}

#[allow(async_fn_in_trait)]
/// A datagram socket, used for vehicle discovery.
pub trait DatagramTransport {
    /// Allow sending to broadcast addresses.
    fn set_broadcast(&self, on: bool) -> io::Result<()>;
    /// Send one datagram to `target`.
    async fn send_to(&mut self, bytes: &[u8], target: SocketAddr) -> io::Result<usize>;
    /// Receive one datagram and its sender.
    async fn recv_from(&mut self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

impl DoIpStream for TcpStream {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.write_all(bytes).await?;
        Ok(bytes.len())
    }

    async fn receive(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.read(buffer).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.shutdown().await {
            trace!(target: "doip_tcp", "Ignoring shutdown error: {}", e);
        }
    }
}

#[derive(Debug, Clone)]
/// Tokio TCP connector.
///
/// Each attempt creates a fresh socket, optionally bound to a local address,
/// and connects it within the `tcp_connect` timing.
pub struct TcpConnector {
    local_addr: Option<SocketAddr>,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector.
    pub fn new(local_addr: Option<SocketAddr>, connect_timeout: Duration) -> Self {
        Self {
            local_addr,
            connect_timeout,
        }
    }
}

impl StreamConnector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&mut self, remote: SocketAddr) -> io::Result<TcpStream> {
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local_addr) = self.local_addr {
            socket.bind(local_addr)?;
        }
        let stream = time::timeout(self.connect_timeout, socket.connect(remote))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "DoIP connection timeout"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl DatagramTransport for UdpSocket {
    fn set_broadcast(&self, on: bool) -> io::Result<()> {
        UdpSocket::set_broadcast(self, on)
    }

    async fn send_to(&mut self, bytes: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, bytes, target).await
    }

    async fn recv_from(&mut self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buffer).await
    }
}
