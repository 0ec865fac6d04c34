//! TCP connection lifecycle
//!
//! Owns the DoIP TCP stream: bounded connection retries, detection of a dead
//! peer through consecutive empty reads, and reconnection.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::time;

use crate::header::{self, HeaderError, DOIP_HEADER_LENGTH};
use crate::transport::{DoIpStream, StreamConnector};
use crate::DoIpError;

/// Number of consecutive empty reads after which the link is considered dead
/// and is reconnected.
pub const EMPTY_READ_THRESHOLD: u32 = 5;

const READ_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// State of the TCP link.
pub enum LinkState {
    /// No stream.
    Disconnected,
    /// First connection attempts in progress.
    Connecting,
    /// A stream is established.
    Connected,
    /// The stream was dropped and connection attempts are in progress.
    Reconnecting,
}

/// Connection lifecycle manager.
///
/// Only this type mutates the stream and the empty reads counter. Each
/// successful connection bumps a generation number, which lets the session
/// layer notice that the stream it activated is gone.
///
/// The bytes of a frame being received are kept here, not in the caller, so
/// that a frame wait cancelled by a timeout resumes where it stopped on the
/// next call.
pub struct ConnectionManager<C: StreamConnector> {
    connector: C,
    remote: SocketAddr,
    retries: u32,
    retry_delay: Duration,
    verbose: bool,
    stream: Option<C::Stream>,
    state: LinkState,
    consecutive_empty_reads: u32,
    generation: u64,
    partial_frame: Vec<u8>,
    discard: usize,
}

impl<C: StreamConnector> ConnectionManager<C> {
    /// Create a disconnected manager for the entity at `remote`.
    pub fn new(connector: C, remote: SocketAddr, retries: u32) -> Self {
        Self {
            connector,
            remote,
            retries,
            retry_delay: Duration::ZERO,
            verbose: false,
            stream: None,
            state: LinkState::Disconnected,
            consecutive_empty_reads: 0,
            generation: 0,
            partial_frame: Vec::new(),
            discard: 0,
        }
    }

    /// Pause between failed connection attempts.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Dump received bytes at debug level.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Whether a stream is established.
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Number of empty reads in a row on the current stream.
    pub fn consecutive_empty_reads(&self) -> u32 {
        self.consecutive_empty_reads
    }

    /// Number of successful connections so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Address of the DoIP entity.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Connect the stream, trying at most `retries` times.
    ///
    /// A manager already connected is left untouched. A budget of zero still
    /// makes one attempt.
    pub async fn connect(&mut self) -> Result<(), DoIpError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.state != LinkState::Reconnecting {
            self.state = LinkState::Connecting;
        }
        let attempts = self.retries.max(1);
        for attempt in 1..=attempts {
            match self.connector.connect(self.remote).await {
                Ok(stream) => {
                    info!(target: "doip_tcp", "DoIP connection established to {}", self.remote);
                    self.stream = Some(stream);
                    self.state = LinkState::Connected;
                    self.consecutive_empty_reads = 0;
                    self.generation += 1;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        target: "doip_tcp",
                        "Unable to connect to {}, try {}/{}: {}", self.remote, attempt, attempts, e
                    );
                    if attempt < attempts && !self.retry_delay.is_zero() {
                        time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        self.state = LinkState::Disconnected;
        Err(DoIpError::ConnectionFailed {
            addr: self.remote,
            attempts,
        })
    }

    /// Close the stream and connect again.
    pub async fn reconnect(&mut self) -> Result<(), DoIpError> {
        self.close_stream().await;
        self.state = LinkState::Reconnecting;
        self.connect().await
    }

    /// Close the stream. Safe to call on a closed link.
    pub async fn disconnect(&mut self) {
        self.close_stream().await;
        self.state = LinkState::Disconnected;
    }

    async fn close_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close().await;
            info!(target: "doip_tcp", "DoIP connection to {} closed", self.remote);
        }
        self.consecutive_empty_reads = 0;
        self.partial_frame.clear();
        self.discard = 0;
    }

    /// Write a whole frame.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<usize, DoIpError> {
        let stream = self.stream.as_mut().ok_or(DoIpError::NotConnected)?;
        trace!(target: "doip_tcp", "Writing out {:02x?}", bytes);
        stream.send(bytes).await.map_err(DoIpError::Send)
    }

    /// Read whatever is available, at most `buffer.len()` bytes.
    ///
    /// An empty read is returned as `Ok(0)`. On the
    /// [`EMPTY_READ_THRESHOLD`]th empty read in a row the stream is
    /// reconnected before returning, so that the next call reads from a fresh
    /// stream.
    pub async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, DoIpError> {
        let stream = self.stream.as_mut().ok_or(DoIpError::NotConnected)?;
        let read = stream.receive(buffer).await.map_err(DoIpError::Receive)?;
        if read == 0 {
            self.consecutive_empty_reads += 1;
            if self.consecutive_empty_reads >= EMPTY_READ_THRESHOLD {
                warn!(
                    target: "doip_tcp",
                    "Received {} empty messages, reconnecting to {}",
                    self.consecutive_empty_reads,
                    self.remote
                );
                if let Err(e) = self.reconnect().await {
                    warn!(target: "doip_tcp", "Reconnection failed: {}", e);
                }
            }
            return Ok(0);
        }
        self.consecutive_empty_reads = 0;
        trace!(target: "doip_tcp", "Reading in {:02x?}", &buffer[..read]);
        if self.verbose {
            debug!(target: "doip_tcp", "Client received: {:02x?}", &buffer[..read]);
        }
        Ok(read)
    }

    /// Append at most `wanted` bytes to the frame being received. Returns
    /// `false` on an empty read.
    async fn read_partial_frame(&mut self, wanted: usize) -> Result<bool, DoIpError> {
        let mut chunk = [0u8; READ_CHUNK];
        let wanted = wanted.min(READ_CHUNK);
        let read = self.receive(&mut chunk[..wanted]).await?;
        self.partial_frame.extend_from_slice(&chunk[..read]);
        Ok(read > 0)
    }

    /// Drop the payload bytes left over by an oversized frame. Returns `false`
    /// when an empty read stops it before the end.
    async fn skip_discarded(&mut self) -> Result<bool, DoIpError> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.discard > 0 {
            let wanted = self.discard.min(READ_CHUNK);
            let read = self.receive(&mut chunk[..wanted]).await?;
            if read == 0 {
                return Ok(false);
            }
            self.discard -= read;
        }
        Ok(true)
    }

    /// Read one whole DoIP frame: header, then as many payload bytes as the
    /// header declares.
    ///
    /// Returns `Ok(None)` when the very first read is empty. A frame
    /// interrupted by an empty read is a receive error, its bytes are kept and
    /// the next call carries on with it. The same goes when the returned
    /// future is dropped before completion.
    ///
    /// A frame declaring more than `max_payload` bytes fails with
    /// [`HeaderError::MessageTooLarge`]. Its payload is read and dropped, so
    /// the next call starts on the following frame.
    pub async fn receive_frame(&mut self, max_payload: u32) -> Result<Option<Vec<u8>>, DoIpError> {
        if !self.skip_discarded().await? {
            return Ok(None);
        }
        while self.partial_frame.len() < DOIP_HEADER_LENGTH {
            let started = !self.partial_frame.is_empty();
            let wanted = DOIP_HEADER_LENGTH - self.partial_frame.len();
            if !self.read_partial_frame(wanted).await? {
                if !started {
                    return Ok(None);
                }
                return Err(DoIpError::Receive(io::ErrorKind::UnexpectedEof.into()));
            }
        }
        let payload_length = match header::parse_header(&self.partial_frame, false) {
            Ok((_, payload_length)) => payload_length,
            Err(e) => {
                self.partial_frame.clear();
                return Err(e.into());
            }
        };
        if payload_length > max_payload {
            warn!(
                target: "doip_tcp",
                "Dropping {} bytes payload, above the {} bytes limit", payload_length, max_payload
            );
            self.partial_frame.clear();
            self.discard = payload_length as usize;
            if !self.skip_discarded().await? {
                debug!(target: "doip_tcp", "{} payload bytes left to drop", self.discard);
            }
            return Err(HeaderError::MessageTooLarge {
                declared: payload_length,
                max: max_payload,
            }
            .into());
        }
        let frame_length = DOIP_HEADER_LENGTH + payload_length as usize;
        while self.partial_frame.len() < frame_length {
            let wanted = frame_length - self.partial_frame.len();
            if !self.read_partial_frame(wanted).await? {
                return Err(DoIpError::Receive(io::ErrorKind::UnexpectedEof.into()));
            }
        }
        Ok(Some(std::mem::take(&mut self.partial_frame)))
    }
}
