//! The single outbound server connection.
//!
//! A [`ConnectionManager`] owns the recipe for reaching the server (endpoint,
//! [`Connector`], retry policy, framing) and hands out one [`Connection`] at a
//! time. [`ConnectionManager::reconnect`] consumes the old connection, so two
//! connections can never be alive at once.
//!
//! # Lifecycle
//!
//! ```text
//!  Connecting --connect ok--> Handshaking --hello sent--> Streaming
//!      ^                                                      |
//!      |                                        peer closed / reset
//!      +----------------- reconnect <------ Disconnected <----+
//! ```
//!
//! Data frames are refused until the handshake frame has gone out on that
//! connection.
//!
//! # Polling
//!
//! The forwarding loop never blocks on the network. [`Connection::try_recv`]
//! polls one bounded read exactly once and reports a [`RecvOutcome`]:
//! data, nothing yet, or closed. Sends, on the other hand, always complete
//! fully before returning.

pub mod tls;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Endpoint, TransportSecurityConfig},
    error::{Error, Result},
    framing::{FrameCodec, Framing},
    tracing::prelude::*,
    types::RetryPolicy,
};

pub use tls::TlsClient;

/// Upper bound on one connect attempt, TLS handshake included.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on an orderly shutdown before the socket is simply dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound for one non-blocking read.
pub const DEFAULT_RECV_LIMIT: usize = 1024;

/// A bidirectional byte stream: plain TCP, TLS, or an in-memory pipe.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Opens a byte stream to an endpoint. One call is one attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream>;
}

/// TCP connector, optionally wrapping the socket in mutual TLS.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    tls: Option<TlsClient>,
    timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::plain()
    }
}

impl TcpConnector {
    pub fn plain() -> Self {
        Self {
            tls: None,
            timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_tls(tls: TlsClient) -> Self {
        Self {
            tls: Some(tls),
            ..Self::plain()
        }
    }

    /// Bound each attempt by `timeout` instead of [`CONNECT_TIMEOUT`].
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connector for the configured transport security.
    ///
    /// TLS material is loaded here, once, so a broken certificate is a
    /// startup error rather than an endless retry.
    pub fn from_security(security: &TransportSecurityConfig) -> Result<Self> {
        match security {
            TransportSecurityConfig::MutualTls {
                client_cert,
                client_key,
                ca_cert,
            } => Ok(Self::with_tls(TlsClient::from_files(
                client_cert,
                client_key,
                ca_cert,
            )?)),
            TransportSecurityConfig::None | TransportSecurityConfig::PresharedKeyStream { .. } => {
                Ok(Self::plain())
            }
        }
    }

    async fn open(&self, endpoint: &Endpoint) -> io::Result<BoxedStream> {
        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;

        // Raw framing relies on one write going out as one segment.
        tcp.set_nodelay(true)?;

        match &self.tls {
            None => Ok(Box::new(tcp)),
            Some(tls) => {
                let stream = tls.handshake(&endpoint.host, tcp).await?;
                debug!(endpoint = %endpoint, "TLS session established");
                Ok(Box::new(stream))
            }
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream> {
        tokio::time::timeout(self.timeout, self.open(endpoint))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no session within {:?}", self.timeout),
                )
            })?
    }
}

/// Where a connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Streaming,
}

/// Result of one non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A complete frame arrived.
    Data(Bytes),
    /// Nothing to read right now. Not an error.
    WouldBlock,
    /// The peer ended the connection.
    Closed,
}

/// Whether a read result means the peer has gone away.
///
/// A zero-length read is the peer's orderly close. Resets and broken pipes
/// mean the same thing for our purposes. Would-block and other transient
/// errors do not.
pub fn detect_close(result: &io::Result<usize>) -> bool {
    match result {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => is_close_error(e),
    }
}

pub(crate) fn is_close_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// One live connection to the server.
pub struct Connection {
    stream: BoxedStream,
    codec: FrameCodec,
    read_buf: BytesMut,
    scratch: Vec<u8>,
    state: ConnectionState,
    serial_no: u64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("serial_no", &self.serial_no)
            .field("state", &self.state)
            .field("framing", &self.codec.framing())
            .field("buffered", &self.read_buf.len())
            .finish()
    }
}

impl Connection {
    /// Wrap a freshly connected stream. The connection starts out waiting
    /// for its handshake.
    pub fn new(stream: BoxedStream, framing: Framing, recv_limit: usize, serial_no: u64) -> Self {
        Self {
            stream,
            codec: FrameCodec::new(framing),
            read_buf: BytesMut::new(),
            scratch: vec![0; recv_limit.max(1)],
            state: ConnectionState::Handshaking,
            serial_no,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Sequence number of this connection since startup, from 1.
    pub fn serial_no(&self) -> u64 {
        self.serial_no
    }

    /// Send the handshake frame. Only valid once, right after connect.
    pub(crate) async fn send_handshake(&mut self, frame: Bytes) -> io::Result<()> {
        if self.state != ConnectionState::Handshaking {
            return Err(io::Error::other(format!(
                "handshake on connection in state {}",
                self.state
            )));
        }
        self.write_frame(frame).await?;
        self.state = ConnectionState::Streaming;
        Ok(())
    }

    /// Send one data frame. Refused until the handshake went out.
    pub async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        if self.state != ConnectionState::Streaming {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("data frame on connection in state {}", self.state),
            ));
        }
        self.write_frame(frame).await
    }

    async fn write_frame(&mut self, frame: Bytes) -> io::Result<()> {
        let mut wire = BytesMut::new();
        self.codec.encode(frame, &mut wire)?;
        self.stream.write_all(&wire).await?;
        self.stream.flush().await
    }

    /// Poll one bounded read without waiting.
    ///
    /// A complete frame already buffered from an earlier read is returned
    /// without touching the socket.
    pub fn try_recv(&mut self) -> RecvOutcome {
        match self.codec.decode(&mut self.read_buf) {
            Ok(Some(frame)) => return RecvOutcome::Data(frame.freeze()),
            Ok(None) => {}
            Err(e) => return self.framing_error(e),
        }

        let read = self.stream.read(&mut self.scratch).now_or_never();
        let result = match read {
            None => return RecvOutcome::WouldBlock,
            Some(result) => result,
        };

        if detect_close(&result) {
            self.state = ConnectionState::Disconnected;
            return RecvOutcome::Closed;
        }

        match result {
            Ok(n) => {
                trace!(conn = self.serial_no, bytes = n, "Network read");
                self.read_buf.extend_from_slice(&self.scratch[..n]);
                match self.codec.decode(&mut self.read_buf) {
                    Ok(Some(frame)) => RecvOutcome::Data(frame.freeze()),
                    Ok(None) => RecvOutcome::WouldBlock,
                    Err(e) => self.framing_error(e),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => RecvOutcome::WouldBlock,
            Err(e) => {
                debug!(conn = self.serial_no, error = %e, "Network read failed; treating as no data");
                RecvOutcome::WouldBlock
            }
        }
    }

    // A framing violation leaves the stream unparseable, so the connection
    // is given up like a peer close.
    fn framing_error(&mut self, e: io::Error) -> RecvOutcome {
        warn!(conn = self.serial_no, error = %e, "Framing error; dropping connection");
        self.read_buf.clear();
        self.state = ConnectionState::Disconnected;
        RecvOutcome::Closed
    }

    /// Shut the connection down and release the socket.
    pub async fn close(mut self) {
        self.state = ConnectionState::Disconnected;
        match tokio::time::timeout(CLOSE_TIMEOUT, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!(conn = self.serial_no, error = %e, "Shutdown failed"),
            Err(_) => trace!(conn = self.serial_no, "Shutdown timed out"),
        }
        debug!(conn = self.serial_no, "Connection closed");
    }
}

/// Owner of the connection recipe, and the only producer of connections.
pub struct ConnectionManager<C> {
    connector: C,
    endpoint: Endpoint,
    policy: RetryPolicy,
    framing: Framing,
    recv_limit: usize,
    cancel: CancellationToken,
    established: u64,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, endpoint: Endpoint, cancel: CancellationToken) -> Self {
        Self {
            connector,
            endpoint,
            policy: RetryPolicy::default(),
            framing: Framing::default(),
            recv_limit: DEFAULT_RECV_LIMIT,
            cancel,
            established: 0,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_recv_limit(mut self, recv_limit: usize) -> Self {
        self.recv_limit = recv_limit;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of connections established so far.
    pub fn established(&self) -> u64 {
        self.established
    }

    /// Connect, retrying per policy.
    ///
    /// With an unbounded policy this only returns once connected, or with
    /// [`Error::Cancelled`].
    pub async fn connect(&mut self) -> Result<Connection> {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            trace!(
                endpoint = %self.endpoint,
                attempt,
                state = %ConnectionState::Connecting,
                "Connecting"
            );

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                result = self.connector.connect(&self.endpoint) => result,
            };

            let err = match result {
                Ok(stream) => {
                    self.established += 1;
                    info!(
                        endpoint = %self.endpoint,
                        conn = self.established,
                        attempts = attempt,
                        "Connected to server"
                    );
                    return Ok(Connection::new(
                        stream,
                        self.framing,
                        self.recv_limit,
                        self.established,
                    ));
                }
                Err(e) => e,
            };

            if !self.policy.allows(attempt + 1) {
                error!(
                    endpoint = %self.endpoint,
                    attempts = attempt,
                    error = %err,
                    "Giving up on server connection"
                );
                return Err(Error::ConnectExhausted {
                    endpoint: self.endpoint.to_string(),
                    attempts: attempt,
                });
            }

            let delay = self.policy.delay_after(attempt);
            warn!(
                endpoint = %self.endpoint,
                attempt,
                error = %err,
                "Failed to connect to server, retrying in {:?}",
                delay
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Wait out the retry delay after a connection failed during its
    /// handshake.
    ///
    /// `failures` counts such sessions in a row and is checked against the
    /// same policy cap as connect attempts.
    pub async fn hold_off(&self, failures: u32) -> Result<()> {
        if !self.policy.allows(failures.saturating_add(1)) {
            error!(
                endpoint = %self.endpoint,
                failures,
                "Giving up: server keeps dropping the handshake"
            );
            return Err(Error::ConnectExhausted {
                endpoint: self.endpoint.to_string(),
                attempts: failures,
            });
        }

        let delay = self.policy.delay_after(failures);
        warn!(
            endpoint = %self.endpoint,
            failures,
            "Connection lost during handshake, retrying in {:?}",
            delay
        );
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Close `old` completely, then connect again.
    pub async fn reconnect(&mut self, old: Connection) -> Result<Connection> {
        let serial_no = old.serial_no();
        old.close().await;
        info!(endpoint = %self.endpoint, conn = serial_no, "Reconnecting");
        self.connect().await
    }
}
