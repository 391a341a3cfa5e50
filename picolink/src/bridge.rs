//! The serial-to-network forwarding loop.
//!
//! A [`Bridge`] owns everything the steady state touches: the serial channel,
//! the one live server connection, the connection manager that can replace
//! it, the cipher layer, and the activity indicator. Nothing else reads or
//! writes those resources.
//!
//! Each forwarding iteration does, in order:
//!
//! 1. **Outbound.** If the UART has bytes, take them all as one chunk, strip
//!    trailing whitespace, seal, and send as one frame.
//! 2. **Inbound.** Poll one bounded read from the server. Data is opened and
//!    written to the UART. A closed connection is replaced and the handshake
//!    resent; the rest of the iteration is skipped.
//! 3. **Delay.** Sleep the poll interval.
//!
//! Bytes that arrive on either side during a reconnect are best-effort.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::{
    cipher::CipherLayer,
    config::DeviceIdentity,
    connection::{is_close_error, Connection, ConnectionManager, Connector, RecvOutcome},
    error::{Error, Result},
    handshake,
    indicator::ActivityIndicator,
    serial::{trim_trailing_whitespace, SerialChannel},
    tracing::prelude::*,
};

/// Default delay between forwarding iterations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What happened on the inbound side of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Nothing to read.
    Idle,
    /// A frame of this many plaintext bytes went to the UART.
    Delivered(usize),
    /// A frame arrived but could not be opened and was discarded.
    Dropped,
    /// The connection was replaced and the handshake resent.
    Reconnected,
}

/// Summary of one forwarding iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iteration {
    /// Plaintext bytes sent to the server, if a serial chunk went out.
    pub outbound: Option<usize>,
    pub inbound: Inbound,
}

/// The owned bridge context.
pub struct Bridge<S, C, I> {
    serial: SerialChannel<S>,
    connection: Option<Connection>,
    manager: ConnectionManager<C>,
    cipher: CipherLayer,
    identity: DeviceIdentity,
    indicator: I,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl<S, C, I> Bridge<S, C, I>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: Connector,
    I: ActivityIndicator,
{
    /// Connect, send the handshake, and return a bridge ready to forward.
    ///
    /// Blocks for as long as the connection manager's retry policy allows.
    pub async fn start(
        serial: SerialChannel<S>,
        mut manager: ConnectionManager<C>,
        cipher: CipherLayer,
        identity: DeviceIdentity,
        mut indicator: I,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let connection = open_session(&mut manager, &identity, &cipher, None).await?;
        indicator.set_connected(true);
        info!(
            endpoint = %manager.endpoint(),
            identity = %identity,
            cipher = cipher.name(),
            "Bridge streaming"
        );

        Ok(Self {
            serial,
            connection: Some(connection),
            manager,
            cipher,
            identity,
            indicator,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The live connection.
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn manager(&self) -> &ConnectionManager<C> {
        &self.manager
    }

    /// Forward until cancelled or a fault occurs, then clean up.
    pub async fn run(mut self) -> Result<()> {
        let result = match self.forward_until_cancelled().await {
            Err(Error::Cancelled) => Ok(()),
            other => other,
        };
        if let Err(e) = &result {
            error!(error = %e, "Forwarding loop failed");
        }
        self.shutdown().await;
        result
    }

    async fn forward_until_cancelled(&mut self) -> Result<()> {
        while !self.cancel.is_cancelled() {
            self.iterate().await?;
        }
        Ok(())
    }

    /// Run one forwarding iteration, including its trailing delay.
    pub async fn iterate(&mut self) -> Result<Iteration> {
        let outbound = match self.forward_serial().await? {
            Outbound::Sent(n) => Some(n),
            Outbound::Idle => None,
            Outbound::PeerGone => {
                self.restart_connection().await?;
                return Ok(Iteration {
                    outbound: None,
                    inbound: Inbound::Reconnected,
                });
            }
        };

        let inbound = self.forward_network().await?;
        if inbound == Inbound::Reconnected {
            return Ok(Iteration { outbound, inbound });
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }

        Ok(Iteration { outbound, inbound })
    }

    fn live(&mut self) -> Result<&mut Connection> {
        self.connection
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::from(io::ErrorKind::NotConnected)))
    }

    // Serial -> network.
    async fn forward_serial(&mut self) -> Result<Outbound> {
        let Some(chunk) = self.serial.read_available()? else {
            return Ok(Outbound::Idle);
        };

        let line = trim_trailing_whitespace(&chunk);
        if line.is_empty() {
            trace!(bytes = chunk.len(), "Serial chunk was only whitespace");
            return Ok(Outbound::Idle);
        }

        let frame = self.cipher.seal(line);
        let len = line.len();
        let conn = self.live()?;
        match conn.send(frame).await {
            Ok(()) => {
                debug!(conn = conn.serial_no(), bytes = len, "Serial -> network");
                self.indicator.pulse();
                Ok(Outbound::Sent(len))
            }
            Err(e) if is_close_error(&e) => {
                warn!(
                    conn = conn.serial_no(),
                    error = %e,
                    bytes = len,
                    "Send failed, peer gone; chunk dropped"
                );
                Ok(Outbound::PeerGone)
            }
            Err(e) => Err(e.into()),
        }
    }

    // Network -> serial.
    async fn forward_network(&mut self) -> Result<Inbound> {
        let outcome = self.live()?.try_recv();
        match outcome {
            RecvOutcome::WouldBlock => Ok(Inbound::Idle),
            RecvOutcome::Closed => {
                info!("Server closed the connection");
                self.restart_connection().await?;
                Ok(Inbound::Reconnected)
            }
            RecvOutcome::Data(frame) => match self.cipher.open(&frame) {
                Ok(plaintext) => {
                    self.serial.write(&plaintext).await?;
                    self.indicator.pulse();
                    debug!(bytes = plaintext.len(), "Network -> serial");
                    Ok(Inbound::Delivered(plaintext.len()))
                }
                Err(e) => {
                    warn!(bytes = frame.len(), error = %e, "Dropping undecodable frame");
                    Ok(Inbound::Dropped)
                }
            },
        }
    }

    /// Replace the connection and resend the handshake.
    async fn restart_connection(&mut self) -> Result<()> {
        self.indicator.set_connected(false);
        let old = self
            .connection
            .take()
            .ok_or_else(|| Error::Io(io::Error::from(io::ErrorKind::NotConnected)))?;

        let fresh =
            open_session(&mut self.manager, &self.identity, &self.cipher, Some(old)).await?;
        self.connection = Some(fresh);
        self.indicator.set_connected(true);
        info!(endpoint = %self.manager.endpoint(), "Reconnected to server");
        Ok(())
    }

    /// Close the connection and turn the indicator off.
    pub async fn shutdown(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close().await;
        }
        self.indicator.set_connected(false);
        info!("Bridge stopped");
    }
}

enum Outbound {
    Idle,
    Sent(usize),
    PeerGone,
}

/// Connect (replacing `previous`, if any) and send the handshake.
///
/// A connection that dies before its handshake is out is replaced again
/// after the retry delay. Only errors other than a lost peer are fatal.
async fn open_session<C: Connector>(
    manager: &mut ConnectionManager<C>,
    identity: &DeviceIdentity,
    cipher: &CipherLayer,
    mut previous: Option<Connection>,
) -> Result<Connection> {
    let mut failures = 0u32;
    loop {
        let mut conn = match previous.take() {
            Some(old) => manager.reconnect(old).await?,
            None => manager.connect().await?,
        };

        match handshake::send_hello(&mut conn, identity, cipher).await {
            Ok(()) => return Ok(conn),
            Err(e) if is_close_error(&e) => {
                failures = failures.saturating_add(1);
                warn!(conn = conn.serial_no(), error = %e, "Peer gone before handshake");
                previous = Some(conn);
                manager.hold_off(failures).await?;
            }
            Err(e) => {
                conn.close().await;
                return Err(e.into());
            }
        }
    }
}
