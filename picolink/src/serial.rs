//! Serial channel to the attached peripheral.
//!
//! The UART is opened once at startup and stays open for the life of the
//! process, independent of any server connection.

use std::io;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::{config::SerialConfig, error::Result, tracing::prelude::*};

/// Largest chunk taken from the UART in one iteration.
pub const MAX_CHUNK: usize = 4096;

const READ_STEP: usize = 256;

/// Open the UART described by `config` as 8N1.
pub fn open(config: &SerialConfig) -> Result<SerialChannel<SerialStream>> {
    let port = tokio_serial::new(&config.device, config.baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .open_native_async()?;
    info!(device = %config.device, baud = config.baud, "Opened serial port");
    Ok(SerialChannel::new(port))
}

/// Byte channel to the peripheral.
#[derive(Debug)]
pub struct SerialChannel<S> {
    port: S,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SerialChannel<S> {
    pub fn new(port: S) -> Self {
        Self { port }
    }

    /// Take everything the UART has buffered right now, without waiting.
    ///
    /// Returns `None` when nothing is pending. At most [`MAX_CHUNK`] bytes
    /// are taken; the remainder is left for the next call.
    pub fn read_available(&mut self) -> io::Result<Option<Bytes>> {
        let mut chunk = BytesMut::new();
        let mut step = [0u8; READ_STEP];

        while chunk.len() < MAX_CHUNK {
            let want = READ_STEP.min(MAX_CHUNK - chunk.len());
            match self.port.read(&mut step[..want]).now_or_never() {
                None | Some(Ok(0)) => break,
                Some(Ok(n)) => chunk.extend_from_slice(&step[..n]),
                Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Some(Err(e)) => return Err(e),
            }
        }

        if chunk.is_empty() {
            Ok(None)
        } else {
            trace!(bytes = chunk.len(), "Serial read");
            Ok(Some(chunk.freeze()))
        }
    }

    /// Write `bytes` to the peripheral in full.
    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes).await?;
        self.port.flush().await
    }

    pub fn into_inner(self) -> S {
        self.port
    }
}

/// Strip trailing ASCII whitespace (line endings, padding) from a chunk.
pub fn trim_trailing_whitespace(chunk: &[u8]) -> &[u8] {
    chunk.trim_ascii_end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(b"STATUS=OK\r\n", b"STATUS=OK"; "crlf")]
    #[test_case(b"STATUS=OK", b"STATUS=OK"; "nothing to strip")]
    #[test_case(b"  lead kept \t\n ", b"  lead kept"; "mixed trailing")]
    #[test_case(b"a\r\nb\r\n", b"a\r\nb"; "interior newline kept")]
    #[test_case(b"\r\n", b""; "only whitespace")]
    fn test_trim_trailing_whitespace(input: &[u8], expected: &[u8]) {
        assert_eq!(trim_trailing_whitespace(input), expected);
    }

    #[tokio::test]
    async fn test_read_available_empty() {
        let (port, _device) = tokio::io::duplex(64);
        let mut serial = SerialChannel::new(port);
        assert!(serial.read_available().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_available_drains_buffer() {
        let (port, mut device) = tokio::io::duplex(8192);
        let mut serial = SerialChannel::new(port);

        device.write_all(b"TEMP=21.5\r\n").await.unwrap();
        device.write_all(b"TEMP=21.6\r\n").await.unwrap();

        let chunk = serial.read_available().unwrap().unwrap();
        assert_eq!(&chunk[..], b"TEMP=21.5\r\nTEMP=21.6\r\n");
        assert!(serial.read_available().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_available_caps_chunk() {
        let (port, mut device) = tokio::io::duplex(2 * MAX_CHUNK);
        let mut serial = SerialChannel::new(port);

        device.write_all(&vec![b'x'; MAX_CHUNK + 10]).await.unwrap();

        assert_eq!(serial.read_available().unwrap().unwrap().len(), MAX_CHUNK);
        assert_eq!(serial.read_available().unwrap().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_write_reaches_device() {
        let (port, mut device) = tokio::io::duplex(64);
        let mut serial = SerialChannel::new(port);

        serial.write(b"LED=ON").await.unwrap();

        let mut buf = [0u8; 6];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"LED=ON");
    }
}
