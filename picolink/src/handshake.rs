//! Identity handshake.
//!
//! Right after every successful connect the gateway announces itself with a
//! single `pico_<id>` frame. The server uses it to attach the connection to
//! the device's channel; it never replies.

use std::io;

use crate::{
    cipher::CipherLayer, config::DeviceIdentity, connection::Connection, tracing::prelude::*,
};

/// Prefix of the handshake payload.
pub const HELLO_PREFIX: &str = "pico_";

/// Plaintext handshake payload for `identity`.
pub fn hello_payload(identity: &DeviceIdentity) -> String {
    format!("{}{}", HELLO_PREFIX, identity)
}

/// Send the handshake frame, sealed if the cipher layer seals.
///
/// Moves the connection to streaming. Fails if the connection already sent
/// its handshake.
pub async fn send_hello(
    connection: &mut Connection,
    identity: &DeviceIdentity,
    cipher: &CipherLayer,
) -> io::Result<()> {
    let payload = hello_payload(identity);
    connection
        .send_handshake(cipher.seal(payload.as_bytes()))
        .await?;
    debug!(
        conn = connection.serial_no(),
        hello = %payload,
        cipher = cipher.name(),
        "Sent handshake"
    );
    Ok(())
}
