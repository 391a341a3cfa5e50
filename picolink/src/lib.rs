//! picolink: bridge a serial peripheral to a remote TCP server.
//!
//! The daemon waits for the network link, connects to the configured server,
//! announces the device with a `pico_<id>` handshake, and then shuttles bytes
//! between the UART and the socket, optionally sealed with a pre-shared key
//! or carried over mutual TLS.

pub mod bridge;
pub mod cipher;
pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod indicator;
pub mod link;
pub mod serial;
pub mod tracing;
pub mod types;
