//! Common error types for picolink.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.

use thiserror::Error;

use crate::cipher::CipherError;

/// Main error type for picolink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Malformed configuration document
    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS setup errors (certificate loading, client config)
    #[error("TLS error: {0}")]
    Tls(String),

    /// Frame sealing or opening errors
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Network association did not complete within the retry policy
    #[error("Network association not established after {attempts} polls")]
    AssociationTimeout { attempts: u32 },

    /// Connect attempts exhausted the retry policy
    #[error("Could not connect to {endpoint} after {attempts} attempts")]
    ConnectExhausted { endpoint: String, attempts: u32 },

    /// Shutdown was requested while waiting
    #[error("Operation cancelled")]
    Cancelled,
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
