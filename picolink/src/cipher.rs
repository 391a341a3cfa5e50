//! Frame-level cipher layer.
//!
//! Every frame that crosses the network passes through a [`CipherLayer`]
//! before it is written and after it is read. The layer is chosen once from
//! the configured transport security:
//!
//! - **None** and **MutualTls** pass bytes through untouched. With mutual TLS
//!   the transport itself is encrypted, see [`crate::connection::tls`].
//! - **PresharedKey** seals each frame with AES-256 in CFB mode under a fresh
//!   random IV, and ships `base64(iv || ciphertext)` so the envelope survives
//!   text-oriented relays on the server side.
//!
//! CFB runs with 128-bit feedback segments, as the server decrypts with
//! `AES_cfb128_encrypt`; an 8-bit-segment CFB peer will not interoperate.
//!
//! The stream cipher provides confidentiality only. There is no MAC, so
//! opening with the wrong key produces garbage rather than an error.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use cfb_mode::cipher::{generic_array::GenericArray, AsyncStreamCipher, KeyIvInit};
use rand::RngCore;
use thiserror::Error;

use crate::config::TransportSecurityConfig;

type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;

/// Pre-shared key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Initialization vector length in bytes (one AES block).
pub const IV_LEN: usize = 16;

/// Byte used to pad short keys, matching the server's key handling.
const KEY_PAD: u8 = b' ';

/// Structural failures while opening a sealed frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("envelope is not valid base64: {0}")]
    Encoding(String),

    #[error("envelope too short: {len} bytes, need at least {IV_LEN}")]
    TooShort { len: usize },
}

/// Normalize a pre-shared key string to exactly [`KEY_LEN`] bytes.
///
/// Longer keys are truncated, shorter keys are right-padded with spaces. The
/// result says nothing about key strength.
pub fn normalize_key(psk: &str) -> [u8; KEY_LEN] {
    let mut key = [KEY_PAD; KEY_LEN];
    let bytes = psk.as_bytes();
    let n = bytes.len().min(KEY_LEN);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

/// AES-256-CFB sealing with a pre-shared key.
#[derive(Clone)]
pub struct PresharedKeyCipher {
    key: [u8; KEY_LEN],
}

impl PresharedKeyCipher {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Build from a key string, padding or truncating it first.
    pub fn from_passphrase(psk: &str) -> Self {
        Self::new(normalize_key(psk))
    }

    /// Encrypt under a fresh random IV and return the base64 envelope.
    pub fn seal(&self, plaintext: &[u8]) -> Bytes {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        self.seal_with_iv(plaintext, iv)
    }

    fn seal_with_iv(&self, plaintext: &[u8], iv: [u8; IV_LEN]) -> Bytes {
        let mut envelope = Vec::with_capacity(IV_LEN + plaintext.len());
        envelope.extend_from_slice(&iv);
        envelope.extend_from_slice(plaintext);

        Aes256CfbEnc::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(&iv),
        )
        .encrypt(&mut envelope[IV_LEN..]);

        Bytes::from(STANDARD.encode(envelope))
    }

    /// Decode a base64 envelope and decrypt it.
    ///
    /// Surrounding ASCII whitespace is ignored, since line-oriented peers may
    /// append a newline to the envelope.
    pub fn open(&self, wire: &[u8]) -> Result<Bytes, CipherError> {
        let mut envelope = STANDARD
            .decode(wire.trim_ascii())
            .map_err(|e| CipherError::Encoding(e.to_string()))?;

        if envelope.len() < IV_LEN {
            return Err(CipherError::TooShort {
                len: envelope.len(),
            });
        }

        let (iv, ciphertext) = envelope.split_at_mut(IV_LEN);
        Aes256CfbDec::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(iv),
        )
        .decrypt(ciphertext);

        Ok(Bytes::copy_from_slice(ciphertext))
    }
}

impl std::fmt::Debug for PresharedKeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresharedKeyCipher")
            .field("key", &"<redacted>")
            .finish()
    }
}

/// The frame-level security capability selected at startup.
#[derive(Debug, Clone)]
pub enum CipherLayer {
    /// No security at all.
    Plain,
    /// Frames sealed with a pre-shared key.
    PresharedKey(PresharedKeyCipher),
    /// Security lives in the TLS transport; frames pass through.
    MutualTls,
}

impl CipherLayer {
    pub fn from_security(security: &TransportSecurityConfig) -> Self {
        match security {
            TransportSecurityConfig::None => CipherLayer::Plain,
            TransportSecurityConfig::PresharedKeyStream { key } => {
                CipherLayer::PresharedKey(PresharedKeyCipher::new(*key))
            }
            TransportSecurityConfig::MutualTls { .. } => CipherLayer::MutualTls,
        }
    }

    /// Prepare an outgoing frame payload.
    pub fn seal(&self, plaintext: &[u8]) -> Bytes {
        match self {
            CipherLayer::PresharedKey(cipher) => cipher.seal(plaintext),
            CipherLayer::Plain | CipherLayer::MutualTls => Bytes::copy_from_slice(plaintext),
        }
    }

    /// Recover the plaintext of an incoming frame payload.
    pub fn open(&self, wire: &[u8]) -> Result<Bytes, CipherError> {
        match self {
            CipherLayer::PresharedKey(cipher) => cipher.open(wire),
            CipherLayer::Plain | CipherLayer::MutualTls => Ok(Bytes::copy_from_slice(wire)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherLayer::Plain => "none",
            CipherLayer::PresharedKey(_) => "psk-aes256-cfb",
            CipherLayer::MutualTls => "mutual-tls",
        }
    }
}
