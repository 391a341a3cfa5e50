//! Wire framing for handshake and data frames.
//!
//! The deployed servers expect each frame to arrive as exactly one TCP
//! segment with no delimiter ([`Framing::Raw`]). That only works while frames
//! are small and the link is quiet, so [`Framing::LengthPrefixed`] is offered
//! for peers that can parse a 4-byte big-endian length in front of every
//! frame. The frame payload itself is identical in both modes.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this are refused in length-prefixed mode.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Framing {
    /// One write per frame, no delimiter.
    #[default]
    Raw,
    /// u32 big-endian length, then payload.
    LengthPrefixed,
}

/// Codec for one connection's frames.
#[derive(Debug)]
pub struct FrameCodec {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Raw,
    LengthPrefixed(LengthDelimitedCodec),
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        let inner = match framing {
            Framing::Raw => Inner::Raw,
            Framing::LengthPrefixed => Inner::LengthPrefixed(
                LengthDelimitedCodec::builder()
                    .length_field_length(4)
                    .big_endian()
                    .max_frame_length(MAX_FRAME_LEN)
                    .new_codec(),
            ),
        };
        Self { inner }
    }

    pub fn framing(&self) -> Framing {
        match self.inner {
            Inner::Raw => Framing::Raw,
            Inner::LengthPrefixed(_) => Framing::LengthPrefixed,
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &mut self.inner {
            Inner::Raw => {
                dst.put_slice(&frame);
                Ok(())
            }
            Inner::LengthPrefixed(codec) => codec.encode(frame, dst),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.inner {
            // Whatever arrived is the frame.
            Inner::Raw if src.is_empty() => Ok(None),
            Inner::Raw => Ok(Some(src.split())),
            Inner::LengthPrefixed(codec) => codec.decode(src),
        }
    }
}
