//! Newline-delimited JSON framing for the control channel.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! runaway subject cannot make the harness buffer an unbounded line.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum accepted inbound line: 16 MiB.
///
/// Query responses from a file-watching server can be large, so the limit
/// is generous; exceeding it is a protocol error.
pub const MAX_LINE_BYTES: usize = 16 * 1_048_576;

/// Line codec for the control channel.
///
/// Each `\n`-terminated UTF-8 line is one frame. Decoding longer lines than
/// [`MAX_LINE_BYTES`] yields [`AppError::Protocol`]; I/O failures map to
/// [`AppError::Io`].
#[derive(Debug)]
pub struct FrameCodec(LinesCodec);

impl FrameCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Protocol(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
