//! NDJSON codec for bus and relay streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so
//! a misbehaving peer cannot make the master buffer unbounded input.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::message::Frame;
use crate::{AppError, Result};

/// Maximum accepted line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited UTF-8 framing with a [`MAX_LINE_BYTES`] limit.
#[derive(Debug)]
pub struct BusCodec(LinesCodec);

impl BusCodec {
    /// Create a codec with the default limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for BusCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BusCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for BusCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

/// Serialise a frame into one line (without the trailing newline).
///
/// # Errors
///
/// Returns `AppError::Transport` if serialisation fails.
pub fn encode_frame(frame: &Frame) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Parse one line into a frame.
///
/// # Errors
///
/// Returns `AppError::Transport` on malformed JSON or unknown variants.
pub fn decode_frame(line: &str) -> Result<Frame> {
    Ok(serde_json::from_str(line.trim())?)
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Transport(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
