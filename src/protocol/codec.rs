use super::envelope::{self, Envelope};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Hard ceiling for one framed envelope. A single line larger than this is a
/// corrupted or hostile stream, not a message.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Newline-delimited JSON framing: exactly one envelope per line, no batching
/// or compression.
#[derive(Debug)]
pub struct EnvelopeCodec {
    lines: LinesCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors raised while framing envelopes on a byte stream.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("envelope frame exceeds {MAX_FRAME_BYTES} bytes")]
    FrameTooLong,
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<LinesCodecError> for CodecError {
    fn from(error: LinesCodecError) -> Self {
        match error {
            LinesCodecError::MaxLineLengthExceeded => Self::FrameTooLong,
            LinesCodecError::Io(io) => Self::Io(io),
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
        loop {
            let Some(line) = self.lines.decode(src)? else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(envelope::decode(line)?));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
        loop {
            let Some(line) = self.lines.decode_eof(src)? else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(envelope::decode(line)?));
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), CodecError> {
        let line = envelope::encode(&item)?;
        self.lines.encode(line, dst)?;
        Ok(())
    }
}
