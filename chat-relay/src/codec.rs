//! Newline-delimited JSON framing.
//!
//! [`LineCodec`] splits a byte stream on `\n` and serializes outgoing
//! envelopes as one JSON object per line. The read buffer is owned by the
//! caller (a `FramedRead` per connection), so a line split across reads is
//! reassembled and a read carrying several lines yields each of them in turn.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::envelope::{Envelope, Frame};

const DELIMITER: u8 = b'\n';

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line is valid JSON but not an object")]
    NotAnObject,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frames raw bytes into lines, excluding the delimiter.
#[derive(Debug, Default)]
pub struct LineCodec {
    // Bytes before this offset are known not to contain a delimiter.
    next_index: usize,
}

impl Decoder for LineCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let scan_from = self.next_index.min(src.len());

        match src[scan_from..].iter().position(|byte| *byte == DELIMITER) {
            Some(offset) => {
                self.next_index = 0;
                let line = src.split_to(scan_from + offset);
                src.advance(1);
                Ok(Some(line))
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        // An unterminated tail is never a complete line.
        if !src.is_empty() {
            debug!(bytes = src.len(), "discarding partial line at end of stream");
            src.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

impl Encoder<Envelope> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = serde_json::to_vec(&item)?;
        dst.reserve(encoded.len() + 1);
        dst.put_slice(&encoded);
        dst.put_u8(DELIMITER);
        Ok(())
    }
}

/// Encodes one envelope as a complete wire line, ready to write to any peer.
pub fn encode_line(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let mut encoded = serde_json::to_vec(envelope)?;
    encoded.push(DELIMITER);
    Ok(Bytes::from(encoded))
}

/// Decodes one line (without its delimiter) into a JSON object.
///
/// Callers treat every error as "skip this line".
pub fn decode_frame(line: &[u8]) -> Result<Frame, CodecError> {
    match serde_json::from_slice::<Value>(line)? {
        Value::Object(object) => Ok(Frame::from(object)),
        _ => Err(CodecError::NotAnObject),
    }
}
