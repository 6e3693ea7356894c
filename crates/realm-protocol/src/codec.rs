//! Codec for encoding and decoding Realm frames.
//!
//! The wire format is `[opcode:1][length prefix per table][payload]`. The
//! decoder is incremental: it never consumes a byte from the buffer unless a
//! whole frame is available, so a partial frame can be retried on the next
//! read without re-interpreting the opcode or length prefix.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::frames::Frame;
use crate::table::{LengthSpec, OpcodeTable};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload does not fit the length prefix of its opcode.
    #[error("Payload of {length} bytes exceeds {max} for opcode {opcode}")]
    FrameTooLarge {
        opcode: u8,
        length: usize,
        max: usize,
    },

    /// Payload of a fixed-size opcode has the wrong size.
    #[error("Opcode {opcode} expects {expected} bytes, got {actual}")]
    FixedLengthMismatch {
        opcode: u8,
        expected: usize,
        actual: usize,
    },

    /// Declared length is larger than the buffer backing the frame.
    #[error("Declared length {length} exceeds payload capacity {capacity} for opcode {opcode}")]
    LengthExceedsPayload {
        opcode: u8,
        length: usize,
        capacity: usize,
    },

    /// Frame opcode is not a known message.
    #[error("Unknown message opcode: {0}")]
    UnknownMessage(u8),

    /// Payload does not follow the layout of its opcode.
    #[error("Malformed payload for opcode {opcode}: {reason}")]
    Malformed { opcode: u8, reason: &'static str },

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Try to decode one frame from a buffer, advancing it only on success.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded and `Ok(None)`
/// if more data is needed; in the latter case the buffer is untouched.
///
/// # Errors
///
/// Returns an error if an unmapped opcode would swallow more than
/// [`MAX_FRAME_SIZE`] bytes.
pub fn decode_from(table: &OpcodeTable, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(&opcode) = buf.first() else {
        return Ok(None);
    };

    let (header, length) = match table.lookup(opcode) {
        LengthSpec::Fixed(size) => (1, size as usize),
        LengthSpec::U8Prefixed => match buf.get(1) {
            Some(&len) => (2, len as usize),
            None => return Ok(None),
        },
        LengthSpec::U16Prefixed => match (buf.get(1), buf.get(2)) {
            (Some(&hi), Some(&lo)) => (3, u16::from_be_bytes([hi, lo]) as usize),
            _ => return Ok(None),
        },
        LengthSpec::Remainder => {
            let length = buf.len() - 1;
            if length > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge {
                    opcode,
                    length,
                    max: MAX_FRAME_SIZE,
                });
            }
            warn!(opcode, length, "Unmapped opcode, consuming buffered remainder");
            (1, length)
        }
    };

    if buf.len() < header + length {
        return Ok(None);
    }

    buf.advance(header);
    let payload = buf.split_to(length).freeze();
    Ok(Some(Frame::inbound(opcode, payload)))
}

/// Decode every complete frame in the buffer, leaving a trailing partial frame.
///
/// # Errors
///
/// Returns an error if any frame is invalid.
pub fn decode_all(table: &OpcodeTable, buf: &mut BytesMut) -> Result<Vec<Frame>, ProtocolError> {
    let mut frames = Vec::new();
    while let Some(frame) = decode_from(table, buf)? {
        frames.push(frame);
    }
    Ok(frames)
}

/// Encode a frame into an existing buffer.
///
/// Exactly [`Frame::length`] payload bytes are written, never the trailing
/// capacity of the frame buffer.
///
/// # Errors
///
/// Returns an error if the payload does not fit the opcode's length spec.
pub fn encode_into(table: &OpcodeTable, frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let opcode = frame.opcode();
    let payload = frame.payload();
    let spec = table.lookup(opcode);

    if let LengthSpec::Fixed(size) = spec {
        if payload.len() != size as usize {
            return Err(ProtocolError::FixedLengthMismatch {
                opcode,
                expected: size as usize,
                actual: payload.len(),
            });
        }
    } else if payload.len() > spec.max_payload() {
        return Err(ProtocolError::FrameTooLarge {
            opcode,
            length: payload.len(),
            max: spec.max_payload(),
        });
    }

    buf.reserve(1 + spec.prefix_len() + payload.len());
    buf.put_u8(opcode);
    match spec {
        LengthSpec::U8Prefixed => buf.put_u8(payload.len() as u8),
        LengthSpec::U16Prefixed => buf.put_u16(payload.len() as u16),
        LengthSpec::Fixed(_) | LengthSpec::Remainder => {}
    }
    buf.extend_from_slice(payload);

    Ok(())
}

/// Codec for streaming frame encoding/decoding over a byte stream.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    table: Arc<OpcodeTable>,
}

impl FrameCodec {
    /// Create a codec over a shared opcode table.
    #[must_use]
    pub fn new(table: Arc<OpcodeTable>) -> Self {
        Self { table }
    }

    /// The opcode table used by this codec.
    #[must_use]
    pub fn table(&self) -> &Arc<OpcodeTable> {
        &self.table
    }

    /// Encode a frame into a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame does not fit its length spec.
    pub fn encode_into(&self, frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_into(&self.table, frame, buf)
    }

    /// Try to decode a frame from a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is invalid.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        decode_from(&self.table, buf)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_from(&self.table, src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_into(&self.table, &item, dst)
    }
}
