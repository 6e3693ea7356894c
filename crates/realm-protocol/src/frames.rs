//! Frame types for the Realm protocol.
//!
//! A frame is one opcode-tagged message. Frames are immutable once built and
//! are owned by the connection that produced them until handed to a handler.

use bytes::Bytes;

use crate::codec::ProtocolError;

/// Which way a frame travels relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Received from a peer.
    Inbound,
    /// To be written to a peer.
    Outbound,
}

/// A protocol frame.
///
/// Equality compares the opcode, direction and the declared payload bytes;
/// buffer bytes past the declared length are not part of the frame.
#[derive(Debug, Clone)]
pub struct Frame {
    opcode: u8,
    payload: Bytes,
    length: usize,
    direction: Direction,
}

impl Frame {
    /// Create an inbound frame carrying the whole payload.
    #[must_use]
    pub fn inbound(opcode: u8, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            opcode,
            length: payload.len(),
            payload,
            direction: Direction::Inbound,
        }
    }

    /// Create an outbound frame carrying the whole payload.
    #[must_use]
    pub fn outbound(opcode: u8, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            opcode,
            length: payload.len(),
            payload,
            direction: Direction::Outbound,
        }
    }

    /// Create an outbound frame whose declared length is shorter than its buffer.
    ///
    /// Only the first `length` bytes are ever written to the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::LengthExceedsPayload`] if `length` is larger
    /// than the buffer.
    pub fn with_length(
        opcode: u8,
        payload: impl Into<Bytes>,
        length: usize,
    ) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        if length > payload.len() {
            return Err(ProtocolError::LengthExceedsPayload {
                opcode,
                length,
                capacity: payload.len(),
            });
        }
        Ok(Self {
            opcode,
            payload,
            length,
            direction: Direction::Outbound,
        })
    }

    /// Create an empty outbound frame.
    #[must_use]
    pub fn empty(opcode: u8) -> Self {
        Self::outbound(opcode, Bytes::new())
    }

    /// The opcode.
    #[must_use]
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// The declared payload length.
    #[must_use]
    pub fn length(&self) -> usize {
        self.length
    }

    /// The frame direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The meaningful payload bytes, truncated to the declared length.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.length]
    }

    /// The payload as shared bytes, truncated to the declared length.
    #[must_use]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.slice(..self.length)
    }

    /// Capacity of the underlying buffer, which may exceed [`Frame::length`].
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.payload.len()
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.opcode == other.opcode
            && self.direction == other.direction
            && self.payload() == other.payload()
    }
}

impl Eq for Frame {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_direction() {
        assert_eq!(Frame::inbound(1, vec![1]).direction(), Direction::Inbound);
        assert_eq!(Frame::outbound(1, vec![1]).direction(), Direction::Outbound);
    }

    #[test]
    fn test_declared_length_truncates_payload() {
        let frame = Frame::with_length(9, vec![1, 2, 3, 4, 5], 3).unwrap();
        assert_eq!(frame.length(), 3);
        assert_eq!(frame.capacity(), 5);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert_eq!(&frame.payload_bytes()[..], &[1, 2, 3]);
    }

    #[test]
    fn test_declared_length_beyond_buffer_rejected() {
        assert!(matches!(
            Frame::with_length(9, vec![1, 2], 3),
            Err(ProtocolError::LengthExceedsPayload { .. })
        ));
    }
}
