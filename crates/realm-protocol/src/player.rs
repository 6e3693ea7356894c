//! Player-facing protocol spoken by world processes.

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::ProtocolError;
use crate::frames::Frame;
use crate::table::OpcodeTable;

/// Player opcodes.
pub mod opcodes {
    pub const KEEPALIVE: u8 = 0x00;
    pub const LOGIN: u8 = 0x10;
    pub const LOGIN_OK: u8 = 0x11;
    pub const LOGIN_REJECTED: u8 = 0x12;
    pub const WALK: u8 = 0x20;
    pub const CHAT: u8 = 0x21;
    pub const LOGOUT: u8 = 0x30;
    pub const MESSAGE: u8 = 0x40;
}

/// Opcode table of the player protocol.
#[must_use]
pub fn player_table() -> OpcodeTable {
    OpcodeTable::new()
        .fixed(opcodes::KEEPALIVE, 0)
        .u8_prefixed(opcodes::LOGIN)
        .fixed(opcodes::LOGIN_OK, 2)
        .u8_prefixed(opcodes::LOGIN_REJECTED)
        .fixed(opcodes::WALK, 4)
        .u8_prefixed(opcodes::CHAT)
        .fixed(opcodes::LOGOUT, 0)
        .u16_prefixed(opcodes::MESSAGE)
}

/// Build a login acknowledgement carrying the player's slot index.
#[must_use]
pub fn login_ok(index: u16) -> Frame {
    let mut buf = BytesMut::with_capacity(2);
    buf.put_u16(index);
    Frame::outbound(opcodes::LOGIN_OK, buf.freeze())
}

/// Build a login rejection with a short reason.
///
/// Reasons longer than a U8 prefix allows are cut.
#[must_use]
pub fn login_rejected(reason: &str) -> Frame {
    let bytes = reason.as_bytes().to_vec();
    let length = bytes.len().min(u8::MAX as usize);
    // Length never exceeds the buffer, so this cannot fail.
    Frame::with_length(opcodes::LOGIN_REJECTED, bytes, length)
        .unwrap_or_else(|_| Frame::empty(opcodes::LOGIN_REJECTED))
}

/// Build a server text message.
#[must_use]
pub fn message(text: &str) -> Frame {
    Frame::outbound(opcodes::MESSAGE, text.as_bytes().to_vec())
}

const LOGIN_LOBBY: u8 = 0x01;

/// First frame a player sends: a flags byte followed by the account name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub name: String,
    /// Enter the lobby instead of the game.
    pub lobby: bool,
}

impl Login {
    #[must_use]
    pub fn new(name: impl Into<String>, lobby: bool) -> Self {
        Self {
            name: name.into(),
            lobby,
        }
    }

    /// Encode as a LOGIN frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the name does not fit the U8 prefix.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let mut buf = BytesMut::with_capacity(1 + self.name.len());
        buf.put_u8(if self.lobby { LOGIN_LOBBY } else { 0 });
        buf.put_slice(self.name.as_bytes());
        if buf.len() > usize::from(u8::MAX) {
            return Err(ProtocolError::FrameTooLarge {
                opcode: opcodes::LOGIN,
                length: buf.len(),
                max: usize::from(u8::MAX),
            });
        }
        Ok(Frame::outbound(opcodes::LOGIN, buf.freeze()))
    }

    /// Decode a LOGIN frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] for any other opcode, an empty
    /// payload or a name that is not UTF-8.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let malformed = |reason| ProtocolError::Malformed {
            opcode: frame.opcode(),
            reason,
        };
        if frame.opcode() != opcodes::LOGIN {
            return Err(malformed("not a login"));
        }
        let mut payload = frame.payload();
        if payload.is_empty() {
            return Err(malformed("missing flags"));
        }
        let flags = payload.get_u8();
        let name = std::str::from_utf8(payload).map_err(|_| malformed("name is not UTF-8"))?;
        Ok(Self::new(name, flags & LOGIN_LOBBY != 0))
    }
}

/// Build a walk request to tile `(x, y)`.
#[must_use]
pub fn walk(x: u16, y: u16) -> Frame {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u16(x);
    buf.put_u16(y);
    Frame::outbound(opcodes::WALK, buf.freeze())
}

/// Read the destination of a walk request.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] if the payload is not 4 bytes.
pub fn parse_walk(frame: &Frame) -> Result<(u16, u16), ProtocolError> {
    let mut payload = frame.payload();
    if payload.len() != 4 {
        return Err(ProtocolError::Malformed {
            opcode: frame.opcode(),
            reason: "walk needs 4 bytes",
        });
    }
    Ok((payload.get_u16(), payload.get_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_into;

    #[test]
    fn test_long_rejection_is_cut() {
        let reason = "x".repeat(300);
        let frame = login_rejected(&reason);
        assert_eq!(frame.length(), 255);

        let mut buf = BytesMut::new();
        encode_into(&player_table(), &frame, &mut buf).unwrap();
        assert_eq!(buf.len(), 2 + 255);
    }

    #[test]
    fn test_login_flags() {
        let frame = Login::new("alice", true).to_frame().unwrap();
        assert_eq!(frame.payload()[0], 0x01);

        let inbound = Frame::inbound(opcodes::LOGIN, frame.payload_bytes());
        assert_eq!(Login::from_frame(&inbound).unwrap(), Login::new("alice", true));
        assert!(matches!(
            Login::from_frame(&Frame::inbound(opcodes::LOGIN, vec![])),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(Login::new("x".repeat(300), false).to_frame().is_err());
    }

    #[test]
    fn test_walk_layout() {
        let frame = walk(3200, 3201);
        assert_eq!(parse_walk(&frame).unwrap(), (3200, 3201));
        assert!(parse_walk(&Frame::inbound(opcodes::WALK, vec![1, 2])).is_err());
    }

    #[test]
    fn test_login_ok_layout() {
        let frame = login_ok(0x0102);
        assert_eq!(frame.payload(), &[0x01, 0x02]);
    }
}
