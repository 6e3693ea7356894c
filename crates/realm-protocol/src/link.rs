//! Link control messages exchanged between world processes and the hub.
//!
//! Each message travels as one frame; the body is MessagePack-encoded and
//! the opcode identifies the message kind.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;
use crate::frames::Frame;
use crate::table::OpcodeTable;
use crate::version::Version;

/// Players carried by one roster frame.
pub const ROSTER_CHUNK: usize = 256;

/// Link opcodes.
pub mod opcodes {
    pub const AUTHENTICATE: u8 = 0x01;
    pub const AUTHENTICATED: u8 = 0x02;
    pub const REJECTED: u8 = 0x03;
    pub const REGISTER_PLAYER: u8 = 0x10;
    pub const UNREGISTER_PLAYER: u8 = 0x11;
    pub const ROSTER_REQUEST: u8 = 0x12;
    pub const ROSTER: u8 = 0x13;
    pub const RELAY: u8 = 0x20;
    pub const PING: u8 = 0x30;
    pub const PONG: u8 = 0x31;
}

/// Identifier of a world process.
pub type WorldId = u16;

/// What kind of players a world process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldKind {
    Game,
    Lobby,
    GameAndLobby,
}

impl WorldKind {
    /// Whether players on this world may be in the game state.
    #[must_use]
    pub fn hosts_game(self) -> bool {
        matches!(self, WorldKind::Game | WorldKind::GameAndLobby)
    }

    /// Whether players on this world may be in the lobby state.
    #[must_use]
    pub fn hosts_lobby(self) -> bool {
        matches!(self, WorldKind::Lobby | WorldKind::GameAndLobby)
    }
}

impl std::fmt::Display for WorldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            WorldKind::Game => "game",
            WorldKind::Lobby => "lobby",
            WorldKind::GameAndLobby => "game_and_lobby",
        })
    }
}

/// The hub's view of a player connected to some world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerShadow {
    /// Account name, unique across the fleet.
    pub name: String,
    /// World the player is connected to.
    pub world: WorldId,
    /// Whether the player is in the lobby rather than in game.
    pub in_lobby: bool,
}

impl PlayerShadow {
    /// Create a new shadow record.
    #[must_use]
    pub fn new(name: impl Into<String>, world: WorldId, in_lobby: bool) -> Self {
        Self {
            name: name.into(),
            world,
            in_lobby,
        }
    }
}

/// A link control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkMessage {
    /// First message on every world link.
    Authenticate {
        world: WorldId,
        kind: WorldKind,
        address: String,
        key: String,
        version: Version,
    },

    /// Hub accepted the link.
    Authenticated { world: WorldId },

    /// Hub refused the link; the connection is closed afterwards.
    Rejected { reason: String },

    /// A player connected to the sending world or changed game/lobby state.
    RegisterPlayer(PlayerShadow),

    /// A player left the sending world.
    UnregisterPlayer { name: String },

    /// Hub asks a world for its full local roster.
    RosterRequest { nonce: u64 },

    /// One part of the answer to a roster request; `last` ends the answer.
    Roster {
        nonce: u64,
        players: Vec<PlayerShadow>,
        last: bool,
    },

    /// Opaque frame to forward to another world.
    Relay {
        target: WorldId,
        opcode: u8,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Keepalive ping.
    Ping,

    /// Keepalive pong.
    Pong,
}

impl LinkMessage {
    /// The opcode carrying this message.
    #[must_use]
    pub fn opcode(&self) -> u8 {
        match self {
            LinkMessage::Authenticate { .. } => opcodes::AUTHENTICATE,
            LinkMessage::Authenticated { .. } => opcodes::AUTHENTICATED,
            LinkMessage::Rejected { .. } => opcodes::REJECTED,
            LinkMessage::RegisterPlayer(_) => opcodes::REGISTER_PLAYER,
            LinkMessage::UnregisterPlayer { .. } => opcodes::UNREGISTER_PLAYER,
            LinkMessage::RosterRequest { .. } => opcodes::ROSTER_REQUEST,
            LinkMessage::Roster { .. } => opcodes::ROSTER,
            LinkMessage::Relay { .. } => opcodes::RELAY,
            LinkMessage::Ping => opcodes::PING,
            LinkMessage::Pong => opcodes::PONG,
        }
    }

    /// Split a world's roster into messages that each fit one frame.
    ///
    /// An empty roster is a single, final message.
    #[must_use]
    pub fn roster(nonce: u64, players: Vec<PlayerShadow>) -> Vec<LinkMessage> {
        let parts = players.len().div_ceil(ROSTER_CHUNK).max(1);
        let mut players = players.into_iter();
        (1..=parts)
            .map(|part| LinkMessage::Roster {
                nonce,
                players: players.by_ref().take(ROSTER_CHUNK).collect(),
                last: part == parts,
            })
            .collect()
    }

    /// Encode the message as an outbound frame.
    ///
    /// # Errors
    ///
    /// Returns an error if MessagePack encoding fails.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        match self {
            LinkMessage::Ping | LinkMessage::Pong => Ok(Frame::empty(self.opcode())),
            _ => Ok(Frame::outbound(self.opcode(), rmp_serde::to_vec_named(self)?)),
        }
    }

    /// Decode a message from a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the opcode is not a link message, the body is
    /// malformed, or the body does not match the opcode.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let opcode = frame.opcode();
        match opcode {
            opcodes::PING => return Ok(LinkMessage::Ping),
            opcodes::PONG => return Ok(LinkMessage::Pong),
            opcodes::AUTHENTICATE
            | opcodes::AUTHENTICATED
            | opcodes::REJECTED
            | opcodes::REGISTER_PLAYER
            | opcodes::UNREGISTER_PLAYER
            | opcodes::ROSTER_REQUEST
            | opcodes::ROSTER
            | opcodes::RELAY => {}
            _ => return Err(ProtocolError::UnknownMessage(opcode)),
        }

        let message: LinkMessage = rmp_serde::from_slice(frame.payload())?;
        if message.opcode() != opcode {
            return Err(ProtocolError::UnknownMessage(opcode));
        }
        Ok(message)
    }
}

/// Opcode table of the link protocol.
#[must_use]
pub fn link_table() -> OpcodeTable {
    OpcodeTable::new()
        .u16_prefixed(opcodes::AUTHENTICATE)
        .u16_prefixed(opcodes::AUTHENTICATED)
        .u16_prefixed(opcodes::REJECTED)
        .u16_prefixed(opcodes::REGISTER_PLAYER)
        .u16_prefixed(opcodes::UNREGISTER_PLAYER)
        .u16_prefixed(opcodes::ROSTER_REQUEST)
        .u16_prefixed(opcodes::ROSTER)
        .u16_prefixed(opcodes::RELAY)
        .fixed(opcodes::PING, 0)
        .fixed(opcodes::PONG, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_from, encode_into};
    use bytes::BytesMut;

    #[test]
    fn test_link_message_over_the_wire() {
        let table = link_table();
        let messages = vec![
            LinkMessage::Authenticate {
                world: 3,
                kind: WorldKind::Lobby,
                address: "10.0.0.3:43594".to_string(),
                key: "secret".to_string(),
                version: Version::default(),
            },
            LinkMessage::RegisterPlayer(PlayerShadow::new("alice", 3, true)),
            LinkMessage::Roster {
                nonce: 7,
                players: vec![PlayerShadow::new("bob", 1, false)],
                last: true,
            },
            LinkMessage::Relay {
                target: 1,
                opcode: 0x44,
                payload: vec![1, 2, 3],
            },
            LinkMessage::Ping,
        ];

        let mut buf = BytesMut::new();
        for message in &messages {
            encode_into(&table, &message.to_frame().unwrap(), &mut buf).unwrap();
        }

        for message in messages {
            let frame = decode_from(&table, &mut buf).unwrap().unwrap();
            assert_eq!(LinkMessage::from_frame(&frame).unwrap(), message);
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_mismatched_opcode_rejected() {
        let body = LinkMessage::UnregisterPlayer {
            name: "carol".to_string(),
        }
        .to_frame()
        .unwrap();
        let forged = Frame::inbound(opcodes::ROSTER_REQUEST, body.payload_bytes());

        assert!(matches!(
            LinkMessage::from_frame(&forged),
            Err(ProtocolError::UnknownMessage(opcodes::ROSTER_REQUEST))
        ));
        assert!(matches!(
            LinkMessage::from_frame(&Frame::inbound(0x99, vec![])),
            Err(ProtocolError::UnknownMessage(0x99))
        ));
    }

    #[test]
    fn test_full_world_roster_fits_link_frames() {
        let table = link_table();
        let players: Vec<PlayerShadow> = (0..2000)
            .map(|i| PlayerShadow::new(format!("player_{i:05}"), 4, i % 3 == 0))
            .collect();
        let parts = LinkMessage::roster(11, players.clone());
        assert_eq!(parts.len(), 8);

        let mut buf = BytesMut::new();
        for part in &parts {
            let frame = part.to_frame().unwrap();
            assert!(frame.payload().len() < usize::from(u16::MAX));
            encode_into(&table, &frame, &mut buf).unwrap();
        }

        let mut received = Vec::new();
        let mut finals = 0;
        while let Some(frame) = decode_from(&table, &mut buf).unwrap() {
            match LinkMessage::from_frame(&frame).unwrap() {
                LinkMessage::Roster { nonce, players, last } => {
                    assert_eq!(nonce, 11);
                    received.extend(players);
                    finals += usize::from(last);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(received, players);
        assert_eq!(finals, 1);
        assert!(matches!(
            LinkMessage::roster(12, Vec::new()).as_slice(),
            [LinkMessage::Roster { last: true, players, .. }] if players.is_empty()
        ));
    }

    #[test]
    fn test_world_kind_hosts() {
        assert!(WorldKind::Game.hosts_game());
        assert!(!WorldKind::Game.hosts_lobby());
        assert!(WorldKind::GameAndLobby.hosts_game());
        assert!(WorldKind::GameAndLobby.hosts_lobby());
    }
}
