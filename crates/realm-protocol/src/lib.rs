//! # realm-protocol
//!
//! Wire protocol definitions for Realm world and link servers.
//!
//! Every message on a Realm stream is a frame: one opcode byte, a length
//! prefix whose shape is declared per opcode in an [`OpcodeTable`], and the
//! payload. Decoding is incremental and tolerant of arbitrary TCP
//! fragmentation.
//!
//! ## Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use realm_protocol::{codec, Frame, OpcodeTable};
//!
//! let table = OpcodeTable::new().u8_prefixed(5);
//! let mut buf = BytesMut::new();
//! codec::encode_into(&table, &Frame::outbound(5, vec![0xAA, 0xBB]), &mut buf).unwrap();
//!
//! let frame = codec::decode_from(&table, &mut buf).unwrap().unwrap();
//! assert_eq!(frame.payload(), &[0xAA, 0xBB]);
//! ```

pub mod codec;
pub mod frames;
pub mod link;
pub mod player;
pub mod table;
pub mod version;

pub use codec::{FrameCodec, ProtocolError, MAX_FRAME_SIZE};
pub use frames::{Direction, Frame};
pub use link::{link_table, LinkMessage, PlayerShadow, WorldId, WorldKind};
pub use player::{player_table, Login};
pub use table::{LengthSpec, OpcodeTable};
pub use version::{Version, LINK_VERSION};
