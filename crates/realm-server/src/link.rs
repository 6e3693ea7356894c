//! Pieces of the world-to-hub link shared by both roles.

use std::time::Duration;

use realm_core::HubError;
use realm_protocol::{LinkMessage, ProtocolError, Version, WorldId};
use realm_transport::{Connection, TransportError};
use thiserror::Error;

/// Link errors.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Hub refused the link: {0}")]
    Rejected(String),

    #[error("Wrong link key")]
    BadKey,

    #[error("Incompatible link version {0}")]
    Version(Version),

    #[error("Unexpected link message {0:#04x}")]
    Unexpected(u8),

    #[error("Peer closed the link during the handshake")]
    Closed,

    #[error("No handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("World {world} announced {name:?}, who is not on that world")]
    ForeignPlayer { name: String, world: WorldId },

    #[error("Roster request {nonce} to world {world} timed out")]
    RosterTimeout { world: WorldId, nonce: u64 },

    #[error("Roster request {nonce} to world {world} was dropped")]
    RosterAbandoned { world: WorldId, nonce: u64 },

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Read one link message, giving up after `timeout`.
///
/// # Errors
///
/// Returns an error on timeout, a closed peer or a malformed frame.
pub async fn read_message<C>(conn: &mut C, timeout: Duration) -> Result<LinkMessage, LinkError>
where
    C: Connection + ?Sized,
{
    let frame = tokio::time::timeout(timeout, conn.recv())
        .await
        .map_err(|_| LinkError::HandshakeTimeout(timeout))??
        .ok_or(LinkError::Closed)?;
    Ok(LinkMessage::from_frame(&frame)?)
}
