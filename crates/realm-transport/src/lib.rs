//! # realm-transport
//!
//! Transport layer for Realm servers.
//!
//! Connections carry opcode frames over TCP. Reading happens on the
//! connection; writing goes through a cloneable [`FrameSender`] drained by a
//! per-connection writer task.
//!
//! ```rust,ignore
//! use realm_transport::{Connection, Transport};
//!
//! async fn handle_connection(mut conn: Box<dyn Connection>) {
//!     let sender = conn.sender();
//!     while let Ok(Some(frame)) = conn.recv().await {
//!         // Queue the frame for dispatch
//!     }
//! }
//! ```

pub mod tcp;
pub mod traits;

pub use tcp::{TcpConfig, TcpConnection, TcpTransport};
pub use traits::{Connection, ConnectionId, FrameReceiver, FrameSender, Transport, TransportError};
