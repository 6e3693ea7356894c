//! Transport abstraction traits for Realm.
//!
//! Servers accept connections through a [`Transport`] and read frames from
//! each [`Connection`]. Writes go through a cloneable [`FrameSender`] so any
//! lane can send without holding the connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use realm_protocol::Frame;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Unique identifier for a connection within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next connection ID.
    #[must_use]
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{:x}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// The outbound queue is full.
    #[error("Outbound queue full ({0} frames)")]
    Backlog(usize),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] realm_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A transport that can accept connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Transport name for logs.
    fn name(&self) -> &'static str;

    /// Check if the transport is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// An active connection.
#[async_trait]
pub trait Connection: Send {
    fn id(&self) -> ConnectionId;

    /// Receive the next frame. `None` once the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    /// Handle for writing frames to this connection.
    fn sender(&self) -> FrameSender;

    /// Remote address, if known.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    fn is_open(&self) -> bool;
}

/// Cloneable, non-blocking write handle for one connection.
#[derive(Clone)]
pub struct FrameSender {
    id: ConnectionId,
    tx: mpsc::Sender<Frame>,
    open: Arc<AtomicBool>,
    close: CancellationToken,
}

impl FrameSender {
    /// Create a sender and the receiving end a writer task drains.
    #[must_use]
    pub fn channel(id: ConnectionId, capacity: usize) -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let open = Arc::new(AtomicBool::new(true));
        let close = CancellationToken::new();
        let sender = Self {
            id,
            tx,
            open: open.clone(),
            close: close.clone(),
        };
        (sender, FrameReceiver { rx, open, close })
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the connection is
    /// gone and [`TransportError::Backlog`] when the queue is full.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backlog(self.tx.max_capacity()),
            TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    /// Queue a frame, waiting for room.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the connection is gone.
    pub async fn send_async(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Flush what is queued and close the connection.
    pub fn close(&self) {
        self.close.cancel();
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.close.is_cancelled()
    }
}

impl fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSender")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Receiving end of a [`FrameSender`] channel.
pub struct FrameReceiver {
    rx: mpsc::Receiver<Frame>,
    open: Arc<AtomicBool>,
    close: CancellationToken,
}

impl FrameReceiver {
    /// Next frame to write. `None` once closed and drained, or once every
    /// sender is gone.
    pub async fn next(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            () = self.close.cancelled() => {
                self.rx.close();
                self.rx.try_recv().ok()
            }
        }
    }

    /// Mark the connection closed for every sender.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn_"));
    }

    #[tokio::test]
    async fn test_sender_backlog_and_close() {
        let (sender, mut receiver) = FrameSender::channel(ConnectionId(7), 2);
        sender.send(Frame::outbound(1, Bytes::new())).unwrap();
        sender.send(Frame::outbound(2, Bytes::new())).unwrap();
        assert!(matches!(
            sender.send(Frame::outbound(3, Bytes::new())),
            Err(TransportError::Backlog(2))
        ));

        sender.close();
        assert!(!sender.is_open());
        assert!(matches!(
            sender.send(Frame::outbound(4, Bytes::new())),
            Err(TransportError::ConnectionClosed)
        ));

        assert_eq!(receiver.next().await.map(|f| f.opcode()), Some(1));
        assert_eq!(receiver.next().await.map(|f| f.opcode()), Some(2));
        assert!(receiver.next().await.is_none());
    }

    #[tokio::test]
    async fn test_receiver_marks_closed() {
        let (sender, receiver) = FrameSender::channel(ConnectionId(8), 4);
        receiver.mark_closed();
        assert!(matches!(
            sender.send(Frame::outbound(1, Bytes::new())),
            Err(TransportError::ConnectionClosed)
        ));
    }
}
