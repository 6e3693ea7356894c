//! TCP transport carrying opcode frames.
//!
//! Each connection is split: the read half stays with the [`TcpConnection`],
//! the write half is owned by a writer task fed through a [`FrameSender`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use realm_protocol::{Frame, FrameCodec, OpcodeTable, ProtocolError};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::traits::{Connection, ConnectionId, FrameReceiver, FrameSender, Transport, TransportError};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Frames queued per connection before sends report backlog.
    pub outbound_capacity: usize,
    /// Disable Nagle's algorithm on accepted sockets.
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 43594)),
            outbound_capacity: 256,
            nodelay: true,
        }
    }
}

/// TCP listener producing framed connections.
pub struct TcpTransport {
    listener: TcpListener,
    table: Arc<OpcodeTable>,
    config: TcpConfig,
}

impl TcpTransport {
    /// Bind a new TCP transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: TcpConfig, table: Arc<OpcodeTable>) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("TCP transport listening on {}", config.bind_addr);
        Ok(Self {
            listener,
            table,
            config,
        })
    }

    /// Bind with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr, table: Arc<OpcodeTable>) -> Result<Self, TransportError> {
        Self::new(
            TcpConfig {
                bind_addr: addr,
                ..Default::default()
            },
            table,
        )
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept the next connection.
    ///
    /// # Errors
    ///
    /// Returns an error if accepting fails.
    pub async fn accept_tcp(&self) -> Result<TcpConnection, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        debug!("Accepted TCP connection from {}", addr);
        Ok(TcpConnection::new(
            stream,
            addr,
            self.table.clone(),
            self.config.outbound_capacity,
        ))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        Ok(Box::new(self.accept_tcp().await?))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// A framed TCP connection.
pub struct TcpConnection {
    id: ConnectionId,
    reader: SplitStream<Framed<TcpStream, FrameCodec>>,
    sender: FrameSender,
    remote_addr: SocketAddr,
    is_open: Arc<AtomicBool>,
}

impl TcpConnection {
    fn new(stream: TcpStream, remote_addr: SocketAddr, table: Arc<OpcodeTable>, capacity: usize) -> Self {
        let id = ConnectionId::generate();
        let (sink, reader) = Framed::new(stream, FrameCodec::new(table)).split();
        let (sender, outbound) = FrameSender::channel(id, capacity);
        let is_open = Arc::new(AtomicBool::new(true));
        tokio::spawn(write_loop(id, sink, outbound, is_open.clone()));

        Self {
            id,
            reader,
            sender,
            remote_addr,
            is_open,
        }
    }

    /// Connect to a remote Realm server.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if the connection is not
    /// established within `timeout`.
    pub async fn connect(
        addr: SocketAddr,
        table: Arc<OpcodeTable>,
        capacity: usize,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", addr);
        Ok(Self::new(stream, addr, table, capacity))
    }

    /// Close the write side after queued frames are flushed.
    pub fn close(&self) {
        self.sender.close();
    }
}

async fn write_loop(
    id: ConnectionId,
    mut sink: SplitSink<Framed<TcpStream, FrameCodec>, Frame>,
    mut outbound: FrameReceiver,
    is_open: Arc<AtomicBool>,
) {
    while let Some(frame) = outbound.next().await {
        trace!(connection = %id, opcode = frame.opcode(), "Writing frame");
        let opcode = frame.opcode();
        match sink.send(frame).await {
            Ok(()) => {}
            // The encoder rejects a frame before writing any of it.
            Err(ProtocolError::Io(e)) => {
                warn!(connection = %id, error = %e, "Write failed");
                break;
            }
            Err(e) => warn!(connection = %id, opcode, error = %e, "Unencodable frame dropped"),
        }
    }
    outbound.mark_closed();
    is_open.store(false, Ordering::Release);
    if let Err(e) = sink.close().await {
        trace!(connection = %id, error = %e, "Close failed");
    }
    debug!(connection = %id, "Writer finished");
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.reader.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => {
                self.is_open.store(false, Ordering::Release);
                self.sender.close();
                Err(e.into())
            }
            None => {
                debug!(connection = %self.id, "Peer closed connection");
                self.is_open.store(false, Ordering::Release);
                self.sender.close();
                Ok(None)
            }
        }
    }

    fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }
}
