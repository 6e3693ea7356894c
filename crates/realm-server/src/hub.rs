//! Hub role: accepts world links and keeps the fleet-wide player view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use realm_core::{
    Affinity, BoxError, Flow, HubError, LinkHub, LinkTransport, Pool, RecurringTask, RosterClient, RosterSyncSweep,
    Task, TransportId,
};
use realm_protocol::{link_table, Frame, LinkMessage, PlayerShadow, WorldId, WorldKind, LINK_VERSION};
use realm_transport::{Connection, FrameSender, TcpConfig, TcpConnection, TcpTransport};
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::context::Realm;
use crate::link::{read_message, LinkError};
use crate::metrics::{self, ConnectionMetricsGuard};

/// How long shutdown waits for links to close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A world link connection as seen by the hub's session router.
struct LinkPeer {
    sender: FrameSender,
}

impl LinkTransport for LinkPeer {
    fn id(&self) -> TransportId {
        self.sender.id().get()
    }

    fn send(&self, frame: Frame) -> Result<(), HubError> {
        self.sender
            .send(frame)
            .map_err(|_| HubError::TransportClosed(self.id()))
    }

    fn is_open(&self) -> bool {
        self.sender.is_open()
    }
}

/// A roster answer being collected from its parts.
struct PendingRoster {
    players: Vec<PlayerShadow>,
    answer: oneshot::Sender<Vec<PlayerShadow>>,
}

/// Roster requests waiting for their answer, keyed by nonce.
#[derive(Default)]
pub struct RosterRequests {
    pending: DashMap<u64, PendingRoster>,
    next: AtomicU64,
}

impl RosterRequests {
    fn open(&self) -> (u64, oneshot::Receiver<Vec<PlayerShadow>>) {
        let nonce = self.next.fetch_add(1, Ordering::Relaxed);
        let (answer, rx) = oneshot::channel();
        self.pending.insert(
            nonce,
            PendingRoster {
                players: Vec::new(),
                answer,
            },
        );
        (nonce, rx)
    }

    /// Add one part of an answer; the last part delivers it.
    ///
    /// Returns `false` for unknown or expired nonces.
    fn complete(&self, nonce: u64, players: Vec<PlayerShadow>, last: bool) -> bool {
        let Some(mut pending) = self.pending.get_mut(&nonce) else {
            return false;
        };
        pending.players.extend(players);
        drop(pending);
        if !last {
            return true;
        }
        match self.pending.remove(&nonce) {
            Some((_, pending)) => pending.answer.send(pending.players).is_ok(),
            None => false,
        }
    }

    fn abandon(&self, nonce: u64) {
        self.pending.remove(&nonce);
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

/// Asks a world for its roster over the link and waits for the answer.
pub struct HubRosterClient {
    hub: Arc<LinkHub>,
    requests: Arc<RosterRequests>,
    timeout: Duration,
}

#[async_trait]
impl RosterClient for HubRosterClient {
    async fn local_roster(&mut self, world: WorldId, _kind: WorldKind) -> Result<Vec<PlayerShadow>, BoxError> {
        let (nonce, answer) = self.requests.open();
        let sent = LinkMessage::RosterRequest { nonce }
            .to_frame()
            .map_err(LinkError::from)
            .and_then(|frame| self.hub.route(world, frame).map_err(LinkError::from));
        if let Err(e) = sent {
            self.requests.abandon(nonce);
            return Err(e.into());
        }

        match tokio::time::timeout(self.timeout, answer).await {
            Ok(Ok(players)) => Ok(players),
            Ok(Err(_)) => Err(LinkError::RosterAbandoned { world, nonce }.into()),
            Err(_) => {
                self.requests.abandon(nonce);
                Err(LinkError::RosterTimeout { world, nonce }.into())
            }
        }
    }
}

/// Roster sweep that also publishes its counters.
struct RosterSweepTask {
    sweep: RosterSyncSweep<HubRosterClient>,
    hub: Arc<LinkHub>,
}

#[async_trait]
impl Task for RosterSweepTask {
    async fn run(&mut self) -> Result<Flow, BoxError> {
        let stats = self.sweep.sweep().await?;
        metrics::record_roster_sweep(&stats);
        metrics::set_worlds_online(self.hub.stats().worlds);
        debug!(worlds = stats.worlds, failed = stats.failed, changes = stats.changes, "Roster sweep");
        Ok(Flow::Continue)
    }
}

/// The link hub process.
pub struct HubNode {
    realm: Arc<Realm>,
    hub: Arc<LinkHub>,
    rosters: Arc<RosterRequests>,
}

impl HubNode {
    #[must_use]
    pub fn new(realm: Arc<Realm>) -> Arc<Self> {
        Arc::new(Self {
            hub: Arc::new(LinkHub::with_config(realm.config.hub_config())),
            rosters: Arc::new(RosterRequests::default()),
            realm,
        })
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<LinkHub> {
        &self.hub
    }

    /// A pool of roster clients sized from configuration.
    #[must_use]
    pub fn roster_clients(&self) -> Pool<HubRosterClient> {
        let config = &self.realm.config;
        let timeout = Duration::from_millis(config.link.roster_timeout_ms);
        Pool::with(config.pool.roster_clients.max(1), |_| HubRosterClient {
            hub: self.hub.clone(),
            requests: self.rosters.clone(),
            timeout,
        })
    }

    /// Schedule the roster sync sweep on the link lane.
    pub fn install(&self) {
        let config = &self.realm.config;
        let sweep = RosterSyncSweep::new(
            self.hub.clone(),
            self.roster_clients(),
            Duration::from_millis(config.pool.acquire_timeout_ms),
        );
        self.realm.executor.submit(RecurringTask::new(
            "roster-sync",
            Affinity::Link,
            Duration::from_millis(config.sweeps.roster_interval_ms),
            RosterSweepTask {
                sweep,
                hub: self.hub.clone(),
            },
        ));
    }

    /// Bind the link listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or in use.
    pub async fn bind(&self) -> Result<TcpTransport> {
        let config = &self.realm.config;
        let tcp = TcpConfig {
            bind_addr: config.bind_addr()?,
            outbound_capacity: config.link.outbound_capacity,
            nodelay: true,
        };
        TcpTransport::new(tcp, Arc::new(link_table()))
            .await
            .context("Failed to bind link listener")
    }

    /// Bind and serve world links until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let transport = self.bind().await?;
        self.serve(transport).await;
        Ok(())
    }

    /// Accept world links until shutdown.
    pub async fn serve(self: Arc<Self>, transport: TcpTransport) {
        info!(addr = ?transport.local_addr(), "Link hub accepting worlds");
        let shutdown = self.realm.shutdown.clone();
        let links = TaskTracker::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = transport.accept_tcp() => match accepted {
                    Ok(conn) => {
                        links.spawn(self.clone().serve_link(conn));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        metrics::record_error("accept");
                    }
                },
            }
        }

        links.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, links.wait()).await.is_err() {
            warn!(remaining = links.len(), "Links still open after grace period");
        }
        info!("Link hub stopped");
    }

    async fn serve_link(self: Arc<Self>, mut conn: TcpConnection) {
        let _metrics_guard = ConnectionMetricsGuard::new("link");
        let sender = conn.sender();
        let transport = conn.id().get();

        let world = match self.authenticate(&mut conn).await {
            Ok(world) => world,
            Err(e) => {
                warn!(remote = ?conn.remote_addr(), error = %e, "Link refused");
                if let Ok(frame) = (LinkMessage::Rejected { reason: e.to_string() }).to_frame() {
                    let _ = sender.send(frame);
                }
                conn.close();
                return;
            }
        };
        metrics::set_worlds_online(self.hub.stats().worlds);

        let shutdown = self.realm.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                received = conn.recv() => match received {
                    Ok(Some(frame)) => {
                        metrics::record_frame("link");
                        if let Err(e) = self.on_message(world, &sender, &frame) {
                            warn!(world, opcode = frame.opcode(), error = %e, "Link message failed");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(world, error = %e, "Link read failed");
                        break;
                    }
                },
            }
        }

        conn.close();
        if self.hub.detach(world, transport) {
            info!(world, "World offline");
        }
        metrics::set_worlds_online(self.hub.stats().worlds);
    }

    async fn authenticate(&self, conn: &mut TcpConnection) -> Result<WorldId, LinkError> {
        let config = &self.realm.config;
        let timeout = Duration::from_millis(config.link.connect_timeout_ms);
        let message = read_message(conn, timeout).await?;
        let opcode = message.opcode();
        let LinkMessage::Authenticate {
            world,
            kind,
            address,
            key,
            version,
        } = message
        else {
            return Err(LinkError::Unexpected(opcode));
        };

        if key != config.link.key {
            return Err(LinkError::BadKey);
        }
        if !LINK_VERSION.accepts(&version) {
            return Err(LinkError::Version(version));
        }

        let sender = conn.sender();
        self.hub
            .attach(world, kind, &address, Arc::new(LinkPeer { sender: sender.clone() }))?;
        let accepted = LinkMessage::Authenticated { world };
        if let Err(e) = accepted
            .to_frame()
            .map_err(LinkError::from)
            .and_then(|frame| sender.send(frame).map_err(LinkError::from))
        {
            self.hub.detach(world, sender.id().get());
            return Err(e);
        }

        info!(world, %kind, address = %address, transport = %conn.id(), "World link attached");
        Ok(world)
    }

    fn on_message(&self, world: WorldId, sender: &FrameSender, frame: &Frame) -> Result<(), LinkError> {
        match LinkMessage::from_frame(frame)? {
            LinkMessage::RegisterPlayer(shadow) => {
                if shadow.world != world {
                    return Err(LinkError::ForeignPlayer {
                        name: shadow.name,
                        world,
                    });
                }
                self.hub.register_player(&shadow)?;
                trace!(world, player = %shadow.name, lobby = shadow.in_lobby, "Player registered");
            }
            LinkMessage::UnregisterPlayer { name } => {
                if self.hub.locate_player(&name) == Some(world) {
                    self.hub.unregister_player(&name);
                    trace!(world, player = %name, "Player unregistered");
                }
            }
            LinkMessage::Roster { nonce, players, last } => {
                if !self.rosters.complete(nonce, players, last) {
                    debug!(world, nonce, "Late roster answer dropped");
                }
            }
            LinkMessage::Relay { target, .. } => {
                self.hub
                    .route(target, Frame::outbound(frame.opcode(), frame.payload_bytes()))?;
            }
            LinkMessage::Ping => sender.send(LinkMessage::Pong.to_frame()?)?,
            LinkMessage::Pong => trace!(world, "Pong"),
            other => return Err(LinkError::Unexpected(other.opcode())),
        }
        Ok(())
    }
}
