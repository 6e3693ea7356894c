//! World role: player connections, login, frame dispatch and the hub link.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use realm_core::{
    idle_entities, task_fn, Affinity, BoxError, Dispatcher, DrainTask, EntitySource, Flow, HandlerRegistry,
    Inbound, InboundQueue, PersistenceSweep, Pool, RecurringTask,
};
use realm_protocol::player::{login_ok, login_rejected, message, opcodes, parse_walk};
use realm_protocol::{
    link_table, player_table, Frame, LinkMessage, Login, OpcodeTable, PlayerShadow, WorldId, WorldKind,
    LINK_VERSION,
};
use realm_transport::{Connection, FrameSender, TcpConfig, TcpConnection, TcpTransport};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::context::Realm;
use crate::link::{read_message, LinkError};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::store::{PlayerRecord, StoreSession};

/// Longest account name.
pub const MAX_NAME_LEN: usize = 12;

/// How long a new connection has to send its login.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for connections to save and close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Reasons a login is refused. The message is sent to the player.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginError {
    #[error("No login received")]
    NoLogin,

    #[error("Malformed login")]
    Malformed,

    #[error("Invalid name")]
    InvalidName,

    #[error("Already logged in")]
    AlreadyOnline,

    #[error("World is full")]
    WorldFull,

    #[error("This world has no {0}")]
    StateUnavailable(&'static str),

    #[error("Profile unavailable, try again later")]
    ProfileUnavailable,
}

/// Normalize an account name: trimmed, lowercase, letters, digits, spaces
/// and underscores only.
///
/// # Errors
///
/// Returns [`LoginError::InvalidName`] for empty, long or odd names.
pub fn normalize_name(name: &str) -> Result<String, LoginError> {
    let name = name.trim();
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '_');
    if !valid {
        return Err(LoginError::InvalidName);
    }
    Ok(name.to_ascii_lowercase())
}

/// A connected player.
pub struct PlayerSession {
    name: String,
    index: u16,
    world: WorldId,
    queue: InboundQueue,
    sender: FrameSender,
    in_lobby: AtomicBool,
    authenticated: AtomicBool,
    loaded: AtomicBool,
    position: Mutex<(u16, u16)>,
    disconnect: CancellationToken,
}

impl PlayerSession {
    #[must_use]
    pub fn new(name: String, index: u16, world: WorldId, in_lobby: bool, sender: FrameSender) -> Self {
        Self {
            name,
            index,
            world,
            queue: InboundQueue::new(),
            sender,
            in_lobby: AtomicBool::new(in_lobby),
            authenticated: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            position: Mutex::new(crate::store::SPAWN),
            disconnect: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot index on this world.
    #[must_use]
    pub fn index(&self) -> u16 {
        self.index
    }

    #[must_use]
    pub fn in_lobby(&self) -> bool {
        self.in_lobby.load(Ordering::Acquire)
    }

    /// Whether the stored profile was loaded. Unloaded players are never saved.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn position(&self) -> (u16, u16) {
        *self.position.lock()
    }

    pub fn set_position(&self, x: u16, y: u16) {
        *self.position.lock() = (x, y);
    }

    /// Apply a loaded profile.
    pub fn restore(&self, record: &PlayerRecord) {
        self.set_position(record.x, record.y);
        self.loaded.store(true, Ordering::Release);
    }

    /// Start accepting frames from this player.
    pub fn complete_login(&self) {
        self.queue.touch();
        self.authenticated.store(true, Ordering::Release);
    }

    /// Snapshot for the player store.
    #[must_use]
    pub fn record(&self) -> PlayerRecord {
        let (x, y) = self.position();
        PlayerRecord {
            name: self.name.clone(),
            world: self.world,
            x,
            y,
            saved_at: 0,
        }
    }

    /// The hub's view of this player.
    #[must_use]
    pub fn shadow(&self) -> PlayerShadow {
        PlayerShadow::new(self.name.clone(), self.world, self.in_lobby())
    }

    /// Queue a frame to the player. Returns whether it was queued.
    pub fn send(&self, frame: Frame) -> bool {
        match self.sender.send(frame) {
            Ok(()) => {
                metrics::record_frame("outbound");
                true
            }
            Err(e) => {
                debug!(player = %self.name, error = %e, "Frame to player dropped");
                false
            }
        }
    }

    /// Stop accepting frames and close the connection once queued frames
    /// are written.
    pub fn logout(&self) {
        self.authenticated.store(false, Ordering::Release);
        self.disconnect.cancel();
        self.sender.close();
    }

    /// Resolves once [`logout`](Self::logout) was called.
    pub async fn disconnected(&self) {
        self.disconnect.cancelled().await;
    }
}

impl Inbound for PlayerSession {
    fn queue(&self) -> &InboundQueue {
        &self.queue
    }

    fn label(&self) -> String {
        self.name.clone()
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PlayerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerSession")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("in_lobby", &self.in_lobby())
            .finish()
    }
}

/// Players connected to this world, keyed by normalized name.
pub struct WorldPlayers {
    world: WorldId,
    players: DashMap<String, Arc<PlayerSession>>,
    slots: Mutex<Vec<bool>>,
}

impl WorldPlayers {
    #[must_use]
    pub fn new(world: WorldId, capacity: usize) -> Self {
        let capacity = capacity.min(usize::from(u16::MAX));
        Self {
            world,
            players: DashMap::new(),
            slots: Mutex::new(vec![false; capacity]),
        }
    }

    /// Claim a slot for a new login.
    ///
    /// # Errors
    ///
    /// Fails for invalid names, names already online and a full world.
    pub fn admit(&self, login: &Login, sender: FrameSender) -> Result<Arc<PlayerSession>, LoginError> {
        let name = normalize_name(&login.name)?;
        match self.players.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(LoginError::AlreadyOnline),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let index = self.claim_slot().ok_or(LoginError::WorldFull)?;
                let player = Arc::new(PlayerSession::new(name, index, self.world, login.lobby, sender));
                slot.insert(player.clone());
                Ok(player)
            }
        }
    }

    fn claim_slot(&self) -> Option<u16> {
        let mut slots = self.slots.lock();
        let index = slots.iter().position(|taken| !taken)?;
        slots[index] = true;
        u16::try_from(index).ok()
    }

    /// Remove a player and free its slot. Returns whether it was present.
    pub fn remove(&self, player: &Arc<PlayerSession>) -> bool {
        let removed = self
            .players
            .remove_if(player.name(), |_, current| Arc::ptr_eq(current, player))
            .is_some();
        if removed {
            if let Some(slot) = self.slots.lock().get_mut(usize::from(player.index())) {
                *slot = false;
            }
        }
        removed
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<PlayerSession>> {
        self.players.get(name).map(|p| p.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.players.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Every player, ordered by slot.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<PlayerSession>> {
        let mut players: Vec<_> = self.players.iter().map(|p| p.value().clone()).collect();
        players.sort_by_key(|p| p.index());
        players
    }

    /// Logged-in players as the hub should see them.
    #[must_use]
    pub fn shadows(&self) -> Vec<PlayerShadow> {
        self.all()
            .into_iter()
            .filter(|p| p.is_authenticated())
            .map(|p| p.shadow())
            .collect()
    }

    /// Send a frame to every logged-in player in the given state.
    pub fn broadcast(&self, frame: &Frame, lobby: bool) -> usize {
        self.all()
            .into_iter()
            .filter(|p| p.is_authenticated() && p.in_lobby() == lobby)
            .filter(|p| p.send(frame.clone()))
            .count()
    }

    fn in_state(&self, lobby: bool) -> Vec<Arc<PlayerSession>> {
        self.all()
            .into_iter()
            .filter(|p| p.in_lobby() == lobby)
            .collect()
    }
}

impl EntitySource<PlayerSession> for WorldPlayers {
    fn game_entities(&self) -> Vec<Arc<PlayerSession>> {
        self.in_state(false)
    }

    fn lobby_entities(&self) -> Vec<Arc<PlayerSession>> {
        self.in_state(true)
    }
}

/// Opcode handlers of the player protocol.
#[must_use]
pub fn player_handlers(players: Arc<WorldPlayers>) -> HandlerRegistry<PlayerSession> {
    HandlerRegistry::new()
        .with(opcodes::KEEPALIVE, |_: &PlayerSession, _: &Frame| -> Result<(), BoxError> { Ok(()) })
        .with(
            opcodes::WALK,
            |player: &PlayerSession, frame: &Frame| -> Result<(), BoxError> {
                if player.in_lobby() {
                    return Err("walk request from the lobby".into());
                }
                let (x, y) = parse_walk(frame)?;
                player.set_position(x, y);
                trace!(player = player.name(), x, y, "Walk");
                Ok(())
            },
        )
        .with(
            opcodes::CHAT,
            move |player: &PlayerSession, frame: &Frame| -> Result<(), BoxError> {
                let text = std::str::from_utf8(frame.payload())?.trim();
                if text.is_empty() {
                    return Ok(());
                }
                let line = message(&format!("{}: {}", player.name(), text));
                players.broadcast(&line, player.in_lobby());
                Ok(())
            },
        )
        .with(opcodes::LOGOUT, |player: &PlayerSession, _: &Frame| -> Result<(), BoxError> {
            player.logout();
            Ok(())
        })
}

/// Connections from this world to the hub.
pub struct WorldLink {
    hub_addr: SocketAddr,
    realm: Arc<Realm>,
    players: Arc<WorldPlayers>,
    table: Arc<OpcodeTable>,
    peers: Mutex<Vec<FrameSender>>,
    cursor: AtomicUsize,
}

impl WorldLink {
    /// # Errors
    ///
    /// Returns an error if the configured hub address is invalid.
    pub fn new(realm: Arc<Realm>, players: Arc<WorldPlayers>) -> Result<Self> {
        Ok(Self {
            hub_addr: realm.config.hub_addr()?,
            realm,
            players,
            table: Arc::new(link_table()),
            peers: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Authenticated link connections.
    #[must_use]
    pub fn connected(&self) -> usize {
        self.peers.lock().iter().filter(|p| p.is_open()).count()
    }

    /// Send a message over the next open connection, round-robin.
    ///
    /// Returns `false` while no link is up; the hub's roster sweep catches
    /// up once it reconnects.
    pub fn send(&self, message: &LinkMessage) -> bool {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to encode link message");
                return false;
            }
        };

        let mut peers = self.peers.lock();
        peers.retain(FrameSender::is_open);
        if peers.is_empty() {
            debug!(opcode = message.opcode(), "Hub link down, message dropped");
            return false;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..peers.len() {
            let peer = &peers[(start + offset) % peers.len()];
            if peer.send(frame.clone()).is_ok() {
                return true;
            }
        }
        false
    }

    pub fn register(&self, player: &PlayerSession) {
        self.send(&LinkMessage::RegisterPlayer(player.shadow()));
    }

    pub fn unregister(&self, name: &str) {
        self.send(&LinkMessage::UnregisterPlayer {
            name: name.to_string(),
        });
    }

    fn authenticate(&self) -> LinkMessage {
        let config = &self.realm.config;
        LinkMessage::Authenticate {
            world: config.world.id,
            kind: config.world.kind,
            address: config.advertised_address(),
            key: config.link.key.clone(),
            version: LINK_VERSION,
        }
    }

    /// Keep the configured number of hub connections up until shutdown.
    pub async fn run(self: Arc<Self>) {
        let count = self.realm.config.link.transports.max(1);
        info!(hub = %self.hub_addr, transports = count, "Linking to hub");
        join_all((0..count).map(|slot| self.clone().maintain(slot))).await;
    }

    async fn maintain(self: Arc<Self>, slot: usize) {
        let shutdown = self.realm.shutdown.clone();
        let delay = Duration::from_millis(self.realm.config.link.reconnect_delay_ms);
        while !shutdown.is_cancelled() {
            match self.session(slot).await {
                Ok(()) => info!(slot, "Hub link closed"),
                Err(e) => {
                    warn!(slot, error = %e, "Hub link failed");
                    metrics::record_error("link");
                }
            }
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn session(&self, slot: usize) -> Result<(), LinkError> {
        let link = &self.realm.config.link;
        let timeout = Duration::from_millis(link.connect_timeout_ms);
        let mut conn =
            TcpConnection::connect(self.hub_addr, self.table.clone(), link.outbound_capacity, timeout).await?;
        let sender = conn.sender();

        sender.send(self.authenticate().to_frame()?)?;
        match read_message(&mut conn, timeout).await? {
            LinkMessage::Authenticated { world } => info!(slot, world, "Hub link authenticated"),
            LinkMessage::Rejected { reason } => return Err(LinkError::Rejected(reason)),
            other => return Err(LinkError::Unexpected(other.opcode())),
        }

        // The hub may have dropped this world while the link was down.
        for shadow in self.players.shadows() {
            sender
                .send_async(LinkMessage::RegisterPlayer(shadow).to_frame()?)
                .await?;
        }
        self.peers.lock().push(sender.clone());

        let shutdown = self.realm.shutdown.clone();
        let outcome = loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break Ok(()),
                received = conn.recv() => match received {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.on_message(&sender, &frame).await {
                            warn!(opcode = frame.opcode(), error = %e, "Link message failed");
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e.into()),
                },
            }
        };

        self.peers.lock().retain(|peer| peer.id() != sender.id());
        conn.close();
        outcome
    }

    async fn on_message(&self, sender: &FrameSender, frame: &Frame) -> Result<(), LinkError> {
        match LinkMessage::from_frame(frame)? {
            LinkMessage::RosterRequest { nonce } => {
                let players = self.players.shadows();
                trace!(nonce, players = players.len(), "Roster requested");
                for part in LinkMessage::roster(nonce, players) {
                    sender.send_async(part.to_frame()?).await?;
                }
            }
            LinkMessage::Relay { opcode, payload, .. } if opcode == opcodes::MESSAGE => {
                let text = String::from_utf8_lossy(&payload);
                let frame = message(&text);
                self.players.broadcast(&frame, false);
                self.players.broadcast(&frame, true);
            }
            LinkMessage::Relay { opcode, .. } => debug!(opcode, "Relay with unsupported opcode ignored"),
            LinkMessage::Ping => sender.send(LinkMessage::Pong.to_frame()?)?,
            LinkMessage::Pong => trace!("Pong"),
            other => return Err(LinkError::Unexpected(other.opcode())),
        }
        Ok(())
    }
}

/// A world process.
pub struct World {
    realm: Arc<Realm>,
    kind: WorldKind,
    players: Arc<WorldPlayers>,
    dispatcher: Arc<Dispatcher<PlayerSession>>,
    stores: Pool<StoreSession>,
    link: Arc<WorldLink>,
}

impl World {
    /// Build the world and prepare its profile directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directory or hub address is unusable.
    pub async fn new(realm: Arc<Realm>) -> Result<Arc<Self>> {
        let config = &realm.config;
        let dir = Arc::new(config.store_dir()?);
        StoreSession::prepare(&dir)
            .await
            .with_context(|| format!("Failed to prepare store at {}", dir.display()))?;

        let players = Arc::new(WorldPlayers::new(config.world.id, config.world.max_players));
        let handlers = Arc::new(player_handlers(players.clone()));
        let stores = Pool::with(config.pool.store_sessions.max(1), |slot| {
            StoreSession::new(dir.clone(), slot)
        });
        let link = Arc::new(WorldLink::new(realm.clone(), players.clone())?);

        Ok(Arc::new(Self {
            kind: config.world.kind,
            realm,
            players,
            dispatcher: Arc::new(Dispatcher::new(handlers)),
            stores,
            link,
        }))
    }

    #[must_use]
    pub fn id(&self) -> WorldId {
        self.realm.config.world.id
    }

    #[must_use]
    pub fn kind(&self) -> WorldKind {
        self.kind
    }

    #[must_use]
    pub fn players(&self) -> &Arc<WorldPlayers> {
        &self.players
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher<PlayerSession>> {
        &self.dispatcher
    }

    #[must_use]
    pub fn link(&self) -> &Arc<WorldLink> {
        &self.link
    }

    /// Schedule the drain task, the idle reaper and the persistence sweep.
    pub fn install(&self) {
        let config = &self.realm.config;
        let executor = &self.realm.executor;

        let drain = DrainTask::new(self.dispatcher.clone(), self.players.clone())
            .with_observer(|stats, elapsed| metrics::record_drain(stats, elapsed.as_secs_f64()));
        executor.submit(RecurringTask::new(
            "drain",
            Affinity::StrictSingle,
            executor.pulse(),
            drain,
        ));

        let players = self.players.clone();
        let timeout = Duration::from_millis(config.world.idle_timeout_ms);
        let reaper = task_fn(move || {
            let online: Vec<_> = players.all().into_iter().filter(|p| p.is_authenticated()).collect();
            for player in idle_entities(&online, timeout) {
                info!(player = player.name(), "Disconnecting idle player");
                player.send(message("You have been logged out for inactivity."));
                player.logout();
            }
            metrics::set_players_online(players.len());
            Ok(Flow::Continue)
        });
        executor.submit(RecurringTask::new(
            "idle-reaper",
            Affinity::Service,
            Duration::from_millis(config.sweeps.idle_check_interval_ms),
            reaper,
        ));

        executor.submit(RecurringTask::new(
            "persistence",
            Affinity::World,
            Duration::from_millis(config.sweeps.persistence_interval_ms),
            PersistenceSweep::new(self.stores.clone(), self.players.clone()),
        ));
    }

    /// Bind the player listener.
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
        TcpTransport::new(tcp, Arc::new(player_table()))
            .await
            .context("Failed to bind player listener")
    }

    /// Bind, link to the hub and serve players until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let transport = self.bind().await?;
        tokio::spawn(self.link.clone().run());
        self.serve(transport).await;
        Ok(())
    }

    /// Accept players until shutdown, then save everyone still online.
    pub async fn serve(self: Arc<Self>, transport: TcpTransport) {
        info!(
            world = self.id(),
            kind = %self.kind,
            addr = ?transport.local_addr(),
            "World accepting players"
        );
        let shutdown = self.realm.shutdown.clone();
        let connections = TaskTracker::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = transport.accept_tcp() => match accepted {
                    Ok(conn) => {
                        connections.spawn(self.clone().serve_player(conn));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        metrics::record_error("accept");
                    }
                },
            }
        }

        connections.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, connections.wait()).await.is_err() {
            warn!(remaining = connections.len(), "Connections still open after grace period");
        }

        let stats = PersistenceSweep::new(self.stores.clone(), self.players.clone())
            .sweep()
            .await;
        metrics::record_saves(&stats);
        self.stores.close();
        info!(saved = stats.saved, failed = stats.failed, "World stopped");
    }

    async fn serve_player(self: Arc<Self>, mut conn: TcpConnection) {
        let _metrics_guard = ConnectionMetricsGuard::new("player");

        let player = match self.login(&mut conn).await {
            Ok(player) => player,
            Err(e) => {
                debug!(connection = %conn.id(), remote = ?conn.remote_addr(), reason = %e, "Login refused");
                let _ = conn.sender().send(login_rejected(&e.to_string()));
                conn.close();
                return;
            }
        };

        player.complete_login();
        player.send(login_ok(player.index()));
        self.link.register(&player);
        metrics::set_players_online(self.players.len());
        info!(
            player = player.name(),
            index = player.index(),
            lobby = player.in_lobby(),
            "Player logged in"
        );

        let shutdown = self.realm.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = player.disconnected() => break,
                received = conn.recv() => match received {
                    Ok(Some(frame)) => {
                        metrics::record_frame("inbound");
                        self.dispatcher.on_receive(Some(&*player), frame);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(player = player.name(), error = %e, "Player connection failed");
                        break;
                    }
                },
            }
        }

        self.players.remove(&player);
        self.link.unregister(player.name());
        self.save(&player).await;
        player.logout();
        metrics::set_players_online(self.players.len());
        info!(player = player.name(), "Player logged out");
    }

    async fn login(&self, conn: &mut TcpConnection) -> Result<Arc<PlayerSession>, LoginError> {
        let frame = match tokio::time::timeout(LOGIN_TIMEOUT, conn.recv()).await {
            Ok(Ok(Some(frame))) => frame,
            _ => return Err(LoginError::NoLogin),
        };
        let login = Login::from_frame(&frame).map_err(|_| LoginError::Malformed)?;
        if login.lobby && !self.kind.hosts_lobby() {
            return Err(LoginError::StateUnavailable("lobby"));
        }
        if !login.lobby && !self.kind.hosts_game() {
            return Err(LoginError::StateUnavailable("game"));
        }

        let player = self.players.admit(&login, conn.sender())?;
        if let Err(e) = self.load_profile(&player).await {
            self.players.remove(&player);
            return Err(e);
        }
        Ok(player)
    }

    async fn load_profile(&self, player: &PlayerSession) -> Result<(), LoginError> {
        let timeout = Duration::from_millis(self.realm.config.pool.acquire_timeout_ms);
        let store = self.stores.acquire_timeout(timeout).await.map_err(|e| {
            warn!(player = player.name(), error = %e, "No store session for login");
            LoginError::ProfileUnavailable
        })?;
        let record = store.load(player.name()).await.map_err(|e| {
            warn!(player = player.name(), error = %e, "Profile load failed");
            LoginError::ProfileUnavailable
        })?;
        store.release();

        player.restore(&record.unwrap_or_else(|| PlayerRecord::fresh(player.name(), self.id())));
        Ok(())
    }

    async fn save(&self, player: &PlayerSession) {
        use realm_core::Persist;

        let timeout = Duration::from_millis(self.realm.config.pool.acquire_timeout_ms);
        let mut store = match self.stores.acquire_timeout(timeout).await {
            Ok(store) => store,
            Err(e) => {
                warn!(player = player.name(), error = %e, "No store session for logout save");
                return;
            }
        };
        match store.save(player).await {
            Ok(true) => {}
            Ok(false) => debug!(player = player.name(), "Save declined"),
            Err(e) => {
                warn!(player = player.name(), error = %e, "Logout save failed");
                metrics::record_error("save");
            }
        }
    }
}
