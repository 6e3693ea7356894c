//! Per-world session state held by the link hub.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use realm_protocol::{Frame, PlayerShadow, WorldId, WorldKind};
use tracing::{debug, warn};

use crate::hub::HubError;

/// Identifier of one link transport.
pub type TransportId = u64;

/// One live connection from a world process to the hub.
pub trait LinkTransport: Send + Sync + 'static {
    fn id(&self) -> TransportId;

    /// Queue a frame for sending. Must not block.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::TransportClosed`] if the connection is gone.
    fn send(&self, frame: Frame) -> Result<(), HubError>;

    fn is_open(&self) -> bool {
        true
    }
}

struct Ring {
    transports: Vec<Arc<dyn LinkTransport>>,
    cursor: usize,
}

/// Which membership set a player is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Game,
    Lobby,
}

impl Membership {
    fn of(shadow: &PlayerShadow) -> Self {
        if shadow.in_lobby {
            Membership::Lobby
        } else {
            Membership::Game
        }
    }
}

/// Outcome of reconciling a world roster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Players the hub did not know about.
    pub added: Vec<String>,
    /// Players the hub knew but the world no longer reports.
    pub removed: Vec<String>,
    /// Players that switched between game and lobby.
    pub moved: Vec<String>,
}

impl Reconciliation {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.moved.is_empty()
    }
}

/// The hub's record of one world process.
///
/// When both membership sets are locked, the game set is locked first.
pub struct WorldServerSession {
    id: WorldId,
    kind: WorldKind,
    address: String,
    ring: Mutex<Ring>,
    game_players: Mutex<HashSet<String>>,
    lobby_players: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl WorldServerSession {
    #[must_use]
    pub fn new(id: WorldId, kind: WorldKind, address: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            address: address.into(),
            ring: Mutex::new(Ring {
                transports: Vec::new(),
                cursor: 0,
            }),
            game_players: Mutex::new(HashSet::new()),
            lobby_players: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> WorldId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> WorldKind {
        self.kind
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the hub dropped this session.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn close(&self) {
        let _ring = self.ring.lock();
        self.closed.store(true, Ordering::Release);
    }

    /// Close the session if no transport is attached.
    pub(crate) fn close_if_empty(&self) -> bool {
        let ring = self.ring.lock();
        if !ring.transports.is_empty() {
            return false;
        }
        self.closed.store(true, Ordering::Release);
        true
    }

    /// Add a transport, returning how many are attached.
    ///
    /// A closed session accepts no transports.
    pub(crate) fn attach(&self, transport: Arc<dyn LinkTransport>, max: usize) -> Result<usize, HubError> {
        let mut ring = self.ring.lock();
        if self.is_closed() {
            return Err(HubError::WorldOffline(self.id));
        }
        if ring.transports.len() >= max {
            return Err(HubError::TooManyTransports { world: self.id, max });
        }
        ring.transports.push(transport);
        Ok(ring.transports.len())
    }

    /// Remove a transport, returning how many remain.
    pub(crate) fn detach(&self, transport: TransportId) -> usize {
        let mut ring = self.ring.lock();
        if let Some(index) = ring.transports.iter().position(|t| t.id() == transport) {
            ring.transports.remove(index);
            if ring.cursor > index {
                ring.cursor -= 1;
            }
        }
        ring.transports.len()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.ring.lock().transports.len()
    }

    /// Next transport in round-robin order, or `None` when the world is
    /// offline.
    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn LinkTransport>> {
        if self.is_closed() {
            return None;
        }
        let mut ring = self.ring.lock();
        if ring.transports.is_empty() {
            return None;
        }
        if ring.cursor >= ring.transports.len() {
            ring.cursor = 0;
        }
        let transport = ring.transports[ring.cursor].clone();
        ring.cursor += 1;
        Some(transport)
    }

    /// Send over the next transport, falling over to the others if it fails.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::WorldOffline`] when no transport accepted the frame.
    pub fn send(&self, frame: Frame) -> Result<(), HubError> {
        for _ in 0..self.transport_count() {
            let Some(transport) = self.transport() else {
                break;
            };
            match transport.send(frame.clone()) {
                Ok(()) => return Ok(()),
                Err(e) => warn!(world = self.id, transport = transport.id(), error = %e, "Link send failed"),
            }
        }
        Err(HubError::WorldOffline(self.id))
    }

    /// Record a player in the set matching its declared state.
    pub fn register_player(&self, shadow: &PlayerShadow) {
        let membership = Membership::of(shadow);
        let hosted = match membership {
            Membership::Game => self.kind.hosts_game(),
            Membership::Lobby => self.kind.hosts_lobby(),
        };
        if !hosted {
            warn!(world = self.id, kind = %self.kind, player = %shadow.name, ?membership, "Player state not hosted by world");
        }

        let mut game = self.game_players.lock();
        let mut lobby = self.lobby_players.lock();
        match membership {
            Membership::Game => {
                lobby.remove(&shadow.name);
                game.insert(shadow.name.clone());
            }
            Membership::Lobby => {
                game.remove(&shadow.name);
                lobby.insert(shadow.name.clone());
            }
        }
        debug!(world = self.id, player = %shadow.name, ?membership, "Player registered");
    }

    /// Forget a player. Returns whether it was known.
    pub fn unregister_player(&self, name: &str) -> bool {
        let mut game = self.game_players.lock();
        let mut lobby = self.lobby_players.lock();
        game.remove(name) | lobby.remove(name)
    }

    #[must_use]
    pub fn membership(&self, name: &str) -> Option<Membership> {
        if self.game_players.lock().contains(name) {
            Some(Membership::Game)
        } else if self.lobby_players.lock().contains(name) {
            Some(Membership::Lobby)
        } else {
            None
        }
    }

    /// Snapshot of players in game.
    #[must_use]
    pub fn game_players(&self) -> Vec<String> {
        self.game_players.lock().iter().cloned().collect()
    }

    /// Snapshot of players in the lobby.
    #[must_use]
    pub fn lobby_players(&self) -> Vec<String> {
        self.lobby_players.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn player_count(&self) -> (usize, usize) {
        let game = self.game_players.lock();
        let lobby = self.lobby_players.lock();
        (game.len(), lobby.len())
    }

    /// Replace both membership sets with what the world reports.
    ///
    /// Entries that name another world are ignored.
    pub fn reconcile(&self, roster: &[PlayerShadow]) -> Reconciliation {
        let mut next_game = HashSet::new();
        let mut next_lobby = HashSet::new();
        for shadow in roster {
            if shadow.world != self.id {
                warn!(world = self.id, player = %shadow.name, reported = shadow.world, "Roster entry for another world");
                continue;
            }
            match Membership::of(shadow) {
                Membership::Game => {
                    next_lobby.remove(&shadow.name);
                    next_game.insert(shadow.name.clone());
                }
                Membership::Lobby => {
                    next_game.remove(&shadow.name);
                    next_lobby.insert(shadow.name.clone());
                }
            }
        }

        let mut game = self.game_players.lock();
        let mut lobby = self.lobby_players.lock();
        let mut outcome = Reconciliation::default();

        for name in game.iter().chain(lobby.iter()) {
            if !next_game.contains(name) && !next_lobby.contains(name) {
                outcome.removed.push(name.clone());
            }
        }
        for name in &next_game {
            if lobby.contains(name) {
                outcome.moved.push(name.clone());
            } else if !game.contains(name) {
                outcome.added.push(name.clone());
            }
        }
        for name in &next_lobby {
            if game.contains(name) {
                outcome.moved.push(name.clone());
            } else if !lobby.contains(name) {
                outcome.added.push(name.clone());
            }
        }

        *game = next_game;
        *lobby = next_lobby;
        outcome.added.sort();
        outcome.removed.sort();
        outcome.moved.sort();
        outcome
    }
}

impl std::fmt::Debug for WorldServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldServerSession")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("address", &self.address)
            .field("transports", &self.transport_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    struct Peer {
        id: TransportId,
        open: AtomicBool,
        sent: AtomicUsize,
    }

    impl Peer {
        fn new(id: TransportId) -> Arc<Self> {
            Arc::new(Self {
                id,
                open: AtomicBool::new(true),
                sent: AtomicUsize::new(0),
            })
        }
    }

    impl LinkTransport for Peer {
        fn id(&self) -> TransportId {
            self.id
        }

        fn send(&self, _frame: Frame) -> Result<(), HubError> {
            if !self.open.load(Ordering::Acquire) {
                return Err(HubError::TransportClosed(self.id));
            }
            self.sent.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    fn session_with(transports: &[TransportId]) -> WorldServerSession {
        let session = WorldServerSession::new(1, WorldKind::GameAndLobby, "127.0.0.1:43594");
        for id in transports {
            session.attach(Peer::new(*id), 8).unwrap();
        }
        session
    }

    #[test]
    fn test_round_robin_each_once_per_cycle() {
        let session = session_with(&[10, 11, 12]);
        for _ in 0..4 {
            let mut cycle: Vec<_> = (0..3).map(|_| session.transport().unwrap().id()).collect();
            cycle.sort_unstable();
            assert_eq!(cycle, vec![10, 11, 12]);
        }
    }

    #[test]
    fn test_detach_keeps_rotation_valid() {
        let session = session_with(&[10, 11, 12]);
        assert_eq!(session.transport().unwrap().id(), 10);
        assert_eq!(session.transport().unwrap().id(), 11);

        assert_eq!(session.detach(10), 2);
        assert_eq!(session.transport().unwrap().id(), 12);
        assert_eq!(session.transport().unwrap().id(), 11);

        assert_eq!(session.detach(11), 1);
        assert_eq!(session.detach(12), 0);
        assert!(session.transport().is_none());
    }

    #[test]
    fn test_closed_session_is_offline() {
        let session = session_with(&[1]);
        session.close();
        assert!(session.transport().is_none());
        assert_eq!(
            session.send(Frame::outbound(0x30, Bytes::new())),
            Err(HubError::WorldOffline(1))
        );
    }

    #[test]
    fn test_closed_session_refuses_transports() {
        let session = session_with(&[]);
        assert!(session.close_if_empty());
        assert_eq!(session.attach(Peer::new(1), 4), Err(HubError::WorldOffline(1)));
        assert_eq!(session.transport_count(), 0);

        let busy = session_with(&[2]);
        assert!(!busy.close_if_empty());
        assert!(!busy.is_closed());
    }

    #[test]
    fn test_send_fails_over() {
        let session = WorldServerSession::new(2, WorldKind::Game, "w2");
        let dead = Peer::new(1);
        let live = Peer::new(2);
        dead.open.store(false, Ordering::Release);
        session.attach(dead.clone(), 4).unwrap();
        session.attach(live.clone(), 4).unwrap();

        for _ in 0..3 {
            session.send(Frame::outbound(0x30, Bytes::new())).unwrap();
        }
        assert_eq!(live.sent.load(Ordering::Acquire), 3);
    }

    #[test]
    fn test_transport_limit() {
        let session = session_with(&[1, 2]);
        assert_eq!(
            session.attach(Peer::new(3), 2),
            Err(HubError::TooManyTransports { world: 1, max: 2 })
        );
    }

    #[test]
    fn test_membership_is_exclusive() {
        let session = session_with(&[]);
        session.register_player(&PlayerShadow::new("zezima", 1, true));
        assert_eq!(session.membership("zezima"), Some(Membership::Lobby));

        session.register_player(&PlayerShadow::new("zezima", 1, false));
        assert_eq!(session.membership("zezima"), Some(Membership::Game));
        assert_eq!(session.player_count(), (1, 0));

        assert!(session.unregister_player("zezima"));
        assert!(!session.unregister_player("zezima"));
        assert_eq!(session.membership("zezima"), None);
    }

    #[test]
    fn test_reconcile() {
        let session = session_with(&[]);
        session.register_player(&PlayerShadow::new("stays", 1, false));
        session.register_player(&PlayerShadow::new("moves", 1, false));
        session.register_player(&PlayerShadow::new("leaves", 1, true));

        let outcome = session.reconcile(&[
            PlayerShadow::new("stays", 1, false),
            PlayerShadow::new("moves", 1, true),
            PlayerShadow::new("joins", 1, true),
            PlayerShadow::new("stranger", 9, false),
        ]);

        assert_eq!(outcome.added, vec!["joins".to_string()]);
        assert_eq!(outcome.removed, vec!["leaves".to_string()]);
        assert_eq!(outcome.moved, vec!["moves".to_string()]);
        assert_eq!(session.membership("moves"), Some(Membership::Lobby));
        assert_eq!(session.membership("stranger"), None);
        assert!(session.reconcile(&[
            PlayerShadow::new("stays", 1, false),
            PlayerShadow::new("moves", 1, true),
            PlayerShadow::new("joins", 1, true),
        ])
        .is_empty());
    }
}
