//! Link hub: routing between world processes.
//!
//! The hub keeps one [`WorldServerSession`] per authenticated world and an
//! index of which world each player is on. A world disappears from the hub
//! when its last transport detaches; later lookups report it offline.

use std::sync::Arc;

use dashmap::DashMap;
use realm_protocol::{Frame, PlayerShadow, WorldId, WorldKind};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::{LinkTransport, Reconciliation, TransportId, WorldServerSession};

/// Hub errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// No session, or no live transport, for the world.
    #[error("World {0} is offline")]
    WorldOffline(WorldId),

    /// A world re-attached declaring a different kind.
    #[error("World {world} registered as {registered}, attach declared {declared}")]
    KindMismatch {
        world: WorldId,
        registered: WorldKind,
        declared: WorldKind,
    },

    /// Transport limit per world reached.
    #[error("World {world} already has {max} transports")]
    TooManyTransports { world: WorldId, max: usize },

    /// The transport's connection is gone.
    #[error("Transport {0} is closed")]
    TransportClosed(TransportId),
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum transports one world may attach.
    pub max_transports_per_world: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_transports_per_world: 4,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub worlds: usize,
    pub transports: usize,
    pub game_players: usize,
    pub lobby_players: usize,
}

/// Registry of world sessions and player locations.
pub struct LinkHub {
    sessions: DashMap<WorldId, Arc<WorldServerSession>>,
    players: DashMap<String, WorldId>,
    config: HubConfig,
}

impl LinkHub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating link hub with config: {:?}", config);
        Self {
            sessions: DashMap::new(),
            players: DashMap::new(),
            config,
        }
    }

    /// Attach a transport for a world, creating its session on first attach.
    ///
    /// # Errors
    ///
    /// Returns an error if the world is known under another kind or already
    /// has the maximum number of transports.
    pub fn attach(
        &self,
        world: WorldId,
        kind: WorldKind,
        address: &str,
        transport: Arc<dyn LinkTransport>,
    ) -> Result<Arc<WorldServerSession>, HubError> {
        let transport_id = transport.id();
        loop {
            let session = self
                .sessions
                .entry(world)
                .or_insert_with(|| {
                    info!(world, %kind, address, "World session created");
                    Arc::new(WorldServerSession::new(world, kind, address))
                })
                .clone();

            if session.kind() != kind {
                return Err(HubError::KindMismatch {
                    world,
                    registered: session.kind(),
                    declared: kind,
                });
            }

            match session.attach(transport.clone(), self.config.max_transports_per_world) {
                Ok(count) => {
                    debug!(world, transport = transport_id, transports = count, "Transport attached");
                    return Ok(session);
                }
                // A concurrent detach closed and removed this session.
                Err(HubError::WorldOffline(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Detach a transport. Returns `true` if that was the world's last
    /// transport and the world was removed.
    pub fn detach(&self, world: WorldId, transport: TransportId) -> bool {
        let Some(session) = self.sessions.get(&world).map(|s| s.clone()) else {
            return false;
        };
        let remaining = session.detach(transport);
        debug!(world, transport, remaining, "Transport detached");
        if remaining > 0 {
            return false;
        }

        let removed = self
            .sessions
            .remove_if(&world, |_, s| Arc::ptr_eq(s, &session) && s.close_if_empty())
            .is_some();
        if removed {
            self.players.retain(|_, w| *w != world);
            info!(world, "World offline, session removed");
        }
        removed
    }

    /// The live session for a world.
    #[must_use]
    pub fn session(&self, world: WorldId) -> Option<Arc<WorldServerSession>> {
        self.sessions
            .get(&world)
            .map(|s| s.clone())
            .filter(|s| !s.is_closed())
    }

    /// Send a frame to a world over its next transport.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::WorldOffline`] if the world has no session or no
    /// transport accepted the frame.
    pub fn route(&self, world: WorldId, frame: Frame) -> Result<(), HubError> {
        self.session(world)
            .ok_or(HubError::WorldOffline(world))?
            .send(frame)
    }

    /// Record a player on the world named in its shadow.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::WorldOffline`] if that world has no session.
    pub fn register_player(&self, shadow: &PlayerShadow) -> Result<(), HubError> {
        let session = self
            .session(shadow.world)
            .ok_or(HubError::WorldOffline(shadow.world))?;

        if let Some(previous) = self.players.insert(shadow.name.clone(), shadow.world) {
            if previous != shadow.world {
                if let Some(old) = self.session(previous) {
                    old.unregister_player(&shadow.name);
                }
                debug!(player = %shadow.name, from = previous, to = shadow.world, "Player moved worlds");
            }
        }
        session.register_player(shadow);
        Ok(())
    }

    /// Forget a player. Returns the world it was on.
    pub fn unregister_player(&self, name: &str) -> Option<WorldId> {
        let (_, world) = self.players.remove(name)?;
        if let Some(session) = self.session(world) {
            session.unregister_player(name);
        }
        Some(world)
    }

    /// The world a player is on.
    #[must_use]
    pub fn locate_player(&self, name: &str) -> Option<WorldId> {
        self.players.get(name).map(|w| *w)
    }

    /// Reconcile a world's membership with its reported roster.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::WorldOffline`] if the world has no session.
    pub fn reconcile(&self, world: WorldId, roster: &[PlayerShadow]) -> Result<Reconciliation, HubError> {
        let session = self.session(world).ok_or(HubError::WorldOffline(world))?;
        let outcome = session.reconcile(roster);

        for name in &outcome.removed {
            self.players.remove_if(name, |_, w| *w == world);
        }
        for name in &outcome.added {
            if let Some(previous) = self.players.insert(name.clone(), world) {
                if previous != world {
                    warn!(player = %name, world, previous, "Player reported by two worlds");
                    if let Some(old) = self.session(previous) {
                        old.unregister_player(name);
                    }
                }
            }
        }
        if !outcome.is_empty() {
            debug!(
                world,
                added = outcome.added.len(),
                removed = outcome.removed.len(),
                moved = outcome.moved.len(),
                "Roster reconciled"
            );
        }
        Ok(outcome)
    }

    /// Snapshot of live sessions, ordered by world id.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<WorldServerSession>> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|s| s.value().clone())
            .filter(|s| !s.is_closed())
            .collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        self.sessions().iter().fold(HubStats::default(), |mut stats, session| {
            let (game, lobby) = session.player_count();
            stats.worlds += 1;
            stats.transports += session.transport_count();
            stats.game_players += game;
            stats.lobby_players += lobby;
            stats
        })
    }
}

impl Default for LinkHub {
    fn default() -> Self {
        Self::new()
    }
}
