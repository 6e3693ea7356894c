//! Background sweeps over pooled session handles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use realm_protocol::{PlayerShadow, WorldId, WorldKind};
use tracing::{debug, warn};

use crate::dispatch::EntitySource;
use crate::hub::LinkHub;
use crate::pool::Pool;
use crate::task::{BoxError, Flow, Task};

/// Fetches a world's own view of its connected players.
#[async_trait]
pub trait RosterClient: Send + 'static {
    async fn local_roster(&mut self, world: WorldId, kind: WorldKind) -> Result<Vec<PlayerShadow>, BoxError>;
}

/// Counters from one roster sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RosterSweepStats {
    pub worlds: usize,
    pub failed: usize,
    pub changes: usize,
}

/// Reconciles every world's roster against the hub.
pub struct RosterSyncSweep<C> {
    hub: Arc<LinkHub>,
    clients: Pool<C>,
    acquire_timeout: Duration,
}

impl<C: RosterClient> RosterSyncSweep<C> {
    #[must_use]
    pub fn new(hub: Arc<LinkHub>, clients: Pool<C>, acquire_timeout: Duration) -> Self {
        Self {
            hub,
            clients,
            acquire_timeout,
        }
    }

    /// Run one sweep.
    ///
    /// # Errors
    ///
    /// Fails only when no roster client could be checked out. Per-world
    /// failures are logged and counted.
    pub async fn sweep(&self) -> Result<RosterSweepStats, BoxError> {
        let mut client = self.clients.acquire_timeout(self.acquire_timeout).await?;
        let mut stats = RosterSweepStats::default();

        for session in self.hub.sessions() {
            stats.worlds += 1;
            let roster = match client.local_roster(session.id(), session.kind()).await {
                Ok(roster) => roster,
                Err(e) => {
                    stats.failed += 1;
                    warn!(world = session.id(), error = %e, "Roster request failed");
                    continue;
                }
            };
            match self.hub.reconcile(session.id(), &roster) {
                Ok(outcome) => {
                    stats.changes += outcome.added.len() + outcome.removed.len() + outcome.moved.len();
                }
                Err(e) => {
                    stats.failed += 1;
                    debug!(world = session.id(), error = %e, "World went away during sweep");
                }
            }
        }

        client.release();
        Ok(stats)
    }
}

#[async_trait]
impl<C: RosterClient> Task for RosterSyncSweep<C> {
    async fn run(&mut self) -> Result<Flow, BoxError> {
        let stats = self.sweep().await?;
        debug!(worlds = stats.worlds, failed = stats.failed, changes = stats.changes, "Roster sweep");
        Ok(Flow::Continue)
    }
}

/// Saves entities through a pooled store session.
#[async_trait]
pub trait Persist<E>: Send + 'static {
    /// Save one entity. `Ok(false)` means the store declined the save.
    async fn save(&mut self, entity: &E) -> Result<bool, BoxError>;
}

/// Counters from one persistence sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSweepStats {
    pub saved: usize,
    pub declined: usize,
    pub failed: usize,
}

/// Saves every connected entity, at most pool capacity at a time.
pub struct PersistenceSweep<E, P, S> {
    sessions: Pool<P>,
    source: Arc<S>,
    _entity: std::marker::PhantomData<fn() -> E>,
}

impl<E, P, S> PersistenceSweep<E, P, S>
where
    E: Send + Sync + 'static,
    P: Persist<E>,
    S: EntitySource<E>,
{
    #[must_use]
    pub fn new(sessions: Pool<P>, source: Arc<S>) -> Self {
        Self {
            sessions,
            source,
            _entity: std::marker::PhantomData,
        }
    }

    /// Run one sweep over game and lobby entities.
    pub async fn sweep(&self) -> PersistSweepStats {
        let entities: Vec<Arc<E>> = self
            .source
            .game_entities()
            .into_iter()
            .chain(self.source.lobby_entities())
            .collect();

        let saves = entities.iter().map(|entity| async move {
            let mut session = self.sessions.acquire().await?;
            let saved = session.save(entity).await;
            session.release();
            saved
        });

        let mut stats = PersistSweepStats::default();
        for outcome in join_all(saves).await {
            match outcome {
                Ok(true) => stats.saved += 1,
                Ok(false) => stats.declined += 1,
                Err(e) => {
                    stats.failed += 1;
                    warn!(error = %e, "Save failed");
                }
            }
        }
        stats
    }
}

#[async_trait]
impl<E, P, S> Task for PersistenceSweep<E, P, S>
where
    E: Send + Sync + 'static,
    P: Persist<E>,
    S: EntitySource<E>,
{
    async fn run(&mut self) -> Result<Flow, BoxError> {
        let stats = self.sweep().await;
        debug!(saved = stats.saved, declined = stats.declined, failed = stats.failed, "Persistence sweep");
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubError;
    use crate::session::{LinkTransport, TransportId};
    use parking_lot::Mutex;
    use realm_protocol::Frame;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullTransport(TransportId);

    impl LinkTransport for NullTransport {
        fn id(&self) -> TransportId {
            self.0
        }

        fn send(&self, _frame: Frame) -> Result<(), HubError> {
            Ok(())
        }
    }

    struct FakeWorlds {
        rosters: Arc<Mutex<HashMap<WorldId, Vec<PlayerShadow>>>>,
    }

    #[async_trait]
    impl RosterClient for FakeWorlds {
        async fn local_roster(&mut self, world: WorldId, _kind: WorldKind) -> Result<Vec<PlayerShadow>, BoxError> {
            self.rosters
                .lock()
                .get(&world)
                .cloned()
                .ok_or_else(|| format!("world {world} did not answer").into())
        }
    }

    #[tokio::test]
    async fn test_roster_sweep_reconciles_and_survives_failures() {
        let hub = Arc::new(LinkHub::new());
        hub.attach(1, WorldKind::Game, "w1", Arc::new(NullTransport(1))).unwrap();
        hub.attach(2, WorldKind::Lobby, "w2", Arc::new(NullTransport(2))).unwrap();
        hub.register_player(&PlayerShadow::new("stale", 1, false)).unwrap();

        let rosters = Arc::new(Mutex::new(HashMap::new()));
        rosters
            .lock()
            .insert(1, vec![PlayerShadow::new("fresh", 1, false)]);

        let pool = Pool::with(1, |_| FakeWorlds {
            rosters: rosters.clone(),
        });
        let sweep = RosterSyncSweep::new(hub.clone(), pool.clone(), Duration::from_secs(1));

        let stats = sweep.sweep().await.unwrap();
        assert_eq!(stats, RosterSweepStats { worlds: 2, failed: 1, changes: 2 });
        assert_eq!(hub.locate_player("fresh"), Some(1));
        assert_eq!(hub.locate_player("stale"), None);
        assert_eq!(pool.available(), 1);

        rosters.lock().insert(2, vec![PlayerShadow::new("waiting", 2, true)]);
        let stats = sweep.sweep().await.unwrap();
        assert_eq!(stats.failed, 0);
        assert_eq!(hub.stats().lobby_players, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_roster_sweep_errors_without_client() {
        let hub = Arc::new(LinkHub::new());
        let pool = Pool::with(1, |_| FakeWorlds {
            rosters: Arc::new(Mutex::new(HashMap::new())),
        });
        let _held = pool.acquire().await.unwrap();

        let sweep = RosterSyncSweep::new(hub, pool.clone(), Duration::from_millis(100));
        assert!(sweep.sweep().await.is_err());
    }

    struct Entities(Vec<Arc<u32>>);

    impl EntitySource<u32> for Entities {
        fn game_entities(&self) -> Vec<Arc<u32>> {
            self.0.iter().filter(|e| ***e % 2 == 0).cloned().collect()
        }

        fn lobby_entities(&self) -> Vec<Arc<u32>> {
            self.0.iter().filter(|e| ***e % 2 == 1).cloned().collect()
        }
    }

    struct SlowStore {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Persist<u32> for SlowStore {
        async fn save(&mut self, entity: &u32) -> Result<bool, BoxError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            match *entity {
                13 => Err("disk full".into()),
                7 => Ok(false),
                _ => Ok(true),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_bounded_by_pool() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let pool = Pool::with(3, |_| SlowStore {
            active: active.clone(),
            peak: peak.clone(),
        });
        let source = Arc::new(Entities((0..20).map(Arc::new).collect()));

        let sweep = PersistenceSweep::new(pool.clone(), source);
        let stats = sweep.sweep().await;

        assert_eq!(stats, PersistSweepStats { saved: 18, declined: 1, failed: 1 });
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(pool.available(), 3);
    }
}
