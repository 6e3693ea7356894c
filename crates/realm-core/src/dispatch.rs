//! Inbound frame queueing and pull-based dispatch.
//!
//! The network side pushes decoded frames into a per-connection
//! [`InboundQueue`]; a [`DrainTask`] periodically pulls every queue dry and
//! hands each frame to the handler registered for its opcode.
//!
//! Within one drain pass, an entity only gets one frame per opcode handled.
//! Later frames with an opcode already handled in that pass are dropped.
//! This coalesces bursts of the same intent (repeated walk clicks, spammed
//! chat) into one action per pulse and is the intended backpressure policy.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use realm_protocol::Frame;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::task::{BoxError, Flow, Task};

/// Per-connection FIFO of inbound frames.
#[derive(Debug)]
pub struct InboundQueue {
    frames: Mutex<VecDeque<Frame>>,
    epoch: Instant,
    last_activity: AtomicU64,
}

impl InboundQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            epoch: Instant::now(),
            last_activity: AtomicU64::new(0),
        }
    }

    /// Append a frame and record activity.
    pub fn push(&self, frame: Frame) {
        self.frames.lock().push_back(frame);
        self.touch();
    }

    /// Take the oldest frame.
    pub fn pop(&self) -> Option<Frame> {
        self.frames.lock().pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Record activity now.
    pub fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_activity.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// An entity that owns an inbound queue.
pub trait Inbound: Send + Sync + 'static {
    fn queue(&self) -> &InboundQueue;

    /// Name used in logs.
    fn label(&self) -> String;

    /// Only authenticated entities get frames queued.
    fn is_authenticated(&self) -> bool {
        true
    }
}

/// Handles frames of one opcode.
pub trait FrameHandler<E>: Send + Sync {
    /// Handle one frame. Must not block.
    ///
    /// # Errors
    ///
    /// Errors are logged with the opcode and entity; draining continues.
    fn handle(&self, entity: &E, frame: &Frame) -> Result<(), BoxError>;
}

impl<E, F> FrameHandler<E> for F
where
    F: Fn(&E, &Frame) -> Result<(), BoxError> + Send + Sync,
{
    fn handle(&self, entity: &E, frame: &Frame) -> Result<(), BoxError> {
        self(entity, frame)
    }
}

/// Stand-in for opcodes nobody registered a handler for.
struct DebugHandler;

impl<E: Inbound> FrameHandler<E> for DebugHandler {
    fn handle(&self, entity: &E, frame: &Frame) -> Result<(), BoxError> {
        debug!(
            opcode = frame.opcode(),
            length = frame.length(),
            entity = %entity.label(),
            "Unhandled frame"
        );
        Ok(())
    }
}

/// Opcode to handler lookup.
pub struct HandlerRegistry<E> {
    handlers: DashMap<u8, Arc<dyn FrameHandler<E>>>,
}

impl<E: Inbound> HandlerRegistry<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register or replace the handler for an opcode.
    pub fn register(&self, opcode: u8, handler: impl FrameHandler<E> + 'static) {
        self.handlers.insert(opcode, Arc::new(handler));
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(self, opcode: u8, handler: impl FrameHandler<E> + 'static) -> Self {
        self.register(opcode, handler);
        self
    }

    /// The handler for an opcode; a debug handler is installed for unknown
    /// opcodes on first lookup.
    pub fn handler(&self, opcode: u8) -> Arc<dyn FrameHandler<E>> {
        self.handlers
            .entry(opcode)
            .or_insert_with(|| {
                debug!(opcode, "No handler registered, using debug handler");
                Arc::new(DebugHandler)
            })
            .clone()
    }

    #[must_use]
    pub fn is_registered(&self, opcode: u8) -> bool {
        self.handlers.contains_key(&opcode)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<E: Inbound> Default for HandlerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub entities: usize,
    pub handled: usize,
    pub coalesced: usize,
    pub failed: usize,
}

impl DrainStats {
    fn merge(&mut self, other: DrainStats) {
        self.entities += other.entities;
        self.handled += other.handled;
        self.coalesced += other.coalesced;
        self.failed += other.failed;
    }
}

/// Routes queued frames to handlers.
pub struct Dispatcher<E> {
    handlers: Arc<HandlerRegistry<E>>,
}

impl<E: Inbound> Dispatcher<E> {
    #[must_use]
    pub fn new(handlers: Arc<HandlerRegistry<E>>) -> Self {
        Self { handlers }
    }

    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerRegistry<E>> {
        &self.handlers
    }

    /// Queue a received frame for its entity.
    ///
    /// Returns `false` when the connection has no authenticated entity and
    /// the frame was dropped.
    pub fn on_receive(&self, entity: Option<&E>, frame: Frame) -> bool {
        match entity {
            Some(entity) if entity.is_authenticated() => {
                entity.queue().push(frame);
                true
            }
            Some(entity) => {
                trace!(opcode = frame.opcode(), entity = %entity.label(), "Frame before authentication dropped");
                false
            }
            None => {
                trace!(opcode = frame.opcode(), "Frame without entity dropped");
                false
            }
        }
    }

    /// Drain the frames an entity had queued when the pass started.
    ///
    /// Frames arriving during the pass wait for the next one.
    pub fn drain_entity(&self, entity: &E) -> DrainStats {
        let mut stats = DrainStats {
            entities: 1,
            ..DrainStats::default()
        };
        let mut seen = [false; 256];
        let queued = entity.queue().len();

        for _ in 0..queued {
            let Some(frame) = entity.queue().pop() else {
                break;
            };
            let opcode = frame.opcode();
            if seen[usize::from(opcode)] {
                stats.coalesced += 1;
                continue;
            }
            seen[usize::from(opcode)] = true;

            let handler = self.handlers.handler(opcode);
            match catch_unwind(AssertUnwindSafe(|| handler.handle(entity, &frame))) {
                Ok(Ok(())) => stats.handled += 1,
                Ok(Err(e)) => {
                    stats.failed += 1;
                    warn!(opcode, entity = %entity.label(), error = %e, "Frame handler failed");
                }
                Err(_) => {
                    stats.failed += 1;
                    error!(opcode, entity = %entity.label(), "Frame handler panicked");
                }
            }
        }

        stats
    }

    /// Drain game entities, then lobby entities.
    pub fn drain(&self, game: &[Arc<E>], lobby: &[Arc<E>]) -> DrainStats {
        let mut stats = DrainStats::default();
        for entity in game.iter().chain(lobby) {
            stats.merge(self.drain_entity(entity));
        }
        stats
    }
}

/// Entities whose last activity is older than `timeout`.
pub fn idle_entities<E: Inbound>(entities: &[Arc<E>], timeout: Duration) -> Vec<Arc<E>> {
    entities
        .iter()
        .filter(|entity| entity.queue().idle_for() >= timeout)
        .cloned()
        .collect()
}

/// The connected entities a drain pass visits.
pub trait EntitySource<E>: Send + Sync + 'static {
    fn game_entities(&self) -> Vec<Arc<E>>;
    fn lobby_entities(&self) -> Vec<Arc<E>>;
}

type DrainObserver = Box<dyn Fn(&DrainStats, Duration) + Send + Sync>;

/// Recurring task that drains every entity once per firing.
pub struct DrainTask<E, S> {
    dispatcher: Arc<Dispatcher<E>>,
    source: Arc<S>,
    observer: Option<DrainObserver>,
}

impl<E, S> DrainTask<E, S> {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher<E>>, source: Arc<S>) -> Self {
        Self {
            dispatcher,
            source,
            observer: None,
        }
    }

    /// Call `observer` with the counters and duration of every pass.
    #[must_use]
    pub fn with_observer(mut self, observer: impl Fn(&DrainStats, Duration) + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }
}

#[async_trait]
impl<E, S> Task for DrainTask<E, S>
where
    E: Inbound,
    S: EntitySource<E>,
{
    async fn run(&mut self) -> Result<Flow, BoxError> {
        let started = std::time::Instant::now();
        let game = self.source.game_entities();
        let lobby = self.source.lobby_entities();
        let stats = self.dispatcher.drain(&game, &lobby);
        if let Some(observer) = &self.observer {
            observer(&stats, started.elapsed());
        }
        if stats.handled + stats.coalesced + stats.failed > 0 {
            trace!(
                handled = stats.handled,
                coalesced = stats.coalesced,
                failed = stats.failed,
                "Drain pass"
            );
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;

    struct Player {
        name: &'static str,
        queue: InboundQueue,
        authenticated: AtomicBool,
        log: Mutex<Vec<(u8, Bytes)>>,
    }

    impl Player {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                queue: InboundQueue::new(),
                authenticated: AtomicBool::new(true),
                log: Mutex::new(Vec::new()),
            })
        }
    }

    impl Inbound for Player {
        fn queue(&self) -> &InboundQueue {
            &self.queue
        }

        fn label(&self) -> String {
            self.name.to_string()
        }

        fn is_authenticated(&self) -> bool {
            self.authenticated.load(Ordering::Acquire)
        }
    }

    fn frame(opcode: u8, payload: &'static [u8]) -> Frame {
        Frame::inbound(opcode, Bytes::from_static(payload))
    }

    fn recording() -> Arc<HandlerRegistry<Player>> {
        let registry = HandlerRegistry::<Player>::new();
        for opcode in [1u8, 2, 3] {
            registry.register(opcode, |player: &Player, frame: &Frame| -> Result<(), BoxError> {
                player
                    .log
                    .lock()
                    .push((frame.opcode(), frame.payload_bytes()));
                Ok(())
            });
        }
        Arc::new(registry)
    }

    #[test]
    fn test_unauthenticated_frames_dropped() {
        let dispatcher = Dispatcher::new(recording());
        let player = Player::new("guest");
        player.authenticated.store(false, Ordering::Release);

        assert!(!dispatcher.on_receive(None, frame(1, b"x")));
        assert!(!dispatcher.on_receive(Some(&*player), frame(1, b"x")));
        assert!(player.queue.is_empty());

        player.authenticated.store(true, Ordering::Release);
        assert!(dispatcher.on_receive(Some(&*player), frame(1, b"x")));
        assert_eq!(player.queue.len(), 1);
    }

    #[test]
    fn test_repeated_opcode_coalesced_within_pass() {
        let dispatcher = Dispatcher::new(recording());
        let player = Player::new("zezima");
        for f in [frame(1, b"a"), frame(2, b"b"), frame(1, b"c"), frame(3, b"d"), frame(1, b"e")] {
            dispatcher.on_receive(Some(&*player), f);
        }

        let stats = dispatcher.drain(&[player.clone()], &[]);
        assert_eq!(stats.handled, 3);
        assert_eq!(stats.coalesced, 2);
        assert!(player.queue.is_empty());

        let log = player.log.lock();
        let handled: Vec<_> = log.iter().map(|(op, payload)| (*op, payload.clone())).collect();
        assert_eq!(
            handled,
            vec![
                (1, Bytes::from_static(b"a")),
                (2, Bytes::from_static(b"b")),
                (3, Bytes::from_static(b"d")),
            ]
        );
    }

    #[test]
    fn test_frames_arriving_mid_pass_wait_for_next_pass() {
        let registry = HandlerRegistry::<Player>::new();
        registry.register(1, |player: &Player, _frame: &Frame| -> Result<(), BoxError> {
            player.queue.push(frame(3, b"late"));
            Ok(())
        });
        registry.register(2, |_player: &Player, _frame: &Frame| -> Result<(), BoxError> { Ok(()) });
        registry.register(3, |player: &Player, frame: &Frame| -> Result<(), BoxError> {
            player.log.lock().push((frame.opcode(), frame.payload_bytes()));
            Ok(())
        });
        let dispatcher = Dispatcher::new(Arc::new(registry));
        let player = Player::new("flood");
        dispatcher.on_receive(Some(&*player), frame(1, b"a"));
        dispatcher.on_receive(Some(&*player), frame(2, b"b"));

        let stats = dispatcher.drain_entity(&player);
        assert_eq!(stats.handled, 2);
        assert_eq!(player.queue.len(), 1);
        assert!(player.log.lock().is_empty());

        let stats = dispatcher.drain_entity(&player);
        assert_eq!(stats.handled, 1);
        assert!(player.queue.is_empty());
        assert_eq!(player.log.lock().len(), 1);
    }

    #[test]
    fn test_next_pass_handles_opcode_again() {
        let dispatcher = Dispatcher::new(recording());
        let player = Player::new("zezima");

        dispatcher.on_receive(Some(&*player), frame(1, b"a"));
        dispatcher.drain(&[player.clone()], &[]);
        dispatcher.on_receive(Some(&*player), frame(1, b"b"));
        dispatcher.drain(&[player.clone()], &[]);

        assert_eq!(player.log.lock().len(), 2);
    }

    #[test]
    fn test_game_drained_before_lobby() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let registry = HandlerRegistry::<Player>::new().with(1, move |player: &Player, _: &Frame| -> Result<(), BoxError> {
            seen.lock().push(player.name);
            Ok(())
        });
        let dispatcher = Dispatcher::new(Arc::new(registry));

        let lobby = Player::new("lobby");
        let game = Player::new("game");
        dispatcher.on_receive(Some(&*lobby), frame(1, b""));
        dispatcher.on_receive(Some(&*game), frame(1, b""));

        let stats = dispatcher.drain(&[game], &[lobby]);
        assert_eq!(stats.entities, 2);
        assert_eq!(*order.lock(), vec!["game", "lobby"]);
    }

    #[test]
    fn test_handler_faults_do_not_stop_drain() {
        let registry = HandlerRegistry::<Player>::new()
            .with(1, |_: &Player, _: &Frame| -> Result<(), BoxError> { Err("bad walk".into()) })
            .with(2, |_: &Player, _: &Frame| -> Result<(), BoxError> { panic!("bad chat") })
            .with(3, |player: &Player, frame: &Frame| -> Result<(), BoxError> {
                player.log.lock().push((frame.opcode(), frame.payload_bytes()));
                Ok(())
            });
        let dispatcher = Dispatcher::new(Arc::new(registry));

        let first = Player::new("first");
        let second = Player::new("second");
        for f in [frame(1, b""), frame(2, b""), frame(3, b"ok")] {
            dispatcher.on_receive(Some(&*first), f);
        }
        dispatcher.on_receive(Some(&*second), frame(3, b"ok"));

        let stats = dispatcher.drain(&[first.clone(), second.clone()], &[]);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.handled, 2);
        assert_eq!(first.log.lock().len(), 1);
        assert_eq!(second.log.lock().len(), 1);
    }

    #[test]
    fn test_missing_handler_installs_debug_handler() {
        let registry = Arc::new(HandlerRegistry::<Player>::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let player = Player::new("zezima");

        assert!(!registry.is_registered(0x7f));
        dispatcher.on_receive(Some(&*player), frame(0x7f, b"??"));
        let stats = dispatcher.drain(&[player], &[]);

        assert_eq!(stats.handled, 1);
        assert!(registry.is_registered(0x7f));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entities() {
        let active = Player::new("active");
        let quiet = Player::new("quiet");
        active.queue.touch();
        quiet.queue.touch();

        tokio::time::advance(Duration::from_secs(30)).await;
        active.queue.touch();
        tokio::time::advance(Duration::from_secs(31)).await;

        let idle = idle_entities(&[active, quiet], Duration::from_secs(60));
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].name, "quiet");
    }
}
