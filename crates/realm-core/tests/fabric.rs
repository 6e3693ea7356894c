//! End-to-end scheduling: pulse ticks draining player queues.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use realm_core::{
    Affinity, BoxError, Dispatcher, DrainTask, EntitySource, Executor, ExecutorConfig,
    HandlerRegistry, Inbound, InboundQueue, RecurringTask, Tick, TickPolicy,
};
use realm_protocol::Frame;

struct Player {
    name: String,
    queue: InboundQueue,
    steps: AtomicUsize,
}

impl Inbound for Player {
    fn queue(&self) -> &InboundQueue {
        &self.queue
    }

    fn label(&self) -> String {
        self.name.clone()
    }
}

struct World {
    players: Mutex<Vec<Arc<Player>>>,
}

impl EntitySource<Player> for World {
    fn game_entities(&self) -> Vec<Arc<Player>> {
        self.players.lock().clone()
    }

    fn lobby_entities(&self) -> Vec<Arc<Player>> {
        Vec::new()
    }
}

fn executor() -> Executor {
    let config = ExecutorConfig {
        pulse: Duration::from_millis(600),
        ..ExecutorConfig::default()
    };
    Executor::with_handle(tokio::runtime::Handle::current(), config)
}

#[tokio::test(start_paused = true)]
async fn test_walk_clicks_coalesce_per_pulse() {
    let executor = executor();
    let handlers = HandlerRegistry::<Player>::new().with(0x20, |player: &Player, _: &Frame| -> Result<(), BoxError> {
        player.steps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(handlers)));
    let player = Arc::new(Player {
        name: "zezima".to_string(),
        queue: InboundQueue::new(),
        steps: AtomicUsize::new(0),
    });
    let world = Arc::new(World {
        players: Mutex::new(vec![player.clone()]),
    });

    executor.submit(RecurringTask::new(
        "drain",
        Affinity::StrictSingle,
        executor.pulse(),
        DrainTask::new(dispatcher.clone(), world),
    ));
    executor.start();

    for _ in 0..5 {
        dispatcher.on_receive(Some(&*player), Frame::inbound(0x20, Bytes::from_static(&[0, 1, 0, 2])));
    }
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(player.steps.load(Ordering::SeqCst), 1);
    assert!(player.queue.is_empty());

    dispatcher.on_receive(Some(&*player), Frame::inbound(0x20, Bytes::from_static(&[0, 1, 0, 3])));
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(player.steps.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_strict_ticks_run_in_submission_order() {
    let executor = executor();
    let order = Arc::new(Mutex::new(Vec::new()));

    for name in ["combat", "movement", "regen"] {
        let seen = order.clone();
        executor.schedule_tick(
            name,
            Tick::new(1, TickPolicy::Persistent, move || {
                seen.lock().push(name);
                Ok(true)
            }),
        );
    }
    executor.start();

    tokio::time::sleep(Duration::from_millis(1_300)).await;
    assert_eq!(
        *order.lock(),
        vec!["combat", "movement", "regen", "combat", "movement", "regen"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stopped_tick_never_fires_again() {
    let executor = executor();
    executor.start();

    let runs = Arc::new(AtomicUsize::new(0));
    let seen = runs.clone();
    let handle = executor.schedule_tick(
        "poison",
        Tick::new(2, TickPolicy::Strict, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }),
    );

    tokio::time::sleep(Duration::from_millis(1_300)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    handle.stop();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(handle.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_strict_interval_change_mid_countdown() {
    let executor = executor();
    executor.start();

    let runs = Arc::new(AtomicUsize::new(0));
    let seen = runs.clone();
    let handle = executor.schedule_tick(
        "harvest",
        Tick::new(4, TickPolicy::Strict, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }),
    );

    // Two of four pulses elapsed; doubling the interval keeps half done.
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    assert_eq!(handle.counter(), 2);
    handle.set_interval(8);
    assert_eq!(handle.counter(), 4);

    tokio::time::sleep(Duration::from_millis(2_400)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(handle.counter(), 8);
}
