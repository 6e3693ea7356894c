//! Executor fabric.
//!
//! A fixed set of named lanes that tasks declare affinity to. Every lane runs
//! on OS threads; the strict lane is a single thread that additionally
//! serializes its work through one FIFO permit, which is what keeps the
//! simulation pulse in submission order.
//!
//! The fabric only runs work. It never performs business logic itself.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, warn};

use crate::task::{BoxError, RecurringTask, TaskHandle};
use crate::tick::{Tick, TickHandle};

/// Default simulation pulse.
pub const DEFAULT_PULSE: Duration = Duration::from_millis(600);

/// The lane a task runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affinity {
    /// One global, strictly serialized queue. Reserved for the simulation pulse.
    StrictSingle,
    /// Worker pool sized from available cores.
    Parallel,
    /// Small pool for background bookkeeping.
    Service,
    /// World-state work such as autosaves.
    World,
    /// Map and region work.
    Map,
    /// Cache maintenance.
    Cache,
    /// Cross-process link traffic.
    Link,
}

impl Affinity {
    /// Every lane, in index order.
    pub const ALL: [Affinity; 7] = [
        Affinity::StrictSingle,
        Affinity::Parallel,
        Affinity::Service,
        Affinity::World,
        Affinity::Map,
        Affinity::Cache,
        Affinity::Link,
    ];

    /// Lane name used in thread names and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Affinity::StrictSingle => "strict",
            Affinity::Parallel => "parallel",
            Affinity::Service => "service",
            Affinity::World => "world",
            Affinity::Map => "map",
            Affinity::Cache => "cache",
            Affinity::Link => "link",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Affinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Executor errors.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A lane runtime could not be built.
    #[error("Failed to start {lane} lane: {source}")]
    Lane {
        lane: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Simulation pulse that drives ticks.
    pub pulse: Duration,
    /// Parallel lane size as a multiple of available cores.
    pub parallel_multiplier: f64,
    /// Service lane size.
    pub service_threads: usize,
    /// World lane size.
    pub world_threads: usize,
    /// Map lane size.
    pub map_threads: usize,
    /// Cache lane size.
    pub cache_threads: usize,
    /// Link lane size.
    pub link_threads: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pulse: DEFAULT_PULSE,
            parallel_multiplier: 1.0,
            service_threads: 2,
            world_threads: 2,
            map_threads: 2,
            cache_threads: 1,
            link_threads: 2,
        }
    }
}

impl ExecutorConfig {
    /// Number of concurrent tasks a lane admits.
    #[must_use]
    pub fn lane_size(&self, affinity: Affinity) -> usize {
        let size = match affinity {
            Affinity::StrictSingle => 1,
            Affinity::Parallel => {
                (num_cpus::get() as f64 * self.parallel_multiplier).ceil() as usize
            }
            Affinity::Service => self.service_threads,
            Affinity::World => self.world_threads,
            Affinity::Map => self.map_threads,
            Affinity::Cache => self.cache_threads,
            Affinity::Link => self.link_threads,
        };
        size.max(1)
    }
}

/// One concurrency lane.
pub struct Lane {
    affinity: Affinity,
    handle: Handle,
    permits: Arc<Semaphore>,
    size: usize,
    shutdown: CancellationToken,
    scheduled: AtomicU64,
    firings: AtomicU64,
    faults: AtomicU64,
}

impl Lane {
    fn new(affinity: Affinity, handle: Handle, size: usize, shutdown: CancellationToken) -> Self {
        Self {
            affinity,
            handle,
            permits: Arc::new(Semaphore::new(size)),
            size,
            shutdown,
            scheduled: AtomicU64::new(0),
            firings: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        }
    }

    /// Lane name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.affinity.name()
    }

    /// Lane affinity.
    #[must_use]
    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    /// Maximum concurrent tasks.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for a run slot. Slots are granted in request order.
    pub(crate) async fn permit(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    pub(crate) fn shutdown_signal(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    pub(crate) fn record_firing(&self) {
        self.firings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of lane counters.
    #[must_use]
    pub fn stats(&self) -> LaneStats {
        LaneStats {
            affinity: self.affinity,
            size: self.size,
            scheduled: self.scheduled.load(Ordering::Relaxed),
            firings: self.firings.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

/// Lane statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneStats {
    pub affinity: Affinity,
    pub size: usize,
    /// Recurring tasks armed on this lane.
    pub scheduled: u64,
    /// Completed firings and one-off jobs.
    pub firings: u64,
    /// Firings and jobs that returned an error or panicked.
    pub faults: u64,
}

/// The executor fabric.
pub struct Executor {
    config: ExecutorConfig,
    lanes: Vec<Arc<Lane>>,
    runtimes: Mutex<Vec<Runtime>>,
    pending: Mutex<Option<VecDeque<RecurringTask>>>,
    shutdown: CancellationToken,
}

impl Executor {
    /// Build an executor with one dedicated runtime per lane.
    ///
    /// # Errors
    ///
    /// Returns an error if a lane runtime or thread cannot be created.
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        let shutdown = CancellationToken::new();
        let mut lanes = Vec::with_capacity(Affinity::ALL.len());
        let mut runtimes = Vec::new();

        for affinity in Affinity::ALL {
            let size = config.lane_size(affinity);
            let lane_error = |source| ExecutorError::Lane {
                lane: affinity.name(),
                source,
            };

            let handle = if affinity == Affinity::StrictSingle {
                let runtime = Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(lane_error)?;
                let handle = runtime.handle().clone();
                let token = shutdown.clone();
                std::thread::Builder::new()
                    .name("realm-strict".to_string())
                    .spawn(move || runtime.block_on(token.cancelled()))
                    .map_err(lane_error)?;
                handle
            } else {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(size)
                    .thread_name(format!("realm-{}", affinity.name()))
                    .enable_all()
                    .build()
                    .map_err(lane_error)?;
                let handle = runtime.handle().clone();
                runtimes.push(runtime);
                handle
            };

            debug!(lane = affinity.name(), size, "Lane started");
            lanes.push(Arc::new(Lane::new(affinity, handle, size, shutdown.clone())));
        }

        info!(pulse = ?config.pulse, "Executor created");

        Ok(Self {
            config,
            lanes,
            runtimes: Mutex::new(runtimes),
            pending: Mutex::new(Some(VecDeque::new())),
            shutdown,
        })
    }

    /// Build an executor whose lanes all run on an existing runtime.
    ///
    /// Lane concurrency limits still apply.
    #[must_use]
    pub fn with_handle(handle: Handle, config: ExecutorConfig) -> Self {
        let shutdown = CancellationToken::new();
        let lanes = Affinity::ALL
            .iter()
            .map(|&affinity| {
                Arc::new(Lane::new(
                    affinity,
                    handle.clone(),
                    config.lane_size(affinity),
                    shutdown.clone(),
                ))
            })
            .collect();

        Self {
            config,
            lanes,
            runtimes: Mutex::new(Vec::new()),
            pending: Mutex::new(Some(VecDeque::new())),
            shutdown,
        }
    }

    /// Executor configuration.
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Simulation pulse.
    #[must_use]
    pub fn pulse(&self) -> Duration {
        self.config.pulse
    }

    /// The lane for an affinity.
    #[must_use]
    pub fn lane(&self, affinity: Affinity) -> &Arc<Lane> {
        &self.lanes[affinity.index()]
    }

    /// Whether [`Executor::start`] has run.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.pending.lock().is_none()
    }

    /// Submit a recurring task.
    ///
    /// Before [`Executor::start`] the task is buffered; buffered tasks are
    /// armed in submission order when the executor starts. Afterwards tasks
    /// are armed immediately on the lane matching their affinity.
    pub fn submit(&self, task: RecurringTask) -> TaskHandle {
        let handle = task.handle();
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(queue) => {
                debug!(task = handle.name(), "Task buffered until executor start");
                queue.push_back(task);
            }
            None => self.arm(task),
        }
        handle
    }

    /// Submit a tick on the strict lane at the simulation pulse.
    pub fn schedule_tick(&self, name: impl Into<String>, tick: Tick) -> TickHandle {
        self.schedule_tick_on(name, Affinity::StrictSingle, tick)
    }

    /// Submit a tick on a specific lane at the simulation pulse.
    pub fn schedule_tick_on(
        &self,
        name: impl Into<String>,
        affinity: Affinity,
        tick: Tick,
    ) -> TickHandle {
        let (task, handle) = tick.into_task(name, affinity, self.config.pulse);
        self.submit(task);
        handle
    }

    /// Start the executor, arming every buffered task in submission order.
    ///
    /// Calling this more than once has no effect.
    pub fn start(&self) {
        let mut pending = self.pending.lock();
        if let Some(queue) = pending.take() {
            info!(buffered = queue.len(), "Executor started");
            for task in queue {
                self.arm(task);
            }
        }
    }

    fn arm(&self, task: RecurringTask) {
        let lane = self.lane(task.affinity()).clone();
        lane.scheduled.fetch_add(1, Ordering::Relaxed);
        debug!(task = task.handle().name(), lane = lane.name(), "Task armed");
        lane.handle.spawn(task.drive(lane.clone()));
    }

    /// Run a one-off job on a lane without waiting for it.
    ///
    /// Errors and panics are logged and counted; the lane keeps running.
    pub fn dispatch<F>(&self, affinity: Affinity, name: impl Into<String>, job: F)
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let lane = self.lane(affinity).clone();
        let name = name.into();
        lane.handle.clone().spawn(async move {
            let Some(_permit) = lane.permit().await else {
                return;
            };
            let outcome = AssertUnwindSafe(job).catch_unwind().await;
            lane.record_firing();
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    lane.record_fault();
                    warn!(job = %name, lane = lane.name(), error = %e, "Job failed");
                }
                Err(_) => {
                    lane.record_fault();
                    error!(job = %name, lane = lane.name(), "Job panicked");
                }
            }
        });
    }

    /// Run a synchronous one-off job on a lane thread.
    pub fn dispatch_fn<F>(&self, affinity: Affinity, name: impl Into<String>, job: F)
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.dispatch(affinity, name, async move { job() });
    }

    /// Counters for every lane.
    #[must_use]
    pub fn stats(&self) -> Vec<LaneStats> {
        self.lanes.iter().map(|lane| lane.stats()).collect()
    }

    /// Stop every lane. Running firings are not preempted.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        for lane in &self.lanes {
            lane.permits.close();
        }
        for runtime in self.runtimes.lock().drain(..) {
            runtime.shutdown_background();
        }
        info!("Executor shut down");
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{task_fn, Flow, TaskState};
    use std::sync::atomic::AtomicUsize;

    fn executor() -> Executor {
        Executor::with_handle(Handle::current(), ExecutorConfig::default())
    }

    fn counting_task(name: &str, affinity: Affinity, period_ms: u64) -> (RecurringTask, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let task = RecurringTask::new(
            name,
            affinity,
            Duration::from_millis(period_ms),
            task_fn(move || {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(Flow::Continue)
            }),
        );
        (task, count)
    }

    #[test]
    fn test_lane_sizes() {
        let config = ExecutorConfig {
            parallel_multiplier: 0.0,
            cache_threads: 0,
            ..ExecutorConfig::default()
        };
        assert_eq!(config.lane_size(Affinity::StrictSingle), 1);
        assert_eq!(config.lane_size(Affinity::Parallel), 1);
        assert_eq!(config.lane_size(Affinity::Cache), 1);
        assert_eq!(config.lane_size(Affinity::World), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_buffered_until_start() {
        let executor = executor();
        let (task, count) = counting_task("buffered", Affinity::Service, 100);
        let handle = executor.submit(task);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(handle.state(), TaskState::Created);

        executor.start();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(executor.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_tasks_armed_in_submission_order() {
        let executor = executor();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            executor.submit(RecurringTask::new(
                format!("ordered-{i}"),
                Affinity::StrictSingle,
                Duration::from_millis(100),
                task_fn(move || {
                    order.lock().push(i);
                    Ok(Flow::Stop)
                }),
            ));
        }

        executor.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_task_keeps_lane_alive() {
        let executor = executor();
        executor.start();

        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        let failing = executor.submit(RecurringTask::new(
            "failing",
            Affinity::World,
            Duration::from_millis(100),
            task_fn(move || {
                if seen.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                    panic!("boom");
                }
                Err("bad state".into())
            }),
        ));
        let (sibling, count) = counting_task("sibling", Affinity::World, 100);
        executor.submit(sibling);

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 4);
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert!(!failing.is_stopped());
        assert_eq!(executor.lane(Affinity::World).stats().faults, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_future_firings() {
        let executor = executor();
        executor.start();
        let (task, count) = counting_task("stoppable", Affinity::Parallel, 100);
        let handle = executor.submit(task);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        handle.stop();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(handle.state(), TaskState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start_never_fires() {
        let executor = executor();
        let (task, count) = counting_task("early", Affinity::Service, 100);
        let handle = executor.submit(task);
        handle.stop();

        executor.start();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(handle.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_period_rearms() {
        let executor = executor();
        executor.start();
        let (task, count) = counting_task("rearm", Affinity::Service, 100);
        let handle = executor.submit(task);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Re-armed at t=150 with a 500ms period: next firing at t=650.
        handle.set_period(Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_stop_ends_task() {
        let executor = executor();
        executor.start();
        let mut remaining = 3;
        let handle = executor.submit(RecurringTask::new(
            "countdown",
            Affinity::Cache,
            Duration::from_millis(10),
            task_fn(move || {
                remaining -= 1;
                Ok(if remaining == 0 { Flow::Stop } else { Flow::Continue })
            }),
        ));

        handle.stopped().await;
        assert_eq!(handle.firings(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_survives_panics() {
        let executor = executor();
        let done = Arc::new(AtomicUsize::new(0));

        executor.dispatch_fn(Affinity::Link, "panics", || panic!("job exploded"));
        let seen = done.clone();
        executor.dispatch(Affinity::Link, "works", async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        let stats = executor.lane(Affinity::Link).stats();
        assert_eq!(stats.firings, 2);
        assert_eq!(stats.faults, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_tasks() {
        let executor = executor();
        executor.start();
        let (task, count) = counting_task("until-shutdown", Affinity::Map, 100);
        let handle = executor.submit(task);

        tokio::time::sleep(Duration::from_millis(150)).await;
        executor.shutdown();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(handle.is_stopped());
    }
}
